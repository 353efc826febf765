//! ttysplit
//!
//! Relays a command's terminal session to several tty devices at once.

use std::io;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ttysplit::app::{self, Invocation, Settings};
use ttysplit::process;

fn main() -> ExitCode {
    let settings = match Settings::load_or_default() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: failed to load settings: {}", e);
            return ExitCode::FAILURE;
        },
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut args = std::env::args_os();
    let program = args
        .next()
        .map(|arg| arg.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ttysplit".to_string());

    let config = match app::parse_args(args, &settings) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Usage) => {
            print!("{}", app::usage(&program));
            return ExitCode::FAILURE;
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        },
    };

    let result = process::prepare(&config).and_then(|launch| launch.start());
    match result {
        Ok(never) => match never {},
        Err(e) if e.is_config() => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        },
        Err(e) if e.is_shutdown() => {
            info!("Relay stopped: {}", e);
            ExitCode::FAILURE
        },
        Err(e) => {
            error!("Fatal error: {}", e);
            ExitCode::FAILURE
        },
    }
}
