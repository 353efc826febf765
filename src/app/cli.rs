//! Command-line parsing

use std::ffi::OsString;
use std::path::PathBuf;

use super::config::{ConfigError, Settings};

/// Everything the relay needs to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Secondary devices, in broadcast order
    pub devices: Vec<PathBuf>,
    /// File receiving a copy of everything the command prints
    pub log_file: Option<PathBuf>,
    /// Leave the invoking terminal out of the relay
    pub suppress_stdout: bool,
    /// Target command and its arguments; never empty
    pub command: Vec<OsString>,
}

/// What the command line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Run(RelayConfig),
    Usage,
}

/// Parse arguments (without the program name) on top of `settings`
///
/// Options are read until `--` or the first token that is not an option;
/// that token and everything after it form the command. Device paths are
/// only collected here; nothing is opened until the whole line has parsed.
pub fn parse_args<I, S>(args: I, settings: &Settings) -> Result<Invocation, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if args.is_empty() {
        return Ok(Invocation::Usage);
    }

    let mut devices = settings.devices.clone();
    let mut log_file = settings.log_file.clone();
    let mut suppress_stdout = settings.suppress_stdout;

    let mut i = 0;
    while i < args.len() {
        match args[i].to_str() {
            Some("-h") => return Ok(Invocation::Usage),
            Some("-s") => {
                suppress_stdout = true;
            },
            Some("-f") => {
                i += 1;
                let path = args.get(i).ok_or(ConfigError::MissingValue("-f"))?;
                log_file = Some(PathBuf::from(path));
            },
            Some("-d") => {
                i += 1;
                let path = args.get(i).ok_or(ConfigError::MissingValue("-d"))?;
                devices.push(PathBuf::from(path));
            },
            Some("--") => {
                i += 1;
                break;
            },
            _ => break,
        }
        i += 1;
    }

    let command = args[i..].to_vec();
    if command.is_empty() {
        return Err(ConfigError::MissingCommand);
    }

    Ok(Invocation::Run(RelayConfig {
        devices,
        log_file,
        suppress_stdout,
        command,
    }))
}

/// Usage text
pub fn usage(program: &str) -> String {
    format!(
        "Usage:\n\
         {program} [-s] [-f log-file] [-d device] [-d device] [--] cmd [args...]\n\
         \n\
         \x20 Argument info:\n\
         \x20    -d <device>   A tty device to send input/output to (repeatable)\n\
         \x20    -f <log-file> A file to append all output to\n\
         \x20    -s            Suppress input/output on the original terminal\n\
         \x20    -h            Show this help message\n"
    )
}
