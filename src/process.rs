//! Process topology
//!
//! Two forks produce three processes:
//!
//! ```text
//! invoker ── fork #1 ─┬─ parent: foreground, waits for readiness then execs the command
//!                     └─ child:  pre-daemon ── fork #2 ─┬─ parent: exits(0) at once
//!                                                       └─ child:  relay (new session)
//! ```
//!
//! The foreground process keeps the invoker's pid, so the shell waits on
//! the target command directly. The relay runs detached in its own session.

use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult, Pid};

use crate::app::RelayConfig;
use crate::error::{RelayError, Result};
use crate::handshake::{self, ReadyReceiver, ReadySender};
use crate::pty::PtySession;
use crate::relay::{Endpoint, Relay};
use crate::term::DeviceSet;

/// Opened resources, ready to fork
#[derive(Debug)]
pub struct Launch {
    devices: DeviceSet,
    log: Option<File>,
    suppress_stdout: bool,
    command: Vec<CString>,
}

/// Open every device and the log file named by `config`
///
/// Runs only once the whole command line has parsed, so `-h` or a bad
/// option never touches a device. Devices are opened and captured in
/// order; on failure the ones already captured are restored as the
/// partial set is dropped.
pub fn prepare(config: &RelayConfig) -> Result<Launch> {
    let command = command_line(&config.command)?;

    let mut devices = DeviceSet::new();
    for path in &config.devices {
        devices.open(path)?;
    }

    let log = config.log_file.as_deref().map(open_log).transpose()?;

    tracing::debug!(
        devices = devices.len(),
        log = ?config.log_file,
        suppress_stdout = config.suppress_stdout,
        "prepared relay"
    );

    Ok(Launch {
        devices,
        log,
        suppress_stdout: config.suppress_stdout,
        command,
    })
}

impl Launch {
    /// Allocate the pty, fork, and become one of the roles
    ///
    /// Returns only on failure: the foreground replaces its image with the
    /// command, the pre-daemon exits, the relay loops until a fatal error.
    pub fn start(self) -> Result<Infallible> {
        let Launch {
            devices,
            log,
            suppress_stdout,
            command,
        } = self;

        let pty = PtySession::open(&devices)?;
        let (sender, receiver) = handshake::channel()?;

        // Child exits are ignored from here until the handshake completes
        ignore_child_exits(true)?;

        // SAFETY: the process is single-threaded here; both sides only run
        // ordinary Rust code before exec or exit
        match unsafe { fork() }.map_err(RelayError::Fork)? {
            ForkResult::Parent { child } => {
                drop(sender);
                foreground(child, receiver, pty, devices, log, &command)
            },
            ForkResult::Child => {
                drop(receiver);
                ignore_child_exits(false)?;
                background(sender, pty, devices, log, suppress_stdout)
            },
        }
    }
}

/// Foreground role: wait for the relay, then exec the command on the pty
fn foreground(
    child: Pid,
    receiver: ReadyReceiver,
    pty: PtySession,
    devices: DeviceSet,
    log: Option<File>,
    command: &[CString],
) -> Result<Infallible> {
    let (controller, subordinate) = pty.into_parts();
    drop(controller);
    devices.release();

    receiver.wait()?;
    reset_signal_dispositions()?;
    // The pre-daemon exits right after its fork; reap it if the kernel has not
    let _ = waitpid(child, None);
    drop(log);

    tracing::debug!(
        pid = std::process::id(),
        command = ?command[0],
        "relay ready, executing command"
    );

    let fd = subordinate.as_raw_fd();
    for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        dup2(fd, target).map_err(RelayError::Dup2)?;
    }
    if fd <= STDERR_FILENO {
        // Now one of the standard streams; keep it open
        let _ = subordinate.into_raw_fd();
    } else {
        drop(subordinate);
    }

    execvp(&command[0], command).map_err(|source| RelayError::Exec {
        command: command[0].to_string_lossy().into_owned(),
        source,
    })
}

/// Background role: detach, then run the relay
fn background(
    sender: ReadySender,
    pty: PtySession,
    devices: DeviceSet,
    log: Option<File>,
    suppress_stdout: bool,
) -> Result<Infallible> {
    let (controller, subordinate) = pty.into_parts();
    drop(subordinate);

    // SAFETY: as in `Launch::start`
    if let ForkResult::Parent { child } = unsafe { fork() }.map_err(RelayError::Fork)? {
        tracing::debug!(relay = %child, "daemonized relay");
        // Leave without running destructors; the relay owns every cleanup now
        std::process::exit(0);
    }

    devices.enter_raw_mode()?;
    setsid().map_err(RelayError::Setsid)?;
    tracing::info!(pid = std::process::id(), "relay started");

    let mut relay = Relay::new(devices, File::from(controller))?;
    if !suppress_stdout {
        relay.attach_console(Endpoint::console_input()?, Endpoint::console_output()?)?;
    }
    if let Some(log) = log {
        relay.attach_log(log);
    }
    relay.catch_signals()?;

    sender.signal()?;
    relay.run()
}

/// Toggle automatic reaping of exited children
fn ignore_child_exits(ignore: bool) -> Result<()> {
    let handler = if ignore {
        SigHandler::SigIgn
    } else {
        SigHandler::SigDfl
    };
    // SAFETY: only switches between the ignore and default dispositions,
    // no handler code is installed
    unsafe { signal(Signal::SIGCHLD, handler) }.map_err(RelayError::Signals)?;
    Ok(())
}

/// Put back default dispositions the command must not inherit
///
/// The Rust runtime ignores SIGPIPE and an ignored disposition survives
/// exec, so pipelines inside the session would see EPIPE instead of dying.
fn reset_signal_dispositions() -> Result<()> {
    for sig in [
        Signal::SIGCHLD,
        Signal::SIGPIPE,
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGTERM,
        Signal::SIGALRM,
    ] {
        // SAFETY: installs the default disposition, no handler code
        unsafe { signal(sig, SigHandler::SigDfl) }.map_err(RelayError::Signals)?;
    }
    Ok(())
}

/// Open the log file for appending, creating it if needed
pub fn open_log(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| RelayError::OpenLog {
            path: path.to_path_buf(),
            source,
        })
}

/// Convert the command line for `execvp`
pub fn command_line(args: &[OsString]) -> Result<Vec<CString>> {
    if args.is_empty() {
        return Err(crate::app::ConfigError::MissingCommand.into());
    }
    args.iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .map_err(|_| RelayError::InvalidArgument(arg.to_string_lossy().into_owned()))
        })
        .collect()
}
