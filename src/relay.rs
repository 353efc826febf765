//! The byte relay
//!
//! A single-threaded, level-triggered poll loop. Every iteration moves at
//! most one byte per ready endpoint:
//!
//! - bytes from a secondary device or the console go to the pty controller
//!   and nowhere else;
//! - bytes from the pty controller go to the console output, the log file
//!   and every device, in that order, before the next byte is read.
//!
//! Any read or write failure ends the relay. Writes that would block are
//! retried byte by byte.

use std::convert::Infallible;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::thread;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::error::{RelayError, Result};
use crate::term::DeviceSet;

/// Pause between attempts when a write would block
const RETRY_PAUSE: Duration = Duration::from_micros(1);

/// Signals that end the relay through the normal cleanup path
const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// Readiness flags that make an endpoint worth reading
///
/// Hang-up and error count too, so the read reports the failure instead of
/// the loop spinning on a dead descriptor.
fn is_readable(fd: &PollFd<'_>) -> bool {
    let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL;
    fd.revents().is_some_and(|r| r.intersects(wanted))
}

/// A labelled byte stream taking part in the relay
#[derive(Debug)]
pub struct Endpoint {
    label: String,
    file: File,
    /// Status flags to put back on drop, for descriptions shared with the invoking shell
    restore_flags: Option<OFlag>,
}

impl Endpoint {
    pub fn new(label: impl Into<String>, file: File) -> Self {
        Self {
            label: label.into(),
            file,
            restore_flags: None,
        }
    }

    /// Duplicate of the invoking terminal's input
    pub fn console_input() -> Result<Self> {
        let fd = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| RelayError::Read {
                endpoint: "console input".to_string(),
                source,
            })?;
        Ok(Self::new("console input", File::from(fd)))
    }

    /// Duplicate of the invoking terminal's output
    pub fn console_output() -> Result<Self> {
        let fd = io::stdout()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| RelayError::Write {
                endpoint: "console output".to_string(),
                source,
            })?;
        Ok(Self::new("console output", File::from(fd)))
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Switch to non-blocking mode, remembering the previous flags
    ///
    /// With `restore_on_drop` the previous flags are written back when the
    /// endpoint is dropped.
    pub fn set_nonblocking(&mut self, restore_on_drop: bool) -> Result<()> {
        let previous = set_nonblocking(self.file.as_raw_fd()).map_err(|source| {
            RelayError::NonBlocking {
                endpoint: self.label.clone(),
                source,
            }
        })?;
        if restore_on_drop {
            self.restore_flags = Some(previous);
        }
        Ok(())
    }

    /// Read one byte; `None` when nothing was available after all
    pub fn read_byte(&self) -> Result<Option<u8>> {
        read_byte(&self.file, &self.label)
    }

    pub fn write_byte(&self, byte: u8) -> Result<()> {
        write_byte(&self.file, byte).map_err(|source| RelayError::Write {
            endpoint: self.label.clone(),
            source,
        })
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(flags) = self.restore_flags.take() {
            let _ = fcntl(self.file.as_raw_fd(), FcntlArg::F_SETFL(flags));
        }
    }
}

/// Which endpoints were ready after one wait
#[derive(Debug, Default)]
struct Readiness {
    devices: Vec<bool>,
    console: bool,
    pty: bool,
    signal: bool,
}

/// State owned by the relay process
pub struct Relay {
    devices: DeviceSet,
    pty: Endpoint,
    console_in: Option<Endpoint>,
    console_out: Option<Endpoint>,
    log: Option<Endpoint>,
    signals: Option<SignalFd>,
}

impl Relay {
    /// Register the devices and the pty controller, both non-blocking
    pub fn new(devices: DeviceSet, pty: File) -> Result<Self> {
        for device in devices.iter() {
            set_nonblocking(device.file().as_raw_fd()).map_err(|source| {
                RelayError::NonBlocking {
                    endpoint: device.label(),
                    source,
                }
            })?;
        }

        let mut pty = Endpoint::new("pty controller", pty);
        pty.set_nonblocking(false)?;

        Ok(Self {
            devices,
            pty,
            console_in: None,
            console_out: None,
            log: None,
            signals: None,
        })
    }

    /// Relay to and from the invoking terminal
    pub fn attach_console(&mut self, mut input: Endpoint, output: Endpoint) -> Result<()> {
        input.set_nonblocking(true)?;
        self.console_in = Some(input);
        self.console_out = Some(output);
        Ok(())
    }

    /// Append everything read from the pty to `file`
    pub fn attach_log(&mut self, file: File) {
        self.log = Some(Endpoint::new("log file", file));
    }

    /// Route termination signals through the poll set
    ///
    /// Blocks them for the calling thread; once caught, the relay returns
    /// `RelayError::Terminated` and unwinds through the normal drop path.
    pub fn catch_signals(&mut self) -> Result<()> {
        let mut mask = SigSet::empty();
        for signal in TERMINATION_SIGNALS {
            mask.add(signal);
        }
        mask.thread_block().map_err(RelayError::Signals)?;

        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(RelayError::Signals)?;
        self.signals = Some(fd);
        Ok(())
    }

    /// Relay until a fatal error or a termination signal
    pub fn run(&mut self) -> Result<Infallible> {
        tracing::info!(
            devices = self.devices.len(),
            console = self.console_in.is_some(),
            log = self.log.is_some(),
            "relay running"
        );
        loop {
            self.step(PollTimeout::NONE)?;
        }
    }

    /// Wait for readiness once and move one byte per ready endpoint
    pub fn step(&mut self, timeout: PollTimeout) -> Result<()> {
        let Some(ready) = self.wait(timeout)? else {
            return Ok(());
        };

        if ready.signal {
            self.check_signals()?;
        }

        for (device, readable) in self.devices.iter().zip(&ready.devices) {
            if !*readable {
                continue;
            }
            if let Some(byte) = read_byte(device.file(), &device.label())? {
                self.pty.write_byte(byte)?;
            }
        }

        if ready.console {
            if let Some(console) = &self.console_in {
                if let Some(byte) = console.read_byte()? {
                    self.pty.write_byte(byte)?;
                }
            }
        }

        if ready.pty {
            if let Some(byte) = self.read_pty()? {
                self.fan_out(byte)?;
            }
        }

        Ok(())
    }

    /// `None` when the wait timed out or was interrupted
    fn wait(&self, timeout: PollTimeout) -> Result<Option<Readiness>> {
        let mut fds: Vec<PollFd<'_>> = self
            .devices
            .iter()
            .map(|device| PollFd::new(device.file().as_fd(), PollFlags::POLLIN))
            .collect();
        let device_count = fds.len();

        fds.push(PollFd::new(self.pty.file().as_fd(), PollFlags::POLLIN));
        if let Some(console) = &self.console_in {
            fds.push(PollFd::new(console.file().as_fd(), PollFlags::POLLIN));
        }
        if let Some(signals) = &self.signals {
            fds.push(PollFd::new(signals.as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(None),
            Ok(_) => {},
            Err(nix::errno::Errno::EINTR) => return Ok(None),
            Err(e) => return Err(RelayError::Poll(e)),
        }

        let mut rest = fds[device_count..].iter();
        let pty = rest.next().is_some_and(is_readable);
        let console = self.console_in.is_some() && rest.next().is_some_and(is_readable);
        let signal = self.signals.is_some() && rest.next().is_some_and(is_readable);

        Ok(Some(Readiness {
            devices: fds[..device_count].iter().map(is_readable).collect(),
            console,
            pty,
            signal,
        }))
    }

    fn read_pty(&self) -> Result<Option<u8>> {
        match self.pty.read_byte() {
            Err(RelayError::EndOfFile(_)) => Err(RelayError::SessionClosed),
            Err(RelayError::Read { source, .. }) if source.raw_os_error() == Some(libc::EIO) => {
                Err(RelayError::SessionClosed)
            },
            other => other,
        }
    }

    fn fan_out(&self, byte: u8) -> Result<()> {
        if let Some(console) = &self.console_out {
            console.write_byte(byte)?;
        }
        if let Some(log) = &self.log {
            log.write_byte(byte)?;
        }
        for device in self.devices.iter() {
            write_byte(device.file(), byte).map_err(|source| RelayError::Write {
                endpoint: device.label(),
                source,
            })?;
        }
        Ok(())
    }

    fn check_signals(&mut self) -> Result<()> {
        let Some(signals) = self.signals.as_mut() else {
            return Ok(());
        };
        match signals.read_signal() {
            Ok(Some(info)) => {
                let signal = Signal::try_from(info.ssi_signo as i32).unwrap_or(Signal::SIGTERM);
                Err(RelayError::Terminated(signal))
            },
            Ok(None) => Ok(()),
            Err(e) => Err(RelayError::Signals(e)),
        }
    }
}

/// Set `O_NONBLOCK`, returning the flags that were in effect before
pub fn set_nonblocking(fd: RawFd) -> nix::Result<OFlag> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(flags)
}

/// Read exactly one byte from a non-blocking descriptor
///
/// Returns `None` on a spurious wake-up; end of file is an error.
fn read_byte(mut file: &File, label: &str) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Err(RelayError::EndOfFile(label.to_string())),
            Ok(_) => return Ok(Some(buf[0])),
            // EAGAIN and EWOULDBLOCK are the same value on Linux
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(RelayError::Read {
                    endpoint: label.to_string(),
                    source,
                })
            },
        }
    }
}

/// Write one byte, retrying while the descriptor would block
pub fn write_byte(mut file: &File, byte: u8) -> io::Result<()> {
    loop {
        match file.write(&[byte]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(RETRY_PAUSE),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::PtySession;
    use crate::testing::{pty_device, stream_pair};
    use nix::sys::pthread::{pthread_kill, pthread_self};
    use std::io::Seek;
    use std::path::PathBuf;

    const WAIT: u16 = 2000;

    /// Poll `file` for up to `ms` and read one byte if one shows up
    fn read_within(file: &File, ms: u16) -> Option<u8> {
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(n) if n > 0 => {
                let mut buf = [0u8; 1];
                match (&*file).read(&mut buf) {
                    Ok(1) => Some(buf[0]),
                    _ => None,
                }
            },
            _ => None,
        }
    }

    struct Harness {
        // Dropped first, so devices are restored while their far ends are open
        relay: Relay,
        device_peers: Vec<File>,
        pty_peer: File,
        console_in_peer: Option<File>,
        console_out_peer: Option<File>,
        log: Option<File>,
    }

    fn harness(device_count: usize, console: bool, log: bool) -> Harness {
        let mut device_peers = Vec::new();
        let mut devices = DeviceSet::new();
        for i in 0..device_count {
            let (peer, device) = pty_device();
            device_peers.push(peer);
            devices
                .push(PathBuf::from(format!("/dev/pts/t{}", i)), device)
                .unwrap();
        }
        devices.enter_raw_mode().unwrap();

        let (pty_peer, pty_end) = stream_pair();
        let mut relay = Relay::new(devices, pty_end).unwrap();

        let (console_in_peer, console_out_peer) = if console {
            let (in_peer, in_end) = stream_pair();
            let (out_end, out_peer) = stream_pair();
            relay
                .attach_console(
                    Endpoint::new("console input", in_end),
                    Endpoint::new("console output", out_end),
                )
                .unwrap();
            (Some(in_peer), Some(out_peer))
        } else {
            (None, None)
        };

        let log = log.then(|| {
            let file = tempfile::tempfile().unwrap();
            relay.attach_log(file.try_clone().unwrap());
            file
        });

        Harness {
            relay,
            device_peers,
            pty_peer,
            console_in_peer,
            console_out_peer,
            log,
        }
    }

    fn log_contents(file: &File) -> Vec<u8> {
        let mut file = file.try_clone().unwrap();
        file.rewind().unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        contents
    }

    #[test]
    fn test_pty_byte_reaches_every_endpoint() {
        let mut h = harness(2, true, true);
        (&h.pty_peer).write_all(b"a").unwrap();
        h.relay.step(PollTimeout::from(WAIT)).unwrap();

        assert_eq!(read_within(h.console_out_peer.as_ref().unwrap(), WAIT), Some(b'a'));
        for peer in &h.device_peers {
            assert_eq!(read_within(peer, WAIT), Some(b'a'));
        }
        assert_eq!(log_contents(h.log.as_ref().unwrap()), b"a");
    }

    #[test]
    fn test_device_byte_goes_only_to_pty() {
        let mut h = harness(2, true, true);
        (&h.device_peers[0]).write_all(b"k").unwrap();
        h.relay.step(PollTimeout::from(WAIT)).unwrap();

        assert_eq!(read_within(&h.pty_peer, WAIT), Some(b'k'));
        assert_eq!(read_within(&h.device_peers[0], 100), None);
        assert_eq!(read_within(&h.device_peers[1], 100), None);
        assert_eq!(read_within(h.console_out_peer.as_ref().unwrap(), 100), None);
        assert!(log_contents(h.log.as_ref().unwrap()).is_empty());
    }

    #[test]
    fn test_console_byte_goes_only_to_pty() {
        let mut h = harness(1, true, false);
        (h.console_in_peer.as_ref().unwrap()).write_all(b"c").unwrap();
        h.relay.step(PollTimeout::from(WAIT)).unwrap();

        assert_eq!(read_within(&h.pty_peer, WAIT), Some(b'c'));
        assert_eq!(read_within(&h.device_peers[0], 100), None);
        assert_eq!(read_within(h.console_out_peer.as_ref().unwrap(), 100), None);
    }

    #[test]
    fn test_inputs_relayed_in_registration_order() {
        let mut h = harness(2, true, false);
        (&h.device_peers[1]).write_all(b"a").unwrap();
        (&h.device_peers[0]).write_all(b"b").unwrap();
        (h.console_in_peer.as_ref().unwrap()).write_all(b"c").unwrap();

        // Let the pty line discipline deliver both device bytes
        thread::sleep(Duration::from_millis(200));
        h.relay.step(PollTimeout::from(WAIT)).unwrap();

        let received: Vec<u8> = (0..3).filter_map(|_| read_within(&h.pty_peer, WAIT)).collect();
        assert_eq!(received, b"bac");
    }

    #[test]
    fn test_suppressed_console_is_not_written() {
        let mut h = harness(1, false, true);
        (&h.pty_peer).write_all(b"z").unwrap();
        h.relay.step(PollTimeout::from(WAIT)).unwrap();

        assert_eq!(read_within(&h.device_peers[0], WAIT), Some(b'z'));
        assert_eq!(log_contents(h.log.as_ref().unwrap()), b"z");
    }

    #[test]
    fn test_one_byte_per_step() {
        let mut h = harness(1, false, false);
        (&h.pty_peer).write_all(b"xy").unwrap();

        h.relay.step(PollTimeout::from(WAIT)).unwrap();
        assert_eq!(read_within(&h.device_peers[0], WAIT), Some(b'x'));
        assert_eq!(read_within(&h.device_peers[0], 100), None);

        h.relay.step(PollTimeout::from(WAIT)).unwrap();
        assert_eq!(read_within(&h.device_peers[0], WAIT), Some(b'y'));
    }

    #[test]
    fn test_console_eof_is_fatal() {
        let mut h = harness(0, true, false);
        drop(h.console_in_peer.take());
        let err = h.relay.step(PollTimeout::from(WAIT)).unwrap_err();
        assert!(matches!(err, RelayError::EndOfFile(ref label) if label == "console input"));
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let mut h = harness(1, true, false);
        drop(h.console_out_peer.take());
        (&h.pty_peer).write_all(b"q").unwrap();

        let err = h.relay.step(PollTimeout::from(WAIT)).unwrap_err();
        assert!(matches!(
            err,
            RelayError::Write { ref endpoint, .. } if endpoint == "console output"
        ));
        // Fan-out stopped at the failing endpoint
        assert_eq!(read_within(&h.device_peers[0], 100), None);
    }

    #[test]
    fn test_closed_session_detected() {
        let (_peer, device) = pty_device();
        let attributes = crate::term::capture(&device).unwrap();
        let (controller, subordinate) = PtySession::open_with(&attributes, None)
            .unwrap()
            .into_parts();
        drop(subordinate);

        let mut relay = Relay::new(DeviceSet::new(), File::from(controller)).unwrap();
        let err = relay.step(PollTimeout::from(WAIT)).unwrap_err();
        assert!(matches!(err, RelayError::SessionClosed));
    }

    #[test]
    fn test_termination_signal_ends_relay() {
        let mut h = harness(1, false, false);
        h.relay.catch_signals().unwrap();

        // Thread-directed, so only this (now blocking) thread sees it
        pthread_kill(pthread_self(), Signal::SIGTERM).unwrap();

        let err = h.relay.step(PollTimeout::from(WAIT)).unwrap_err();
        assert!(matches!(err, RelayError::Terminated(Signal::SIGTERM)));
        assert!(err.is_shutdown());
    }

    #[test]
    fn test_timeout_moves_nothing() {
        let mut h = harness(1, true, false);
        h.relay.step(PollTimeout::from(50u16)).unwrap();
        assert_eq!(read_within(&h.pty_peer, 50), None);
    }

    #[test]
    fn test_write_byte_retries_when_full() {
        let (writer, reader) = stream_pair();
        set_nonblocking(writer.as_raw_fd()).unwrap();

        let mut filled = 0usize;
        loop {
            match (&writer).write(&[0u8; 4096]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        let drainer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let mut reader = reader;
            let mut buf = vec![0u8; filled + 1];
            reader.read_exact(&mut buf).unwrap();
            buf[filled]
        });

        write_byte(&writer, b'!').unwrap();
        assert_eq!(drainer.join().unwrap(), b'!');
    }

    #[test]
    fn test_console_flags_restored_on_drop() {
        let (_peer, end) = stream_pair();
        let probe = end.try_clone().unwrap();
        let before = fcntl(probe.as_raw_fd(), FcntlArg::F_GETFL).unwrap();

        let mut endpoint = Endpoint::new("console input", end);
        endpoint.set_nonblocking(true).unwrap();
        let during = fcntl(probe.as_raw_fd(), FcntlArg::F_GETFL).unwrap();
        assert_ne!(during & libc::O_NONBLOCK, 0);

        drop(endpoint);
        assert_eq!(fcntl(probe.as_raw_fd(), FcntlArg::F_GETFL).unwrap(), before);
    }
}
