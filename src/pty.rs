//! Pseudoterminal session
//!
//! Allocates the pty pair the target command runs on. The new pair inherits
//! its attributes (and window size, when known) from the invoking terminal,
//! or failing that from the first secondary device that answers.
//!
//! Reference: https://man7.org/linux/man-pages/man3/openpty.3.html

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use nix::libc;
use nix::pty::{openpty, Winsize};
use nix::sys::termios::{self, Termios};

use crate::error::{RelayError, Result};
use crate::term::DeviceSet;

/// A connected pty pair
#[derive(Debug)]
pub struct PtySession {
    /// Side read and written by the relay
    controller: OwnedFd,
    /// Side handed to the target command as its standard streams
    subordinate: OwnedFd,
}

impl PtySession {
    /// Allocate a pair seeded from the best available terminal
    pub fn open(devices: &DeviceSet) -> Result<Self> {
        let (attributes, size) = seed(devices);
        Self::open_with(&attributes, size.as_ref())
    }

    /// Allocate a pair with explicit attributes and window size
    pub fn open_with(attributes: &Termios, size: Option<&Winsize>) -> Result<Self> {
        let pair = openpty(size, Some(attributes)).map_err(RelayError::OpenPty)?;
        tracing::debug!(
            rows = size.map(|s| s.ws_row),
            cols = size.map(|s| s.ws_col),
            "allocated pty pair"
        );
        Ok(Self {
            controller: pair.master,
            subordinate: pair.slave,
        })
    }

    pub fn controller(&self) -> BorrowedFd<'_> {
        self.controller.as_fd()
    }

    pub fn subordinate(&self) -> BorrowedFd<'_> {
        self.subordinate.as_fd()
    }

    /// Split into (controller, subordinate)
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.controller, self.subordinate)
    }
}

/// Pick seed attributes and window size
///
/// Tries the controlling terminal first, then each secondary device in
/// order, and falls back to zeroed attributes with no window size.
pub fn seed(devices: &DeviceSet) -> (Termios, Option<Winsize>) {
    let stdin = io::stdin();
    if let Ok(attributes) = termios::tcgetattr(stdin.as_fd()) {
        tracing::debug!("seeding pty from controlling terminal");
        return (attributes, window_size(stdin.as_fd()));
    }

    if let Some(attributes) = devices.first_attributes() {
        tracing::debug!("seeding pty from first responsive device");
        let size = devices
            .iter()
            .find_map(|device| window_size(device.file().as_fd()));
        return (attributes, size);
    }

    tracing::debug!("seeding pty with zeroed attributes");
    (zeroed_attributes(), None)
}

/// All-zero terminal attributes
pub fn zeroed_attributes() -> Termios {
    // SAFETY: libc::termios is plain old data; all-zero is a valid value
    let raw: libc::termios = unsafe { std::mem::zeroed() };
    Termios::from(raw)
}

/// Window size of a terminal, if it reports a usable one
pub fn window_size(fd: BorrowedFd<'_>) -> Option<Winsize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ is a valid ioctl for getting window size
    let result = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };

    if result == 0 && ws.ws_col > 0 && ws.ws_row > 0 {
        Some(ws)
    } else {
        None
    }
}
