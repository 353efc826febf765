//! Shared fixtures for unit tests

use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::pty::openpty;
use nix::sys::termios::Termios;

/// A fresh pty pair standing in for a secondary device: (far end, device)
pub fn pty_device() -> (File, File) {
    let pair = openpty(None, None).expect("openpty failed");
    (File::from(pair.master), File::from(pair.slave))
}

/// Path the open descriptor refers to, e.g. `/dev/pts/4`
pub fn fd_path(file: &File) -> PathBuf {
    std::fs::read_link(format!("/proc/self/fd/{}", file.as_raw_fd()))
        .expect("failed to resolve descriptor path")
}

/// A connected bidirectional byte stream pair
pub fn stream_pair() -> (File, File) {
    let (a, b) = UnixStream::pair().expect("socketpair failed");
    (File::from(OwnedFd::from(a)), File::from(OwnedFd::from(b)))
}

/// Compare the parts of two attribute sets the relay touches or restores
pub fn same_attributes(a: &Termios, b: &Termios) -> bool {
    a.input_flags == b.input_flags
        && a.output_flags == b.output_flags
        && a.control_flags == b.control_flags
        && a.local_flags == b.local_flags
        && a.control_chars == b.control_chars
}
