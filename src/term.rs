//! Terminal mode control for secondary devices
//!
//! Each secondary device has its attributes captured when it is opened.
//! The relay switches every device to raw mode for its lifetime, and the
//! captured attributes are written back exactly once when the owning
//! `DeviceSet` is dropped (or `restore_all` is called earlier).

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::libc;
use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
    Termios,
};

use crate::error::{RelayError, Result};

/// Maximum number of secondary devices a relay will drive
pub const MAX_DEVICES: usize = 10;

/// A secondary terminal device and its original attributes
#[derive(Debug)]
pub struct Device {
    path: PathBuf,
    file: File,
    /// Attributes at open time; `None` once restored or released
    saved: Option<Termios>,
}

impl Device {
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Name used in logs and error messages
    pub fn label(&self) -> String {
        format!("device {}", self.path.display())
    }
}

/// Ordered, bounded collection of secondary devices
///
/// Insertion order is the broadcast order used by the relay.
#[derive(Debug, Default)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a device by path and capture its attributes
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if self.devices.len() >= MAX_DEVICES {
            return Err(RelayError::TooManyDevices);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(|source| RelayError::OpenDevice {
                path: path.to_path_buf(),
                source,
            })?;

        self.push(path.to_path_buf(), file)
    }

    /// Register an already open device and capture its attributes
    pub fn push(&mut self, path: PathBuf, file: File) -> Result<()> {
        if self.devices.len() >= MAX_DEVICES {
            return Err(RelayError::TooManyDevices);
        }

        let saved = capture(&file).map_err(|source| RelayError::Capture {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(device = %path.display(), "captured terminal attributes");

        self.devices.push(Device {
            path,
            file,
            saved: Some(saved),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Current attributes of the first device that still answers
    pub fn first_attributes(&self) -> Option<Termios> {
        self.devices
            .iter()
            .find_map(|device| termios::tcgetattr(device.file.as_fd()).ok())
    }

    /// Switch every captured device into raw mode
    pub fn enter_raw_mode(&self) -> Result<()> {
        for device in &self.devices {
            let Some(saved) = &device.saved else {
                continue;
            };
            let raw = raw_attributes(saved);
            termios::tcsetattr(device.file.as_fd(), SetArg::TCSADRAIN, &raw).map_err(
                |source| RelayError::SetAttributes {
                    endpoint: device.label(),
                    source,
                },
            )?;
        }
        tracing::debug!(devices = self.devices.len(), "entered raw mode");
        Ok(())
    }

    /// Write back the captured attributes of every device
    ///
    /// Each device is restored at most once; later calls are no-ops.
    pub fn restore_all(&mut self) {
        for device in &mut self.devices {
            let Some(saved) = device.saved.take() else {
                continue;
            };
            if let Err(e) = termios::tcsetattr(device.file.as_fd(), SetArg::TCSADRAIN, &saved) {
                tracing::warn!(
                    device = %device.path.display(),
                    "failed to restore attributes: {}",
                    e
                );
            }
            let _ = termios::tcdrain(device.file.as_fd());
        }
    }

    /// Close every device without touching its attributes
    ///
    /// For processes that hold copies of the descriptors but do not own
    /// restoration.
    pub fn release(mut self) {
        for device in &mut self.devices {
            device.saved = None;
        }
    }
}

impl Drop for DeviceSet {
    fn drop(&mut self) {
        self.restore_all();
    }
}

/// Read the current attributes of a terminal
pub fn capture(file: &File) -> nix::Result<Termios> {
    termios::tcgetattr(file.as_fd())
}

/// Derive the raw-mode attributes used while relaying
pub fn raw_attributes(original: &Termios) -> Termios {
    let mut raw = original.clone();

    raw.input_flags.remove(
        InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXOFF,
    );
    raw.output_flags.remove(OutputFlags::OPOST);
    raw.local_flags.remove(
        LocalFlags::ECHO
            | LocalFlags::ECHONL
            | LocalFlags::ICANON
            | LocalFlags::ISIG
            | LocalFlags::IEXTEN,
    );
    raw.control_flags.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
    raw.control_flags.insert(ControlFlags::CS8);

    raw.control_chars[SpecialCharacterIndices::VLNEXT as usize] = libc::_POSIX_VDISABLE;
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    raw
}
