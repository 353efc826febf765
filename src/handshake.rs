//! One-shot readiness handshake
//!
//! The relay process signals the foreground process through a private pipe
//! once every endpoint is registered; the foreground process only execs
//! the target command after it has read that byte. Both halves consume
//! themselves, so the byte is sent and received at most once.

use std::fs::File;
use std::io::{self, Read};

use nix::unistd::pipe;

use crate::error::{RelayError, Result};
use crate::relay::write_byte;

/// Token written on the pipe; only its arrival matters
const READY: u8 = b'w';

/// Write end, held by the process that becomes the relay
#[derive(Debug)]
pub struct ReadySender {
    pipe: File,
}

/// Read end, held by the foreground exec-waiter
#[derive(Debug)]
pub struct ReadyReceiver {
    pipe: File,
}

/// Create a connected sender/receiver pair
pub fn channel() -> Result<(ReadySender, ReadyReceiver)> {
    let (read_end, write_end) = pipe().map_err(RelayError::Pipe)?;
    Ok((
        ReadySender {
            pipe: File::from(write_end),
        },
        ReadyReceiver {
            pipe: File::from(read_end),
        },
    ))
}

impl ReadySender {
    /// Tell the foreground process it may exec now
    pub fn signal(self) -> Result<()> {
        write_byte(&self.pipe, READY).map_err(RelayError::HandshakeSend)?;
        tracing::debug!("readiness signal sent");
        Ok(())
    }
}

impl ReadyReceiver {
    /// Block until the relay signals readiness
    ///
    /// A closed pipe means the relay died before it was ready.
    pub fn wait(mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        loop {
            match self.pipe.read(&mut buf) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(RelayError::HandshakeClosed),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::HandshakeReceive(e)),
            }
        }
    }
}
