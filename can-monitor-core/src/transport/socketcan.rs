//! SocketCAN driver (Linux only)
//!
//! The interface bitrate is configured outside the process (`ip link set can0
//! type can bitrate 250000`); the requested bitrate is only checked against the
//! supported list and logged.

use super::{CanDriver, CanLink, LinkError, LinkFrame};
use crate::types::{MonitorError, Result};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};
use std::io;
use std::time::{Duration, Instant};

/// A zero read timeout would mean "block forever" to the kernel
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Default, Clone)]
pub struct SocketCanDriver;

impl SocketCanDriver {
    pub fn new() -> Self {
        Self
    }
}

impl CanDriver for SocketCanDriver {
    fn name(&self) -> &str {
        "socketcan"
    }

    fn open(&self, channel: &str, bitrate: u32) -> Result<Box<dyn CanLink>> {
        super::validate_bitrate(bitrate)?;

        let socket = CanSocket::open(channel).map_err(|e| {
            MonitorError::Connection(format!("Failed to open {}: {}", channel, e))
        })?;
        socket.set_read_timeout(MIN_READ_TIMEOUT).map_err(|e| {
            MonitorError::Connection(format!("Failed to set read timeout on {}: {}", channel, e))
        })?;

        log::info!(
            "Opened SocketCAN interface {} (expecting {} bit/s)",
            channel,
            bitrate
        );

        Ok(Box::new(SocketCanLink {
            socket: Some(socket),
            channel: channel.to_string(),
            read_timeout: MIN_READ_TIMEOUT,
        }))
    }
}

struct SocketCanLink {
    socket: Option<CanSocket>,
    channel: String,
    /// Timeout currently set on the socket
    read_timeout: Duration,
}

impl CanLink for SocketCanLink {
    fn recv(&mut self, timeout: Duration) -> std::result::Result<Option<LinkFrame>, LinkError> {
        let timeout = timeout.max(MIN_READ_TIMEOUT);
        let socket = self.socket.as_ref().ok_or(LinkError::Closed)?;
        if timeout != self.read_timeout {
            socket
                .set_read_timeout(timeout)
                .map_err(|e| LinkError::Lost(format!("{}: set read timeout: {}", self.channel, e)))?;
            self.read_timeout = timeout;
        }
        let deadline = Instant::now() + timeout;

        // Blocks for at most the read timeout; error frames restart the wait
        loop {
            match socket.read_frame() {
                Ok(CanFrame::Error(frame)) => {
                    log::debug!("{}: bus error frame 0x{:X}", self.channel, frame.raw_id());
                }
                Ok(frame) => {
                    return Ok(Some(LinkFrame {
                        can_id: frame.raw_id(),
                        is_extended: EmbeddedFrame::is_extended(&frame),
                        data: EmbeddedFrame::data(&frame).to_vec(),
                    }));
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(LinkError::Lost(format!("{}: {}", self.channel, e)));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Closed SocketCAN interface {}", self.channel);
        }
    }
}
