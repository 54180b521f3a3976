//! Hardware transport boundary
//!
//! The session talks to hardware through two small traits:
//! - [`CanDriver`] opens a channel at a bitrate and hands back a link
//! - [`CanLink`] yields received frames until it is closed or the link drops
//!
//! Implementations:
//! - [`VirtualDriver`] over an in-process [`VirtualBus`] (tests and demos)
//! - `SocketCanDriver` for Linux SocketCAN interfaces

pub mod virtual_bus;

#[cfg(target_os = "linux")]
pub mod socketcan;

pub use crate::config::{validate_bitrate, SUPPORTED_BITRATES};
pub use virtual_bus::{VirtualBus, VirtualDriver};

#[cfg(target_os = "linux")]
pub use self::socketcan::SocketCanDriver;

use crate::types::Result;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A frame as received from the hardware, before it is timestamped by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    pub can_id: u32,
    pub is_extended: bool,
    pub data: Vec<u8>,
}

impl LinkFrame {
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            can_id,
            is_extended: can_id > 0x7FF,
            data: data.into(),
        }
    }

    /// Builder method: force the extended-identifier flag
    pub fn extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }
}

/// Errors raised by an open link
#[derive(Error, Debug)]
pub enum LinkError {
    /// The physical link went away; the link is unusable afterwards
    #[error("Link lost: {0}")]
    Lost(String),

    /// The link was closed while a receive was pending
    #[error("Link closed")]
    Closed,
}

/// Opens hardware channels
pub trait CanDriver: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &str;

    /// Open `channel` at `bitrate`. Failures are `MonitorError::Connection`.
    fn open(&self, channel: &str, bitrate: u32) -> Result<Box<dyn CanLink>>;
}

/// An open hardware channel
pub trait CanLink: Send {
    /// Wait up to `timeout` for the next frame. `Ok(None)` means nothing arrived in time.
    fn recv(&mut self, timeout: Duration) -> std::result::Result<Option<LinkFrame>, LinkError>;

    /// Release the hardware handle. Calling it twice is a no-op.
    fn close(&mut self);
}

/// Driver for the host platform's native CAN stack
pub fn default_driver() -> Result<Arc<dyn CanDriver>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(SocketCanDriver::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(crate::types::MonitorError::Connection(
            "no CAN driver available: SocketCAN requires Linux".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MonitorError;

    #[test]
    fn test_link_frame_extended_flag() {
        assert!(!LinkFrame::new(0x100, vec![0u8; 8]).is_extended);
        assert!(LinkFrame::new(0x18FEF100, vec![]).is_extended);
        assert!(LinkFrame::new(0x10, vec![]).extended(true).is_extended);
    }

    #[test]
    fn test_drivers_share_the_bitrate_list() {
        let bus = VirtualBus::new().with_channel("can0");
        let driver = VirtualDriver::new(bus);
        for bitrate in SUPPORTED_BITRATES {
            let mut link = driver.open("can0", bitrate).unwrap();
            link.close();
        }
        assert!(matches!(driver.open("can0", 100_000), Err(MonitorError::Connection(_))));
    }
}
