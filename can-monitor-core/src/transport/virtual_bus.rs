//! In-process virtual CAN bus
//!
//! A [`VirtualBus`] owns a set of named channels. Frames are injected from the
//! test or demo side and received through a [`VirtualDriver`] link, and a
//! channel can be told to drop its link to exercise the failure path.

use super::{CanDriver, CanLink, LinkError, LinkFrame};
use crate::types::{MonitorError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ChannelState {
    pending: VecDeque<LinkFrame>,
    open: bool,
    bitrate: Option<u32>,
    lost: Option<String>,
}

#[derive(Debug)]
struct BusState {
    driver_present: bool,
    channels: HashMap<String, ChannelState>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<BusState>,
    activity: Condvar,
}

/// Shared handle to an in-process bus
#[derive(Debug, Clone)]
pub struct VirtualBus {
    shared: Arc<Shared>,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    /// Create a bus with no channels
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState {
                    driver_present: true,
                    channels: HashMap::new(),
                }),
                activity: Condvar::new(),
            }),
        }
    }

    /// Builder method: add a channel
    pub fn with_channel(self, name: &str) -> Self {
        self.add_channel(name);
        self
    }

    pub fn add_channel(&self, name: &str) {
        self.shared
            .state
            .lock()
            .channels
            .entry(name.to_string())
            .or_default();
    }

    /// Simulate the driver library being installed or missing
    pub fn set_driver_present(&self, present: bool) {
        self.shared.state.lock().driver_present = present;
    }

    /// Queue a frame on a channel. Returns false when nobody has the channel open.
    pub fn inject(&self, channel: &str, frame: LinkFrame) -> bool {
        let mut state = self.shared.state.lock();
        match state.channels.get_mut(channel) {
            Some(ch) if ch.open && ch.lost.is_none() => {
                ch.pending.push_back(frame);
                self.shared.activity.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Convenience wrapper around [`VirtualBus::inject`]
    pub fn send(&self, channel: &str, can_id: u32, data: &[u8]) -> bool {
        self.inject(channel, LinkFrame::new(can_id, data))
    }

    /// Make the open link on `channel` fail with `reason`
    pub fn simulate_link_loss(&self, channel: &str, reason: &str) {
        let mut state = self.shared.state.lock();
        if let Some(ch) = state.channels.get_mut(channel) {
            ch.lost = Some(reason.to_string());
            self.shared.activity.notify_all();
        }
    }

    pub fn is_open(&self, channel: &str) -> bool {
        self.shared
            .state
            .lock()
            .channels
            .get(channel)
            .map(|ch| ch.open)
            .unwrap_or(false)
    }

    /// Bitrate the channel was opened with, if it is open
    pub fn bitrate(&self, channel: &str) -> Option<u32> {
        self.shared
            .state
            .lock()
            .channels
            .get(channel)
            .and_then(|ch| if ch.open { ch.bitrate } else { None })
    }

    /// Frames injected but not yet received
    pub fn pending(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .channels
            .get(channel)
            .map(|ch| ch.pending.len())
            .unwrap_or(0)
    }
}

/// [`CanDriver`] backed by a [`VirtualBus`]
#[derive(Debug, Clone)]
pub struct VirtualDriver {
    bus: VirtualBus,
}

impl VirtualDriver {
    pub fn new(bus: VirtualBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &VirtualBus {
        &self.bus
    }
}

impl CanDriver for VirtualDriver {
    fn name(&self) -> &str {
        "virtual"
    }

    fn open(&self, channel: &str, bitrate: u32) -> Result<Box<dyn CanLink>> {
        super::validate_bitrate(bitrate)?;

        let mut state = self.bus.shared.state.lock();
        if !state.driver_present {
            return Err(MonitorError::Connection(
                "virtual CAN driver not installed".to_string(),
            ));
        }
        let ch = state.channels.get_mut(channel).ok_or_else(|| {
            MonitorError::Connection(format!("device not found: {}", channel))
        })?;
        if ch.open {
            return Err(MonitorError::Connection(format!(
                "channel {} is already in use",
                channel
            )));
        }

        ch.open = true;
        ch.bitrate = Some(bitrate);
        ch.lost = None;
        ch.pending.clear();

        Ok(Box::new(VirtualLink {
            bus: self.bus.clone(),
            channel: channel.to_string(),
            closed: false,
        }))
    }
}

struct VirtualLink {
    bus: VirtualBus,
    channel: String,
    closed: bool,
}

impl CanLink for VirtualLink {
    fn recv(&mut self, timeout: Duration) -> std::result::Result<Option<LinkFrame>, LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }

        let deadline = Instant::now() + timeout;
        let shared = &self.bus.shared;
        let mut state = shared.state.lock();
        loop {
            let ch = state
                .channels
                .get_mut(&self.channel)
                .ok_or_else(|| LinkError::Lost(format!("channel {} removed", self.channel)))?;

            // Frames that arrived before the loss are still delivered
            if let Some(frame) = ch.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(reason) = &ch.lost {
                return Err(LinkError::Lost(reason.clone()));
            }

            if shared.activity.wait_until(&mut state, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.bus.shared.state.lock();
        if let Some(ch) = state.channels.get_mut(&self.channel) {
            ch.open = false;
            ch.bitrate = None;
            ch.pending.clear();
        }
        self.bus.shared.activity.notify_all();
    }
}

impl Drop for VirtualLink {
    fn drop(&mut self) {
        self.close();
    }
}
