//! Channel session
//!
//! A [`ChannelSession`] owns the lifecycle of one hardware connection: open a
//! channel at a bitrate, hand out the frame stream once, and close. The
//! [`FrameStream`] polls the link with a short receive timeout so a close
//! request is noticed promptly, and it distinguishes an explicit close from a
//! lost link.

use crate::config::{validate_bitrate, MonitorConfig};
use crate::transport::{CanDriver, CanLink, LinkError};
use crate::types::{MonitorError, RawFrame, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type LinkSlot = Arc<Mutex<Option<Box<dyn CanLink>>>>;

/// Why a [`FrameStream`] stopped yielding frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// `close()` was called on the session
    Closed,
    /// The physical link failed
    LinkLost,
}

struct ActiveLink {
    channel: String,
    bitrate: u32,
    link: LinkSlot,
    stop: Arc<AtomicBool>,
    opened_at: Instant,
    stream_taken: bool,
}

/// One hardware connection at a time
pub struct ChannelSession {
    driver: Arc<dyn CanDriver>,
    config: MonitorConfig,
    active: Option<ActiveLink>,
}

impl ChannelSession {
    pub fn new(driver: Arc<dyn CanDriver>, config: MonitorConfig) -> Self {
        Self {
            driver,
            config,
            active: None,
        }
    }

    /// Open `channel` at `bitrate`.
    ///
    /// Fails with `MonitorError::Connection` when the session is already open,
    /// the bitrate is unsupported, or the driver cannot open the channel. A
    /// failed open leaves the session closed.
    pub fn open(&mut self, channel: &str, bitrate: u32) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(MonitorError::Connection(format!(
                "session already open on {}",
                active.channel
            )));
        }
        validate_bitrate(bitrate)?;

        let link = self.driver.open(channel, bitrate)?;
        log::info!(
            "Opened channel {} at {} bit/s ({} driver)",
            channel,
            bitrate,
            self.driver.name()
        );

        self.active = Some(ActiveLink {
            channel: channel.to_string(),
            bitrate,
            link: Arc::new(Mutex::new(Some(link))),
            stop: Arc::new(AtomicBool::new(false)),
            opened_at: Instant::now(),
            stream_taken: false,
        });
        Ok(())
    }

    /// Take the frame stream for the current connection.
    ///
    /// The stream can be taken once per `open`.
    pub fn frames(&mut self) -> Result<FrameStream> {
        let poll_interval = self.config.poll_interval();
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| MonitorError::InvalidState("session is not open".to_string()))?;
        if active.stream_taken {
            return Err(MonitorError::InvalidState(
                "frame stream already taken for this connection".to_string(),
            ));
        }
        active.stream_taken = true;

        Ok(FrameStream {
            link: active.link.clone(),
            stop: active.stop.clone(),
            poll_interval,
            opened_at: active.opened_at,
            end: None,
        })
    }

    /// Release the connection. Closing a closed session is a no-op.
    ///
    /// The stream is asked to stop; if its reader still holds the link after
    /// `close_timeout` the session drops its handle and the reader releases the
    /// link as soon as its pending receive returns.
    pub fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.stop.store(true, Ordering::SeqCst);

        match active.link.try_lock_for(self.config.close_timeout()) {
            Some(mut slot) => {
                if let Some(mut link) = slot.take() {
                    link.close();
                }
                log::info!("Closed channel {}", active.channel);
            }
            None => {
                log::warn!(
                    "Reader on {} did not stop within {:?}, force-releasing",
                    active.channel,
                    self.config.close_timeout()
                );
            }
        };
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn channel(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.channel.as_str())
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.bitrate)
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ordered frames from one connection.
///
/// Yields `Ok(frame)` while the link is up. After an explicit close it yields
/// `None`; after a link failure it yields one `Err(MonitorError::LinkLost)` and
/// then `None`.
pub struct FrameStream {
    link: LinkSlot,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    opened_at: Instant,
    end: Option<StreamEnd>,
}

impl FrameStream {
    /// How the stream ended, or `None` while it is still live
    pub fn end_reason(&self) -> Option<StreamEnd> {
        self.end
    }

    /// A handle that can stop this stream from another thread
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

impl Iterator for FrameStream {
    type Item = Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.end.is_some() {
            return None;
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.release();
                self.end = Some(StreamEnd::Closed);
                return None;
            }

            let mut slot = self.link.lock();
            let Some(link) = slot.as_mut() else {
                self.end = Some(StreamEnd::Closed);
                return None;
            };

            match link.recv(self.poll_interval) {
                Ok(Some(frame)) => {
                    let timestamp_ns = self.opened_at.elapsed().as_nanos() as u64;
                    log::trace!("rx 0x{:X} [{}]", frame.can_id, frame.data.len());
                    return Some(Ok(RawFrame {
                        timestamp_ns,
                        can_id: frame.can_id,
                        is_extended: frame.is_extended,
                        data: frame.data,
                    }));
                }
                Ok(None) => continue,
                Err(LinkError::Closed) => {
                    *slot = None;
                    self.end = Some(StreamEnd::Closed);
                    return None;
                }
                Err(LinkError::Lost(detail)) => {
                    link.close();
                    *slot = None;
                    log::warn!("Link lost: {}", detail);
                    self.end = Some(StreamEnd::LinkLost);
                    return Some(Err(MonitorError::LinkLost(detail)));
                }
            }
        }
    }
}

impl FrameStream {
    fn release(&self) {
        if let Some(mut link) = self.link.lock().take() {
            link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LinkFrame, VirtualBus, VirtualDriver};
    use std::thread;

    /// Driver whose links block in `recv` far past the requested timeout
    struct StallingDriver;

    struct StallingLink;

    impl CanDriver for StallingDriver {
        fn name(&self) -> &str {
            "stalling"
        }

        fn open(&self, _channel: &str, _bitrate: u32) -> Result<Box<dyn CanLink>> {
            Ok(Box::new(StallingLink))
        }
    }

    impl CanLink for StallingLink {
        fn recv(&mut self, _timeout: Duration) -> std::result::Result<Option<LinkFrame>, LinkError> {
            thread::sleep(Duration::from_secs(2));
            Ok(None)
        }

        fn close(&mut self) {}
    }

    fn session(bus: &VirtualBus) -> ChannelSession {
        let config = MonitorConfig::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_close_timeout(Duration::from_millis(200));
        ChannelSession::new(Arc::new(VirtualDriver::new(bus.clone())), config)
    }

    #[test]
    fn test_open_unsupported_bitrate() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        let err = session.open("can0", 83_333).unwrap_err();
        assert!(matches!(err, MonitorError::Connection(_)));
        assert!(!session.is_open());
        assert!(!bus.is_open("can0"));
    }

    #[test]
    fn test_failed_open_needs_no_close() {
        let bus = VirtualBus::new();
        let mut session = session(&bus);
        assert!(session.open("can0", 250_000).is_err());
        assert!(!session.is_open());

        bus.add_channel("can0");
        assert!(session.open("can0", 250_000).is_ok());
        assert_eq!(session.channel(), Some("can0"));
        assert_eq!(session.bitrate(), Some(250_000));
    }

    #[test]
    fn test_open_twice_fails() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        session.open("can0", 250_000).unwrap();
        assert!(matches!(
            session.open("can0", 250_000),
            Err(MonitorError::Connection(_))
        ));
        assert!(session.is_open());
    }

    #[test]
    fn test_close_is_idempotent() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        session.close();
        session.open("can0", 250_000).unwrap();
        session.close();
        session.close();
        assert!(!session.is_open());
        assert!(!bus.is_open("can0"));
    }

    #[test]
    fn test_stream_taken_once() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        assert!(matches!(session.frames(), Err(MonitorError::InvalidState(_))));
        session.open("can0", 250_000).unwrap();
        let _stream = session.frames().unwrap();
        assert!(matches!(session.frames(), Err(MonitorError::InvalidState(_))));
    }

    #[test]
    fn test_stream_yields_frames_in_order() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        session.open("can0", 250_000).unwrap();
        let mut stream = session.frames().unwrap();

        bus.send("can0", 0x100, &[1]);
        bus.send("can0", 0x200, &[2]);
        bus.send("can0", 0x100, &[3]);

        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        let third = stream.next().unwrap().unwrap();
        assert_eq!(
            vec![first.data[0], second.data[0], third.data[0]],
            vec![1, 2, 3]
        );
        assert!(first.timestamp_ns <= second.timestamp_ns);
        assert!(second.timestamp_ns <= third.timestamp_ns);
        assert!(stream.end_reason().is_none());
    }

    #[test]
    fn test_close_ends_stream() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        session.open("can0", 250_000).unwrap();
        let mut stream = session.frames().unwrap();

        let reader = thread::spawn(move || {
            let count = stream.by_ref().count();
            (count, stream.end_reason())
        });
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        session.close();
        let (count, end) = reader.join().unwrap();

        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(count, 0);
        assert_eq!(end, Some(StreamEnd::Closed));
        assert!(!bus.is_open("can0"));
    }

    #[test]
    fn test_link_loss_is_terminal_error() {
        let bus = VirtualBus::new().with_channel("can0");
        let mut session = session(&bus);
        session.open("can0", 250_000).unwrap();
        let mut stream = session.frames().unwrap();

        bus.send("can0", 0x100, &[0xFF]);
        bus.simulate_link_loss("can0", "bus-off");

        assert!(stream.next().unwrap().is_ok());
        match stream.next() {
            Some(Err(MonitorError::LinkLost(detail))) => assert_eq!(detail, "bus-off"),
            other => panic!("expected link loss, got {:?}", other),
        }
        assert!(stream.next().is_none());
        assert_eq!(stream.end_reason(), Some(StreamEnd::LinkLost));

        // A fresh open is required after the loss
        session.close();
        assert!(session.open("can0", 250_000).is_ok());
    }

    #[test]
    fn test_close_gives_up_on_stalled_reader() {
        let config = MonitorConfig::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_close_timeout(Duration::from_millis(200));
        let mut session = ChannelSession::new(Arc::new(StallingDriver), config);
        session.open("can0", 250_000).unwrap();
        let mut stream = session.frames().unwrap();

        let reader = thread::spawn(move || stream.next().is_none());
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        session.close();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(150), "closed after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "closed after {:?}", elapsed);
        assert!(!session.is_open());

        // Once its receive returns the reader sees the stop request
        assert!(reader.join().unwrap());
    }
}
