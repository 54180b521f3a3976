//! Monitor pipeline
//!
//! [`CanMonitor`] ties the pieces together:
//!
//! ```text
//! FrameStream -> capture thread -> FrameQueue -> dispatch thread
//!                                                  |-> MessageDecoder (current Database)
//!                                                  |-> Router (SelectionSet)
//!                                                  '-> Consumer
//! ```
//!
//! The capture thread only reads the link and pushes into the bounded queue,
//! so a slow consumer costs dropped frames, never a stalled read. The database
//! is swapped as a whole `Arc`, so the dispatch thread always decodes against
//! either the old or the new database.

use crate::config::MonitorConfig;
use crate::message_decoder::MessageDecoder;
use crate::queue::FrameQueue;
use crate::router::{Consumer, Router, SelectionSet};
use crate::session::{ChannelSession, FrameStream};
use crate::signals::{load_dbc_file, Database};
use crate::transport::CanDriver;
use crate::types::{
    DecodeOutcome, DisconnectReason, MonitorError, MonitorEvent, RawFrame, Result,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Pipeline counters, cumulative over the life of the monitor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Frames read from the link
    pub received: u64,
    /// Frames matched to a message definition
    pub decoded: u64,
    /// Frames whose identifier is not in the database
    pub unmatched: u64,
    /// Decoded frames shorter than their declared length
    pub truncated: u64,
    /// Frames evicted from the capture queue on overflow
    pub dropped: u64,
    /// Messages handed to the consumer
    pub delivered: u64,
    /// Selected messages the consumer refused because its buffer was full
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    decoded: AtomicU64,
    unmatched: AtomicU64,
    truncated: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// State shared between the caller and the two pipeline threads
struct Shared {
    database: RwLock<Arc<Database>>,
    router: Router,
    counters: Counters,
}

struct Pipeline {
    channel: String,
    session: ChannelSession,
    queue: Arc<FrameQueue>,
    stop: Arc<AtomicBool>,
    /// True until the connection ends; whoever flips it reports the disconnect
    live: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

/// Live CAN monitor
pub struct CanMonitor {
    driver: Arc<dyn CanDriver>,
    config: MonitorConfig,
    shared: Arc<Shared>,
    pipeline: Mutex<Option<Pipeline>>,
}

impl CanMonitor {
    /// Create a monitor with an empty database and an empty selection
    pub fn new<C>(driver: Arc<dyn CanDriver>, config: MonitorConfig, consumer: C) -> Self
    where
        C: Consumer + 'static,
    {
        let consumer: Arc<dyn Consumer> = Arc::new(consumer);
        Self {
            driver,
            config,
            shared: Arc::new(Shared {
                database: RwLock::new(Arc::new(Database::new())),
                router: Router::new(SelectionSet::new(), consumer),
                counters: Counters::default(),
            }),
            pipeline: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Load a DBC file and make it the active database.
    ///
    /// On failure the previous database stays active.
    pub fn load_database(&self, path: impl AsRef<Path>) -> Result<usize> {
        let loaded = load_dbc_file(path.as_ref())?;
        let count = loaded.message_count;
        self.set_database(loaded.database);
        Ok(count)
    }

    /// Replace the active database with an already built one
    pub fn set_database(&self, database: Database) {
        let count = database.len();
        *self.shared.database.write() = Arc::new(database);
        log::info!("Active database now has {} messages", count);
        self.shared
            .router
            .notify(MonitorEvent::DatabaseLoaded { count });
    }

    /// Snapshot of the active database
    pub fn database(&self) -> Arc<Database> {
        self.shared.database.read().clone()
    }

    /// Open `channel` and start the capture and dispatch threads
    pub fn connect(&self, channel: &str, bitrate: u32) -> Result<()> {
        self.config.validate()?;

        let mut slot = self.pipeline.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.live.load(Ordering::SeqCst) {
                return Err(MonitorError::Connection(format!(
                    "already connected to {}",
                    existing.channel
                )));
            }
        }
        // A pipeline that ended on link loss is torn down before reconnecting
        if let Some(stale) = slot.take() {
            self.shutdown(stale);
        }

        let mut session = ChannelSession::new(self.driver.clone(), self.config.clone());
        session.open(channel, bitrate)?;
        let stream = session.frames()?;

        let queue = Arc::new(FrameQueue::with_capacity(self.config.queue_depth));
        let stop = Arc::new(AtomicBool::new(false));
        let live = Arc::new(AtomicBool::new(true));
        let link_lost: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        // Held until Connected is out, so the dispatch thread cannot report
        // a lost link ahead of it
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();

        let capture = {
            let capture_queue = queue.clone();
            let shared = self.shared.clone();
            let link_lost = link_lost.clone();
            thread::Builder::new()
                .name("can-capture".to_string())
                .spawn(move || capture_loop(stream, &capture_queue, &shared, &link_lost))?
        };

        let dispatch = {
            let dispatch_queue = queue.clone();
            let shared = self.shared.clone();
            let stop = stop.clone();
            let live = live.clone();
            let gate = gate.clone();
            let spawned = thread::Builder::new()
                .name("can-dispatch".to_string())
                .spawn(move || {
                    drop(gate.lock());
                    dispatch_loop(&dispatch_queue, &shared, &stop, &live, &link_lost)
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    session.close();
                    queue.close();
                    return Err(e.into());
                }
            }
        };

        *slot = Some(Pipeline {
            channel: channel.to_string(),
            session,
            queue,
            stop,
            live,
            capture: Some(capture),
            dispatch: Some(dispatch),
        });
        drop(slot);

        log::info!("Monitoring {} at {} bit/s", channel, bitrate);
        self.shared.router.notify(MonitorEvent::Connected {
            channel: channel.to_string(),
            bitrate,
        });
        drop(held);
        Ok(())
    }

    /// Stop monitoring. Does nothing when not connected.
    pub fn disconnect(&self) {
        let Some(pipeline) = self.pipeline.lock().take() else {
            return;
        };
        let was_live = pipeline.live.swap(false, Ordering::SeqCst);
        let channel = pipeline.channel.clone();
        self.shutdown(pipeline);

        if was_live {
            log::info!("Disconnected from {}", channel);
            self.shared.router.notify(MonitorEvent::Disconnected {
                reason: DisconnectReason::Closed,
            });
        }
    }

    /// True while a connection is up and has not been lost
    pub fn is_connected(&self) -> bool {
        self.pipeline
            .lock()
            .as_ref()
            .map(|p| p.live.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn select(&self, can_id: u32) {
        self.shared.router.select(can_id);
    }

    pub fn deselect(&self, can_id: u32) {
        self.shared.router.deselect(can_id);
    }

    /// Select every message of the active database, returning how many were added
    pub fn select_all(&self) -> usize {
        let ids = self.database().can_ids();
        let added = self.shared.router.selection().select_all(ids);
        log::debug!("Selected {} more messages", added);
        added
    }

    pub fn clear_selection(&self) {
        self.shared.router.selection().clear();
        log::debug!("Selection cleared");
    }

    /// Shared handle to the selection
    pub fn selection(&self) -> SelectionSet {
        self.shared.router.selection().clone()
    }

    pub fn stats(&self) -> MonitorStats {
        let counters = &self.shared.counters;
        MonitorStats {
            received: counters.received.load(Ordering::Relaxed),
            decoded: counters.decoded.load(Ordering::Relaxed),
            unmatched: counters.unmatched.load(Ordering::Relaxed),
            truncated: counters.truncated.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            delivered: self.shared.router.delivered(),
            rejected: self.shared.router.rejected(),
        }
    }

    fn shutdown(&self, mut pipeline: Pipeline) {
        let deadline = Instant::now() + self.config.close_timeout();

        pipeline.stop.store(true, Ordering::SeqCst);
        pipeline.session.close();
        pipeline.queue.close();

        if let Some(handle) = pipeline.capture.take() {
            join_until(handle, deadline);
        }
        if let Some(handle) = pipeline.dispatch.take() {
            join_until(handle, deadline);
        }
        let discarded = pipeline.queue.clear();
        if discarded > 0 {
            log::debug!("Discarded {} queued frames on shutdown", discarded);
        }
    }
}

impl Drop for CanMonitor {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn capture_loop(
    stream: FrameStream,
    queue: &FrameQueue,
    shared: &Shared,
    link_lost: &Mutex<Option<String>>,
) {
    for item in stream {
        match item {
            Ok(frame) => {
                Counters::bump(&shared.counters.received);
                if queue.push(frame).is_some() {
                    let dropped = Counters::bump(&shared.counters.dropped);
                    if dropped == 1 || dropped % 1000 == 0 {
                        log::warn!(
                            "Capture queue full, dropped oldest frame ({} dropped so far)",
                            dropped
                        );
                    }
                }
            }
            Err(e) => {
                *link_lost.lock() = Some(e.to_string());
                break;
            }
        }
    }
    queue.close();
    log::debug!("Capture thread finished");
}

fn dispatch_loop(
    queue: &FrameQueue,
    shared: &Shared,
    stop: &AtomicBool,
    live: &AtomicBool,
    link_lost: &Mutex<Option<String>>,
) {
    while let Some(frame) = queue.pop() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        dispatch_frame(shared, &frame);
    }

    if stop.load(Ordering::SeqCst) {
        return;
    }
    if let Some(detail) = link_lost.lock().take() {
        if live.swap(false, Ordering::SeqCst) {
            let err = MonitorError::LinkLost(detail);
            log::warn!("{}", err);
            shared.router.notify(MonitorEvent::error(&err));
            shared.router.notify(MonitorEvent::Disconnected {
                reason: DisconnectReason::LinkLost,
            });
        }
    }
    log::debug!("Dispatch thread finished");
}

fn dispatch_frame(shared: &Shared, frame: &RawFrame) {
    let database = shared.database.read().clone();

    match MessageDecoder::decode_frame(&database, frame) {
        DecodeOutcome::Unmatched(can_id) => {
            Counters::bump(&shared.counters.unmatched);
            log::trace!("No definition for 0x{:X}", can_id);
        }
        DecodeOutcome::Decoded(message) => {
            let truncation = message.truncation_error();
            let delivered = shared.router.feed(message);

            if let Some(err) = truncation {
                Counters::bump(&shared.counters.truncated);
                if delivered {
                    shared.router.notify(MonitorEvent::error(&err));
                }
            }
            // Counted once routing is done so the counter never runs ahead of delivery
            Counters::bump(&shared.counters.decoded);
        }
    }
}

/// Join `handle`, giving up at `deadline` and leaving the thread detached
fn join_until(handle: JoinHandle<()>, deadline: Instant) {
    let name = handle.thread().name().unwrap_or("pipeline").to_string();

    // A consumer that disconnects from inside its callback runs on this thread
    if handle.thread().id() == thread::current().id() {
        return;
    }

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::warn!("{} thread did not stop in time, detaching it", name);
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    if handle.join().is_err() {
        log::error!("{} thread panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{ByteOrder, MessageDefinition, SignalDefinition};
    use crate::transport::{CanLink, LinkError, LinkFrame, VirtualBus, VirtualDriver};
    use std::sync::mpsc;

    /// Link that fails on its first receive
    struct DeadLink;

    impl CanLink for DeadLink {
        fn recv(&mut self, _timeout: Duration) -> std::result::Result<Option<LinkFrame>, LinkError> {
            Err(LinkError::Lost("bus-off".to_string()))
        }

        fn close(&mut self) {}
    }

    /// Link whose receive ignores its timeout
    struct StuckLink;

    impl CanLink for StuckLink {
        fn recv(&mut self, _timeout: Duration) -> std::result::Result<Option<LinkFrame>, LinkError> {
            thread::sleep(Duration::from_secs(2));
            Ok(None)
        }

        fn close(&mut self) {}
    }

    enum Behaviour {
        Dead,
        Stuck,
    }

    struct ScriptedDriver(Behaviour);

    impl CanDriver for ScriptedDriver {
        fn name(&self) -> &str {
            "scripted"
        }

        fn open(&self, _channel: &str, _bitrate: u32) -> Result<Box<dyn CanLink>> {
            match self.0 {
                Behaviour::Dead => Ok(Box::new(DeadLink)),
                Behaviour::Stuck => Ok(Box::new(StuckLink)),
            }
        }
    }

    fn scripted_monitor(
        behaviour: Behaviour,
        close_timeout: Duration,
    ) -> (CanMonitor, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel();
        let config = MonitorConfig::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_close_timeout(close_timeout);
        (CanMonitor::new(Arc::new(ScriptedDriver(behaviour)), config, tx), rx)
    }

    fn test_database() -> Database {
        let message = MessageDefinition::new(0x100, "EngineData", 8).with_signal(
            SignalDefinition::new("EngineSpeed", 0, 16, ByteOrder::LittleEndian)
                .with_scaling(0.1, 0.0),
        );
        Database::from_messages(vec![message], "test.dbc").unwrap()
    }

    fn monitor(bus: &VirtualBus) -> (CanMonitor, mpsc::Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel();
        let config = MonitorConfig::new()
            .with_poll_interval(Duration::from_millis(5))
            .with_close_timeout(Duration::from_millis(500));
        let driver = Arc::new(VirtualDriver::new(bus.clone()));
        (CanMonitor::new(driver, config, tx), rx)
    }

    #[test]
    fn test_stats_start_at_zero() {
        let (monitor, _rx) = monitor(&VirtualBus::new());
        assert_eq!(monitor.stats(), MonitorStats::default());
        assert!(!monitor.is_connected());
        assert!(monitor.database().is_empty());
    }

    #[test]
    fn test_set_database_emits_event() {
        let (monitor, rx) = monitor(&VirtualBus::new());
        monitor.set_database(test_database());
        assert_eq!(rx.recv().unwrap(), MonitorEvent::DatabaseLoaded { count: 1 });
        assert_eq!(monitor.select_all(), 1);
        assert_eq!(monitor.selection().snapshot(), vec![0x100]);
    }

    #[test]
    fn test_failed_load_keeps_previous_database() {
        let (monitor, _rx) = monitor(&VirtualBus::new());
        monitor.set_database(test_database());
        let err = monitor.load_database("/nonexistent/file.dbc").unwrap_err();
        assert!(matches!(err, MonitorError::Parse(_)));
        assert!(monitor.database().contains(0x100));
    }

    #[test]
    fn test_connect_failure_leaves_monitor_disconnected() {
        let (monitor, rx) = monitor(&VirtualBus::new());
        assert!(matches!(
            monitor.connect("can0", 250_000),
            Err(MonitorError::Connection(_))
        ));
        assert!(!monitor.is_connected());
        monitor.disconnect();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let bus = VirtualBus::new().with_channel("can0");
        let (monitor, _rx) = monitor(&bus);
        monitor.connect("can0", 250_000).unwrap();
        assert!(matches!(
            monitor.connect("can0", 250_000),
            Err(MonitorError::Connection(_))
        ));
        monitor.disconnect();
        assert!(!bus.is_open("can0"));
    }

    #[test]
    fn test_disconnect_emits_once() {
        let bus = VirtualBus::new().with_channel("can0");
        let (monitor, rx) = monitor(&bus);
        monitor.connect("can0", 500_000).unwrap();
        assert_eq!(
            rx.recv().unwrap(),
            MonitorEvent::Connected {
                channel: "can0".to_string(),
                bitrate: 500_000
            }
        );

        monitor.disconnect();
        monitor.disconnect();
        assert_eq!(
            rx.recv().unwrap(),
            MonitorEvent::Disconnected {
                reason: DisconnectReason::Closed
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connected_precedes_immediate_link_loss() {
        let (monitor, rx) = scripted_monitor(Behaviour::Dead, Duration::from_millis(500));

        for _ in 0..200 {
            monitor.connect("can0", 250_000).unwrap();
            let mut events = Vec::new();
            loop {
                let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
                let done = matches!(event, MonitorEvent::Disconnected { .. });
                events.push(event);
                if done {
                    break;
                }
            }

            assert_eq!(events.len(), 3, "{:?}", events);
            assert!(matches!(events[0], MonitorEvent::Connected { .. }), "{:?}", events);
            assert!(matches!(events[1], MonitorEvent::Error { .. }), "{:?}", events);
            assert_eq!(
                events[2],
                MonitorEvent::Disconnected {
                    reason: DisconnectReason::LinkLost
                }
            );
        }
    }

    #[test]
    fn test_disconnect_force_releases_stuck_reader() {
        let (monitor, rx) = scripted_monitor(Behaviour::Stuck, Duration::from_millis(200));
        monitor.connect("can0", 250_000).unwrap();
        // Let the capture thread enter its receive
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        monitor.disconnect();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(1000), "disconnect took {:?}", elapsed);
        assert!(!monitor.is_connected());
        assert!(matches!(rx.recv().unwrap(), MonitorEvent::Connected { .. }));
        assert_eq!(
            rx.recv().unwrap(),
            MonitorEvent::Disconnected {
                reason: DisconnectReason::Closed
            }
        );
    }
}
