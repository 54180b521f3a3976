//! Selection and dispatch
//!
//! The [`SelectionSet`] holds the identifiers the user wants to watch. The
//! [`Router`] forwards a decoded message to the [`Consumer`] only when its
//! identifier is selected at the moment the message is fed.

use crate::types::{DecodedMessage, MonitorEvent};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

/// Receives every event the monitor produces
pub trait Consumer: Send + Sync {
    fn on_event(&self, event: MonitorEvent);

    /// Hand over a decoded message, returning false if the consumer refused it.
    ///
    /// Consumers with a bounded buffer override this to refuse instead of
    /// blocking the dispatch thread.
    fn offer(&self, event: MonitorEvent) -> bool {
        self.on_event(event);
        true
    }
}

impl<F> Consumer for F
where
    F: Fn(MonitorEvent) + Send + Sync,
{
    fn on_event(&self, event: MonitorEvent) {
        self(event)
    }
}

impl Consumer for mpsc::Sender<MonitorEvent> {
    fn on_event(&self, event: MonitorEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.send(event);
    }
}

/// Bounded channel: a full buffer refuses the event instead of growing
impl Consumer for mpsc::SyncSender<MonitorEvent> {
    fn on_event(&self, event: MonitorEvent) {
        if let Err(mpsc::TrySendError::Full(_)) = self.try_send(event) {
            log::debug!("Consumer buffer full, event not delivered");
        }
    }

    fn offer(&self, event: MonitorEvent) -> bool {
        match self.try_send(event) {
            Ok(()) => true,
            Err(mpsc::TrySendError::Full(_)) => false,
            // Nobody is listening any more; nothing is buffered either
            Err(mpsc::TrySendError::Disconnected(_)) => true,
        }
    }
}

/// Shared set of selected identifiers
///
/// Clones share the same underlying set.
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    ids: Arc<RwLock<HashSet<u32>>>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the identifier was not already selected
    pub fn select(&self, can_id: u32) -> bool {
        self.ids.write().insert(can_id)
    }

    /// Returns true if the identifier was selected
    pub fn deselect(&self, can_id: u32) -> bool {
        self.ids.write().remove(&can_id)
    }

    /// Select every identifier in `ids`, returning how many were newly added
    pub fn select_all<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = u32>,
    {
        let mut set = self.ids.write();
        ids.into_iter().filter(|id| set.insert(*id)).count()
    }

    pub fn clear(&self) {
        self.ids.write().clear();
    }

    pub fn contains(&self, can_id: u32) -> bool {
        self.ids.read().contains(&can_id)
    }

    /// Sorted copy of the current selection
    pub fn snapshot(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.ids.read().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }
}

/// Filters decoded messages by the selection and forwards them
pub struct Router {
    selection: SelectionSet,
    consumer: Arc<dyn Consumer>,
    delivered: AtomicU64,
    filtered: AtomicU64,
    rejected: AtomicU64,
}

impl Router {
    pub fn new(selection: SelectionSet, consumer: Arc<dyn Consumer>) -> Self {
        Self {
            selection,
            consumer,
            delivered: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn select(&self, can_id: u32) {
        if self.selection.select(can_id) {
            log::debug!("Selected 0x{:X}", can_id);
        }
    }

    pub fn deselect(&self, can_id: u32) {
        if self.selection.deselect(can_id) {
            log::debug!("Deselected 0x{:X}", can_id);
        }
    }

    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    /// Deliver `message` if its identifier is currently selected.
    ///
    /// Returns whether the consumer received it; a consumer with a full
    /// buffer may refuse it, which is counted as rejected.
    pub fn feed(&self, message: DecodedMessage) -> bool {
        if !self.selection.contains(message.can_id) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let can_id = message.can_id;
        if !self.consumer.offer(MonitorEvent::Message(message)) {
            let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
            if rejected == 1 || rejected % 1000 == 0 {
                log::warn!(
                    "Consumer is not keeping up, 0x{:X} not delivered ({} so far)",
                    can_id,
                    rejected
                );
            }
            return false;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Send a lifecycle or error event to the consumer, bypassing the selection
    pub fn notify(&self, event: MonitorEvent) {
        self.consumer.on_event(event);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    /// Selected messages the consumer refused
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
