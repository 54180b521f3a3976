//! CAN Monitor Library
//!
//! Decodes live CAN traffic with signal definitions from a DBC file and
//! streams the messages a user has selected to a consumer.
//!
//! # Architecture
//!
//! - Loads DBC files into an immutable message database
//! - Reads frames from a hardware channel on a capture thread
//! - Buffers them in a bounded queue that drops the oldest frame on overflow
//! - Decodes, filters by the selection and delivers on a dispatch thread
//!
//! The library does NOT:
//! - Write or edit DBC files
//! - Transmit frames
//! - Record captured traffic
//!
//! Rendering is up to the consumer (see the `can-monitor` binary).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_monitor_core::{transport, CanMonitor, MonitorConfig, MonitorEvent};
//!
//! let driver = transport::default_driver().unwrap();
//! let monitor = CanMonitor::new(driver, MonitorConfig::default(), |event: MonitorEvent| {
//!     if let MonitorEvent::Message(message) = event {
//!         for signal in &message.signals {
//!             println!("{} {}", message.message_name, signal);
//!         }
//!     }
//! });
//!
//! monitor.load_database("powertrain.dbc").unwrap();
//! monitor.select(0x100);
//! monitor.connect("can0", 500_000).unwrap();
//! // ...
//! monitor.disconnect();
//! ```

// Public modules
pub mod config;
pub mod message_decoder;
pub mod monitor;
pub mod queue;
pub mod router;
pub mod session;
pub mod signals;
pub mod tracker;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::{MonitorConfig, SUPPORTED_BITRATES};
pub use message_decoder::MessageDecoder;
pub use monitor::{CanMonitor, MonitorStats};
pub use queue::FrameQueue;
pub use router::{Consumer, Router, SelectionSet};
pub use session::{ChannelSession, FrameStream, StreamEnd};
pub use signals::{
    load_dbc_file, load_dbc_str, ByteOrder, Database, DatabaseStats, LoadedDatabase,
    MessageDefinition, SignalDefinition, ValueType,
};
pub use tracker::{MessageTracker, TrackedMessage};
pub use transport::{CanDriver, CanLink, LinkError, LinkFrame, VirtualBus, VirtualDriver};
pub use types::{
    DecodeOutcome, DecodedMessage, DecodedSignal, DisconnectReason, ErrorKind, MonitorError,
    MonitorEvent, RawFrame, Result, TruncatedFrame,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
