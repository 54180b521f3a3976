//! Core types for the CAN monitor library
//!
//! This module defines the frames read from the bus, the messages the decoder
//! emits, the lifecycle events delivered to consumers, and the error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result type for monitor operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Raw CAN frame as captured from a channel session
///
/// This represents a single CAN frame exactly as the hardware delivered it,
/// before any signal decoding or message interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Monotonic capture time in nanoseconds since the session was opened
    pub timestamp_ns: u64,
    /// CAN message ID (11-bit or 29-bit)
    pub can_id: u32,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    /// Frame data bytes (0-8 bytes for classic CAN)
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Create a frame with a zero timestamp; identifiers above 0x7FF are extended
    pub fn new(can_id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp_ns: 0,
            can_id,
            is_extended: can_id > 0x7FF,
            data: data.into(),
        }
    }

    /// Builder method: set the identifier format explicitly
    pub fn extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }

    /// Builder method: set the capture timestamp
    pub fn with_timestamp_ns(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// Capture timestamp as a duration since session open
    pub fn timestamp(&self) -> Duration {
        Duration::from_nanos(self.timestamp_ns)
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

/// Errors that can occur while loading, connecting or decoding
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Failed to parse DBC file: {0}")]
    Parse(String),

    #[error("Failed to connect: {0}")]
    Connection(String),

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("Truncated frame for CAN ID 0x{can_id:X}: expected {expected_len} bytes, got {actual_len}")]
    TruncatedFrame {
        can_id: u32,
        expected_len: usize,
        actual_len: usize,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Classify this error for the consumer boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonitorError::Parse(_) => ErrorKind::Parse,
            MonitorError::Connection(_) => ErrorKind::Connection,
            MonitorError::LinkLost(_) => ErrorKind::LinkLost,
            MonitorError::TruncatedFrame { .. } => ErrorKind::TruncatedFrame,
            MonitorError::InvalidState(_) | MonitorError::Config(_) => ErrorKind::Usage,
            MonitorError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Error classification carried by [`MonitorEvent::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Parse,
    Connection,
    LinkLost,
    TruncatedFrame,
    Usage,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Parse => write!(f, "ParseError"),
            ErrorKind::Connection => write!(f, "ConnectionError"),
            ErrorKind::LinkLost => write!(f, "LinkLostError"),
            ErrorKind::TruncatedFrame => write!(f, "TruncatedFrameError"),
            ErrorKind::Usage => write!(f, "UsageError"),
            ErrorKind::Io => write!(f, "IoError"),
        }
    }
}

/// A decoded signal with its current value
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Signal name from the DBC
    pub name: String,
    /// Physical value (`raw * factor + offset`)
    pub value: f64,
    /// Raw value before scaling, sign-extended for signed signals
    pub raw_value: i64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Name of the raw value from the database's value descriptions
    pub description: Option<String>,
}

impl fmt::Display for DecodedSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(description) = &self.description {
            return write!(f, "{}: {}", self.name, description);
        }
        match &self.unit {
            Some(unit) => write!(f, "{}: {} {}", self.name, format_value(self.value), unit),
            None => write!(f, "{}: {}", self.name, format_value(self.value)),
        }
    }
}

/// Format a physical value without trailing noise for whole numbers
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.3}", value)
    }
}

/// Signals that could not be decoded because the payload was too short
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedFrame {
    /// Payload length declared by the message definition
    pub expected_len: usize,
    /// Payload length actually received
    pub actual_len: usize,
    /// Signals that would have read past the end of the payload
    pub skipped_signals: Vec<String>,
}

/// One successfully matched frame, decoded into physical values
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Capture time in nanoseconds since the session was opened
    pub timestamp_ns: u64,
    /// CAN message ID
    pub can_id: u32,
    /// Message name from the DBC
    pub message_name: String,
    /// Decoded signals, in definition order
    pub signals: Vec<DecodedSignal>,
    /// Active multiplexer value (if message is multiplexed)
    pub multiplexer_value: Option<u64>,
    /// Present when the payload was shorter than the declared length
    pub truncation: Option<TruncatedFrame>,
}

impl DecodedMessage {
    /// Look up a decoded signal by name
    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Physical value of a signal by name
    pub fn value(&self, name: &str) -> Option<f64> {
        self.signal(name).map(|s| s.value)
    }

    /// True if some signals were skipped because the payload was short
    pub fn is_truncated(&self) -> bool {
        self.truncation.is_some()
    }

    /// The truncation report as an error value, for the consumer boundary
    pub fn truncation_error(&self) -> Option<MonitorError> {
        self.truncation.as_ref().map(|t| MonitorError::TruncatedFrame {
            can_id: self.can_id,
            expected_len: t.expected_len,
            actual_len: t.actual_len,
        })
    }
}

/// Outcome of decoding a single frame
///
/// Unknown identifiers are routine on a shared bus, so they are a variant
/// rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// The frame matched a message definition
    Decoded(DecodedMessage),
    /// No message definition has this identifier
    Unmatched(u32),
}

impl DecodeOutcome {
    /// Convert into the decoded message, discarding unmatched outcomes
    pub fn into_message(self) -> Option<DecodedMessage> {
        match self {
            DecodeOutcome::Decoded(message) => Some(message),
            DecodeOutcome::Unmatched(_) => None,
        }
    }

    pub fn is_unmatched(&self) -> bool {
        matches!(self, DecodeOutcome::Unmatched(_))
    }
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The caller closed the session
    Closed,
    /// The physical link failed while open
    LinkLost,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed"),
            DisconnectReason::LinkLost => write!(f, "link lost"),
        }
    }
}

/// Everything a consumer can receive from the monitor
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A channel session was opened
    Connected { channel: String, bitrate: u32 },
    /// The channel session ended
    Disconnected { reason: DisconnectReason },
    /// A database was loaded and is now active
    DatabaseLoaded { count: usize },
    /// A selected message was decoded
    Message(DecodedMessage),
    /// A non-fatal or asynchronous error
    Error { kind: ErrorKind, detail: String },
}

impl MonitorEvent {
    /// Build an error event from a monitor error
    pub fn error(err: &MonitorError) -> Self {
        MonitorEvent::Error {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }

    /// Get the CAN ID of this event (if applicable)
    pub fn can_id(&self) -> Option<u32> {
        match self {
            MonitorEvent::Message(message) => Some(message.can_id),
            _ => None,
        }
    }
}
