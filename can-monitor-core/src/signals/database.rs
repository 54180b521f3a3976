//! Message and signal database
//!
//! Holds the message definitions of one loaded DBC file, keyed by CAN ID.
//! A database is immutable once built; reloading produces a new one.

use crate::types::{MonitorError, Result};
use std::collections::HashMap;

/// Largest payload a message definition may declare (CAN-FD)
pub const MAX_PAYLOAD_BYTES: usize = 64;

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    /// CAN message ID (11-bit or 29-bit, without the extended flag)
    pub id: u32,
    /// True if the ID is a 29-bit extended identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message, in definition order
    pub signals: Vec<SignalDefinition>,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit, DBC numbering (LSB of a little-endian signal, MSB of a big-endian one)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: Option<f64>,
    /// Maximum physical value
    pub max: Option<f64>,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<String>,
    /// Value descriptions from `VAL_` (raw value -> text)
    pub value_table: Option<HashMap<i64, String>>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// How a start bit number maps onto the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitNumbering {
    /// Bit `n` is bit `n % 8` counted from the LSB of byte `n / 8` (DBC)
    Lsb0,
    /// Bit `n` is bit `n % 8` counted from the MSB of byte `n / 8`
    Msb0,
}

impl BitNumbering {
    /// Translate a bit number between the two numberings.
    ///
    /// The mapping mirrors the bit inside its byte, so it is its own inverse.
    pub fn flip(bit: usize) -> usize {
        8 * (bit / 8) + (7 - bit % 8)
    }
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

impl SignalDefinition {
    /// Create an unsigned, unscaled signal with a DBC start bit
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            unit: None,
            value_table: None,
            multiplexer_info: None,
        }
    }

    /// Create a signal whose start bit is given in the requested numbering
    pub fn with_numbering(
        name: impl Into<String>,
        start_bit: u16,
        numbering: BitNumbering,
        length: u16,
        byte_order: ByteOrder,
    ) -> Self {
        let start_bit = match numbering {
            BitNumbering::Lsb0 => start_bit,
            BitNumbering::Msb0 => BitNumbering::flip(start_bit as usize) as u16,
        };
        Self::new(name, start_bit, length, byte_order)
    }

    /// Builder method: interpret the raw value as two's complement
    pub fn signed(mut self) -> Self {
        self.value_type = ValueType::Signed;
        self
    }

    /// Builder method: set factor and offset
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: set the physical range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Builder method: set the engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Builder method: describe a raw value with a name
    pub fn with_value_description(mut self, raw: i64, text: impl Into<String>) -> Self {
        self.value_table
            .get_or_insert_with(HashMap::new)
            .insert(raw, text.into());
        self
    }

    /// Description of a raw value, if the database names it
    pub fn describe(&self, raw: i64) -> Option<&str> {
        self.value_table.as_ref()?.get(&raw).map(String::as_str)
    }

    /// Builder method: make the signal active only for the given multiplexer values
    pub fn multiplexed_by(mut self, multiplexer_signal: impl Into<String>, values: Vec<u64>) -> Self {
        self.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: multiplexer_signal.into(),
            multiplexer_values: values,
        });
        self
    }

    /// Start bit expressed in MSB-first numbering
    pub fn msb0_start_bit(&self) -> usize {
        BitNumbering::flip(self.start_bit as usize)
    }

    /// Payload bit positions (LSB-first numbering) occupied by this signal,
    /// from the signal's least significant bit upwards.
    pub fn bit_positions(&self) -> Vec<usize> {
        let length = self.length as usize;
        match self.byte_order {
            ByteOrder::LittleEndian => {
                let start = self.start_bit as usize;
                (start..start + length).collect()
            }
            ByteOrder::BigEndian => {
                // Walk MSB-first from the signal MSB, then reverse to LSB-first order
                let msb0 = self.msb0_start_bit();
                (0..length)
                    .rev()
                    .map(|i| BitNumbering::flip(msb0 + i))
                    .collect()
            }
        }
    }

    /// Number of payload bytes needed to hold the whole signal
    pub fn required_bytes(&self) -> usize {
        // Both orders walk forward through the payload in their own numbering
        let first = match self.byte_order {
            ByteOrder::LittleEndian => self.start_bit as usize,
            ByteOrder::BigEndian => self.msb0_start_bit(),
        };
        (first + self.length as usize + 7) / 8
    }

    /// True if the signal is present for the given multiplexer value
    pub fn is_active_for(&self, multiplexer_value: Option<u64>) -> bool {
        match (&self.multiplexer_info, multiplexer_value) {
            (None, _) => true,
            (Some(info), Some(value)) => info.multiplexer_values.contains(&value),
            (Some(_), None) => false,
        }
    }

    /// True if both signals can be present in the same frame
    fn coexists_with(&self, other: &SignalDefinition) -> bool {
        match (&self.multiplexer_info, &other.multiplexer_info) {
            (Some(a), Some(b)) if a.multiplexer_signal == b.multiplexer_signal => a
                .multiplexer_values
                .iter()
                .any(|v| b.multiplexer_values.contains(v)),
            _ => true,
        }
    }
}

impl MessageDefinition {
    /// Create a message without signals
    pub fn new(id: u32, name: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            is_extended: id > 0x7FF,
            name: name.into(),
            size,
            sender: None,
            signals: Vec::new(),
            multiplexer_signal: None,
        }
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    /// Builder method: name the multiplexor signal
    pub fn with_multiplexer(mut self, signal_name: impl Into<String>) -> Self {
        self.multiplexer_signal = Some(signal_name.into());
        self
    }

    /// True if this message has multiplexed signals
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer_signal.is_some()
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Check the structural invariants of this message.
    ///
    /// Every signal must lie inside the payload, signal names must be unique,
    /// and signals that can appear in the same frame must not share bits.
    pub fn validate(&self) -> Result<()> {
        if self.size > MAX_PAYLOAD_BYTES {
            return Err(MonitorError::Parse(format!(
                "Message '{}' (0x{:X}) declares {} bytes, maximum is {}",
                self.name, self.id, self.size, MAX_PAYLOAD_BYTES
            )));
        }

        let mut occupied: Vec<Vec<usize>> = Vec::with_capacity(self.signals.len());

        for (idx, signal) in self.signals.iter().enumerate() {
            if signal.length == 0 || signal.length > 64 {
                return Err(MonitorError::Parse(format!(
                    "Signal '{}' in message '{}' has invalid length {}",
                    signal.name, self.name, signal.length
                )));
            }

            if self.signals[..idx].iter().any(|s| s.name == signal.name) {
                return Err(MonitorError::Parse(format!(
                    "Duplicate signal name '{}' in message '{}'",
                    signal.name, self.name
                )));
            }

            let out_of_range = signal.required_bytes() > self.size;
            if out_of_range {
                return Err(MonitorError::Parse(format!(
                    "Signal '{}' ({}|{}) exceeds the {}-byte payload of message '{}'",
                    signal.name, signal.start_bit, signal.length, self.size, self.name
                )));
            }

            if let Some(mux) = &signal.multiplexer_info {
                if self.multiplexer_signal.as_deref() != Some(mux.multiplexer_signal.as_str()) {
                    return Err(MonitorError::Parse(format!(
                        "Multiplexed signal '{}' but no multiplexer '{}' in message '{}'",
                        signal.name, mux.multiplexer_signal, self.name
                    )));
                }
            }

            let bits = signal.bit_positions();
            for (other, other_bits) in self.signals[..idx].iter().zip(&occupied) {
                if signal.coexists_with(other) && bits.iter().any(|b| other_bits.contains(b)) {
                    return Err(MonitorError::Parse(format!(
                        "Signals '{}' and '{}' overlap in message '{}'",
                        other.name, signal.name, self.name
                    )));
                }
            }
            occupied.push(bits);
        }

        if let Some(mux_name) = &self.multiplexer_signal {
            if self.signal(mux_name).is_none() {
                return Err(MonitorError::Parse(format!(
                    "Multiplexer signal '{}' not found in message '{}'",
                    mux_name, self.name
                )));
            }
        }

        Ok(())
    }
}

/// The message database of one loaded DBC file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    /// All message definitions by CAN ID
    messages: HashMap<u32, MessageDefinition>,
    /// Source file (DBC filename)
    source: String,
}

impl Database {
    /// Create a new empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a database from message definitions.
    ///
    /// Each message is validated, and two messages with the same CAN ID are
    /// rejected.
    pub fn from_messages(
        messages: impl IntoIterator<Item = MessageDefinition>,
        source: impl Into<String>,
    ) -> Result<Self> {
        let mut by_id: HashMap<u32, MessageDefinition> = HashMap::new();

        for message in messages {
            message.validate()?;
            if let Some(existing) = by_id.get(&message.id) {
                return Err(MonitorError::Parse(format!(
                    "Duplicate CAN ID 0x{:X}: '{}' and '{}'",
                    message.id, existing.name, message.name
                )));
            }
            by_id.insert(message.id, message);
        }

        Ok(Self {
            messages: by_id,
            source: source.into(),
        })
    }

    /// Get the message definition for a CAN ID
    pub fn get(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&can_id)
    }

    /// Get the message definition matching both the identifier and its format.
    ///
    /// A standard frame never matches an extended definition with the same
    /// numeric identifier, and the other way round.
    pub fn lookup(&self, can_id: u32, is_extended: bool) -> Option<&MessageDefinition> {
        self.get(can_id).filter(|m| m.is_extended == is_extended)
    }

    /// True if a message with this CAN ID is defined
    pub fn contains(&self, can_id: u32) -> bool {
        self.messages.contains_key(&can_id)
    }

    /// All messages, sorted by CAN ID
    pub fn messages(&self) -> Vec<&MessageDefinition> {
        let mut messages: Vec<&MessageDefinition> = self.messages.values().collect();
        messages.sort_unstable_by_key(|m| m.id);
        messages
    }

    /// Get all CAN IDs in the database, sorted
    pub fn can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Messages whose hex ID (`0x1A0`) or name contains `text`, ignoring case
    pub fn search(&self, text: &str) -> Vec<&MessageDefinition> {
        let needle = text.trim().to_lowercase();
        self.messages()
            .into_iter()
            .filter(|m| {
                needle.is_empty()
                    || format!("0x{:x}", m.id).contains(&needle)
                    || m.name.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Source file name the database was loaded from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|m| m.signals.len()).sum(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_data() -> MessageDefinition {
        MessageDefinition::new(0x123, "EngineData", 8)
            .with_signal(
                SignalDefinition::new("EngineSpeed", 0, 16, ByteOrder::LittleEndian)
                    .with_range(0.0, 8000.0)
                    .with_unit("rpm"),
            )
            .with_signal(
                SignalDefinition::new("EngineTemp", 16, 8, ByteOrder::LittleEndian)
                    .with_scaling(1.0, -40.0),
            )
    }

    #[test]
    fn test_empty_database() {
        let db = Database::new();
        let stats = db.stats();
        assert_eq!(stats.num_messages, 0);
        assert_eq!(stats.num_signals, 0);
        assert!(db.is_empty());
    }

    #[test]
    fn test_from_messages() {
        let db = Database::from_messages(vec![engine_data()], "test.dbc").unwrap();

        let stats = db.stats();
        assert_eq!(stats.num_messages, 1);
        assert_eq!(stats.num_signals, 2);
        assert_eq!(db.source(), "test.dbc");

        let msg = db.get(0x123).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.signals[0].name, "EngineSpeed");
        assert!(db.get(0x124).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let other = MessageDefinition::new(0x123, "Other", 8);
        let err = Database::from_messages(vec![engine_data(), other], "dup.dbc").unwrap_err();
        assert!(matches!(err, MonitorError::Parse(_)));
        assert!(err.to_string().contains("0x123"));
    }

    #[test]
    fn test_msb0_numbering_conversion() {
        // MSB of byte 0 is bit 7 in DBC numbering
        let sig = SignalDefinition::with_numbering("S", 0, BitNumbering::Msb0, 8, ByteOrder::BigEndian);
        assert_eq!(sig.start_bit, 7);
        assert_eq!(sig.msb0_start_bit(), 0);

        // Flip is an involution
        for bit in 0..64 {
            assert_eq!(BitNumbering::flip(BitNumbering::flip(bit)), bit);
        }
    }

    #[test]
    fn test_big_endian_bit_positions() {
        // 12-bit Motorola signal, MSB at bit 7 of byte 0: covers byte 0 and the
        // high nibble of byte 1
        let sig = SignalDefinition::new("S", 7, 12, ByteOrder::BigEndian);
        let mut bits = sig.bit_positions();
        bits.sort_unstable();
        assert_eq!(bits, vec![0, 1, 2, 3, 4, 5, 6, 7, 12, 13, 14, 15]);
        assert_eq!(sig.required_bytes(), 2);
    }

    #[test]
    fn test_signal_outside_payload() {
        let msg = MessageDefinition::new(0x10, "Short", 2)
            .with_signal(SignalDefinition::new("Wide", 8, 16, ByteOrder::LittleEndian));
        assert!(msg.validate().is_err());

        // Motorola signal starting at the LSB of byte 1 runs into byte 2
        let msg = MessageDefinition::new(0x10, "Short", 2)
            .with_signal(SignalDefinition::new("Moto", 8, 16, ByteOrder::BigEndian));
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_overlap_rejected() {
        let msg = MessageDefinition::new(0x10, "Overlap", 8)
            .with_signal(SignalDefinition::new("A", 0, 8, ByteOrder::LittleEndian))
            .with_signal(SignalDefinition::new("B", 4, 8, ByteOrder::LittleEndian));
        let err = msg.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_multiplexed_overlap_allowed() {
        let msg = MessageDefinition::new(0x200, "Mux", 8)
            .with_multiplexer("Mode")
            .with_signal(SignalDefinition::new("Mode", 0, 8, ByteOrder::LittleEndian))
            .with_signal(
                SignalDefinition::new("A", 8, 16, ByteOrder::LittleEndian)
                    .multiplexed_by("Mode", vec![0]),
            )
            .with_signal(
                SignalDefinition::new("B", 8, 16, ByteOrder::LittleEndian)
                    .multiplexed_by("Mode", vec![1]),
            );
        assert!(msg.validate().is_ok());

        let clash = msg.clone().with_signal(
            SignalDefinition::new("C", 8, 8, ByteOrder::LittleEndian).multiplexed_by("Mode", vec![1]),
        );
        assert!(clash.validate().is_err());
    }

    #[test]
    fn test_search() {
        let db = Database::from_messages(
            vec![
                engine_data(),
                MessageDefinition::new(0x1A0, "BatteryStatus", 8),
            ],
            "test.dbc",
        )
        .unwrap();

        let names = |text: &str| -> Vec<String> {
            db.search(text).into_iter().map(|m| m.name.clone()).collect()
        };

        assert_eq!(names("battery"), vec!["BatteryStatus"]);
        assert_eq!(names("0x1A"), vec!["BatteryStatus"]);
        assert_eq!(names("0x12"), vec!["EngineData"]);
        assert_eq!(names(""), vec!["EngineData", "BatteryStatus"]);
        assert!(names("nothing").is_empty());
    }
}
