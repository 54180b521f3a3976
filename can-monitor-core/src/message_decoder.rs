//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN frames based on the message definitions
//! of the loaded database. Handles bit extraction, endianness, multiplexing,
//! short payloads and physical value conversion.

use crate::signals::database::{ByteOrder, Database, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{DecodeOutcome, DecodedMessage, DecodedSignal, RawFrame, TruncatedFrame};

/// Message decoder - extracts signals from CAN frames
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode a raw frame against the database
    ///
    /// Returns [`DecodeOutcome::Unmatched`] when no message has the frame's
    /// identifier in the frame's format (standard or extended); that is the
    /// normal case for foreign traffic on a shared bus.
    pub fn decode_frame(database: &Database, frame: &RawFrame) -> DecodeOutcome {
        match database.lookup(frame.can_id, frame.is_extended) {
            Some(message_def) => {
                log::trace!("Decoding message: {} (ID 0x{:X})", message_def.name, frame.can_id);
                DecodeOutcome::Decoded(Self::decode_message(frame, message_def))
            }
            None => {
                log::trace!("Unknown CAN ID: 0x{:X}", frame.can_id);
                DecodeOutcome::Unmatched(frame.can_id)
            }
        }
    }

    /// Decode a CAN frame into a DecodedMessage
    ///
    /// Signals that lie entirely inside the received payload are decoded. If
    /// the payload is shorter than the declared message size, the result
    /// carries a [`TruncatedFrame`] report naming the signals that had to be
    /// skipped.
    pub fn decode_message(frame: &RawFrame, message_def: &MessageDefinition) -> DecodedMessage {
        let mut decoded_signals = Vec::with_capacity(message_def.signals.len());
        let mut skipped_signals = Vec::new();

        // For multiplexed messages, first extract the multiplexer signal value
        let multiplexer_value = message_def
            .multiplexer_signal
            .as_ref()
            .and_then(|name| message_def.signal(name))
            .and_then(|mux_signal| Self::extract_signal_value(&frame.data, mux_signal))
            .map(|value| value as u64);

        for signal in &message_def.signals {
            if signal.multiplexer_info.is_some() {
                match multiplexer_value {
                    // Multiplexer selects a different signal set
                    Some(_) if !signal.is_active_for(multiplexer_value) => continue,
                    Some(_) => {}
                    // Multiplexer itself was cut off, so nothing it controls is known
                    None => {
                        skipped_signals.push(signal.name.clone());
                        continue;
                    }
                }
            }

            match Self::decode_signal(&frame.data, signal) {
                Some(decoded) => decoded_signals.push(decoded),
                None => skipped_signals.push(signal.name.clone()),
            }
        }

        let truncation = if frame.data.len() < message_def.size {
            log::debug!(
                "Message 0x{:X} truncated: {} of {} bytes, skipped {:?}",
                frame.can_id,
                frame.data.len(),
                message_def.size,
                skipped_signals
            );
            Some(TruncatedFrame {
                expected_len: message_def.size,
                actual_len: frame.data.len(),
                skipped_signals,
            })
        } else {
            None
        };

        DecodedMessage {
            timestamp_ns: frame.timestamp_ns,
            can_id: frame.can_id,
            message_name: message_def.name.clone(),
            signals: decoded_signals,
            multiplexer_value,
            truncation,
        }
    }

    /// Decode a single signal from CAN frame data
    fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
        // Extract raw value from CAN frame data
        let raw_value = Self::extract_signal_value(data, signal)?;

        // Apply physical value conversion (factor and offset)
        let value = match signal.value_type {
            ValueType::Signed => raw_value as f64,
            // Unsigned 64-bit values above i64::MAX are carried bit-for-bit
            ValueType::Unsigned => raw_value as u64 as f64,
        } * signal.factor
            + signal.offset;

        Some(DecodedSignal {
            name: signal.name.clone(),
            value,
            raw_value,
            unit: signal.unit.clone(),
            description: signal.describe(raw_value).map(str::to_string),
        })
    }

    /// Extract raw signal value from CAN frame data
    ///
    /// Returns `None` when the signal would read past the end of `data`.
    fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let length = signal.length as usize;

        // Validate signal fits within data
        let required_bytes = signal.required_bytes();
        if required_bytes > data.len() {
            log::trace!(
                "Signal '{}' requires {} bytes but frame only has {} bytes",
                signal.name,
                required_bytes,
                data.len()
            );
            return None;
        }

        // Extract raw bits based on byte order
        let raw_value = match signal.byte_order {
            ByteOrder::LittleEndian => {
                Self::extract_little_endian(data, signal.start_bit as usize, length)
            }
            ByteOrder::BigEndian => Self::extract_big_endian(data, signal.msb0_start_bit(), length),
        };

        // Apply sign extension if needed
        let signed_value = match signal.value_type {
            ValueType::Unsigned => raw_value as i64,
            ValueType::Signed => Self::sign_extend(raw_value, length),
        };

        Some(signed_value)
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// Little-endian format:
    /// - Start bit points to the LSB (least significant bit)
    /// - Bits are numbered from LSB to MSB within each byte
    /// - Byte 0 is the first byte in the CAN frame
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte_idx = bit_pos / 8;
            let bit_in_byte = bit_pos % 8;

            if byte_idx < data.len() {
                let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
                result |= (bit_value as u64) << i;
            }
        }

        result
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// `msb0_start` is the signal's MSB in MSB-first numbering:
    /// - Bit 0 = MSB of byte 0, bit 7 = LSB of byte 0
    /// - Signal grows towards higher bit numbers
    fn extract_big_endian(data: &[u8], msb0_start: usize, length: usize) -> u64 {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = msb0_start + i;
            let byte_idx = bit_pos / 8;
            let bit_in_byte = 7 - (bit_pos % 8); // Bit 0 = MSB, bit 7 = LSB

            if byte_idx < data.len() {
                let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
                result |= (bit_value as u64) << (length - 1 - i);
            }
        }

        result
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            // Negative value - sign extend
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            // Positive value
            value as i64
        }
    }

    /// Write a physical value into a payload, the inverse of decoding
    ///
    /// The value is converted to raw (`(value - offset) / factor`, rounded) and
    /// clamped to the range the signal can represent. Returns the raw value
    /// written, or `None` if the payload is too short for the signal.
    pub fn encode_signal(data: &mut [u8], signal: &SignalDefinition, value: f64) -> Option<i64> {
        if signal.required_bytes() > data.len() || signal.length == 0 || signal.factor == 0.0 {
            return None;
        }

        let length = signal.length as u32;
        let (min, max): (i128, i128) = match signal.value_type {
            ValueType::Unsigned => (0, (1i128 << length) - 1),
            ValueType::Signed => (-(1i128 << (length - 1)), (1i128 << (length - 1)) - 1),
        };
        let raw = (((value - signal.offset) / signal.factor).round() as i128).clamp(min, max);

        // Two's complement truncated to the signal width
        let bits = (raw as u128 & ((1u128 << length) - 1)) as u64;

        for (i, bit_pos) in signal.bit_positions().into_iter().enumerate() {
            let mask = 1u8 << (bit_pos % 8);
            if (bits >> i) & 1 == 1 {
                data[bit_pos / 8] |= mask;
            } else {
                data[bit_pos / 8] &= !mask;
            }
        }

        Some(raw as i64)
    }
}
