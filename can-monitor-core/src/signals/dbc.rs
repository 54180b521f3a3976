//! DBC file loader
//!
//! Parses Vector DBC files and converts them into our internal message database.
//!
//! Loading happens in two steps. A line-oriented pre-pass keeps only the
//! constructs the monitor needs (`BU_`, `BO_` and their `SG_` lines, plus the
//! `VAL_` value descriptions), normalises line endings and spacing, and skips
//! every other top-level section, including multi-line quoted comments. The
//! message text is handed to `can-dbc` for the actual grammar, then validated
//! structurally.

use crate::signals::database::{
    ByteOrder, Database, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{MonitorError, Result};
use std::collections::HashMap;
use std::path::Path;

/// CAN-ID flag `can-dbc` keeps in bit 31 for 29-bit identifiers
const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

/// Container CANdb++ writes for signals not mapped to any message
const INDEPENDENT_SIGNALS_NAME: &str = "VECTOR__INDEPENDENT_SIG_MSG";
const INDEPENDENT_SIGNALS_ID: u32 = 0xC000_0000;

/// A database together with the number of messages parsed
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDatabase {
    pub database: Database,
    pub message_count: usize,
}

/// Parse a DBC file and build a database from it
pub fn load_dbc_file(path: &Path) -> Result<LoadedDatabase> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        MonitorError::Parse(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fallback to Latin-1/Windows-1252 encoding
    let dbc_content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc")
        .to_string();

    let database = load_dbc_str(&dbc_content, &source_filename)?;
    let message_count = database.len();

    log::info!("Parsed {} messages from {:?}", message_count, path);

    Ok(LoadedDatabase {
        database,
        message_count,
    })
}

/// Parse DBC text and build a database from it
pub fn load_dbc_str(content: &str, source: &str) -> Result<Database> {
    let normalized = normalize(content)?;

    let dbc = can_dbc::DBC::from_slice(normalized.text.as_bytes()).map_err(|e| match e {
        can_dbc::Error::Incomplete(_, remaining) => MonitorError::Parse(format!(
            "{}: malformed definition near '{}'",
            source,
            remaining.trim_start().lines().next().unwrap_or_default()
        )),
        other => MonitorError::Parse(format!("{}: {:?}", source, other)),
    })?;

    let mut messages = dbc
        .messages()
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>>>()?;
    attach_value_descriptions(&mut messages, normalized.value_descriptions);

    Database::from_messages(messages, source)
}

/// Pre-pass output: the text for `can-dbc` and the `VAL_` statements found
struct Normalized {
    text: String,
    value_descriptions: Vec<ValueDescriptions>,
}

/// Value descriptions of one signal, from a `VAL_` statement
#[derive(Debug, Clone, PartialEq)]
struct ValueDescriptions {
    /// Message identifier as written in the file, extended flag included
    message_id: u32,
    signal: String,
    values: HashMap<i64, String>,
}

fn attach_value_descriptions(messages: &mut [MessageDefinition], descriptions: Vec<ValueDescriptions>) {
    for entry in descriptions {
        let id = entry.message_id & !EXTENDED_ID_FLAG;
        let signal = messages
            .iter_mut()
            .find(|m| m.id == id)
            .and_then(|m| m.signals.iter_mut().find(|s| s.name == entry.signal));
        match signal {
            Some(signal) => signal.value_table = Some(entry.values),
            None => log::debug!(
                "Value descriptions for unknown signal '{}' of 0x{:X} ignored",
                entry.signal,
                id
            ),
        }
    }
}

/// Which block the pre-pass is currently inside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    /// Between top-level constructs
    None,
    /// Inside a `BO_` block, `SG_` lines belong to it
    Message,
    /// Inside a `BO_` block that is dropped together with its `SG_` lines
    IgnoredMessage,
    /// Inside a skipped construct
    Skipped,
}

/// Reduce DBC text to the subset understood by the monitor.
///
/// Output always starts with the `VERSION`, `NS_`, `BS_` and `BU_` header that
/// `can-dbc` expects, followed by the message blocks in file order.
fn normalize(content: &str) -> Result<Normalized> {
    let content = content.replace("\r\n", "\n").replace('\r', "\n");

    let mut nodes: Vec<String> = Vec::new();
    let mut blocks: Vec<String> = Vec::new();
    let mut value_descriptions = Vec::new();
    let mut block = Block::None;
    let mut recognized = false;
    let mut open_quote_line: Option<usize> = None;
    // A VAL_ statement spanning several lines, with its first line number
    let mut pending_values: Option<(usize, String)> = None;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;

        if let Some((start, mut statement)) = pending_values.take() {
            // Only an open string or an indented line continues the statement
            let continues = quote_count(&statement) % 2 == 1 || line.starts_with(char::is_whitespace);
            if continues {
                statement.push(' ');
                statement.push_str(line.trim());
                if statement_complete(&statement) {
                    value_descriptions.extend(parse_value_descriptions(&statement, start));
                } else {
                    pending_values = Some((start, statement));
                }
                continue;
            }
            value_descriptions.extend(parse_value_descriptions(&statement, start));
        }

        // Continuation of a quoted string in a skipped construct
        if open_quote_line.is_some() {
            if quote_count(line) % 2 == 1 {
                open_quote_line = None;
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let keyword = trimmed
            .split(|c: char| c.is_whitespace() || c == ':')
            .next()
            .unwrap_or_default();

        match keyword {
            "BO_" => {
                recognized = true;
                let header = canonical_spacing(trimmed, false);
                if is_independent_signals(&header) {
                    log::debug!("Skipping {} at line {}", INDEPENDENT_SIGNALS_NAME, line_no);
                    block = Block::IgnoredMessage;
                } else {
                    block = Block::Message;
                    blocks.push(header);
                }
            }
            "SG_" if block == Block::IgnoredMessage => {}
            "SG_" => {
                if block != Block::Message {
                    return Err(MonitorError::Parse(format!(
                        "line {}: signal definition outside of a message block",
                        line_no
                    )));
                }
                blocks.push(format!(" {}", canonical_spacing(trimmed, true)));
            }
            "BU_" => {
                recognized = true;
                block = Block::None;
                let list = trimmed.splitn(2, ':').nth(1).unwrap_or_default();
                nodes.extend(list.split_whitespace().map(str::to_string));
            }
            "VERSION" | "NS_" | "BS_" => {
                recognized = true;
                block = Block::Skipped;
            }
            // An indented `VAL_` inside a skipped block is an NS_ symbol
            "VAL_" if !(line.starts_with(char::is_whitespace) && block == Block::Skipped) => {
                block = Block::Skipped;
                if statement_complete(trimmed) {
                    value_descriptions.extend(parse_value_descriptions(trimmed, line_no));
                } else {
                    pending_values = Some((line_no, trimmed.to_string()));
                }
            }
            _ => {
                // Indented lines of a skipped block (the NS_ symbol list) are
                // part of that block; anything else is a new skipped construct.
                let indented = line.starts_with(char::is_whitespace);
                if !(indented && block == Block::Skipped) {
                    log::trace!("Skipping DBC construct '{}' at line {}", keyword, line_no);
                }
                block = Block::Skipped;
                if quote_count(trimmed) % 2 == 1 {
                    open_quote_line = Some(line_no);
                }
            }
        }
    }

    if let Some((line_no, statement)) = pending_values {
        if quote_count(&statement) % 2 == 1 {
            open_quote_line = Some(line_no);
        } else {
            value_descriptions.extend(parse_value_descriptions(&statement, line_no));
        }
    }

    if let Some(line_no) = open_quote_line {
        return Err(MonitorError::Parse(format!(
            "line {}: unterminated string",
            line_no
        )));
    }

    if !recognized {
        return Err(MonitorError::Parse(
            "no DBC content found (missing VERSION, BU_ or BO_ sections)".to_string(),
        ));
    }

    let mut out = String::from("VERSION \"\"\n\nNS_ :\n\nBS_:\n\n");
    if nodes.is_empty() {
        out.push_str("BU_:\n\n");
    } else {
        out.push_str(&format!("BU_: {}\n\n", nodes.join(" ")));
    }
    for line in blocks {
        if !line.starts_with(' ') {
            out.push('\n');
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.push('\n');
    Ok(Normalized {
        text: out,
        value_descriptions,
    })
}

/// True for the header of the container CANdb++ uses for unmapped signals
fn is_independent_signals(header: &str) -> bool {
    let mut fields = header.split_whitespace().skip(1);
    let id = fields.next().and_then(|id| id.parse::<u32>().ok());
    let name = fields.next().map(|name| name.trim_end_matches(':'));
    id == Some(INDEPENDENT_SIGNALS_ID) || name == Some(INDEPENDENT_SIGNALS_NAME)
}

/// A statement ends with `;` outside any quoted string
fn statement_complete(statement: &str) -> bool {
    quote_count(statement) % 2 == 0 && statement.trim_end().ends_with(';')
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
}

/// Split a statement into bare words and quoted strings, stopping at `;`
fn tokenize(statement: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = statement.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ';' => break,
            '"' => {
                let mut text = String::new();
                let mut escaped = false;
                for c in chars.by_ref() {
                    if escaped {
                        text.push(c);
                        escaped = false;
                        continue;
                    }
                    match c {
                        '\\' => escaped = true,
                        '"' => break,
                        _ => text.push(c),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_whitespace() => {}
            c => {
                let mut word = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || next == '"' || next == ';' {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    tokens
}

/// Parse `VAL_ <message id> <signal> (<raw> "<text>")* ;`.
///
/// Environment variable descriptions and malformed statements yield `None`;
/// a bad value table never prevents the messages from loading.
fn parse_value_descriptions(statement: &str, line_no: usize) -> Option<ValueDescriptions> {
    let tokens = tokenize(statement);
    let (message_id, signal) = match tokens.get(1..3) {
        Some([Token::Word(id), Token::Word(signal)]) => (id.parse::<u32>().ok()?, signal.clone()),
        _ => return None,
    };

    let mut values = HashMap::new();
    for pair in tokens[3..].chunks(2) {
        let parsed = match pair {
            [Token::Word(raw), Token::Text(text)] => parse_raw_value(raw).map(|raw| (raw, text.clone())),
            _ => None,
        };
        match parsed {
            Some((raw, text)) => {
                values.insert(raw, text);
            }
            None => {
                log::warn!(
                    "line {}: malformed value description for '{}', ignoring it",
                    line_no,
                    signal
                );
                return None;
            }
        }
    }

    Some(ValueDescriptions {
        message_id,
        signal,
        values,
    })
}

/// Raw values are integers, some exporters write them as `1.0`
fn parse_raw_value(text: &str) -> Option<i64> {
    text.parse::<i64>().ok().or_else(|| {
        let value = text.parse::<f64>().ok()?;
        (value.fract() == 0.0).then_some(value as i64)
    })
}

/// Count unescaped double quotes in a line
fn quote_count(line: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => count += 1,
            _ => {}
        }
    }
    count
}

/// Rewrite spacing outside quoted strings into the canonical DBC layout.
///
/// Whitespace runs and tabs collapse to a single space; `|`, `@` and `,` lose
/// surrounding spaces; brackets hug their contents. A `BO_` header gets
/// `Name: size`, a `SG_` line gets `Name : start`.
fn canonical_spacing(line: &str, signal: bool) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_quotes = false;
    let mut pending_space = false;

    for c in line.chars() {
        if in_quotes {
            out.push(c);
            if c == '"' {
                in_quotes = false;
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }

        let tight_before = matches!(c, '|' | '@' | ',' | ')' | ']') || (c == ':' && !signal);
        if pending_space && !tight_before && !out.is_empty() && !out.ends_with(['|', '@', ',', '(', '[']) {
            out.push(' ');
        }
        pending_space = false;

        match c {
            ':' => {
                if signal && !out.ends_with(' ') {
                    out.push(' ');
                }
                out.push(':');
                pending_space = true;
            }
            '(' | '[' => {
                if !out.is_empty() && !out.ends_with(' ') {
                    out.push(' ');
                }
                out.push(c);
            }
            '"' => {
                in_quotes = true;
                out.push(c);
            }
            _ => out.push(c),
        }
    }

    out
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(dbc_msg: &can_dbc::Message) -> Result<MessageDefinition> {
    let raw_id = dbc_msg.message_id().0;
    let is_extended = raw_id & EXTENDED_ID_FLAG != 0;
    let id = raw_id & !EXTENDED_ID_FLAG;

    // First pass: identify multiplexer signal
    let multiplexer_signal = dbc_msg
        .signals()
        .iter()
        .find(|s| {
            matches!(
                s.multiplexer_indicator(),
                can_dbc::MultiplexIndicator::Multiplexor
                    | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(_)
            )
        })
        .map(|s| s.name().to_string());

    // Second pass: convert all signals
    let signals = dbc_msg
        .signals()
        .iter()
        .map(|s| convert_signal(s, dbc_msg.message_name(), multiplexer_signal.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    Ok(MessageDefinition {
        id,
        is_extended,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        multiplexer_signal,
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    message_name: &str,
    multiplexer_signal_name: Option<&str>,
) -> Result<SignalDefinition> {
    // Determine byte order
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    // Determine value type
    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    // Handle multiplexer information
    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value)
        | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(switch_value) => {
            let multiplexer_signal = multiplexer_signal_name.ok_or_else(|| {
                MonitorError::Parse(format!(
                    "Multiplexed signal '{}' in message '{}' but no multiplexer found",
                    dbc_sig.name(),
                    message_name
                ))
            })?;
            Some(MultiplexerInfo {
                multiplexer_signal: multiplexer_signal.to_string(),
                multiplexer_values: vec![switch_value],
            })
        }
        _ => None,
    };

    let (min, max) = match (*dbc_sig.min(), *dbc_sig.max()) {
        // [0|0] means "no range" in most tools
        (min, max) if min == 0.0 && max == 0.0 => (None, None),
        (min, max) => (Some(min), Some(max)),
    };

    let length = u16::try_from(*dbc_sig.signal_size()).map_err(|_| {
        MonitorError::Parse(format!("Signal '{}' is too long", dbc_sig.name()))
    })?;
    let start_bit = u16::try_from(*dbc_sig.start_bit()).map_err(|_| {
        MonitorError::Parse(format!("Signal '{}' start bit out of range", dbc_sig.name()))
    })?;

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit,
        length,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min,
        max,
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table: None,
        multiplexer_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SIMPLE_DBC: &str = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_
    CAT_DEF_
    CAT_
    FILTER
    BA_DEF_DEF_
    EV_DATA_
    ENVVAR_DATA_
    SGTYPE_
    SGTYPE_VAL_
    BA_DEF_SGTYPE_
    BA_SGTYPE_
    SIG_TYPE_REF_
    VAL_TABLE_
    SIG_GROUP_
    SIG_VALTYPE_
    SIGTYPE_VALTYPE_
    BO_TX_BU_
    BA_DEF_REL_
    BA_REL_
    BA_SGTYPE_REL_
    SG_MUL_VAL_

BS_:

BU_: ECU1 ECU2

BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2
"#;

    fn write_temp(content: &[u8]) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_parse_simple_dbc() {
        let temp_file = write_temp(SIMPLE_DBC.as_bytes());

        let loaded = load_dbc_file(temp_file.path()).unwrap();
        assert_eq!(loaded.message_count, 2);

        let db = &loaded.database;
        let msg1 = db.get(291).unwrap();
        assert_eq!(msg1.name, "EngineData");
        assert_eq!(msg1.size, 8);
        assert_eq!(msg1.sender, Some("ECU1".to_string()));
        assert_eq!(msg1.signals.len(), 2);
        assert!(!msg1.is_extended);

        let sig1 = &msg1.signals[0];
        assert_eq!(sig1.name, "EngineSpeed");
        assert_eq!(sig1.start_bit, 0);
        assert_eq!(sig1.length, 16);
        assert_eq!(sig1.factor, 1.0);
        assert_eq!(sig1.offset, 0.0);
        assert_eq!(sig1.max, Some(8000.0));
        assert_eq!(sig1.unit, Some("rpm".to_string()));

        let sig2 = &msg1.signals[1];
        assert_eq!(sig2.offset, -40.0);
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let dbc_content = r#"
VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 512 MultiplexedMsg: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" ECU1
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" ECU1
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" ECU1
"#;

        let db = load_dbc_str(dbc_content, "mux.dbc").unwrap();
        let msg = db.get(512).unwrap();
        assert!(msg.is_multiplexed());
        assert_eq!(msg.multiplexer_signal, Some("Mode".to_string()));
        assert_eq!(msg.signals.len(), 3);

        let sig_a = msg.signal("SignalA").unwrap();
        let mux = sig_a.multiplexer_info.as_ref().unwrap();
        assert_eq!(mux.multiplexer_signal, "Mode");
        assert_eq!(mux.multiplexer_values, vec![0]);
    }

    #[test]
    fn test_vendor_sections_are_skipped() {
        let dbc_content = r#"VERSION "1.0"

NS_ :
    CM_
    BA_

BS_:

BU_: ECU1

VENDOR_SECTION_ 1 2 3 "opaque"

BO_ 256 Status: 8 ECU1
 SG_ Speed : 0|16@1+ (0.1,0) [0|6553.5] "km/h" Vector__XXX

CM_ BO_ 256 "Status message
spanning lines, mentioning BO_ 999 Fake: 8 X
and SG_ Fake : 0|8@1+ (1,0) [0|1] units";
BA_DEF_ BO_ "GenMsgCycleTime" INT 0 10000;
BA_ "GenMsgCycleTime" BO_ 256 100;
VAL_ 256 Speed 0 "Stopped" ;
"#;

        let db = load_dbc_str(dbc_content, "vendor.dbc").unwrap();
        assert_eq!(db.len(), 1);
        assert!(db.get(999).is_none());
        assert_eq!(db.get(256).unwrap().signals[0].unit.as_deref(), Some("km/h"));
    }

    #[test]
    fn test_independent_signal_container_is_skipped() {
        let dbc_content = r#"VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 256 Status: 8 ECU1
 SG_ Speed : 0|16@1+ (0.1,0) [0|6553.5] "km/h" Vector__XXX

BO_ 3221225472 VECTOR__INDEPENDENT_SIG_MSG: 0 Vector__XXX
 SG_ Spare : 0|8@1+ (1,0) [0|0] "" Vector__XXX
 SG_ Reserved : 8|8@1+ (1,0) [0|0] "" Vector__XXX

BO_ 512 Body: 2 ECU1
 SG_ DoorOpen : 0|1@1+ (1,0) [0|1] "" Vector__XXX

CM_ SG_ 3221225472 Spare "Not mapped to a message";
"#;

        let db = load_dbc_str(dbc_content, "vector.dbc").unwrap();
        assert_eq!(db.can_ids(), vec![256, 512]);
        assert!(db.messages().iter().all(|m| m.name != "VECTOR__INDEPENDENT_SIG_MSG"));
    }

    #[test]
    fn test_value_descriptions_attached_to_signals() {
        let dbc_content = r#"VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 256 Transmission: 8 ECU1
 SG_ Gear : 0|4@1+ (1,0) [0|15] "" Vector__XXX
 SG_ Mode : 8|2@1+ (1,0) [0|3] "" Vector__XXX

BO_ 2566844926 J1939Msg: 8 ECU1
 SG_ Lamp : 0|2@1+ (1,0) [0|3] "" Vector__XXX

VAL_ 256 Gear 0 "Park" 1 "Reverse" 2 "Neutral" 3 "Drive" ;
VAL_ 256 Mode 0 "Eco"
   1 "Sport; Plus" ;
VAL_ 2566844926 Lamp 0 "Off" 1 "On" ;
VAL_ 256 Missing 0 "Nowhere" ;
VAL_ EnvIgnition 0 "Off" 1 "On" ;
"#;

        let db = load_dbc_str(dbc_content, "val.dbc").unwrap();
        let transmission = db.get(256).unwrap();

        let gear = transmission.signal("Gear").unwrap();
        assert_eq!(gear.describe(3), Some("Drive"));
        assert_eq!(gear.describe(9), None);
        assert_eq!(gear.value_table.as_ref().unwrap().len(), 4);

        let mode = transmission.signal("Mode").unwrap();
        assert_eq!(mode.describe(1), Some("Sport; Plus"));

        let lamp = db.get(0x18FEF1FE).unwrap().signal("Lamp").unwrap();
        assert_eq!(lamp.describe(1), Some("On"));
    }

    #[test]
    fn test_malformed_value_description_is_ignored() {
        let dbc_content = r#"VERSION ""

NS_ :

BS_:

BU_: ECU1

BO_ 256 Transmission: 8 ECU1
 SG_ Gear : 0|4@1+ (1,0) [0|15] "" Vector__XXX

VAL_ 256 Gear zero "Park" ;
"#;

        let db = load_dbc_str(dbc_content, "val.dbc").unwrap();
        assert!(db.get(256).unwrap().signal("Gear").unwrap().value_table.is_none());
    }

    #[test]
    fn test_tokenize_value_statement() {
        assert_eq!(
            tokenize(r#"VAL_ 1 S 0 "a \"b\"" ; trailing"#),
            vec![
                Token::Word("VAL_".to_string()),
                Token::Word("1".to_string()),
                Token::Word("S".to_string()),
                Token::Word("0".to_string()),
                Token::Text("a \"b\"".to_string()),
            ]
        );
        assert_eq!(parse_raw_value("-2"), Some(-2));
        assert_eq!(parse_raw_value("3.0"), Some(3));
        assert_eq!(parse_raw_value("3.5"), None);
    }

    #[test]
    fn test_whitespace_and_line_endings_do_not_matter() {
        let spaced = SIMPLE_DBC
            .replace(" SG_ EngineSpeed : 0|16@1+ (1,0)", "\tSG_   EngineSpeed :  0 | 16@1+  ( 1 , 0 )")
            .replace("BO_ 512 BatteryStatus: 8 ECU1", "BO_  512  BatteryStatus :\t8  ECU1");
        let crlf = spaced.replace('\n', "\r\n");

        let reference = load_dbc_str(SIMPLE_DBC, "a.dbc").unwrap();
        let variant = load_dbc_str(&crlf, "a.dbc").unwrap();
        assert_eq!(reference, variant);
    }

    #[test]
    fn test_extended_identifier() {
        let dbc_content = "VERSION \"\"\n\nNS_ :\n\nBS_:\n\nBU_: ECU1\n\n\
            BO_ 2566844926 J1939Msg: 8 ECU1\n \
            SG_ Value : 0|8@1+ (1,0) [0|255] \"\" Vector__XXX\n";

        let db = load_dbc_str(dbc_content, "ext.dbc").unwrap();
        let msg = db.get(0x18FEF1FE).unwrap();
        assert!(msg.is_extended);
        assert_eq!(msg.name, "J1939Msg");
    }

    #[test]
    fn test_duplicate_identifiers_fail() {
        let dbc_content = r#"
VERSION ""
NS_ :
BS_:
BU_: ECU1

BO_ 256 First: 8 ECU1
 SG_ A : 0|8@1+ (1,0) [0|255] "" ECU1

BO_ 256 Second: 8 ECU1
 SG_ B : 0|8@1+ (1,0) [0|255] "" ECU1
"#;
        let err = load_dbc_str(dbc_content, "dup.dbc").unwrap_err();
        assert!(matches!(err, MonitorError::Parse(_)));
    }

    #[test]
    fn test_signal_outside_message_fails() {
        let dbc_content = r#"
VERSION ""
NS_ :
BS_:
BU_: ECU1

BO_ 256 Short: 2 ECU1
 SG_ TooWide : 8|16@1+ (1,0) [0|0] "" ECU1
"#;
        assert!(load_dbc_str(dbc_content, "wide.dbc").is_err());
    }

    #[test]
    fn test_malformed_number_fails() {
        let dbc_content = r#"
VERSION ""
NS_ :
BS_:
BU_: ECU1

BO_ 256 Status: 8 ECU1
 SG_ Speed : 0|1x@1+ (1,0) [0|0] "" ECU1
"#;
        assert!(load_dbc_str(dbc_content, "bad.dbc").is_err());
    }

    #[test]
    fn test_unterminated_message_header_fails() {
        let dbc_content = r#"
VERSION ""
NS_ :
BS_:
BU_: ECU1

BO_ 256 Status 8
 SG_ Speed : 0|16@1+ (1,0) [0|0] "" ECU1
"#;
        assert!(load_dbc_str(dbc_content, "bad.dbc").is_err());
    }

    #[test]
    fn test_orphan_signal_fails() {
        let dbc_content = r#"
VERSION ""
NS_ :
BS_:
BU_: ECU1

CM_ "global comment";
 SG_ Speed : 0|16@1+ (1,0) [0|0] "" ECU1
"#;
        assert!(load_dbc_str(dbc_content, "orphan.dbc").is_err());
    }

    #[test]
    fn test_unreadable_file_fails() {
        let err = load_dbc_file(Path::new("/definitely/not/here.dbc")).unwrap_err();
        assert!(matches!(err, MonitorError::Parse(_)));
    }

    #[test]
    fn test_latin1_file() {
        let content = SIMPLE_DBC.replace("\"C\"", "\"\u{00B0}C\"");
        // Encode as Latin-1: the degree sign becomes a single 0xB0 byte
        let bytes: Vec<u8> = content.chars().map(|c| c as u32 as u8).collect();
        let temp_file = write_temp(&bytes);

        let loaded = load_dbc_file(temp_file.path()).unwrap();
        let sig = loaded.database.get(291).unwrap().signal("EngineTemp").unwrap();
        assert_eq!(sig.unit.as_deref(), Some("\u{00B0}C"));
    }

    #[test]
    fn test_canonical_spacing() {
        assert_eq!(
            canonical_spacing("SG_  Speed:0 | 16 @1+ ( 0.1 , 0 ) [ 0 | 100 ]  \"km  h\"  A , B", true),
            "SG_ Speed : 0|16@1+ (0.1,0) [0|100] \"km  h\" A,B"
        );
        assert_eq!(
            canonical_spacing("BO_\t256  Status :  8 ECU1", false),
            "BO_ 256 Status: 8 ECU1"
        );
    }
}
