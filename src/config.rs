//! INI-style configuration loader.
//!
//! Two sections feed the agent. `[common]` carries the log switch,
//! `[telemetry]` the token, cadence, and one `signal-<field>` line per
//! polled signal:
//!
//! ```ini
//! [common]
//! save-json-log = on
//!
//! [telemetry]
//! user-token = 0123456789abcdef
//! send-interval = 1
//! ; unit, tx id, request hex, rx id, start, end, length, bit, scale, offset
//! signal-soc = %, 7E4, 22 91 01, 7EC, 1, 0, 1, -1, 0.5, 0
//! ```
//!
//! Malformed signal lines are dropped, never fatal: the agent runs with
//! whatever survived.

use std::fs;
use std::path::Path;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::can::{EcuAddress, STANDARD_ID_MAX};
use crate::fields::TelemetryField;
use crate::signal::{SignalConfig, MAX_NAME_LEN, MAX_REQUEST_BYTES, MAX_SIGNALS, MAX_UNIT_LEN};

pub const MAX_TOKEN_LEN: usize = 96;

const SIGNAL_KEY_PREFIX: &str = "signal-";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the agent needs for one session. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub save_json_log: bool,
    /// Poll cadence in seconds; zero is coerced to one at poll time.
    pub send_interval_sec: u16,
    /// Opaque relay credential, carried but never interpreted here.
    pub user_token: String<MAX_TOKEN_LEN>,
    /// Polling order is configuration order.
    pub signals: Vec<SignalConfig, MAX_SIGNALS>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            save_json_log: true,
            send_interval_sec: 1,
            user_token: String::new(),
            signals: Vec::new(),
        }
    }
}

/// Loads and parses a configuration file.
pub fn load_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let text = fs::read_to_string(path)?;
    Ok(parse_str(&text))
}

/// Parses configuration text, starting from defaults.
#[must_use]
pub fn parse_str(text: &str) -> AgentConfig {
    let mut config = AgentConfig::default();
    let mut section = "";

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                section = rest[..end].trim();
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());

        if section.eq_ignore_ascii_case("common") {
            if key.eq_ignore_ascii_case("save-json-log") {
                config.save_json_log = parse_bool(value);
            }
        } else if section.eq_ignore_ascii_case("telemetry") {
            if key.eq_ignore_ascii_case("user-token") {
                config.user_token = bounded(value);
            } else if key.eq_ignore_ascii_case("send-interval") {
                config.send_interval_sec = value.parse().unwrap_or(0);
            } else if let Some(field_name) = key.strip_prefix(SIGNAL_KEY_PREFIX) {
                parse_signal_line(field_name.trim(), value, &mut config);
            }
        }
    }

    config
}

fn parse_signal_line(field_name: &str, value: &str, config: &mut AgentConfig) {
    if config.signals.is_full() {
        debug!(field = field_name, "signal table full, dropping");
        return;
    }
    let Some(field) = TelemetryField::from_name(field_name) else {
        debug!(field = field_name, "unknown telemetry field, dropping");
        return;
    };

    let mut unit = "";
    let mut tx: Option<(u32, bool)> = None;
    let mut rx: Option<(u32, bool)> = None;
    let mut request: Vec<u8, MAX_REQUEST_BYTES> = Vec::new();
    let mut start = 0i32;
    let mut end = 0i32;
    let mut length = 0i32;
    let mut bit = -1i32;
    let mut scale = 1.0f32;
    let mut offset = 0.0f32;

    for (index, token) in value.split(',').enumerate() {
        let token = unquote(token.trim());
        match index {
            0 => unit = token,
            1 => tx = parse_can_id(token),
            2 => request = parse_hex_bytes(token),
            3 => rx = parse_can_id(token),
            4 => start = token.parse().unwrap_or(0),
            5 => end = token.parse().unwrap_or(0),
            6 => length = token.parse().unwrap_or(0),
            7 => bit = token.parse().unwrap_or(-1),
            8 => scale = token.parse().unwrap_or(0.0),
            9 => offset = token.parse().unwrap_or(0.0),
            _ => {}
        }
    }

    let (Some((tx_id, tx_extended)), Some((rx_id, rx_extended))) = (tx, rx) else {
        return;
    };
    if request.is_empty() {
        return;
    }

    // Window bounds in the file are 1-indexed; internally zero-based.
    if length <= 0 {
        length = if end > start { end - start + 1 } else { 1 };
    }
    let start_byte = if start > 0 { (start - 1) as u8 } else { 0 };

    let signal = SignalConfig {
        field,
        name: bounded::<MAX_NAME_LEN>(field_name),
        unit: bounded::<MAX_UNIT_LEN>(unit),
        address: EcuAddress::new(tx_id, tx_extended, rx_id, rx_extended),
        request,
        start_byte,
        length: length as u8,
        bit: u8::try_from(bit).ok().filter(|&bit| bit <= 31),
        scale: if scale == 0.0 { 1.0 } else { scale },
        offset,
    };
    let _ = config.signals.push(signal);
}

/// Parses a CAN identifier token: hex digits with an optional `0x` prefix,
/// optionally forced to an addressing mode by `11:` or `29:`. Identifiers
/// above the standard range imply extended addressing either way.
fn parse_can_id(token: &str) -> Option<(u32, bool)> {
    let mut extended = false;
    let mut token = token.trim();
    if let Some((prefix, rest)) = token.split_once(':') {
        match prefix.trim() {
            "29" => extended = true,
            "11" => extended = false,
            _ => {}
        }
        token = rest.trim();
    }
    let token = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    let id = u32::from_str_radix(token, 16).ok()?;
    if id == 0 {
        return None;
    }
    if id > STANDARD_ID_MAX {
        extended = true;
    }
    Some((id, extended))
}

/// Parses a hex byte string, ignoring spaces and an optional leading `0x`.
/// Odd-length or non-hex input yields an empty sequence, which drops the
/// signal.
fn parse_hex_bytes(token: &str) -> Vec<u8, MAX_REQUEST_BYTES> {
    let cleaned: std::string::String = token.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);

    let mut bytes: Vec<u8, MAX_REQUEST_BYTES> = Vec::new();
    if cleaned.len() % 2 != 0 {
        return bytes;
    }
    for pair in cleaned.as_bytes().chunks(2) {
        let Ok(text) = std::str::from_utf8(pair) else {
            return Vec::new();
        };
        let Ok(byte) = u8::from_str_radix(text, 16) else {
            return Vec::new();
        };
        if bytes.push(byte).is_err() {
            break;
        }
    }
    bytes
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value == "1"
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix('"').unwrap_or(value);
    let value = value.strip_suffix('"').unwrap_or(value);
    value.trim()
}

/// Copies as much of `text` as fits the bounded string.
fn bounded<const N: usize>(text: &str) -> String<N> {
    let mut out: String<N> = String::new();
    for c in text.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}
