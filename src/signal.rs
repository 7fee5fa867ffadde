//! Per-signal polling configuration and the response decoder.
//!
//! A signal names one telemetry field, the UDS request that fetches it, and
//! the extraction window that turns the raw response into a number. The
//! decoder itself is a pure function: same config and bytes in, same value
//! out, no store access.

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::can::EcuAddress;
use crate::fields::TelemetryField;
use crate::uds::READ_DID_RESPONSE;

/// Upper bound on configured signals.
pub const MAX_SIGNALS: usize = 32;

/// Upper bound on a signal's request payload.
pub const MAX_REQUEST_BYTES: usize = 24;

/// Widest extraction window the 32-bit accumulator supports.
pub const MAX_WINDOW_BYTES: u8 = 4;

pub const MAX_NAME_LEN: usize = 24;
pub const MAX_UNIT_LEN: usize = 8;

/// Immutable after load; created by the configuration loader and polled in
/// configured order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub field: TelemetryField,
    pub name: String<MAX_NAME_LEN>,
    pub unit: String<MAX_UNIT_LEN>,
    pub address: EcuAddress,
    pub request: Vec<u8, MAX_REQUEST_BYTES>,
    /// Zero-based offset into the response payload.
    pub start_byte: u8,
    /// Window width in bytes, 1-4.
    pub length: u8,
    /// Single-bit selection over the assembled big-endian word, if any.
    pub bit: Option<u8>,
    pub scale: f32,
    pub offset: f32,
}

/// Extracts the signal's value from a raw UDS response, or `None` when the
/// window does not fit. Positive ReadDataByIdentifier responses carry a
/// three-byte envelope (service echo plus DID); anything else is treated as
/// bare payload.
#[must_use]
pub fn decode(signal: &SignalConfig, response: &[u8]) -> Option<f32> {
    if signal.length == 0 || signal.length > MAX_WINDOW_BYTES {
        return None;
    }

    let payload_start = if response.len() >= 3 && response[0] == READ_DID_RESPONSE {
        3
    } else {
        0
    };

    let start = payload_start + usize::from(signal.start_byte);
    let end = start + usize::from(signal.length);
    if end > response.len() {
        return None;
    }

    let mut raw: u32 = 0;
    for &byte in &response[start..end] {
        raw = (raw << 8) | u32::from(byte);
    }

    if let Some(bit) = signal.bit {
        if bit < 32 {
            raw = (raw >> bit) & 1;
        }
    }

    let scale = if signal.scale == 0.0 { 1.0 } else { signal.scale };
    Some(raw as f32 * scale + signal.offset)
}
