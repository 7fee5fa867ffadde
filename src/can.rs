//! CAN frame port.
//!
//! The narrow seam between the protocol engine and whatever CAN driver the
//! host provides. The engine only ever needs four operations: bring the
//! port up at a bitrate, tear it down, push one classic 8-byte frame, and
//! pull one with a timeout. Everything above this module is driver-agnostic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classic CAN payload limit. CAN-FD is out of scope.
pub const MAX_FRAME_DATA: usize = 8;

/// Largest standard (11-bit) identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;

/// Largest extended (29-bit) identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CanError {
    /// The port has not been started (or failed to start).
    #[error("CAN port not started")]
    NotStarted,
    /// No frame arrived (or could be queued) within the caller's timeout.
    #[error("CAN operation timed out")]
    Timeout,
    /// The underlying controller reported a bus fault.
    #[error("CAN bus error")]
    BusError,
}

/// Supported bus bitrates. 500 kbit/s is the usual choice for a vehicle
/// diagnostic bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bitrate {
    K250,
    #[default]
    K500,
    M1,
}

/// One classic CAN frame: identifier, addressing mode, and 0-8 data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub extended: bool,
    pub len: u8,
    pub data: [u8; MAX_FRAME_DATA],
}

impl Frame {
    /// Builds a frame from a byte slice, truncating anything past 8 bytes.
    #[must_use]
    pub fn new(id: u32, extended: bool, bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_FRAME_DATA);
        let mut data = [0u8; MAX_FRAME_DATA];
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            id,
            extended,
            len: len as u8,
            data,
        }
    }

    /// The occupied prefix of the data array.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len.min(MAX_FRAME_DATA as u8))]
    }
}

/// A diagnostic peer on the bus: the identifier we transmit requests on and
/// the identifier it answers from, each with its own addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcuAddress {
    pub tx_id: u32,
    pub tx_extended: bool,
    pub rx_id: u32,
    pub rx_extended: bool,
}

impl EcuAddress {
    #[must_use]
    pub fn new(tx_id: u32, tx_extended: bool, rx_id: u32, rx_extended: bool) -> Self {
        Self {
            tx_id,
            tx_extended,
            rx_id,
            rx_extended,
        }
    }

    /// Address pair using standard 11-bit identifiers on both sides.
    #[must_use]
    pub fn standard(tx_id: u32, rx_id: u32) -> Self {
        Self::new(tx_id, false, rx_id, false)
    }
}

/// Host CAN driver contract. The port is a singleton: one transfer at a
/// time, exclusive access for its duration.
pub trait CanBus {
    /// Brings the port up at the given bitrate. Idempotent starts are the
    /// implementation's business; callers gate on the result.
    fn start(&mut self, bitrate: Bitrate) -> Result<(), CanError>;

    /// Tears the port down.
    fn stop(&mut self);

    /// Transmits one frame, blocking up to `timeout_ms`.
    fn send(&mut self, frame: &Frame, timeout_ms: u32) -> Result<(), CanError>;

    /// Receives one frame, blocking up to `timeout_ms`.
    fn receive(&mut self, timeout_ms: u32) -> Result<Frame, CanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_truncates_oversized_payload() {
        let frame = Frame::new(0x7E4, false, &[0u8; 12]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.data().len(), 8);
    }

    #[test]
    fn frame_data_view_matches_len() {
        let frame = Frame::new(0x7E4, false, &[0x22, 0x91, 0x01]);
        assert_eq!(frame.len, 3);
        assert_eq!(frame.data(), &[0x22, 0x91, 0x01]);
    }

    #[test]
    fn standard_address_pair() {
        let addr = EcuAddress::standard(0x7E4, 0x7EC);
        assert!(!addr.tx_extended);
        assert!(!addr.rx_extended);
        assert_eq!(addr.tx_id, 0x7E4);
        assert_eq!(addr.rx_id, 0x7EC);
    }
}
