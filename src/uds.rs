//! UDS (ISO 14229) request layer.
//!
//! One exchange at a time: dispatch a full service payload through ISO-TP,
//! hand the raw response bytes back to the caller. Envelope parsing of
//! positive responses belongs to the decoder, not here.

use heapless::Vec;
use thiserror::Error;
use tracing::debug;

use crate::can::{Bitrate, CanBus, CanError};
use crate::isotp::{self, IsoTpError};

pub use crate::can::EcuAddress;

/// ReadDataByIdentifier service id.
pub const SID_READ_DATA_BY_IDENTIFIER: u8 = 0x22;

/// WriteDataByIdentifier service id.
pub const SID_WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;

/// Positive responses echo the request service id plus this offset.
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Positive ReadDataByIdentifier response id (`0x62`).
pub const READ_DID_RESPONSE: u8 = SID_READ_DATA_BY_IDENTIFIER + POSITIVE_RESPONSE_OFFSET;

/// Default timeout for a full request/response exchange.
pub const DEFAULT_TIMEOUT_MS: u32 = 200;

const MAX_WRITE_REQUEST: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UdsError {
    /// The transfer failed at the ISO-TP or CAN layer.
    #[error("transport: {0}")]
    Transport(#[from] IsoTpError),
    /// The assembled request exceeds the request buffer.
    #[error("request too long")]
    RequestTooLong,
}

impl From<CanError> for UdsError {
    fn from(err: CanError) -> Self {
        Self::Transport(IsoTpError::Bus(err))
    }
}

/// Diagnostic client owning the (singleton) CAN port. The port is brought
/// up lazily on the first request, mirroring a cold boot where the bus
/// transceiver may not be ready when the agent is constructed.
pub struct UdsClient<B: CanBus> {
    bus: B,
    started: bool,
}

impl<B: CanBus> UdsClient<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            started: false,
        }
    }

    /// Brings the port up if it is not already running.
    pub fn start(&mut self, bitrate: Bitrate) -> Result<(), CanError> {
        if self.started {
            return Ok(());
        }
        self.bus.start(bitrate)?;
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.started {
            self.bus.stop();
            self.started = false;
        }
    }

    /// Direct access to the underlying port, for hosts that own bus setup.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Sends a complete UDS request payload (service id included) and
    /// returns the number of raw response bytes written into `response`.
    pub fn request(
        &mut self,
        addr: &EcuAddress,
        request: &[u8],
        response: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, UdsError> {
        self.start(Bitrate::default())?;

        isotp::send(&mut self.bus, addr, request, timeout_ms)?;
        let n = isotp::receive(&mut self.bus, addr, response, timeout_ms)?;
        debug!(
            tx = addr.tx_id,
            rx = addr.rx_id,
            request_len = request.len(),
            response_len = n,
            "uds exchange"
        );
        Ok(n)
    }

    /// Convenience for `0x2E`: service id, DID big-endian, then `data`.
    pub fn write_data_by_identifier(
        &mut self,
        addr: &EcuAddress,
        did: u16,
        data: &[u8],
        response: &mut [u8],
    ) -> Result<usize, UdsError> {
        let mut request: Vec<u8, MAX_WRITE_REQUEST> = Vec::new();
        request
            .push(SID_WRITE_DATA_BY_IDENTIFIER)
            .map_err(|_| UdsError::RequestTooLong)?;
        request
            .extend_from_slice(&did.to_be_bytes())
            .map_err(|_| UdsError::RequestTooLong)?;
        request
            .extend_from_slice(data)
            .map_err(|_| UdsError::RequestTooLong)?;
        self.request(addr, &request, response, DEFAULT_TIMEOUT_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::Frame;
    use crate::sim::QueueBus;

    fn addr() -> EcuAddress {
        EcuAddress::standard(0x7E4, 0x7EC)
    }

    #[test]
    fn request_roundtrip_returns_raw_response() {
        let mut client = UdsClient::new(QueueBus::new());
        client
            .bus_mut()
            .push_rx(Frame::new(0x7EC, false, &[0x04, 0x62, 0x91, 0x01, 0x7A]));

        let mut response = [0u8; 64];
        let n = client
            .request(&addr(), &[0x22, 0x91, 0x01], &mut response, 200)
            .unwrap();
        assert_eq!(&response[..n], &[0x62, 0x91, 0x01, 0x7A]);

        let sent = &client.bus_mut().sent;
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0].data[..4], &[0x03, 0x22, 0x91, 0x01]);
    }

    #[test]
    fn write_did_builds_big_endian_request() {
        let mut client = UdsClient::new(QueueBus::new());
        client
            .bus_mut()
            .push_rx(Frame::new(0x7EC, false, &[0x03, 0x6E, 0xF1, 0x90]));

        let mut response = [0u8; 64];
        let n = client
            .write_data_by_identifier(&addr(), 0xF190, &[0xAB, 0xCD], &mut response)
            .unwrap();
        assert_eq!(&response[..n], &[0x6E, 0xF1, 0x90]);

        let sent = &client.bus_mut().sent;
        assert_eq!(&sent[0].data[..6], &[0x05, 0x2E, 0xF1, 0x90, 0xAB, 0xCD]);
    }

    #[test]
    fn write_did_rejects_oversized_data() {
        let mut client = UdsClient::new(QueueBus::new());
        let mut response = [0u8; 64];
        let err = client
            .write_data_by_identifier(&addr(), 0xF190, &[0u8; 40], &mut response)
            .unwrap_err();
        assert_eq!(err, UdsError::RequestTooLong);
    }

    #[test]
    fn transport_timeout_surfaces() {
        let mut client = UdsClient::new(QueueBus::new());
        let mut response = [0u8; 64];
        let err = client
            .request(&addr(), &[0x22, 0x91, 0x01], &mut response, 200)
            .unwrap_err();
        assert_eq!(err, UdsError::Transport(IsoTpError::Bus(CanError::Timeout)));
    }
}
