//! In-process CAN simulation.
//!
//! Two test doubles for the frame port. [`QueueBus`] is a scripted queue:
//! whatever the test pushes is what the engine receives, and everything the
//! engine sends is captured for inspection. [`SimEcu`] goes further and
//! behaves like a diagnostic ECU end-to-end: it speaks real ISO-TP framing
//! (including segmented transfers and flow control in both directions) and
//! serves a table of data identifiers. The demo binary runs the full agent
//! against it.

use std::collections::VecDeque;

use crate::can::{Bitrate, CanBus, CanError, EcuAddress, Frame};
use crate::uds::{
    READ_DID_RESPONSE, SID_READ_DATA_BY_IDENTIFIER, SID_WRITE_DATA_BY_IDENTIFIER,
};

const NEGATIVE_RESPONSE: u8 = 0x7F;
const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;

/// Scripted frame queue. Starts "up"; `receive` drains the scripted queue
/// and times out once it runs dry.
#[derive(Debug, Default)]
pub struct QueueBus {
    /// Every frame the engine transmitted, in order.
    pub sent: std::vec::Vec<Frame>,
    rx: VecDeque<Frame>,
}

impl QueueBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a frame for the engine to receive.
    pub fn push_rx(&mut self, frame: Frame) {
        self.rx.push_back(frame);
    }

    #[must_use]
    pub fn rx_is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl CanBus for QueueBus {
    fn start(&mut self, _bitrate: Bitrate) -> Result<(), CanError> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn send(&mut self, frame: &Frame, _timeout_ms: u32) -> Result<(), CanError> {
        self.sent.push(*frame);
        Ok(())
    }

    fn receive(&mut self, _timeout_ms: u32) -> Result<Frame, CanError> {
        self.rx.pop_front().ok_or(CanError::Timeout)
    }
}

#[derive(Debug, Clone)]
struct DidEntry {
    address: EcuAddress,
    did: u16,
    data: std::vec::Vec<u8>,
}

/// Partial reassembly of a segmented request from the agent.
#[derive(Debug)]
struct Assembly {
    id: u32,
    extended: bool,
    total: usize,
    data: std::vec::Vec<u8>,
    seq: u8,
}

/// A simulated ECU behind the frame port. Registered data identifiers are
/// served over ReadDataByIdentifier and updated over WriteDataByIdentifier;
/// unknown ones draw a negative response. Responses longer than a Single
/// Frame are segmented and held back until the agent grants flow control.
#[derive(Debug, Default)]
pub struct SimEcu {
    started: bool,
    dids: std::vec::Vec<DidEntry>,
    rx_queue: VecDeque<Frame>,
    pending: VecDeque<Frame>,
    assembling: Option<Assembly>,
    requests_served: u32,
}

impl SimEcu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a data identifier and the bytes it serves.
    pub fn add_did(&mut self, address: EcuAddress, did: u16, data: &[u8]) {
        self.dids.push(DidEntry {
            address,
            did,
            data: data.to_vec(),
        });
    }

    /// Replaces the bytes behind a registered data identifier.
    pub fn set_did(&mut self, did: u16, data: &[u8]) {
        if let Some(entry) = self.dids.iter_mut().find(|entry| entry.did == did) {
            entry.data = data.to_vec();
        }
    }

    /// UDS requests answered so far, negative responses included.
    #[must_use]
    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    fn route(&self, id: u32) -> Option<EcuAddress> {
        self.dids
            .iter()
            .find(|entry| entry.address.tx_id == id)
            .map(|entry| entry.address)
    }

    fn handle_request(&mut self, id: u32, payload: &[u8]) {
        let Some(address) = self.route(id) else {
            return; // nobody home on this id: let the agent time out
        };
        if payload.is_empty() {
            return;
        }
        self.requests_served += 1;

        let sid = payload[0];
        match sid {
            SID_READ_DATA_BY_IDENTIFIER if payload.len() >= 3 => {
                let did = u16::from_be_bytes([payload[1], payload[2]]);
                let entry = self
                    .dids
                    .iter()
                    .find(|entry| entry.address.tx_id == id && entry.did == did)
                    .cloned();
                match entry {
                    Some(entry) => {
                        let mut response = vec![READ_DID_RESPONSE, payload[1], payload[2]];
                        response.extend_from_slice(&entry.data);
                        self.enqueue_response(&address, &response);
                    }
                    None => self.enqueue_response(
                        &address,
                        &[NEGATIVE_RESPONSE, sid, NRC_REQUEST_OUT_OF_RANGE],
                    ),
                }
            }
            SID_WRITE_DATA_BY_IDENTIFIER if payload.len() >= 3 => {
                let did = u16::from_be_bytes([payload[1], payload[2]]);
                let mut known = false;
                if let Some(entry) = self
                    .dids
                    .iter_mut()
                    .find(|entry| entry.address.tx_id == id && entry.did == did)
                {
                    entry.data = payload[3..].to_vec();
                    known = true;
                }
                if known {
                    self.enqueue_response(
                        &address,
                        &[SID_WRITE_DATA_BY_IDENTIFIER + 0x40, payload[1], payload[2]],
                    );
                } else {
                    self.enqueue_response(
                        &address,
                        &[NEGATIVE_RESPONSE, sid, NRC_REQUEST_OUT_OF_RANGE],
                    );
                }
            }
            _ => self.enqueue_response(
                &address,
                &[NEGATIVE_RESPONSE, sid, NRC_SERVICE_NOT_SUPPORTED],
            ),
        }
    }

    fn enqueue_response(&mut self, address: &EcuAddress, payload: &[u8]) {
        let id = address.rx_id;
        let extended = address.rx_extended;

        if payload.len() <= 7 {
            let mut data = vec![payload.len() as u8];
            data.extend_from_slice(payload);
            self.rx_queue.push_back(Frame::new(id, extended, &data));
            return;
        }

        let total = payload.len().min(0xFFF);
        let mut data = vec![0x10 | ((total >> 8) as u8), (total & 0xFF) as u8];
        data.extend_from_slice(&payload[..6]);
        self.rx_queue.push_back(Frame::new(id, extended, &data));

        // Consecutive frames wait for the agent's flow control grant.
        let mut seq: u8 = 1;
        for chunk in payload[6..total].chunks(7) {
            let mut data = vec![0x20 | seq];
            data.extend_from_slice(chunk);
            self.pending.push_back(Frame::new(id, extended, &data));
            seq = (seq + 1) & 0x0F;
        }
    }

    fn handle_frame(&mut self, frame: &Frame) {
        let data = frame.data();
        if data.is_empty() {
            return;
        }
        match data[0] >> 4 {
            0x0 => {
                let len = usize::from(data[0] & 0x0F);
                if len > 0 && len < data.len() {
                    let payload = data[1..=len].to_vec();
                    self.handle_request(frame.id, &payload);
                }
            }
            0x1 => {
                if data.len() < 8 {
                    return;
                }
                let total = (usize::from(data[0] & 0x0F) << 8) | usize::from(data[1]);
                if total == 0 {
                    return;
                }
                self.assembling = Some(Assembly {
                    id: frame.id,
                    extended: frame.extended,
                    total,
                    data: data[2..].to_vec(),
                    seq: 1,
                });
                if let Some(address) = self.route(frame.id) {
                    self.rx_queue.push_back(Frame::new(
                        address.rx_id,
                        address.rx_extended,
                        &[0x30, 0x00, 0x00],
                    ));
                }
            }
            0x2 => {
                let Some(mut assembly) = self.assembling.take() else {
                    return;
                };
                if assembly.id != frame.id
                    || assembly.extended != frame.extended
                    || data[0] & 0x0F != assembly.seq
                {
                    return; // drop the half-open transfer
                }
                let remaining = assembly.total - assembly.data.len();
                let chunk = (data.len() - 1).min(remaining);
                assembly.data.extend_from_slice(&data[1..1 + chunk]);
                assembly.seq = (assembly.seq + 1) & 0x0F;

                if assembly.data.len() >= assembly.total {
                    let payload = assembly.data;
                    self.handle_request(frame.id, &payload);
                } else {
                    self.assembling = Some(assembly);
                }
            }
            0x3 => {
                // Flow control from the agent: release the held frames.
                while let Some(frame) = self.pending.pop_front() {
                    self.rx_queue.push_back(frame);
                }
            }
            _ => {}
        }
    }
}

impl CanBus for SimEcu {
    fn start(&mut self, _bitrate: Bitrate) -> Result<(), CanError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.started = false;
    }

    fn send(&mut self, frame: &Frame, _timeout_ms: u32) -> Result<(), CanError> {
        if !self.started {
            return Err(CanError::NotStarted);
        }
        self.handle_frame(frame);
        Ok(())
    }

    fn receive(&mut self, _timeout_ms: u32) -> Result<Frame, CanError> {
        if !self.started {
            return Err(CanError::NotStarted);
        }
        self.rx_queue.pop_front().ok_or(CanError::Timeout)
    }
}
