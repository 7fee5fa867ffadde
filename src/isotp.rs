//! ISO-TP (ISO 15765-2) transport over classic CAN.
//!
//! Segments outbound diagnostic payloads into Single/First/Consecutive
//! frames and reassembles inbound ones, driving Flow Control in both
//! directions. The engine is stateless between transfers: every call owns
//! the bus for exactly one transfer and leaves nothing half-open behind.

use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::can::{CanBus, CanError, EcuAddress, Frame, MAX_FRAME_DATA};

/// Largest payload a 12-bit First Frame length can describe.
pub const MAX_TRANSFER: usize = 4095;

/// Most payload bytes a Single Frame can carry.
pub const SINGLE_FRAME_MAX: usize = 7;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

const LEN_MASK: u8 = 0x0F;
const SEQ_MASK: u8 = 0x0F;

/// `stMin` values above this are reserved encodings and pace as zero.
const ST_MIN_MAX_MS: u8 = 0x7F;

/// Flow Control frames are lone sends, cheaper than a full exchange.
const FLOW_CONTROL_SEND_TIMEOUT_MS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IsoTpError {
    /// The underlying frame port failed or timed out.
    #[error("can port: {0}")]
    Bus(#[from] CanError),
    /// A frame arrived that does not fit the transfer state: wrong type
    /// where Flow Control was expected, wrong addressing mode, or a
    /// non-transfer frame opening a receive.
    #[error("unexpected frame during transfer")]
    UnexpectedFrame,
    /// A Consecutive Frame arrived out of order.
    #[error("consecutive frame out of sequence (expected {expected:#x}, got {got:#x})")]
    SequenceError { expected: u8, got: u8 },
    /// The caller's buffer cannot hold the declared transfer length.
    #[error("response buffer too small ({needed} needed, {capacity} available)")]
    BufferTooSmall { needed: usize, capacity: usize },
    /// A declared length that cannot occur in a well-formed transfer.
    #[error("malformed transfer length")]
    MalformedLength,
}

/// Transmits `payload` to `addr.tx_id`, honoring Flow Control from
/// `addr.rx_id`. Payloads up to 7 bytes go out as one Single Frame; longer
/// ones as First Frame + Consecutive Frames with `stMin` pacing and
/// `blockSize` gating.
pub fn send<B: CanBus>(
    bus: &mut B,
    addr: &EcuAddress,
    payload: &[u8],
    timeout_ms: u32,
) -> Result<(), IsoTpError> {
    if payload.is_empty() || payload.len() > MAX_TRANSFER {
        return Err(IsoTpError::MalformedLength);
    }

    if payload.len() <= SINGLE_FRAME_MAX {
        let mut data = [0u8; MAX_FRAME_DATA];
        data[0] = (PCI_SINGLE << 4) | (payload.len() as u8 & LEN_MASK);
        data[1..=payload.len()].copy_from_slice(payload);
        let frame = Frame {
            id: addr.tx_id,
            extended: addr.tx_extended,
            len: payload.len() as u8 + 1,
            data,
        };
        debug!(id = addr.tx_id, len = payload.len(), "tx single frame");
        bus.send(&frame, timeout_ms)?;
        return Ok(());
    }

    let total = payload.len();
    let mut data = [0u8; MAX_FRAME_DATA];
    data[0] = (PCI_FIRST << 4) | ((total >> 8) as u8 & LEN_MASK);
    data[1] = (total & 0xFF) as u8;
    data[2..].copy_from_slice(&payload[..6]);
    let first = Frame {
        id: addr.tx_id,
        extended: addr.tx_extended,
        len: MAX_FRAME_DATA as u8,
        data,
    };
    debug!(id = addr.tx_id, len = total, "tx first frame");
    bus.send(&first, timeout_ms)?;

    let (mut block_size, mut st_min) = read_flow_control(bus, addr, timeout_ms)?;

    let mut seq: u8 = 1;
    let mut offset = 6usize;
    let mut sent_in_block: u8 = 0;

    while offset < total {
        let chunk = (total - offset).min(SINGLE_FRAME_MAX);
        let mut data = [0u8; MAX_FRAME_DATA];
        data[0] = (PCI_CONSECUTIVE << 4) | (seq & SEQ_MASK);
        data[1..=chunk].copy_from_slice(&payload[offset..offset + chunk]);
        let frame = Frame {
            id: addr.tx_id,
            extended: addr.tx_extended,
            len: chunk as u8 + 1,
            data,
        };
        bus.send(&frame, timeout_ms)?;
        offset += chunk;
        seq = (seq + 1) & SEQ_MASK;

        pace(st_min);

        if block_size > 0 {
            sent_in_block += 1;
            if sent_in_block >= block_size && offset < total {
                let granted = read_flow_control(bus, addr, timeout_ms)?;
                block_size = granted.0;
                st_min = granted.1;
                sent_in_block = 0;
            }
        }
    }

    Ok(())
}

/// Reassembles one inbound transfer from `addr.rx_id` into `buf`, emitting
/// a continuous-grant Flow Control on `addr.tx_id` when the peer opens a
/// segmented transfer. Returns the reassembled length.
pub fn receive<B: CanBus>(
    bus: &mut B,
    addr: &EcuAddress,
    buf: &mut [u8],
    timeout_ms: u32,
) -> Result<usize, IsoTpError> {
    let frame = bus.receive(timeout_ms)?;
    if frame.id != addr.rx_id || frame.extended != addr.rx_extended || frame.len == 0 {
        return Err(IsoTpError::UnexpectedFrame);
    }

    match frame.data[0] >> 4 {
        PCI_SINGLE => {
            let len = usize::from(frame.data[0] & LEN_MASK);
            if len > SINGLE_FRAME_MAX || len + 1 > usize::from(frame.len) {
                return Err(IsoTpError::MalformedLength);
            }
            if buf.len() < len {
                return Err(IsoTpError::BufferTooSmall {
                    needed: len,
                    capacity: buf.len(),
                });
            }
            buf[..len].copy_from_slice(&frame.data[1..1 + len]);
            debug!(id = frame.id, len, "rx single frame");
            Ok(len)
        }
        PCI_FIRST => {
            if usize::from(frame.len) < MAX_FRAME_DATA {
                return Err(IsoTpError::UnexpectedFrame);
            }
            let total = (usize::from(frame.data[0] & LEN_MASK) << 8) | usize::from(frame.data[1]);
            if total == 0 {
                return Err(IsoTpError::MalformedLength);
            }
            if buf.len() < total {
                return Err(IsoTpError::BufferTooSmall {
                    needed: total,
                    capacity: buf.len(),
                });
            }
            let head = total.min(6);
            buf[..head].copy_from_slice(&frame.data[2..2 + head]);
            let mut copied = head;
            debug!(id = frame.id, total, "rx first frame");

            // Grant the whole remainder at once: blockSize 0, no pacing.
            let grant = Frame::new(addr.tx_id, addr.tx_extended, &[PCI_FLOW_CONTROL << 4, 0, 0]);
            bus.send(&grant, FLOW_CONTROL_SEND_TIMEOUT_MS)?;

            let mut seq: u8 = 1;
            while copied < total {
                let cf = bus.receive(timeout_ms)?;
                if cf.id != addr.rx_id || cf.extended != addr.rx_extended || cf.len == 0 {
                    continue;
                }
                if cf.data[0] >> 4 != PCI_CONSECUTIVE {
                    continue;
                }
                let got = cf.data[0] & SEQ_MASK;
                if got != seq {
                    return Err(IsoTpError::SequenceError { expected: seq, got });
                }
                let chunk = usize::from(cf.len - 1).min(total - copied);
                buf[copied..copied + chunk].copy_from_slice(&cf.data[1..1 + chunk]);
                copied += chunk;
                seq = (seq + 1) & SEQ_MASK;
            }
            Ok(total)
        }
        _ => Err(IsoTpError::UnexpectedFrame),
    }
}

fn read_flow_control<B: CanBus>(
    bus: &mut B,
    addr: &EcuAddress,
    timeout_ms: u32,
) -> Result<(u8, u8), IsoTpError> {
    let frame = bus.receive(timeout_ms)?;
    if frame.id != addr.rx_id || frame.extended != addr.rx_extended || frame.len < 3 {
        return Err(IsoTpError::UnexpectedFrame);
    }
    if frame.data[0] >> 4 != PCI_FLOW_CONTROL {
        return Err(IsoTpError::UnexpectedFrame);
    }
    Ok((frame.data[1], frame.data[2]))
}

fn pace(st_min: u8) {
    if (0x01..=ST_MIN_MAX_MS).contains(&st_min) {
        thread::sleep(Duration::from_millis(u64::from(st_min)));
    }
}
