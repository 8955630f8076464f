//! Framed messages relayed over the inter-processor bridge.
//!
//! The bridge carries fixed-size frames between this core and the cellular
//! co-processor:
//!
//! ```text
//! [LEN u16 le][TYPE u8][VERSION u8][PAYLOAD (LEN bytes)][CRC32 u32 le]
//! ```
//!
//! The CRC covers everything before it. Payloads are postcard-encoded
//! structs. Transport and retransmission are the bridge process's problem;
//! this module only builds and validates frames and types their payloads.

use heapless::Vec;
use serde::{Deserialize, Serialize};

use crate::ble::stack::Addr;
use crate::error::{Error, Result};
use crate::jobs::{JobKind, JobState, JOB_PAYLOAD_MAX};

pub const IPC_VERSION: u8 = 1;
pub const IPC_PAYLOAD_MAX: usize = 256;

/// Length, type and version fields plus the trailing CRC.
pub const FRAME_OVERHEAD: usize = 8;
pub const FRAME_MAX: usize = IPC_PAYLOAD_MAX + FRAME_OVERHEAD;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgType {
    NodeDiscovered = 0x01,
    NodeTelemetry = 0x02,
    JobRequest = 0x03,
    JobResult = 0x04,
    TwinUpdate = 0x05,
}

impl MsgType {
    fn from_u8(raw: u8) -> Option<MsgType> {
        match raw {
            0x01 => Some(MsgType::NodeDiscovered),
            0x02 => Some(MsgType::NodeTelemetry),
            0x03 => Some(MsgType::JobRequest),
            0x04 => Some(MsgType::JobResult),
            0x05 => Some(MsgType::TwinUpdate),
            _ => None,
        }
    }
}

/// First sighting of a node, outbound to the cloud side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeDiscovered {
    pub addr: Addr,
    pub rssi: i8,
    pub battery_percent: u8,
    pub last_reading: f32,
    pub fault_flags: u8,
}

/// Telemetry summary for one node, outbound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeTelemetry {
    pub addr: Addr,
    pub timestamp: u32,
    pub value: f32,
    pub quality: u8,
    pub battery_percent: u8,
    pub fault_flags: u32,
    pub rssi: i8,
}

/// Administrative job request, inbound from the cloud side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    pub target: Addr,
    pub payload: Vec<u8, JOB_PAYLOAD_MAX>,
}

/// Settlement (or enqueue acknowledgement) of a job, outbound.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct JobResult {
    pub job_id: u32,
    pub state: JobState,
    pub result_code: i32,
}

/// Desired-state update for one node, inbound; materializes as a config
/// push job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwinUpdate {
    pub version: u32,
    pub target: Addr,
    pub config: Vec<u8, JOB_PAYLOAD_MAX>,
}

/// A typed bridge message, either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    NodeDiscovered(NodeDiscovered),
    NodeTelemetry(NodeTelemetry),
    JobRequest(JobRequest),
    JobResult(JobResult),
    TwinUpdate(TwinUpdate),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::NodeDiscovered(_) => MsgType::NodeDiscovered,
            Message::NodeTelemetry(_) => MsgType::NodeTelemetry,
            Message::JobRequest(_) => MsgType::JobRequest,
            Message::JobResult(_) => MsgType::JobResult,
            Message::TwinUpdate(_) => MsgType::TwinUpdate,
        }
    }

    /// Encodes the full frame into `buf` and returns its length.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut payload = [0u8; IPC_PAYLOAD_MAX];
        let used = match self {
            Message::NodeDiscovered(m) => postcard::to_slice(m, &mut payload),
            Message::NodeTelemetry(m) => postcard::to_slice(m, &mut payload),
            Message::JobRequest(m) => postcard::to_slice(m, &mut payload),
            Message::JobResult(m) => postcard::to_slice(m, &mut payload),
            Message::TwinUpdate(m) => postcard::to_slice(m, &mut payload),
        }
        .map_err(|_| Error::InvalidArgument)?
        .len();
        encode_frame(self.msg_type(), &payload[..used], buf)
    }

    /// Validates and decodes one full frame.
    pub fn decode(raw: &[u8]) -> Result<Message> {
        let frame = decode_frame(raw)?;
        let msg = match frame.msg_type {
            MsgType::NodeDiscovered => Message::NodeDiscovered(
                postcard::from_bytes(frame.payload).map_err(|_| Error::InvalidArgument)?,
            ),
            MsgType::NodeTelemetry => Message::NodeTelemetry(
                postcard::from_bytes(frame.payload).map_err(|_| Error::InvalidArgument)?,
            ),
            MsgType::JobRequest => Message::JobRequest(
                postcard::from_bytes(frame.payload).map_err(|_| Error::InvalidArgument)?,
            ),
            MsgType::JobResult => Message::JobResult(
                postcard::from_bytes(frame.payload).map_err(|_| Error::InvalidArgument)?,
            ),
            MsgType::TwinUpdate => Message::TwinUpdate(
                postcard::from_bytes(frame.payload).map_err(|_| Error::InvalidArgument)?,
            ),
        };
        Ok(msg)
    }
}

/// A validated frame borrowing its payload from the receive buffer.
#[derive(Debug)]
pub struct Frame<'a> {
    pub msg_type: MsgType,
    pub version: u8,
    pub payload: &'a [u8],
}

pub fn encode_frame(msg_type: MsgType, payload: &[u8], buf: &mut [u8]) -> Result<usize> {
    if payload.len() > IPC_PAYLOAD_MAX {
        return Err(Error::InvalidArgument);
    }
    let total = payload.len() + FRAME_OVERHEAD;
    if buf.len() < total {
        return Err(Error::InvalidArgument);
    }
    buf[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    buf[2] = msg_type as u8;
    buf[3] = IPC_VERSION;
    buf[4..4 + payload.len()].copy_from_slice(payload);
    let crc = crc32(&buf[..4 + payload.len()]);
    buf[4 + payload.len()..total].copy_from_slice(&crc.to_le_bytes());
    Ok(total)
}

pub fn decode_frame(raw: &[u8]) -> Result<Frame<'_>> {
    if raw.len() < FRAME_OVERHEAD {
        return Err(Error::InvalidArgument);
    }
    let len = u16::from_le_bytes([raw[0], raw[1]]) as usize;
    if len > IPC_PAYLOAD_MAX || raw.len() < len + FRAME_OVERHEAD {
        return Err(Error::InvalidArgument);
    }
    let crc_bytes: [u8; 4] = raw[4 + len..4 + len + 4]
        .try_into()
        .map_err(|_| Error::InvalidArgument)?;
    if crc32(&raw[..4 + len]) != u32::from_le_bytes(crc_bytes) {
        warn!("bridge frame crc mismatch");
        return Err(Error::InvalidArgument);
    }
    if raw[3] != IPC_VERSION {
        warn!("bridge frame version {} unsupported", raw[3]);
        return Err(Error::InvalidArgument);
    }
    let msg_type = MsgType::from_u8(raw[2]).ok_or(Error::InvalidArgument)?;
    Ok(Frame {
        msg_type,
        version: raw[3],
        payload: &raw[4..4 + len],
    })
}

/// Reflected CRC-32 (poly 0xEDB88320), bitwise; matches the co-processor.
fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::addr;

    #[test]
    fn crc32_known_vector() {
        // CRC-32 of "123456789" is 0xCBF43926
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn frame_round_trip() {
        let msg = Message::JobResult(JobResult {
            job_id: 17,
            state: JobState::Completed,
            result_code: 0,
        });
        let mut buf = [0u8; FRAME_MAX];
        let n = msg.encode(&mut buf).unwrap();
        assert_eq!(Message::decode(&buf[..n]).unwrap(), msg);
    }

    #[test]
    fn job_request_round_trip() {
        let msg = Message::JobRequest(JobRequest {
            kind: JobKind::PushConfig,
            target: addr(3),
            payload: Vec::from_slice(&[1, 2, 3, 4]).unwrap(),
        });
        let mut buf = [0u8; FRAME_MAX];
        let n = msg.encode(&mut buf).unwrap();
        match Message::decode(&buf[..n]).unwrap() {
            Message::JobRequest(req) => {
                assert_eq!(req.kind, JobKind::PushConfig);
                assert_eq!(req.target, addr(3));
                assert_eq!(req.payload.as_slice(), &[1, 2, 3, 4]);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn corrupted_frames_are_rejected() {
        let msg = Message::NodeDiscovered(NodeDiscovered {
            addr: addr(1),
            rssi: -60,
            battery_percent: 90,
            last_reading: 1.0,
            fault_flags: 0,
        });
        let mut buf = [0u8; FRAME_MAX];
        let n = msg.encode(&mut buf).unwrap();

        // flipped payload byte breaks the CRC
        let mut bad = buf;
        bad[5] ^= 0xff;
        assert_eq!(Message::decode(&bad[..n]), Err(Error::InvalidArgument));

        // truncation
        assert_eq!(Message::decode(&buf[..n - 1]), Err(Error::InvalidArgument));
        assert_eq!(Message::decode(&[]), Err(Error::InvalidArgument));

        // unknown type tag (re-seal the CRC so only the tag is at fault)
        let mut unknown = [0u8; FRAME_MAX];
        let n2 = encode_frame(MsgType::NodeTelemetry, &[0; 4], &mut unknown).unwrap();
        unknown[2] = 0x7f;
        let crc = crc32(&unknown[..n2 - 4]);
        unknown[n2 - 4..n2].copy_from_slice(&crc.to_le_bytes());
        assert!(decode_frame(&unknown[..n2]).is_err());

        // wrong version, CRC re-sealed
        let mut wrong_ver = buf;
        wrong_ver[3] = 9;
        let crc = crc32(&wrong_ver[..n - 4]);
        wrong_ver[n - 4..n].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(
            Message::decode(&wrong_ver[..n]),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = [0u8; FRAME_MAX + 64];
        let payload = [0u8; IPC_PAYLOAD_MAX + 1];
        assert_eq!(
            encode_frame(MsgType::NodeTelemetry, &payload, &mut buf),
            Err(Error::InvalidArgument)
        );
    }
}
