//! Tuya 55AA wire framing.
//! Handles header parsing, CRC32 (v3.3) and HMAC-SHA256 (v3.4) trailers.

use crate::error::{ProjectorError, Result};
use crate::transport::crypto::{hmac_sha256, verify_hmac_sha256};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::fmt;
use std::str::FromStr;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const SUFFIX_55AA: u32 = 0x0000AA55;

/// Prefix, sequence number, command and length.
pub const HEADER_LEN: usize = 16;
const SUFFIX_LEN: usize = 4;
const CRC_LEN: usize = 4;
const HMAC_LEN: usize = 32;
const RETCODE_LEN: usize = 4;

/// Version string followed by 12 reserved bytes, prepended to some payloads.
pub const VERSION_HEADER_LEN: usize = 15;

/// Upper bound on a frame we are willing to buffer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Command codes used by the LAN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
    UpdateDps = 0x12,
    UdpNew = 0x13,
}

impl CommandType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x03 => CommandType::SessKeyNegStart,
            0x04 => CommandType::SessKeyNegResp,
            0x05 => CommandType::SessKeyNegFinish,
            0x07 => CommandType::Control,
            0x08 => CommandType::Status,
            0x09 => CommandType::HeartBeat,
            0x0a => CommandType::DpQuery,
            0x0d => CommandType::ControlNew,
            0x10 => CommandType::DpQueryNew,
            0x12 => CommandType::UpdateDps,
            0x13 => CommandType::UdpNew,
            _ => return None,
        })
    }

    /// Commands whose payload carries no version header.
    pub fn skips_version_header(&self) -> bool {
        matches!(
            self,
            CommandType::DpQuery
                | CommandType::DpQueryNew
                | CommandType::UpdateDps
                | CommandType::HeartBeat
                | CommandType::SessKeyNegStart
                | CommandType::SessKeyNegResp
                | CommandType::SessKeyNegFinish
        )
    }
}

/// Supported protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    V3_3,
    V3_4,
    /// Resolved from the discovery broadcast.
    Auto,
}

impl Version {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Version::V3_4 => b"3.4",
            Version::V3_3 | Version::Auto => b"3.3",
        }
    }

    /// v3.4 negotiates a session key and signs frames with HMAC.
    pub fn uses_session_key(&self) -> bool {
        matches!(self, Version::V3_4)
    }
}

impl FromStr for Version {
    type Err = ProjectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "3.3" => Ok(Version::V3_3),
            "3.4" => Ok(Version::V3_4),
            "" | "auto" | "Auto" => Ok(Version::Auto),
            other => Err(ProjectorError::Configuration(format!(
                "unsupported protocol version '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::V3_3 => f.write_str("3.3"),
            Version::V3_4 => f.write_str("3.4"),
            Version::Auto => f.write_str("auto"),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub seqno: u32,
    pub cmd: u32,
    /// Present on device-to-client messages.
    pub retcode: Option<u32>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(seqno: u32, cmd: CommandType, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            cmd: cmd as u32,
            retcode: None,
            payload,
        }
    }

    pub fn command(&self) -> Option<CommandType> {
        CommandType::from_u32(self.cmd)
    }
}

fn trailer_len(hmac_key: Option<&[u8]>) -> usize {
    if hmac_key.is_some() {
        HMAC_LEN + SUFFIX_LEN
    } else {
        CRC_LEN + SUFFIX_LEN
    }
}

/// Serializes a frame. With `hmac_key` the trailer is HMAC-SHA256,
/// otherwise CRC32.
pub fn encode_frame(frame: &Frame, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let retcode_len = if frame.retcode.is_some() { RETCODE_LEN } else { 0 };
    let body_len = retcode_len + frame.payload.len() + trailer_len(hmac_key);

    let mut data = Vec::with_capacity(HEADER_LEN + body_len);
    data.write_u32::<BigEndian>(PREFIX_55AA)?;
    data.write_u32::<BigEndian>(frame.seqno)?;
    data.write_u32::<BigEndian>(frame.cmd)?;
    data.write_u32::<BigEndian>(body_len as u32)?;
    if let Some(rc) = frame.retcode {
        data.write_u32::<BigEndian>(rc)?;
    }
    data.extend_from_slice(&frame.payload);

    match hmac_key {
        Some(key) => {
            let tag = hmac_sha256(key, &data)?;
            data.extend_from_slice(&tag);
        }
        None => {
            let crc = CRC32.checksum(&data);
            data.write_u32::<BigEndian>(crc)?;
        }
    }
    data.write_u32::<BigEndian>(SUFFIX_55AA)?;
    Ok(data)
}

/// Total frame length announced by a header.
pub fn frame_length(header: &[u8]) -> Result<usize> {
    if header.len() < HEADER_LEN {
        return Err(ProjectorError::Decode("header too short".into()));
    }
    if BigEndian::read_u32(&header[0..4]) != PREFIX_55AA {
        return Err(ProjectorError::InvalidHeader);
    }
    let total = HEADER_LEN + BigEndian::read_u32(&header[12..16]) as usize;
    if total > MAX_FRAME_LEN {
        return Err(ProjectorError::Decode(format!("frame of {} bytes is too large", total)));
    }
    Ok(total)
}

/// Whether the payload of a device frame starts with a return code. Frames
/// whose body opens with JSON or a `3.x` version header carry none; a
/// return code always starts with a zero byte.
fn has_retcode(body: &[u8]) -> bool {
    body.len() >= RETCODE_LEN
        && body[0] != b'{'
        && (body[0] == 0 || (body.len() > RETCODE_LEN && body[0] != b'3'))
}

/// Parses and verifies one complete frame. `retcode` forces whether a
/// return code precedes the payload; `None` detects it.
pub fn decode_frame(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    retcode: Option<bool>,
) -> Result<Frame> {
    let total = frame_length(data)?;
    if data.len() < total {
        return Err(ProjectorError::Decode("frame shorter than announced".into()));
    }

    let trailer = trailer_len(hmac_key);
    if total < HEADER_LEN + trailer {
        return Err(ProjectorError::Decode("frame too short for its trailer".into()));
    }
    let payload_end = total - trailer;
    let signed = &data[..payload_end];
    let footer = &data[payload_end..total - SUFFIX_LEN];

    match hmac_key {
        Some(key) => verify_hmac_sha256(key, signed, footer)?,
        None => {
            if CRC32.checksum(signed) != BigEndian::read_u32(footer) {
                return Err(ProjectorError::CrcMismatch);
            }
        }
    }
    if BigEndian::read_u32(&data[total - SUFFIX_LEN..total]) != SUFFIX_55AA {
        return Err(ProjectorError::InvalidHeader);
    }

    let mut payload_start = HEADER_LEN;
    let body = &data[payload_start..payload_end];
    let with_retcode = retcode.unwrap_or_else(|| has_retcode(body));
    let mut retcode = None;
    if with_retcode && body.len() >= RETCODE_LEN {
        retcode = Some(BigEndian::read_u32(&body[..RETCODE_LEN]));
        payload_start += RETCODE_LEN;
    }

    Ok(Frame {
        seqno: BigEndian::read_u32(&data[4..8]),
        cmd: BigEndian::read_u32(&data[8..12]),
        retcode,
        payload: data[payload_start..payload_end].to_vec(),
    })
}

/// Prepends the version header (`"3.x"` + 12 zero bytes).
pub fn add_version_header(version: Version, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERSION_HEADER_LEN + payload.len());
    out.extend_from_slice(version.as_bytes());
    out.extend_from_slice(&[0u8; VERSION_HEADER_LEN - 3]);
    out.extend_from_slice(payload);
    out
}

/// Strips a version header if `payload` starts with one.
pub fn strip_version_header(version: Version, payload: &[u8]) -> &[u8] {
    if payload.len() >= VERSION_HEADER_LEN && payload.starts_with(version.as_bytes()) {
        &payload[VERSION_HEADER_LEN..]
    } else {
        payload
    }
}
