//! Diagnostic decoder for HDHomeRun discovery datagrams.
//!
//! Decodes the vendor's tag-length-value application payload for
//! human-readable logging. Purely observational; the bridge itself treats
//! payloads as opaque bytes.
//!
//! Datagram layout: `type:u16be, length:u16be, value, crc:u32le`. The value
//! section of get/set/discover packets is a TLV sequence with a 1-byte tag
//! and a 1-or-2-byte length; the high bit of the first length byte selects
//! the extended form (`len = (b0 & 0x7f) | (b1 << 7)`).

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::net;

pub const TYPE_DISCOVER_REQ: u16 = 2;
pub const TYPE_DISCOVER_RPY: u16 = 3;
pub const TYPE_GETSET_REQ: u16 = 4;
pub const TYPE_GETSET_RPY: u16 = 5;
pub const TYPE_UPGRADE_REQ: u16 = 6;
pub const TYPE_UPGRADE_RPY: u16 = 7;

pub const TAG_DEVICE_TYPE: u8 = 0x01;
pub const TAG_DEVICE_ID: u8 = 0x02;
pub const TAG_GETSET_NAME: u8 = 0x03;
pub const TAG_GETSET_VALUE: u8 = 0x04;
pub const TAG_ERROR_MESSAGE: u8 = 0x05;
pub const TAG_TUNER_COUNT: u8 = 0x10;
pub const TAG_GETSET_LOCKKEY: u8 = 0x15;
pub const TAG_LINEUP_URL: u8 = 0x27;
pub const TAG_STORAGE_URL: u8 = 0x28;
pub const TAG_DEVICE_AUTH_BIN: u8 = 0x29;
pub const TAG_BASE_URL: u8 = 0x2a;
pub const TAG_DEVICE_AUTH_STR: u8 = 0x2b;
pub const TAG_STORAGE_ID: u8 = 0x2c;
pub const TAG_MULTI_TYPE: u8 = 0x2d;

const HEADER_SIZE: usize = 4;
const CRC_SIZE: usize = 4;

pub fn packet_type_name(packet_type: u16) -> Option<&'static str> {
    match packet_type {
        TYPE_DISCOVER_REQ => Some("DISCOVER_REQ"),
        TYPE_DISCOVER_RPY => Some("DISCOVER_RPY"),
        TYPE_GETSET_REQ => Some("GETSET_REQ"),
        TYPE_GETSET_RPY => Some("GETSET_RPY"),
        TYPE_UPGRADE_REQ => Some("UPGRADE_REQ"),
        TYPE_UPGRADE_RPY => Some("UPGRADE_RPY"),
        _ => None,
    }
}

pub fn device_type_name(device_type: u32) -> Option<&'static str> {
    match device_type {
        0xffff_ffff => Some("wildcard"),
        1 => Some("tuner"),
        5 => Some("storage"),
        _ => None,
    }
}

pub fn tag_name(tag: u8) -> Option<&'static str> {
    match tag {
        TAG_DEVICE_TYPE => Some("device-type"),
        TAG_DEVICE_ID => Some("device-id"),
        TAG_GETSET_NAME => Some("getset-name"),
        TAG_GETSET_VALUE => Some("getset-value"),
        TAG_ERROR_MESSAGE => Some("error-message"),
        TAG_TUNER_COUNT => Some("tuner-count"),
        TAG_GETSET_LOCKKEY => Some("getset-lockkey"),
        TAG_LINEUP_URL => Some("lineup-url"),
        TAG_STORAGE_URL => Some("storage-url"),
        TAG_DEVICE_AUTH_BIN => Some("device-auth-bin"),
        TAG_BASE_URL => Some("base-url"),
        TAG_DEVICE_AUTH_STR => Some("device-auth-str"),
        TAG_STORAGE_ID => Some("storage-id"),
        TAG_MULTI_TYPE => Some("multi-type"),
        _ => None,
    }
}

/// One tag-length-value entry from a discovery packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValue {
    pub tag: u8,
    pub value: Bytes,
}

/// A decoded discovery datagram.
#[derive(Debug, Clone)]
pub struct DiscoveryPacket {
    pub packet_type: u16,
    pub crc: u32,
    /// TLV entries; empty for packet types whose value section is not TLV
    /// (firmware upgrade chunks).
    pub tags: Vec<TagValue>,
}

impl DiscoveryPacket {
    /// Parses a discovery datagram. The CRC is reported, not verified.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(BridgeError::PacketDecode(format!(
                "datagram of {} bytes is shorter than header plus crc",
                data.len()
            )));
        }

        let packet_type = u16::from_be_bytes([data[0], data[1]]);
        let value_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < HEADER_SIZE + value_len + CRC_SIZE {
            return Err(BridgeError::PacketDecode(format!(
                "value length {} overruns {}-byte datagram",
                value_len,
                data.len()
            )));
        }

        let value = &data[HEADER_SIZE..HEADER_SIZE + value_len];
        let crc_start = HEADER_SIZE + value_len;
        // Everything is big-endian except the CRC.
        let crc = u32::from_le_bytes([
            data[crc_start],
            data[crc_start + 1],
            data[crc_start + 2],
            data[crc_start + 3],
        ]);

        let tags = if (TYPE_DISCOVER_REQ..=TYPE_GETSET_RPY).contains(&packet_type) {
            parse_tlv(value)?
        } else {
            Vec::new()
        };

        Ok(Self {
            packet_type,
            crc,
            tags,
        })
    }
}

fn parse_tlv(mut value: &[u8]) -> Result<Vec<TagValue>> {
    let mut tags = Vec::new();

    while value.len() >= 2 {
        let tag = value[0];
        let (len, start) = if value[1] & 0x80 != 0 {
            if value.len() < 3 {
                return Err(BridgeError::PacketDecode(
                    "extended tag length cut short".to_string(),
                ));
            }
            ((value[1] & 0x7f) as usize | ((value[2] as usize) << 7), 3)
        } else {
            (value[1] as usize, 2)
        };

        let end = start + len;
        if value.len() < end {
            return Err(BridgeError::PacketDecode(format!(
                "tag {:#04x} value of {} bytes overruns packet",
                tag, len
            )));
        }

        tags.push(TagValue {
            tag,
            value: Bytes::copy_from_slice(&value[start..end]),
        });
        value = &value[end..];
    }

    if !value.is_empty() {
        return Err(BridgeError::PacketDecode(format!(
            "{} trailing bytes after last tag",
            value.len()
        )));
    }

    Ok(tags)
}

impl fmt::Display for DiscoveryPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match packet_type_name(self.packet_type) {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "type {:#06x}", self.packet_type)?,
        }
        write!(f, " crc={:#010x}", self.crc)?;
        for tag in &self.tags {
            write!(f, " {}", tag)?;
        }
        Ok(())
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match tag_name(self.tag) {
            Some(name) => write!(f, "{}=", name)?,
            None => write!(f, "tag {:#04x}=", self.tag)?,
        }

        // Device types render by name, printable values as text, the rest
        // as hex.
        if self.tag == TAG_DEVICE_TYPE && self.value.len() == 4 {
            let raw = u32::from_be_bytes([self.value[0], self.value[1], self.value[2], self.value[3]]);
            return match device_type_name(raw) {
                Some(name) => write!(f, "{}", name),
                None => write!(f, "{:#010x}", raw),
            };
        }

        if !self.value.is_empty()
            && self.value.iter().all(|b| b.is_ascii_graphic() || *b == b' ')
        {
            write!(f, "\"{}\"", String::from_utf8_lossy(&self.value))
        } else {
            for byte in self.value.iter() {
                write!(f, "{:02x}", byte)?;
            }
            Ok(())
        }
    }
}

/// Binds the discovery port (shared, SO_REUSEADDR) and logs every decoded
/// datagram. Runs until the process is stopped.
pub async fn run_dump(port: u16) -> Result<()> {
    let socket = net::broadcast_listener(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
    info!("dumping discovery traffic on port {}", port);

    let mut buf = vec![0u8; 1024];
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        match DiscoveryPacket::parse(&buf[..len]) {
            Ok(packet) => info!("{} bytes from {}: {}", len, addr, packet),
            Err(e) => warn!("{} bytes from {}: {}", len, addr, e),
        }
    }
}
