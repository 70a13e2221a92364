//! UDC endpoint capability table (`USB_RAW_IOCTL_EPS_INFO`)

use bytemuck::{Pod, Zeroable};

use super::device::{EndpointDirection, TransferType};
use super::ioctl::EPS_INFO_SIZE;
use crate::error::{GadgetError, Result};

/// Maximum number of entries in the table
pub const USB_RAW_EPS_NUM_MAX: usize = 30;

/// Endpoint name length, NUL-padded
pub const USB_RAW_EP_NAME_MAX: usize = 16;

/// Address value meaning "any endpoint number may be assigned"
pub const USB_RAW_EP_ADDR_ANY: u32 = 0xff;

/// Wire layout of `struct usb_raw_ep_info`
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawEpInfo {
    name: [u8; USB_RAW_EP_NAME_MAX],
    addr: u32,
    caps: u32,
    maxpacket_limit: u16,
    max_streams: u16,
    reserved: u32,
}

/// Size of one table entry
pub const EP_INFO_SIZE: usize = std::mem::size_of::<RawEpInfo>();

const _: () = assert!(EP_INFO_SIZE == 32);
const _: () = assert!(EP_INFO_SIZE * USB_RAW_EPS_NUM_MAX == EPS_INFO_SIZE);

/// Endpoint capability bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointCaps {
    pub type_control: bool,
    pub type_iso: bool,
    pub type_bulk: bool,
    pub type_int: bool,
    pub dir_in: bool,
    pub dir_out: bool,
}

impl EndpointCaps {
    /// Create from the raw bitfield; reserved bits are dropped
    pub fn from_bits(bits: u32) -> Self {
        Self {
            type_control: bits & 0x01 != 0,
            type_iso: bits & 0x02 != 0,
            type_bulk: bits & 0x04 != 0,
            type_int: bits & 0x08 != 0,
            dir_in: bits & 0x10 != 0,
            dir_out: bits & 0x20 != 0,
        }
    }

    pub fn to_bits(&self) -> u32 {
        (self.type_control as u32)
            | (self.type_iso as u32) << 1
            | (self.type_bulk as u32) << 2
            | (self.type_int as u32) << 3
            | (self.dir_in as u32) << 4
            | (self.dir_out as u32) << 5
    }
}

/// Endpoint limits reported by the UDC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointLimits {
    pub maxpacket_limit: u16,
    pub max_streams: u16,
    pub reserved: u32,
}

/// One UDC endpoint as described by the driver
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointInfo {
    /// UDC endpoint name, e.g. "ep1in-bulk"
    pub name: String,
    /// Fixed endpoint number, or `USB_RAW_EP_ADDR_ANY`
    pub address: u32,
    pub caps: EndpointCaps,
    pub limits: EndpointLimits,
}

impl EndpointInfo {
    /// Whether this UDC endpoint can carry the given kind of transfer
    pub fn supports(&self, direction: EndpointDirection, transfer_type: TransferType) -> bool {
        let dir_ok = match direction {
            EndpointDirection::In => self.caps.dir_in,
            EndpointDirection::Out => self.caps.dir_out,
        };
        let type_ok = match transfer_type {
            TransferType::Control => self.caps.type_control,
            TransferType::Isochronous => self.caps.type_iso,
            TransferType::Bulk => self.caps.type_bulk,
            TransferType::Interrupt => self.caps.type_int,
        };
        dir_ok && type_ok
    }

    /// Whether the UDC lets the gadget pick the endpoint number
    pub fn any_address(&self) -> bool {
        self.address == USB_RAW_EP_ADDR_ANY
    }

    fn from_raw(raw: &RawEpInfo) -> Self {
        let name_len = raw
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(USB_RAW_EP_NAME_MAX);
        Self {
            name: String::from_utf8_lossy(&raw.name[..name_len]).into_owned(),
            address: u32::from_le(raw.addr),
            caps: EndpointCaps::from_bits(u32::from_le(raw.caps)),
            limits: EndpointLimits {
                maxpacket_limit: u16::from_le(raw.maxpacket_limit),
                max_streams: u16::from_le(raw.max_streams),
                reserved: u32::from_le(raw.reserved),
            },
        }
    }

    fn to_raw(&self) -> RawEpInfo {
        let mut name = [0u8; USB_RAW_EP_NAME_MAX];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(USB_RAW_EP_NAME_MAX);
        name[..len].copy_from_slice(&bytes[..len]);
        RawEpInfo {
            name,
            addr: self.address.to_le(),
            caps: self.caps.to_bits().to_le(),
            maxpacket_limit: self.limits.maxpacket_limit.to_le(),
            max_streams: self.limits.max_streams.to_le(),
            reserved: self.limits.reserved.to_le(),
        }
    }
}

/// Parse the first `count` entries of an endpoint table
///
/// Entries past `count` hold whatever the buffer contained and are skipped.
pub fn parse_endpoints_info(buffer: &[u8], count: usize) -> Result<Vec<EndpointInfo>> {
    if buffer.len() < EPS_INFO_SIZE {
        return Err(GadgetError::ProtocolViolation(format!(
            "endpoint table is {} bytes, expected {}",
            buffer.len(),
            EPS_INFO_SIZE
        )));
    }
    if count > USB_RAW_EPS_NUM_MAX {
        return Err(GadgetError::ProtocolViolation(format!(
            "driver reported {} endpoints, table holds {}",
            count, USB_RAW_EPS_NUM_MAX
        )));
    }

    Ok(buffer[..EPS_INFO_SIZE]
        .chunks_exact(EP_INFO_SIZE)
        .take(count)
        .map(|chunk| EndpointInfo::from_raw(&bytemuck::pod_read_unaligned(chunk)))
        .collect())
}

/// Serialize entries into a full-size endpoint table
pub fn encode_endpoints_info(entries: &[EndpointInfo]) -> Result<Vec<u8>> {
    if entries.len() > USB_RAW_EPS_NUM_MAX {
        return Err(GadgetError::Codec(format!(
            "{} endpoints exceed the table size of {}",
            entries.len(),
            USB_RAW_EPS_NUM_MAX
        )));
    }

    let mut buf = vec![0u8; EPS_INFO_SIZE];
    for (entry, chunk) in entries.iter().zip(buf.chunks_exact_mut(EP_INFO_SIZE)) {
        chunk.copy_from_slice(bytemuck::bytes_of(&entry.to_raw()));
    }
    Ok(buf)
}
