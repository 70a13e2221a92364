//! Raw-gadget events and the control request header

use bytes::Buf;

use super::ioctl::{decode_response, USB_RAW_IOCTL_EVENT_FETCH};
use crate::error::{GadgetError, Result};

/// Size of the USB SETUP packet
pub const CONTROL_HEADER_SIZE: usize = 8;

pub const USB_RAW_EVENT_INVALID: u32 = 0;
pub const USB_RAW_EVENT_CONNECT: u32 = 1;
pub const USB_RAW_EVENT_CONTROL: u32 = 2;

/// USB control request header (`struct usb_ctrlrequest`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlHeader {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlHeader {
    /// Parse the 8-byte SETUP packet
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != CONTROL_HEADER_SIZE {
            return Err(GadgetError::ProtocolViolation(format!(
                "control header must be {} bytes, got {}",
                CONTROL_HEADER_SIZE,
                raw.len()
            )));
        }

        let mut buf = raw;
        Ok(Self {
            request_type: buf.get_u8(),
            request: buf.get_u8(),
            value: buf.get_u16_le(),
            index: buf.get_u16_le(),
            length: buf.get_u16_le(),
        })
    }

    pub fn to_bytes(&self) -> [u8; CONTROL_HEADER_SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Data stage direction is device-to-host
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// One event fetched from the driver
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RawEvent {
    /// Nothing happened; used as the poll tick for endpoint servicing
    Empty,
    /// The gadget was connected to a host
    Connect,
    /// A control request arrived on endpoint 0
    Control {
        header: ControlHeader,
        raw: [u8; CONTROL_HEADER_SIZE],
    },
    /// Event type this crate does not know about
    Unknown { kind: u32, data: Vec<u8> },
}

impl RawEvent {
    /// Decode an event frame: `type:u32, length:u32, data[length]`
    ///
    /// Data beyond `length` is ignored. A frame shorter than it claims, or a
    /// control event that is not exactly one SETUP packet, is a protocol
    /// violation.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let decoded = decode_response(&USB_RAW_IOCTL_EVENT_FETCH.payload, frame)?;
        let kind = decoded.int(0)? as u32;
        let length = decoded.int(1)? as usize;

        if decoded.rest.len() < length {
            return Err(GadgetError::ProtocolViolation(format!(
                "event type {} advertises {} bytes, only {} present",
                kind,
                length,
                decoded.rest.len()
            )));
        }
        let data = &decoded.rest[..length];

        match kind {
            USB_RAW_EVENT_INVALID => Ok(RawEvent::Empty),
            USB_RAW_EVENT_CONNECT => Ok(RawEvent::Connect),
            USB_RAW_EVENT_CONTROL => {
                let header = ControlHeader::parse(data)?;
                let mut raw = [0u8; CONTROL_HEADER_SIZE];
                raw.copy_from_slice(data);
                Ok(RawEvent::Control { header, raw })
            }
            _ => Ok(RawEvent::Unknown {
                kind,
                data: data.to_vec(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RawEvent::Empty => "empty",
            RawEvent::Connect => "connect",
            RawEvent::Control { .. } => "control",
            RawEvent::Unknown { .. } => "unknown",
        }
    }
}
