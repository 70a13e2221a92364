//! Linux ioctl request codes and raw-gadget payload packing
//!
//! Request code layout (see `include/uapi/asm-generic/ioctl.h`):
//! ```text
//! dir [31:30] | size [29:16] | type [15:8] | nr [7:0]
//! ```
//!
//! Payloads come in four shapes:
//! - `None`: no argument, a null pointer is passed
//! - `Value`: a single `u32` passed directly as the ioctl argument
//! - `Blob(n)`: a fixed-size opaque buffer (endpoint descriptor, endpoint table)
//! - `Struct(fields)`: a little-endian header followed by trailing bytes
//!
//! This layer only checks wire shapes. It knows nothing about USB.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{GadgetError, Result};

pub const IOC_NRBITS: u32 = 8;
pub const IOC_TYPEBITS: u32 = 8;
pub const IOC_SIZEBITS: u32 = 14;
pub const IOC_DIRBITS: u32 = 2;

pub const IOC_NRSHIFT: u32 = 0;
pub const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
pub const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
pub const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

/// Largest payload size encodable in a request code
pub const IOC_SIZE_MAX: usize = (1 << IOC_SIZEBITS) - 1;

/// ioctl type tag shared by every raw-gadget command
pub const RAW_GADGET_IOCTL_TYPE: u8 = b'U';

/// Maximum UDC driver/device name length, including the NUL terminator
pub const UDC_NAME_LENGTH_MAX: usize = 128;

/// Size of `struct usb_raw_ep_io` without its data
pub const EP_IO_HEADER_SIZE: usize = 8;

/// Size of `struct usb_raw_event` without its data
pub const EVENT_HEADER_SIZE: usize = 8;

/// `USB_DT_ENDPOINT_AUDIO_SIZE`, what the kernel copies on endpoint enable
pub const ENDPOINT_DESCRIPTOR_SIZE: usize = 9;

/// Size of `struct usb_raw_eps_info`
pub const EPS_INFO_SIZE: usize = 960;

/// Transfer direction of an ioctl, seen from userspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    None,
    Write,
    Read,
    ReadWrite,
}

impl Direction {
    /// Raw `_IOC_*` direction bits
    pub const fn bits(self) -> u32 {
        match self {
            Direction::None => 0,
            Direction::Write => 1,
            Direction::Read => 2,
            Direction::ReadWrite => 3,
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        match bits & ((1 << IOC_DIRBITS) - 1) {
            0 => Direction::None,
            1 => Direction::Write,
            2 => Direction::Read,
            _ => Direction::ReadWrite,
        }
    }
}

/// Build an ioctl request code
pub fn make_request_code(direction: Direction, type_tag: u8, number: u8, size: usize) -> Result<u32> {
    if size > IOC_SIZE_MAX {
        return Err(GadgetError::InvalidSize(size));
    }

    Ok(direction.bits() << IOC_DIRSHIFT
        | (size as u32) << IOC_SIZESHIFT
        | (type_tag as u32) << IOC_TYPESHIFT
        | (number as u32) << IOC_NRSHIFT)
}

/// Split a request code back into (direction, type, number, size)
pub fn decode_request_code(code: u32) -> (Direction, u8, u8, usize) {
    let direction = Direction::from_bits(code >> IOC_DIRSHIFT);
    let size = (code >> IOC_SIZESHIFT) as usize & IOC_SIZE_MAX;
    let type_tag = (code >> IOC_TYPESHIFT) as u8;
    let number = (code >> IOC_NRSHIFT) as u8;
    (direction, type_tag, number, size)
}

/// One scalar or fixed-width field of a payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    U8,
    U16,
    U32,
    /// NUL-padded byte array
    Bytes(usize),
}

impl Field {
    pub const fn size(self) -> usize {
        match self {
            Field::U8 => 1,
            Field::U16 => 2,
            Field::U32 => 4,
            Field::Bytes(n) => n,
        }
    }
}

/// Payload shape of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    Value,
    Blob(usize),
    Struct(&'static [Field]),
}

impl Payload {
    /// Size encoded into the request code
    pub const fn size(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Value => 4,
            Payload::Blob(n) => *n,
            Payload::Struct(fields) => {
                let mut total = 0;
                let mut i = 0;
                while i < fields.len() {
                    total += fields[i].size();
                    i += 1;
                }
                total
            }
        }
    }
}

/// Argument packed into a payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg<'a> {
    Int(u64),
    Bytes(&'a [u8]),
}

/// Field decoded out of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Int(u64),
    Bytes(&'a [u8]),
}

impl<'a> Value<'a> {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Int(_) => None,
        }
    }
}

/// Decoded response: header fields plus the bytes following the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub values: Vec<Value<'a>>,
    pub rest: &'a [u8],
}

impl<'a> Decoded<'a> {
    /// Integer field at `index`
    pub fn int(&self, index: usize) -> Result<u64> {
        self.values
            .get(index)
            .and_then(Value::as_int)
            .ok_or_else(|| GadgetError::Codec(format!("field {} is not an integer", index)))
    }
}

/// Raw-gadget command descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    pub direction: Direction,
    pub number: u8,
    pub payload: Payload,
}

impl Command {
    pub const fn new(name: &'static str, direction: Direction, number: u8, payload: Payload) -> Self {
        Self {
            name,
            direction,
            number,
            payload,
        }
    }

    pub fn request_code(&self) -> Result<u32> {
        make_request_code(
            self.direction,
            RAW_GADGET_IOCTL_TYPE,
            self.number,
            self.payload.size(),
        )
    }
}

/// `struct usb_raw_init`
pub const INIT_LAYOUT: &[Field] = &[
    Field::Bytes(UDC_NAME_LENGTH_MAX),
    Field::Bytes(UDC_NAME_LENGTH_MAX),
    Field::U8,
];

/// `struct usb_raw_event` header: type, length
pub const EVENT_LAYOUT: &[Field] = &[Field::U32, Field::U32];

/// `struct usb_raw_ep_io` header: ep, flags, length
pub const EP_IO_LAYOUT: &[Field] = &[Field::U16, Field::U16, Field::U32];

pub const USB_RAW_IOCTL_INIT: Command =
    Command::new("init", Direction::Write, 0, Payload::Struct(INIT_LAYOUT));
pub const USB_RAW_IOCTL_RUN: Command = Command::new("run", Direction::None, 1, Payload::None);
pub const USB_RAW_IOCTL_EVENT_FETCH: Command =
    Command::new("event_fetch", Direction::Read, 2, Payload::Struct(EVENT_LAYOUT));
pub const USB_RAW_IOCTL_EP0_WRITE: Command =
    Command::new("ep0_write", Direction::Write, 3, Payload::Struct(EP_IO_LAYOUT));
pub const USB_RAW_IOCTL_EP0_READ: Command =
    Command::new("ep0_read", Direction::ReadWrite, 4, Payload::Struct(EP_IO_LAYOUT));
pub const USB_RAW_IOCTL_EP_ENABLE: Command = Command::new(
    "ep_enable",
    Direction::Write,
    5,
    Payload::Blob(ENDPOINT_DESCRIPTOR_SIZE),
);
pub const USB_RAW_IOCTL_EP_DISABLE: Command =
    Command::new("ep_disable", Direction::Write, 6, Payload::Value);
pub const USB_RAW_IOCTL_EP_WRITE: Command =
    Command::new("ep_write", Direction::Write, 7, Payload::Struct(EP_IO_LAYOUT));
pub const USB_RAW_IOCTL_EP_READ: Command =
    Command::new("ep_read", Direction::ReadWrite, 8, Payload::Struct(EP_IO_LAYOUT));
pub const USB_RAW_IOCTL_CONFIGURE: Command =
    Command::new("configure", Direction::None, 9, Payload::None);
pub const USB_RAW_IOCTL_VBUS_DRAW: Command =
    Command::new("vbus_draw", Direction::Write, 10, Payload::Value);
pub const USB_RAW_IOCTL_EPS_INFO: Command =
    Command::new("eps_info", Direction::Read, 11, Payload::Blob(EPS_INFO_SIZE));
pub const USB_RAW_IOCTL_EP0_STALL: Command =
    Command::new("ep0_stall", Direction::None, 12, Payload::None);
pub const USB_RAW_IOCTL_EP_SET_HALT: Command =
    Command::new("ep_set_halt", Direction::Write, 13, Payload::Value);
pub const USB_RAW_IOCTL_EP_CLEAR_HALT: Command =
    Command::new("ep_clear_halt", Direction::Write, 14, Payload::Value);
pub const USB_RAW_IOCTL_EP_SET_WEDGE: Command =
    Command::new("ep_set_wedge", Direction::Write, 15, Payload::Value);
pub const USB_RAW_IOCTL_EP_FIFO_STATUS: Command =
    Command::new("ep_fifo_status", Direction::Write, 16, Payload::Value);
pub const USB_RAW_IOCTL_EP_WRITE_ASYNC: Command =
    Command::new("ep_write_async", Direction::Write, 17, Payload::Struct(EP_IO_LAYOUT));
pub const USB_RAW_IOCTL_EP_READ_ASYNC: Command = Command::new(
    "ep_read_async",
    Direction::ReadWrite,
    18,
    Payload::Struct(EP_IO_LAYOUT),
);

const _: () = assert!(Payload::Struct(INIT_LAYOUT).size() == 257);
const _: () = assert!(Payload::Struct(EP_IO_LAYOUT).size() == EP_IO_HEADER_SIZE);
const _: () = assert!(Payload::Struct(EVENT_LAYOUT).size() == EVENT_HEADER_SIZE);

fn check_int(field: Field, value: u64) -> Result<()> {
    let max = match field {
        Field::U8 => u8::MAX as u64,
        Field::U16 => u16::MAX as u64,
        Field::U32 => u32::MAX as u64,
        Field::Bytes(_) => unreachable!("byte fields take byte arguments"),
    };
    if value > max {
        return Err(GadgetError::Codec(format!(
            "value {} does not fit {:?}",
            value, field
        )));
    }
    Ok(())
}

/// Pack `args` per the payload layout, then append `trailing`
pub fn encode_command(payload: &Payload, args: &[Arg<'_>], trailing: &[u8]) -> Result<BytesMut> {
    match payload {
        Payload::None => {
            if !args.is_empty() || !trailing.is_empty() {
                return Err(GadgetError::Codec("command takes no payload".into()));
            }
            Ok(BytesMut::new())
        }
        Payload::Value => match args {
            [Arg::Int(v)] if trailing.is_empty() => {
                check_int(Field::U32, *v)?;
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32_le(*v as u32);
                Ok(buf)
            }
            _ => Err(GadgetError::Codec("command takes a single u32".into())),
        },
        Payload::Blob(size) => {
            if !args.is_empty() {
                return Err(GadgetError::Codec("blob command takes no scalars".into()));
            }
            if trailing.len() > *size {
                return Err(GadgetError::Codec(format!(
                    "blob of {} bytes exceeds {} bytes",
                    trailing.len(),
                    size
                )));
            }
            let mut buf = BytesMut::with_capacity(*size);
            buf.put_slice(trailing);
            buf.put_bytes(0, size - trailing.len());
            Ok(buf)
        }
        Payload::Struct(fields) => {
            if fields.len() != args.len() {
                return Err(GadgetError::Codec(format!(
                    "expected {} arguments, got {}",
                    fields.len(),
                    args.len()
                )));
            }

            let mut buf = BytesMut::with_capacity(payload.size() + trailing.len());
            for (field, arg) in fields.iter().zip(args) {
                match (*field, *arg) {
                    (Field::U8, Arg::Int(v)) => {
                        check_int(*field, v)?;
                        buf.put_u8(v as u8);
                    }
                    (Field::U16, Arg::Int(v)) => {
                        check_int(*field, v)?;
                        buf.put_u16_le(v as u16);
                    }
                    (Field::U32, Arg::Int(v)) => {
                        check_int(*field, v)?;
                        buf.put_u32_le(v as u32);
                    }
                    (Field::Bytes(n), Arg::Bytes(b)) => {
                        if b.len() > n {
                            return Err(GadgetError::Codec(format!(
                                "{} bytes do not fit a {}-byte field",
                                b.len(),
                                n
                            )));
                        }
                        buf.put_slice(b);
                        buf.put_bytes(0, n - b.len());
                    }
                    (field, arg) => {
                        return Err(GadgetError::Codec(format!(
                            "argument {:?} does not match field {:?}",
                            arg, field
                        )));
                    }
                }
            }
            buf.put_slice(trailing);
            Ok(buf)
        }
    }
}

/// Unpack a response buffer per the payload layout
pub fn decode_response<'a>(payload: &Payload, buffer: &'a [u8]) -> Result<Decoded<'a>> {
    let size = payload.size();
    if buffer.len() < size {
        return Err(GadgetError::ProtocolViolation(format!(
            "response of {} bytes is shorter than {} byte header",
            buffer.len(),
            size
        )));
    }

    let mut values = Vec::new();
    let mut cursor = buffer;
    match payload {
        Payload::None => {}
        Payload::Value => values.push(Value::Int(cursor.get_u32_le() as u64)),
        Payload::Blob(n) => {
            let (blob, tail) = cursor.split_at(*n);
            values.push(Value::Bytes(blob));
            cursor = tail;
        }
        Payload::Struct(fields) => {
            for field in fields.iter() {
                let value = match field {
                    Field::U8 => Value::Int(cursor.get_u8() as u64),
                    Field::U16 => Value::Int(cursor.get_u16_le() as u64),
                    Field::U32 => Value::Int(cursor.get_u32_le() as u64),
                    Field::Bytes(n) => {
                        let (bytes, tail) = cursor.split_at(*n);
                        cursor = tail;
                        Value::Bytes(bytes)
                    }
                };
                values.push(value);
            }
        }
    }

    Ok(Decoded {
        values,
        rest: cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_request_codes() {
        assert_eq!(USB_RAW_IOCTL_INIT.request_code().unwrap(), 0x4101_5500);
        assert_eq!(USB_RAW_IOCTL_RUN.request_code().unwrap(), 0x0000_5501);
        assert_eq!(USB_RAW_IOCTL_EVENT_FETCH.request_code().unwrap(), 0x8008_5502);
        assert_eq!(USB_RAW_IOCTL_EP0_WRITE.request_code().unwrap(), 0x4008_5503);
        assert_eq!(USB_RAW_IOCTL_EP0_READ.request_code().unwrap(), 0xC008_5504);
        assert_eq!(USB_RAW_IOCTL_EP_ENABLE.request_code().unwrap(), 0x4009_5505);
        assert_eq!(USB_RAW_IOCTL_EP_DISABLE.request_code().unwrap(), 0x4004_5506);
        assert_eq!(USB_RAW_IOCTL_CONFIGURE.request_code().unwrap(), 0x0000_5509);
        assert_eq!(USB_RAW_IOCTL_VBUS_DRAW.request_code().unwrap(), 0x4004_550A);
        assert_eq!(USB_RAW_IOCTL_EPS_INFO.request_code().unwrap(), 0x83C0_550B);
        assert_eq!(USB_RAW_IOCTL_EP_WRITE.request_code().unwrap(), 0x4008_5507);
        assert_eq!(USB_RAW_IOCTL_EP_READ.request_code().unwrap(), 0xC008_5508);
        assert_eq!(USB_RAW_IOCTL_EP0_STALL.request_code().unwrap(), 0x0000_550C);
        assert_eq!(USB_RAW_IOCTL_EP_SET_HALT.request_code().unwrap(), 0x4004_550D);
        assert_eq!(USB_RAW_IOCTL_EP_CLEAR_HALT.request_code().unwrap(), 0x4004_550E);
        assert_eq!(USB_RAW_IOCTL_EP_SET_WEDGE.request_code().unwrap(), 0x4004_550F);
        assert_eq!(USB_RAW_IOCTL_EP_FIFO_STATUS.request_code().unwrap(), 0x4004_5510);
        assert_eq!(USB_RAW_IOCTL_EP_WRITE_ASYNC.request_code().unwrap(), 0x4008_5511);
        assert_eq!(USB_RAW_IOCTL_EP_READ_ASYNC.request_code().unwrap(), 0xC008_5512);
    }

    #[test]
    fn test_request_code_roundtrip_and_injective() {
        let dirs = [
            Direction::None,
            Direction::Write,
            Direction::Read,
            Direction::ReadWrite,
        ];
        let mut seen = std::collections::HashSet::new();
        for dir in dirs {
            for type_tag in [0u8, b'U', 0xff] {
                for number in [0u8, 1, 18, 0xff] {
                    for size in [0usize, 1, 8, 257, 960, IOC_SIZE_MAX] {
                        let code = make_request_code(dir, type_tag, number, size).unwrap();
                        assert_eq!(decode_request_code(code), (dir, type_tag, number, size));
                        assert!(seen.insert(code), "duplicate code {:#x}", code);
                    }
                }
            }
        }
    }

    #[test]
    fn test_request_code_size_limit() {
        assert!(make_request_code(Direction::Read, b'U', 0, IOC_SIZE_MAX).is_ok());
        assert!(matches!(
            make_request_code(Direction::Read, b'U', 0, IOC_SIZE_MAX + 1),
            Err(GadgetError::InvalidSize(16384))
        ));
    }

    #[test]
    fn test_encode_init() {
        let buf = encode_command(
            &USB_RAW_IOCTL_INIT.payload,
            &[Arg::Bytes(b"dummy_udc"), Arg::Bytes(b"dummy_udc.0"), Arg::Int(3)],
            &[],
        )
        .unwrap();
        assert_eq!(buf.len(), 257);
        assert_eq!(&buf[..9], b"dummy_udc");
        assert!(buf[9..128].iter().all(|&b| b == 0));
        assert_eq!(&buf[128..139], b"dummy_udc.0");
        assert_eq!(buf[256], 3);
    }

    #[test]
    fn test_encode_ep_io_header() {
        let buf = encode_command(
            &USB_RAW_IOCTL_EP_WRITE.payload,
            &[Arg::Int(2), Arg::Int(0), Arg::Int(3)],
            &[0xaa, 0xbb, 0xcc],
        )
        .unwrap();
        assert_eq!(&buf[..], &[2, 0, 0, 0, 3, 0, 0, 0, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_encode_blob_pads() {
        let buf = encode_command(&USB_RAW_IOCTL_EP_ENABLE.payload, &[], &[7, 5, 0x81]).unwrap();
        assert_eq!(&buf[..], &[7, 5, 0x81, 0, 0, 0, 0, 0, 0]);

        let too_long = [0u8; 10];
        assert!(encode_command(&USB_RAW_IOCTL_EP_ENABLE.payload, &[], &too_long).is_err());
    }

    #[test]
    fn test_encode_rejects_mismatched_args() {
        assert!(encode_command(&USB_RAW_IOCTL_RUN.payload, &[Arg::Int(1)], &[]).is_err());
        assert!(encode_command(&USB_RAW_IOCTL_EP_WRITE.payload, &[Arg::Int(1)], &[]).is_err());
        assert!(encode_command(
            &USB_RAW_IOCTL_EP_WRITE.payload,
            &[Arg::Int(0x1_0000), Arg::Int(0), Arg::Int(0)],
            &[]
        )
        .is_err());
        assert!(encode_command(
            &USB_RAW_IOCTL_INIT.payload,
            &[Arg::Int(0), Arg::Bytes(b"x"), Arg::Int(0)],
            &[]
        )
        .is_err());
    }

    #[test]
    fn test_decode_event_header() {
        let raw = [2, 0, 0, 0, 8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];
        let decoded = decode_response(&USB_RAW_IOCTL_EVENT_FETCH.payload, &raw).unwrap();
        assert_eq!(decoded.int(0).unwrap(), 2);
        assert_eq!(decoded.int(1).unwrap(), 8);
        assert_eq!(decoded.rest, &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert!(decode_response(&USB_RAW_IOCTL_EVENT_FETCH.payload, &raw[..4]).is_err());
    }

    #[test]
    fn test_decode_byte_fields() {
        let buf = encode_command(
            &USB_RAW_IOCTL_INIT.payload,
            &[Arg::Bytes(b"dummy_udc"), Arg::Bytes(b"dummy_udc.0"), Arg::Int(5)],
            &[0xee],
        )
        .unwrap();
        let decoded = decode_response(&USB_RAW_IOCTL_INIT.payload, &buf).unwrap();

        let driver = decoded.values[0].as_bytes().unwrap();
        assert_eq!(driver.len(), UDC_NAME_LENGTH_MAX);
        assert_eq!(&driver[..9], b"dummy_udc");
        assert_eq!(decoded.values[1].as_bytes().unwrap()[10], b'0');
        assert_eq!(decoded.values[2].as_int(), Some(5));
        assert_eq!(decoded.values[2].as_bytes(), None);
        assert_eq!(decoded.values[0].as_int(), None);
        assert!(decoded.int(0).is_err());
        assert_eq!(decoded.rest, &[0xee]);
    }
}
