//! Raw-gadget driver client
//!
//! One method per driver command. Each method performs exactly one ioctl.
//!
//! Lifecycle: `open` → `init` (once) → `run` → I/O ... → `close`.
//! Issuing commands on a closed client, or out of that order, is a bug in
//! the caller and panics instead of returning an error.

use std::fmt;
use std::path::Path;

use bytes::BytesMut;
use nix::errno::Errno;
use tracing::{debug, info, trace};

use super::channel::{DeviceCommandChannel, DriverChannel, IoctlArg};
use super::event::{RawEvent, CONTROL_HEADER_SIZE};
use super::info::{parse_endpoints_info, EndpointInfo};
use super::ioctl::*;
use crate::config::UsbSpeed;
use crate::error::{GadgetError, Result};

/// Default driver node
pub const DEFAULT_DEVICE_PATH: &str = "/dev/raw-gadget";

/// Client lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Closed,
    Opened,
    Initialized,
    Running,
}

/// Kernel-assigned endpoint handle returned by endpoint enable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointHandle(u32);

impl EndpointHandle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Result of an endpoint I/O command
///
/// `raw` is the whole ioctl buffer: the 8-byte `usb_raw_ep_io` header
/// followed by the data area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Syscall result: bytes transferred
    pub status: i32,
    pub raw: BytesMut,
}

impl Transfer {
    pub fn count(&self) -> usize {
        self.status.max(0) as usize
    }

    /// Transferred bytes, without the header
    pub fn payload(&self) -> &[u8] {
        let start = EP_IO_HEADER_SIZE.min(self.raw.len());
        let end = (EP_IO_HEADER_SIZE + self.count()).min(self.raw.len());
        &self.raw[start..end]
    }
}

/// Outcome of a non-blocking endpoint read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRead {
    Transferred(Transfer),
    /// No data was ready
    WouldBlock,
}

/// Client owning the driver handle
#[derive(Debug)]
pub struct RawGadgetClient<C = DriverChannel> {
    channel: Option<C>,
    state: ClientState,
}

impl RawGadgetClient<DriverChannel> {
    /// Open the driver node
    pub fn open(path: &Path) -> Result<Self> {
        let channel = DriverChannel::open(path)?;
        info!("Opened raw gadget driver at {}", path.display());
        Ok(Self::with_channel(channel))
    }

    /// Check whether the driver node exists and can be opened
    pub fn is_available(path: &Path) -> bool {
        match DriverChannel::open(path) {
            Ok(_) => true,
            Err(e) => {
                debug!("Raw gadget not available at {}: {}", path.display(), e);
                false
            }
        }
    }
}

impl<C: DeviceCommandChannel> RawGadgetClient<C> {
    /// Wrap an already opened channel
    pub fn with_channel(channel: C) -> Self {
        Self {
            channel: Some(channel),
            state: ClientState::Opened,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Release the driver handle. Endpoint handles die with it.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            info!("Closed raw gadget driver");
        }
        self.state = ClientState::Closed;
    }

    pub fn channel(&self) -> &C {
        self.channel
            .as_ref()
            .unwrap_or_else(|| panic!("raw gadget channel accessed after close"))
    }

    pub fn channel_mut(&mut self) -> &mut C {
        self.channel
            .as_mut()
            .unwrap_or_else(|| panic!("raw gadget channel accessed after close"))
    }

    fn call(&mut self, cmd: &Command, arg: IoctlArg<'_>) -> Result<i32> {
        let request = cmd.request_code()?;
        let channel = match self.channel.as_mut() {
            Some(channel) => channel,
            None => panic!("raw gadget command {} issued on a closed handle", cmd.name),
        };

        match channel.submit(request, arg) {
            Ok(rv) if rv < 0 => Err(GadgetError::driver(cmd.name, Errno::from_raw(-rv))),
            Ok(rv) => {
                trace!("{} -> {}", cmd.name, rv);
                Ok(rv)
            }
            Err(errno) => {
                debug!("{} failed: {}", cmd.name, errno);
                Err(GadgetError::driver(cmd.name, errno))
            }
        }
    }

    fn call_buffer(&mut self, cmd: &Command, buf: &mut BytesMut) -> Result<i32> {
        if buf.is_empty() {
            self.call(cmd, IoctlArg::None)
        } else {
            self.call(cmd, IoctlArg::Buffer(&mut buf[..]))
        }
    }

    fn call_value(&mut self, cmd: &Command, value: u32) -> Result<i32> {
        encode_command(&cmd.payload, &[Arg::Int(value as u64)], &[])?;
        self.call(cmd, IoctlArg::Value(value))
    }

    fn call_none(&mut self, cmd: &Command) -> Result<i32> {
        encode_command(&cmd.payload, &[], &[])?;
        self.call(cmd, IoctlArg::None)
    }

    /// Bind to a UDC. Must be called exactly once, before `run`.
    pub fn init(&mut self, driver_name: &str, device_name: &str, speed: UsbSpeed) -> Result<()> {
        assert_eq!(
            self.state,
            ClientState::Opened,
            "raw gadget init must be called once, right after open"
        );

        for name in [driver_name, device_name] {
            if name.len() >= UDC_NAME_LENGTH_MAX {
                return Err(GadgetError::Codec(format!(
                    "UDC name {:?} leaves no room for a NUL in {} bytes",
                    name, UDC_NAME_LENGTH_MAX
                )));
            }
        }

        let mut buf = encode_command(
            &USB_RAW_IOCTL_INIT.payload,
            &[
                Arg::Bytes(driver_name.as_bytes()),
                Arg::Bytes(device_name.as_bytes()),
                Arg::Int(speed as u64),
            ],
            &[],
        )?;
        self.call_buffer(&USB_RAW_IOCTL_INIT, &mut buf)?;
        self.state = ClientState::Initialized;
        info!(
            "Raw gadget bound to {} ({}), speed {:?}",
            device_name, driver_name, speed
        );
        Ok(())
    }

    /// Start the UDC
    pub fn run(&mut self) -> Result<()> {
        assert_eq!(
            self.state,
            ClientState::Initialized,
            "raw gadget run requires a prior init"
        );
        self.call_none(&USB_RAW_IOCTL_RUN)?;
        self.state = ClientState::Running;
        Ok(())
    }

    /// Block until the driver reports the next event
    pub fn event_fetch(&mut self) -> Result<RawEvent> {
        let scratch = [0u8; CONTROL_HEADER_SIZE];
        let mut buf = encode_command(
            &USB_RAW_IOCTL_EVENT_FETCH.payload,
            &[Arg::Int(0), Arg::Int(scratch.len() as u64)],
            &scratch,
        )?;
        self.call_buffer(&USB_RAW_IOCTL_EVENT_FETCH, &mut buf)?;
        RawEvent::decode(&buf)
    }

    /// Read the UDC endpoint capability table
    pub fn endpoints_info(&mut self) -> Result<Vec<EndpointInfo>> {
        let mut buf = encode_command(&USB_RAW_IOCTL_EPS_INFO.payload, &[], &[])?;
        let count = self.call_buffer(&USB_RAW_IOCTL_EPS_INFO, &mut buf)?;
        parse_endpoints_info(&buf, count as usize)
    }

    /// Enable an endpoint from its descriptor
    pub fn endpoint_enable(&mut self, descriptor: &[u8]) -> Result<EndpointHandle> {
        let mut buf = encode_command(&USB_RAW_IOCTL_EP_ENABLE.payload, &[], descriptor)?;
        let handle = self.call_buffer(&USB_RAW_IOCTL_EP_ENABLE, &mut buf)?;
        debug!("Enabled endpoint {:02x?} as #{}", descriptor, handle);
        Ok(EndpointHandle(handle as u32))
    }

    pub fn endpoint_disable(&mut self, handle: EndpointHandle) -> Result<()> {
        self.call_value(&USB_RAW_IOCTL_EP_DISABLE, handle.0)?;
        debug!("Disabled endpoint {}", handle);
        Ok(())
    }

    pub fn endpoint_set_halt(&mut self, handle: EndpointHandle) -> Result<()> {
        self.call_value(&USB_RAW_IOCTL_EP_SET_HALT, handle.0).map(|_| ())
    }

    pub fn endpoint_clear_halt(&mut self, handle: EndpointHandle) -> Result<()> {
        self.call_value(&USB_RAW_IOCTL_EP_CLEAR_HALT, handle.0).map(|_| ())
    }

    pub fn endpoint_set_wedge(&mut self, handle: EndpointHandle) -> Result<()> {
        self.call_value(&USB_RAW_IOCTL_EP_SET_WEDGE, handle.0).map(|_| ())
    }

    /// Bytes pending in the endpoint FIFO
    pub fn fifo_status(&mut self, handle: EndpointHandle) -> Result<u32> {
        self.call_value(&USB_RAW_IOCTL_EP_FIFO_STATUS, handle.0)
            .map(|n| n as u32)
    }

    /// Announce the power draw, in 2 mA units
    pub fn vbus_draw(&mut self, power: u32) -> Result<()> {
        self.call_value(&USB_RAW_IOCTL_VBUS_DRAW, power).map(|_| ())
    }

    /// Tell the UDC the gadget is configured
    pub fn configure(&mut self) -> Result<()> {
        self.call_none(&USB_RAW_IOCTL_CONFIGURE).map(|_| ())
    }

    /// Stall the pending control transfer
    pub fn ep0_stall(&mut self) -> Result<()> {
        self.call_none(&USB_RAW_IOCTL_EP0_STALL).map(|_| ())
    }

    fn transfer(&mut self, cmd: &Command, ep: u32, data: &[u8]) -> Result<Transfer> {
        let mut raw = encode_command(
            &cmd.payload,
            &[
                Arg::Int(ep as u64),
                Arg::Int(0),
                Arg::Int(data.len() as u64),
            ],
            data,
        )?;
        let status = self.call_buffer(cmd, &mut raw)?;
        trace!("{} ep={} len={} -> {}", cmd.name, ep, data.len(), status);
        Ok(Transfer { status, raw })
    }

    pub fn endpoint0_write(&mut self, data: &[u8]) -> Result<Transfer> {
        self.transfer(&USB_RAW_IOCTL_EP0_WRITE, 0, data)
    }

    /// Read up to `length` bytes of the control data stage.
    ///
    /// A zero length acknowledges the status stage of an IN-less request.
    pub fn endpoint0_read(&mut self, length: usize) -> Result<Transfer> {
        self.transfer(&USB_RAW_IOCTL_EP0_READ, 0, &vec![0u8; length])
    }

    pub fn endpoint_write(&mut self, handle: EndpointHandle, data: &[u8]) -> Result<Transfer> {
        self.transfer(&USB_RAW_IOCTL_EP_WRITE, handle.0, data)
    }

    pub fn endpoint_read(&mut self, handle: EndpointHandle, length: usize) -> Result<Transfer> {
        self.transfer(&USB_RAW_IOCTL_EP_READ, handle.0, &vec![0u8; length])
    }

    pub fn endpoint_write_async(&mut self, handle: EndpointHandle, data: &[u8]) -> Result<Transfer> {
        self.transfer(&USB_RAW_IOCTL_EP_WRITE_ASYNC, handle.0, data)
    }

    /// Non-blocking read. `EAGAIN` or an empty transfer yields `WouldBlock`.
    pub fn endpoint_read_async(&mut self, handle: EndpointHandle, length: usize) -> Result<AsyncRead> {
        match self.transfer(&USB_RAW_IOCTL_EP_READ_ASYNC, handle.0, &vec![0u8; length]) {
            Ok(transfer) if transfer.count() == 0 => Ok(AsyncRead::WouldBlock),
            Ok(transfer) => Ok(AsyncRead::Transferred(transfer)),
            Err(e) if e.is_would_block() => Ok(AsyncRead::WouldBlock),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::info::{encode_endpoints_info, EndpointCaps};
    use crate::gadget::testing::{event_frame, FakeChannel, RecordedArg};

    fn running_client() -> RawGadgetClient<FakeChannel> {
        let mut client = RawGadgetClient::with_channel(FakeChannel::new());
        client.init("dummy_udc", "dummy_udc.0", UsbSpeed::High).unwrap();
        client.run().unwrap();
        client.channel_mut().calls.clear();
        client
    }

    #[test]
    fn test_init_and_run() {
        let mut client = RawGadgetClient::with_channel(FakeChannel::new());
        client.init("dummy_udc", "dummy_udc.0", UsbSpeed::High).unwrap();
        client.run().unwrap();
        assert_eq!(client.state(), ClientState::Running);

        let calls = &client.channel().calls;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].code, 0x4101_5500);
        match &calls[0].arg {
            RecordedArg::Buffer(buf) => {
                assert_eq!(buf.len(), 257);
                assert_eq!(&buf[..9], b"dummy_udc");
                assert_eq!(&buf[128..139], b"dummy_udc.0");
                assert_eq!(buf[256], UsbSpeed::High as u8);
            }
            other => panic!("unexpected arg {:?}", other),
        }
        assert_eq!(calls[1].code, 0x0000_5501);
        assert_eq!(calls[1].arg, RecordedArg::None);
    }

    #[test]
    fn test_init_requires_nul_terminated_names() {
        let mut client = RawGadgetClient::with_channel(FakeChannel::new());
        let long = "u".repeat(UDC_NAME_LENGTH_MAX);
        assert!(matches!(
            client.init(&long, "dummy_udc.0", UsbSpeed::High),
            Err(GadgetError::Codec(_))
        ));
        assert!(client.init("dummy_udc", &long, UsbSpeed::High).is_err());
        assert!(client.channel().calls.is_empty());
        assert_eq!(client.state(), ClientState::Opened);

        let longest = "u".repeat(UDC_NAME_LENGTH_MAX - 1);
        client.init(&longest, "dummy_udc.0", UsbSpeed::High).unwrap();
        assert_eq!(client.state(), ClientState::Initialized);
    }

    #[test]
    #[should_panic(expected = "requires a prior init")]
    fn test_run_before_init_panics() {
        let mut client = RawGadgetClient::with_channel(FakeChannel::new());
        let _ = client.run();
    }

    #[test]
    #[should_panic(expected = "init must be called once")]
    fn test_double_init_panics() {
        let mut client = RawGadgetClient::with_channel(FakeChannel::new());
        client.init("a", "b", UsbSpeed::Full).unwrap();
        let _ = client.init("a", "b", UsbSpeed::Full);
    }

    #[test]
    #[should_panic(expected = "closed handle")]
    fn test_command_after_close_panics() {
        let mut client = running_client();
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        let _ = client.configure();
    }

    #[test]
    fn test_event_fetch_control() {
        let mut client = running_client();
        let setup = [0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        client.channel_mut().reply(
            &USB_RAW_IOCTL_EVENT_FETCH,
            Ok(0),
            Some(event_frame(2, &setup)),
        );

        match client.event_fetch().unwrap() {
            RawEvent::Control { header, raw } => {
                assert_eq!(header.request, 0x09);
                assert_eq!(header.value, 1);
                assert_eq!(raw, setup);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // The fetch buffer advertises an 8-byte data area
        match &client.channel().calls[0].arg {
            RecordedArg::Buffer(buf) => {
                assert_eq!(buf.len(), 16);
                assert_eq!(&buf[4..8], &[8, 0, 0, 0]);
            }
            other => panic!("unexpected arg {:?}", other),
        }
    }

    #[test]
    fn test_event_fetch_driver_error() {
        let mut client = running_client();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EVENT_FETCH, Err(Errno::EINTR), None);
        assert!(matches!(
            client.event_fetch(),
            Err(GadgetError::Driver {
                op: "event_fetch",
                errno: Errno::EINTR
            })
        ));
    }

    #[test]
    fn test_endpoints_info_uses_returned_count() {
        let mut client = running_client();
        let entries: Vec<_> = (0..3)
            .map(|i| EndpointInfo {
                name: format!("ep{}", i + 1),
                address: i + 1,
                caps: EndpointCaps::from_bits(0x34),
                ..Default::default()
            })
            .collect();
        let table = encode_endpoints_info(&entries).unwrap();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EPS_INFO, Ok(2), Some(table));

        let info = client.endpoints_info().unwrap();
        assert_eq!(info, entries[..2]);
        assert_eq!(client.channel().calls[0].code, 0x83C0_550B);
    }

    #[test]
    fn test_endpoint_enable_returns_handle() {
        let mut client = running_client();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_ENABLE, Ok(3), None);
        let handle = client.endpoint_enable(&[7, 5, 0x81, 3, 8, 0, 10]).unwrap();
        assert_eq!(handle.raw(), 3);
        assert_eq!(
            client.channel().calls[0].arg,
            RecordedArg::Buffer(vec![7, 5, 0x81, 3, 8, 0, 10, 0, 0])
        );
    }

    #[test]
    fn test_negative_return_surfaces() {
        let mut client = running_client();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_ENABLE, Ok(-(Errno::EBUSY as i32)), None);
        let err = client.endpoint_enable(&[7, 5, 0x81, 3, 8, 0, 10]).unwrap_err();
        assert!(matches!(
            err,
            GadgetError::Driver {
                op: "ep_enable",
                errno: Errno::EBUSY
            }
        ));
    }

    #[test]
    fn test_scalar_commands_pass_value() {
        let mut client = running_client();
        let handle = EndpointHandle::from_raw(4);
        client.endpoint_disable(handle).unwrap();
        client.endpoint_set_halt(handle).unwrap();
        client.endpoint_clear_halt(handle).unwrap();
        client.endpoint_set_wedge(handle).unwrap();
        client.vbus_draw(50).unwrap();

        let calls = &client.channel().calls;
        assert_eq!(calls[0].code, 0x4004_5506);
        assert_eq!(calls[0].arg, RecordedArg::Value(4));
        assert_eq!(calls[1].number, 13);
        assert_eq!(calls[2].number, 14);
        assert_eq!(calls[3].number, 15);
        assert_eq!(calls[4].arg, RecordedArg::Value(50));
    }

    #[test]
    fn test_fifo_status() {
        let mut client = running_client();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_FIFO_STATUS, Ok(17), None);
        assert_eq!(client.fifo_status(EndpointHandle::from_raw(1)).unwrap(), 17);
    }

    #[test]
    fn test_endpoint_write_header() {
        let mut client = running_client();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_WRITE, Ok(3), None);
        let transfer = client
            .endpoint_write(EndpointHandle::from_raw(2), &[1, 2, 3])
            .unwrap();
        assert_eq!(transfer.count(), 3);
        assert_eq!(
            client.channel().calls[0].arg,
            RecordedArg::Buffer(vec![2, 0, 0, 0, 3, 0, 0, 0, 1, 2, 3])
        );
    }

    #[test]
    fn test_endpoint_read_blocking() {
        let mut client = running_client();
        let mut response = vec![5, 0, 0, 0, 16, 0, 0, 0];
        response.extend_from_slice(b"hello");
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_READ, Ok(5), Some(response));

        let transfer = client
            .endpoint_read(EndpointHandle::from_raw(5), 16)
            .unwrap();
        assert_eq!(transfer.count(), 5);
        assert_eq!(transfer.payload(), b"hello");

        let call = &client.channel().calls[0];
        assert_eq!(call.code, 0xC008_5508);
        match &call.arg {
            RecordedArg::Buffer(buf) => {
                assert_eq!(&buf[..8], &[5, 0, 0, 0, 16, 0, 0, 0]);
                assert_eq!(buf.len(), 8 + 16);
                assert!(buf[8..].iter().all(|&b| b == 0));
            }
            other => panic!("unexpected arg {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_write_async() {
        let mut client = running_client();
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_WRITE_ASYNC, Ok(2), None);

        let transfer = client
            .endpoint_write_async(EndpointHandle::from_raw(3), &[0xde, 0xad])
            .unwrap();
        assert_eq!(transfer.count(), 2);

        let call = &client.channel().calls[0];
        assert_eq!(call.code, 0x4008_5511);
        assert_eq!(
            call.arg,
            RecordedArg::Buffer(vec![3, 0, 0, 0, 2, 0, 0, 0, 0xde, 0xad])
        );
    }

    #[test]
    fn test_endpoint0_read_returns_data() {
        let mut client = running_client();
        let mut response = vec![0, 0, 0, 0, 4, 0, 0, 0];
        response.extend_from_slice(&[9, 8, 7, 6]);
        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP0_READ, Ok(4), Some(response));
        let transfer = client.endpoint0_read(4).unwrap();
        assert_eq!(transfer.payload(), &[9, 8, 7, 6]);
    }

    #[test]
    fn test_zero_length_ep0_read() {
        let mut client = running_client();
        let transfer = client.endpoint0_read(0).unwrap();
        assert!(transfer.payload().is_empty());
        assert_eq!(
            client.channel().calls[0].arg,
            RecordedArg::Buffer(vec![0; 8])
        );
    }

    #[test]
    fn test_read_async_would_block() {
        let mut client = running_client();
        let handle = EndpointHandle::from_raw(1);

        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_READ_ASYNC, Err(Errno::EAGAIN), None);
        assert_eq!(client.endpoint_read_async(handle, 64).unwrap(), AsyncRead::WouldBlock);

        // Nothing scripted: the fake returns 0 bytes
        assert_eq!(client.endpoint_read_async(handle, 64).unwrap(), AsyncRead::WouldBlock);

        client
            .channel_mut()
            .reply(&USB_RAW_IOCTL_EP_READ_ASYNC, Err(Errno::ESHUTDOWN), None);
        assert!(client.endpoint_read_async(handle, 64).is_err());
    }

    #[test]
    fn test_transfer_payload_clamped() {
        let transfer = Transfer {
            status: 100,
            raw: BytesMut::from(&[0u8, 0, 0, 0, 2, 0, 0, 0, 5, 6][..]),
        };
        assert_eq!(transfer.payload(), &[5, 6]);
    }
}
