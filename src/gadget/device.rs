//! Device-emulation collaborator interface
//!
//! The dispatcher moves bytes; a [`GadgetDevice`] gives them USB meaning.
//! Control requests, configuration choice and endpoint data all belong to
//! the device. It reaches back into the hardware through [`GadgetIo`].

use super::ioctl::ENDPOINT_DESCRIPTOR_SIZE;
use crate::error::Result;

/// USB endpoint descriptor type
pub const USB_DT_ENDPOINT: u8 = 0x05;

/// `bLength` of a standard endpoint descriptor
pub const USB_DT_ENDPOINT_SIZE: u8 = 7;

/// Direction bit of an endpoint address
pub const USB_DIR_IN: u8 = 0x80;

/// Endpoint data direction, seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl EndpointDirection {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn from_address(address: u8) -> Self {
        if address & USB_DIR_IN != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    pub fn address_bit(&self) -> u8 {
        match self {
            EndpointDirection::Out => 0,
            EndpointDirection::In => USB_DIR_IN,
        }
    }
}

/// Endpoint transfer type (`bmAttributes` bits 1:0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            TransferType::Control => 0,
            TransferType::Isochronous => 1,
            TransferType::Bulk => 2,
            TransferType::Interrupt => 3,
        }
    }
}

/// Endpoint as declared by the device's active configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `bEndpointAddress`: number in bits 3:0, direction in bit 7
    pub address: u8,
    /// `bmAttributes`
    pub attributes: u8,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

impl Endpoint {
    pub fn new(
        number: u8,
        direction: EndpointDirection,
        transfer_type: TransferType,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        Self {
            address: (number & 0x0f) | direction.address_bit(),
            attributes: transfer_type.bits(),
            max_packet_size,
            interval,
        }
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> EndpointDirection {
        EndpointDirection::from_address(self.address)
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    /// Endpoint descriptor as the driver expects it on enable
    ///
    /// The kernel copies the 9-byte audio variant; the trailing
    /// `bRefresh`/`bSynchAddress` bytes stay zero.
    pub fn descriptor(&self) -> [u8; ENDPOINT_DESCRIPTOR_SIZE] {
        let mps = self.max_packet_size.to_le_bytes();
        [
            USB_DT_ENDPOINT_SIZE,
            USB_DT_ENDPOINT,
            self.address,
            self.attributes,
            mps[0],
            mps[1],
            self.interval,
            0,
            0,
        ]
    }
}

/// Interface of a configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Interface {
    pub number: u8,
    pub alternate: u8,
    pub endpoints: Vec<Endpoint>,
}

impl Interface {
    pub fn new(number: u8) -> Self {
        Self {
            number,
            alternate: 0,
            endpoints: Vec::new(),
        }
    }

    /// Add an endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

/// Configuration selected by the host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    /// `bConfigurationValue`
    pub value: u8,
    /// Declared maximum power draw in mA
    pub max_power: u16,
    pub interfaces: Vec<Interface>,
}

impl Configuration {
    pub fn new(value: u8, max_power: u16) -> Self {
        Self {
            value,
            max_power,
            interfaces: Vec::new(),
        }
    }

    /// Add an interface
    #[must_use]
    pub fn with_interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// All endpoints of all interfaces, in declaration order
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.interfaces.iter().flat_map(|i| i.endpoints.iter())
    }

    /// Find an endpoint by number and direction
    pub fn find_endpoint(&self, number: u8, direction: EndpointDirection) -> Option<&Endpoint> {
        self.endpoints()
            .find(|ep| ep.number() == number && ep.direction() == direction)
    }
}

/// Optional callbacks a device implements
///
/// Read once when the device is connected; the dispatcher never probes
/// per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    /// Wants `handle_data_requested` on every poll tick for IN endpoints
    pub data_requested: bool,
    /// Wants `handle_data_received` for OUT data; otherwise data is buffered
    pub data_received: bool,
}

/// Hardware operations available to a device while it handles a callback
pub trait GadgetIo {
    /// Send data on an endpoint; an empty send on endpoint 0 acks the status stage
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()>;

    /// Stall an endpoint
    fn stall_endpoint(&mut self, ep_num: u8, direction: EndpointDirection) -> Result<()>;

    /// Stall the current control transfer
    fn stall_ep0(&mut self) -> Result<()>;

    /// Acknowledge the status stage of a control transfer
    fn ack_status_stage(&mut self, direction: EndpointDirection, ep_num: u8) -> Result<()>;

    /// Read the data stage of a host-to-device control transfer
    fn read_ep0(&mut self, length: usize) -> Result<Vec<u8>>;

    /// The host changed the device address
    fn set_address(&mut self, address: u8, defer: bool);

    /// The host selected a configuration, or deconfigured the device with `None`
    fn configured(&mut self, configuration: Option<&Configuration>) -> Result<()>;
}

/// Device emulated on top of the raw gadget
pub trait GadgetDevice {
    /// Parsed control request
    type Request;

    /// Build a request from the raw SETUP packet
    fn create_request(&mut self, raw: &[u8]) -> Result<Self::Request>;

    /// Handle a control request
    fn handle_request(&mut self, request: Self::Request, io: &mut dyn GadgetIo) -> Result<()>;

    /// Currently active configuration, if any
    fn configuration(&self) -> Option<&Configuration>;

    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    /// The host is polling an IN endpoint
    fn handle_data_requested(&mut self, _endpoint: &Endpoint, _io: &mut dyn GadgetIo) -> Result<()> {
        Ok(())
    }

    /// Data arrived on an OUT endpoint
    fn handle_data_received(
        &mut self,
        _endpoint: &Endpoint,
        _data: &[u8],
        _io: &mut dyn GadgetIo,
    ) -> Result<()> {
        Ok(())
    }

    /// Look up an endpoint of the active configuration
    fn get_endpoint(&self, number: u8, direction: EndpointDirection) -> Option<Endpoint> {
        self.configuration()
            .and_then(|cfg| cfg.find_endpoint(number, direction))
            .cloned()
    }
}
