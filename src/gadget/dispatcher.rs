//! Event dispatch loop
//!
//! `service_irqs` fetches one driver event per call and routes it:
//! - connect: refresh the UDC endpoint table
//! - control: hand the raw SETUP packet to the device
//! - empty: poll enabled endpoints (IN: ask the device for data,
//!   OUT: non-blocking read and forward)
//!
//! The dispatcher never retries. Driver errors go back to the caller's loop.

use tracing::{debug, info, trace, warn};

use super::channel::{DeviceCommandChannel, DriverChannel};
use super::client::{AsyncRead, RawGadgetClient};
use super::device::{
    Configuration, DeviceCapabilities, EndpointDirection, GadgetDevice, GadgetIo, USB_DIR_IN,
};
use super::endpoint::EndpointTable;
use super::event::RawEvent;
use super::info::EndpointInfo;
use crate::config::GadgetConfig;
use crate::error::{GadgetError, Result};

/// Where the dispatcher is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    /// Blocked in event fetch
    AwaitingEvent,
}

/// Drives a [`GadgetDevice`] from raw-gadget events
#[derive(Debug)]
pub struct EventDispatcher<C = DriverChannel> {
    client: RawGadgetClient<C>,
    endpoints: EndpointTable,
    endpoints_info: Option<Vec<EndpointInfo>>,
    capabilities: DeviceCapabilities,
    configured: bool,
    state: DispatchState,
}

impl EventDispatcher<DriverChannel> {
    /// Open the driver named in `config` and bind it to the UDC
    pub fn open(config: &GadgetConfig) -> Result<Self> {
        config.validate()?;
        let client = RawGadgetClient::open(&config.device_path)?;
        let mut dispatcher = Self::new(client);
        dispatcher.init_commands(config)?;
        Ok(dispatcher)
    }
}

impl<C: DeviceCommandChannel> EventDispatcher<C> {
    pub fn new(client: RawGadgetClient<C>) -> Self {
        Self {
            client,
            endpoints: EndpointTable::default(),
            endpoints_info: None,
            capabilities: DeviceCapabilities::default(),
            configured: false,
            state: DispatchState::Idle,
        }
    }

    /// Bind the opened client to the configured UDC
    pub fn init_commands(&mut self, config: &GadgetConfig) -> Result<()> {
        self.client
            .init(&config.driver_name, &config.device_name, config.speed)
    }

    /// Attach a device and start the UDC
    ///
    /// The device's optional callbacks are read here, once.
    pub fn connect<D: GadgetDevice>(&mut self, device: &D) -> Result<()> {
        self.capabilities = device.capabilities();
        info!("Connecting device, capabilities {:?}", self.capabilities);
        self.client.run()
    }

    /// Close the driver handle; all endpoint handles become invalid
    pub fn disconnect(&mut self) {
        self.endpoints.clear();
        self.configured = false;
        self.client.close();
    }

    /// Bus reset seen by the device. The kernel handles it; nothing to send.
    pub fn reset(&mut self) {
        debug!("Reset requested");
    }

    pub fn client(&self) -> &RawGadgetClient<C> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut RawGadgetClient<C> {
        &mut self.client
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// UDC endpoint table cached at the last connect event
    pub fn endpoints_info(&self) -> Option<&[EndpointInfo]> {
        self.endpoints_info.as_deref()
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Drain OUT data buffered for a device without `data_received`
    pub fn take_received(&mut self, address: u8) -> Option<bytes::Bytes> {
        self.endpoints.take_received(address)
    }

    /// Fetch and handle exactly one event
    pub fn service_irqs<D: GadgetDevice>(&mut self, device: &mut D) -> Result<()> {
        self.state = DispatchState::AwaitingEvent;
        let fetched = self.client.event_fetch();
        self.state = DispatchState::Idle;

        let event = match fetched {
            Ok(event) => event,
            Err(GadgetError::ProtocolViolation(reason)) => {
                warn!("Dropping malformed event: {}", reason);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        trace!("Event: {}", event.name());
        match event {
            RawEvent::Connect => {
                let info = self.client.endpoints_info()?;
                debug!(
                    "Connected, UDC reports {} endpoints ({} with any address)",
                    info.len(),
                    info.iter().filter(|ep| ep.any_address()).count()
                );
                self.endpoints_info = Some(info);
            }
            RawEvent::Control { header, raw } => {
                debug!("Control request: {:?}", header);
                let request = device.create_request(&raw)?;
                device.handle_request(request, self)?;
            }
            RawEvent::Empty => self.service_endpoints(device)?,
            RawEvent::Unknown { kind, data } => {
                debug!("Ignoring event type {} ({} bytes)", kind, data.len());
            }
        }
        Ok(())
    }

    fn service_endpoints<D: GadgetDevice>(&mut self, device: &mut D) -> Result<()> {
        if !self.configured {
            return Ok(());
        }

        for address in self.endpoints.addresses() {
            // A callback may have deconfigured the device mid-loop
            let Some(handle) = self.endpoints.lookup(address) else {
                continue;
            };
            let direction = EndpointDirection::from_address(address);
            let endpoint = match device
                .get_endpoint(address & 0x0f, direction)
                .or_else(|| self.endpoints.endpoint(address).cloned())
            {
                Some(endpoint) => endpoint,
                None => continue,
            };

            match direction {
                EndpointDirection::In => {
                    if self.capabilities.data_requested {
                        device.handle_data_requested(&endpoint, self)?;
                    }
                }
                EndpointDirection::Out => {
                    let length = endpoint.max_packet_size as usize;
                    let transfer = match self.client.endpoint_read_async(handle, length)? {
                        AsyncRead::Transferred(transfer) => transfer,
                        AsyncRead::WouldBlock => continue,
                    };

                    let data = transfer.payload();
                    trace!("Received {} bytes on {:#04x}", data.len(), address);
                    if self.capabilities.data_received {
                        device.handle_data_received(&endpoint, data, self)?;
                    } else {
                        self.endpoints.buffer_received(address, data)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl<C: DeviceCommandChannel> GadgetIo for EventDispatcher<C> {
    fn send_on_endpoint(&mut self, ep_num: u8, data: &[u8]) -> Result<()> {
        if ep_num == 0 {
            if data.is_empty() {
                self.client.endpoint0_read(0)?;
            } else {
                self.client.endpoint0_write(data)?;
            }
            return Ok(());
        }

        let address = ep_num | USB_DIR_IN;
        let handle = match self.endpoints.lookup(address) {
            Some(handle) => handle,
            None if !self.configured => return Err(GadgetError::NotConfigured),
            None => return Err(GadgetError::UnknownEndpoint(address)),
        };
        let transfer = self.client.endpoint_write(handle, data)?;
        if transfer.count() < data.len() {
            warn!(
                "Short write on {:#04x}: {} of {} bytes",
                address,
                transfer.count(),
                data.len()
            );
        }
        Ok(())
    }

    fn stall_endpoint(&mut self, ep_num: u8, direction: EndpointDirection) -> Result<()> {
        if ep_num == 0 {
            return self.client.ep0_stall();
        }

        let address = ep_num | direction.address_bit();
        let handle = self
            .endpoints
            .lookup(address)
            .ok_or(GadgetError::UnknownEndpoint(address))?;
        self.client.endpoint_set_halt(handle)
    }

    fn stall_ep0(&mut self) -> Result<()> {
        self.client.ep0_stall()
    }

    fn ack_status_stage(&mut self, direction: EndpointDirection, ep_num: u8) -> Result<()> {
        if direction == EndpointDirection::Out && ep_num == 0 {
            self.send_on_endpoint(0, &[])
        } else {
            trace!("Status stage {:?} on ep{} needs no action", direction, ep_num);
            Ok(())
        }
    }

    fn read_ep0(&mut self, length: usize) -> Result<Vec<u8>> {
        let transfer = self.client.endpoint0_read(length)?;
        Ok(transfer.payload().to_vec())
    }

    fn set_address(&mut self, address: u8, defer: bool) {
        // The UDC applies SET_ADDRESS itself
        debug!("Address {} (defer={})", address, defer);
    }

    fn configured(&mut self, configuration: Option<&Configuration>) -> Result<()> {
        let result = self
            .endpoints
            .apply_configuration(&mut self.client, configuration);
        self.configured = result.is_ok() && configuration.is_some();
        result
    }
}
