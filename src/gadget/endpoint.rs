//! Enabled endpoint table
//!
//! Maps logical endpoint addresses to the handles the kernel assigned on
//! enable. Endpoint 0 never appears here; it has dedicated commands.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::channel::DeviceCommandChannel;
use super::client::{EndpointHandle, RawGadgetClient};
use super::device::{Configuration, Endpoint, EndpointDirection};
use super::info::USB_RAW_EPS_NUM_MAX;
use crate::error::{GadgetError, Result};

/// Enabled endpoint
#[derive(Debug, Clone)]
pub struct EndpointEntry {
    pub handle: EndpointHandle,
    pub endpoint: Endpoint,
    /// OUT data not yet consumed by the device
    pub rx: BytesMut,
}

/// Endpoint table - owns the address to handle map
#[derive(Debug, Clone)]
pub struct EndpointTable {
    max_endpoints: usize,
    entries: BTreeMap<u8, EndpointEntry>,
}

impl EndpointTable {
    /// Create a table holding at most `max_endpoints` entries
    pub fn new(max_endpoints: usize) -> Self {
        Self {
            max_endpoints,
            entries: BTreeMap::new(),
        }
    }

    /// Enable every endpoint of `configuration`, then announce power and
    /// mark the gadget configured.
    ///
    /// `None` deconfigures: all endpoints are disabled and the table cleared.
    /// The driver has no command to undo `configure`, so that part of the
    /// UDC state is left as is.
    ///
    /// On failure the endpoints enabled so far are disabled again and the
    /// table is left empty.
    pub fn apply_configuration<C: DeviceCommandChannel>(
        &mut self,
        client: &mut RawGadgetClient<C>,
        configuration: Option<&Configuration>,
    ) -> Result<()> {
        let Some(configuration) = configuration else {
            self.disable_all(client)?;
            warn!("Gadget deconfigured; the UDC keeps its configured state");
            return Ok(());
        };

        if !self.entries.is_empty() {
            debug!("Replacing {} enabled endpoints", self.entries.len());
            self.disable_all(client)?;
        }

        let endpoints = endpoints_to_enable(configuration);
        if endpoints.len() > self.max_endpoints {
            return Err(GadgetError::Config(format!(
                "Not enough endpoints: need {}, available {}",
                endpoints.len(),
                self.max_endpoints
            )));
        }

        if let Err(e) = self.enable_all(client, configuration, &endpoints) {
            // A half-applied configuration keeps nothing enabled
            if let Err(cleanup) = self.disable_all(client) {
                warn!("Rollback of configuration {} failed: {}", configuration.value, cleanup);
            }
            return Err(e);
        }

        info!(
            "Configuration {} applied with {} endpoints, {} mA",
            configuration.value,
            self.entries.len(),
            configuration.max_power
        );
        Ok(())
    }

    fn enable_all<C: DeviceCommandChannel>(
        &mut self,
        client: &mut RawGadgetClient<C>,
        configuration: &Configuration,
        endpoints: &[&Endpoint],
    ) -> Result<()> {
        for endpoint in endpoints {
            let handle = client.endpoint_enable(&endpoint.descriptor())?;
            self.insert((*endpoint).clone(), handle);
        }
        client.vbus_draw(u32::from(configuration.max_power / 2))?;
        client.configure()
    }

    /// Disable every enabled endpoint and clear the table
    ///
    /// Every handle gets a disable attempt; the first failure is returned.
    pub fn disable_all<C: DeviceCommandChannel>(
        &mut self,
        client: &mut RawGadgetClient<C>,
    ) -> Result<()> {
        let mut first_error = None;
        for (address, entry) in std::mem::take(&mut self.entries) {
            match client.endpoint_disable(entry.handle) {
                Ok(()) => debug!("Endpoint {:#04x} disabled", address),
                Err(e) => {
                    warn!("Failed to disable endpoint {:#04x}: {}", address, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Record an enabled endpoint with an empty receive buffer
    pub fn insert(&mut self, endpoint: Endpoint, handle: EndpointHandle) {
        debug!("Endpoint {:#04x} -> {}", endpoint.address, handle);
        let address = endpoint.address;
        let previous = self.entries.insert(
            address,
            EndpointEntry {
                handle,
                endpoint,
                rx: BytesMut::new(),
            },
        );
        if let Some(previous) = previous {
            warn!(
                "Endpoint {:#04x} handle {} replaced by {}",
                address, previous.handle, handle
            );
        }
    }

    /// Drop all entries without talking to the driver (the handle is gone)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn lookup(&self, address: u8) -> Option<EndpointHandle> {
        self.entries.get(&address).map(|e| e.handle)
    }

    pub fn endpoint(&self, address: u8) -> Option<&Endpoint> {
        self.entries.get(&address).map(|e| &e.endpoint)
    }

    /// Enabled addresses in ascending order
    pub fn addresses(&self) -> Vec<u8> {
        self.entries.keys().copied().collect()
    }

    /// Append OUT data for later consumption
    pub fn buffer_received(&mut self, address: u8, data: &[u8]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&address)
            .ok_or(GadgetError::UnknownEndpoint(address))?;
        entry.rx.extend_from_slice(data);
        Ok(())
    }

    /// Take buffered OUT data
    pub fn take_received(&mut self, address: u8) -> Option<Bytes> {
        self.entries
            .get_mut(&address)
            .map(|e| e.rx.split().freeze())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of IN and OUT endpoints
    pub fn direction_counts(&self) -> (usize, usize) {
        self.entries.keys().fold((0, 0), |(i, o), addr| {
            match EndpointDirection::from_address(*addr) {
                EndpointDirection::In => (i + 1, o),
                EndpointDirection::Out => (i, o + 1),
            }
        })
    }
}

/// Endpoints of `configuration` that need a handle: endpoint 0 and repeated
/// addresses (alternate settings sharing an endpoint) are left out
fn endpoints_to_enable(configuration: &Configuration) -> Vec<&Endpoint> {
    let mut seen = BTreeSet::new();
    let mut endpoints = Vec::new();
    for endpoint in configuration.endpoints() {
        if endpoint.number() == 0 {
            warn!(
                "Skipping endpoint 0 in configuration {}",
                configuration.value
            );
            continue;
        }
        if !seen.insert(endpoint.address) {
            warn!(
                "Endpoint {:#04x} declared more than once in configuration {}, enabling it once",
                endpoint.address, configuration.value
            );
            continue;
        }
        endpoints.push(endpoint);
    }
    endpoints
}

impl Default for EndpointTable {
    fn default() -> Self {
        Self::new(USB_RAW_EPS_NUM_MAX)
    }
}
