//! Raw gadget peripheral layer
//!
//! Drives an emulated USB device through the Linux raw-gadget driver:
//! - command encoding (request codes and argument buffers)
//! - the driver client with one method per command
//! - event dispatch to a device-emulation collaborator
//!
//! Architecture:
//! ```text
//! EventDispatcher (event loop, implements GadgetIo)
//!     ├── RawGadgetClient (one method per driver command)
//!     │       └── DeviceCommandChannel (DriverChannel / test fake)
//!     ├── EndpointTable (address -> handle, OUT buffers)
//!     └── GadgetDevice (collaborator: control requests, endpoint data)
//! ```
//!
//! Everything runs on the caller's thread. `service_irqs` handles one event
//! per call and blocks in the driver while no event is pending.

pub mod channel;
pub mod client;
pub mod device;
pub mod dispatcher;
pub mod endpoint;
pub mod event;
pub mod info;
pub mod ioctl;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{DeviceCommandChannel, DriverChannel, IoctlArg};
pub use client::{
    AsyncRead, ClientState, EndpointHandle, RawGadgetClient, Transfer, DEFAULT_DEVICE_PATH,
};
pub use device::{
    Configuration, DeviceCapabilities, Endpoint, EndpointDirection, GadgetDevice, GadgetIo,
    Interface, TransferType,
};
pub use dispatcher::{DispatchState, EventDispatcher};
pub use endpoint::EndpointTable;
pub use event::{ControlHeader, RawEvent};
pub use info::{EndpointCaps, EndpointInfo, EndpointLimits};
