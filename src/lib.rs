//! rawgadget - USB peripheral emulation over the Linux raw-gadget driver
//!
//! This crate encodes raw-gadget driver commands, owns the driver handle
//! and dispatches driver events to a device-emulation collaborator.

pub mod config;
pub mod error;
pub mod gadget;

pub use config::{GadgetConfig, UsbSpeed};
pub use error::{GadgetError, Result};
pub use gadget::{EventDispatcher, GadgetDevice, GadgetIo, RawGadgetClient};
