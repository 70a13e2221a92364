use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::gadget::DEFAULT_DEVICE_PATH;

/// Longest UDC driver/device name; the driver field keeps a NUL after it
pub const UDC_NAME_MAX: usize = 127;

/// Connection speed requested at init
///
/// Discriminants match the kernel's `enum usb_device_speed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum UsbSpeed {
    Unknown = 0,
    /// 1.5 Mbit/s
    Low = 1,
    /// 12 Mbit/s
    Full = 2,
    /// 480 Mbit/s
    #[default]
    High = 3,
    Wireless = 4,
    /// 5 Gbit/s
    Super = 5,
    /// 10 Gbit/s
    SuperPlus = 6,
}

impl TryFrom<u8> for UsbSpeed {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UsbSpeed::Unknown),
            1 => Ok(UsbSpeed::Low),
            2 => Ok(UsbSpeed::Full),
            3 => Ok(UsbSpeed::High),
            4 => Ok(UsbSpeed::Wireless),
            5 => Ok(UsbSpeed::Super),
            6 => Ok(UsbSpeed::SuperPlus),
            _ => Err(format!("Unknown USB speed: {}", value)),
        }
    }
}

impl std::str::FromStr for UsbSpeed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(n) = s.parse::<u8>() {
            return UsbSpeed::try_from(n);
        }
        match s.to_lowercase().as_str() {
            "unknown" => Ok(UsbSpeed::Unknown),
            "low" => Ok(UsbSpeed::Low),
            "full" => Ok(UsbSpeed::Full),
            "high" => Ok(UsbSpeed::High),
            "wireless" => Ok(UsbSpeed::Wireless),
            "super" => Ok(UsbSpeed::Super),
            "superplus" | "super_plus" | "super-plus" => Ok(UsbSpeed::SuperPlus),
            _ => Err(format!("Unknown USB speed: {}", s)),
        }
    }
}

/// Raw gadget binding configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// Driver node (default /dev/raw-gadget)
    pub device_path: PathBuf,
    /// UDC driver name, e.g. "dummy_udc" or "fe980000.usb"
    pub driver_name: String,
    /// UDC device name, e.g. "dummy_udc.0"
    pub device_name: String,
    pub speed: UsbSpeed,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            driver_name: "dummy_udc".to_string(),
            device_name: "dummy_udc.0".to_string(),
            speed: UsbSpeed::High,
        }
    }
}
