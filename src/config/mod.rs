//! Gadget configuration
//!
//! Layered: defaults, then an optional JSON file, then the environment,
//! then command line overrides applied by the binary.

mod schema;

pub use schema::{GadgetConfig, UsbSpeed, UDC_NAME_MAX};

use std::path::Path;

use tracing::debug;

use crate::error::{GadgetError, Result};

/// UDC driver name override
pub const ENV_UDC_DRIVER: &str = "UDC_DRIVER";
/// UDC device name override
pub const ENV_UDC_DEVICE: &str = "UDC_DEVICE";
/// Speed override, number or name
pub const ENV_SPEED: &str = "RG_SPEED";

impl GadgetConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GadgetConfig = serde_json::from_str(&content)?;
        debug!("Loaded gadget config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Names are lower-cased.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(driver) = lookup(ENV_UDC_DRIVER) {
            self.driver_name = driver.to_lowercase();
        }
        if let Some(device) = lookup(ENV_UDC_DEVICE) {
            self.device_name = device.to_lowercase();
        }
        if let Some(speed) = lookup(ENV_SPEED) {
            self.speed = speed
                .trim()
                .parse()
                .map_err(|e: String| GadgetError::Config(format!("{}: {}", ENV_SPEED, e)))?;
        }
        Ok(())
    }

    /// Check the names fit the driver's init record
    pub fn validate(&self) -> Result<()> {
        check_udc_name("driver_name", &self.driver_name)?;
        check_udc_name("device_name", &self.device_name)?;
        if self.speed == UsbSpeed::Unknown {
            tracing::warn!("USB speed is unknown; the UDC picks its own");
        }
        Ok(())
    }
}

fn check_udc_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(GadgetError::Config(format!("{} is empty", field)));
    }
    if !value.is_ascii() || value.contains('\0') {
        return Err(GadgetError::Config(format!(
            "{} must be ASCII without NUL: {:?}",
            field, value
        )));
    }
    if value.len() > UDC_NAME_MAX {
        return Err(GadgetError::Config(format!(
            "{} is {} bytes, at most {} allowed",
            field,
            value.len(),
            UDC_NAME_MAX
        )));
    }
    Ok(())
}
