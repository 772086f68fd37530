//! Device model and registry.
//!
//! The registry shells out to the device-list and device-info tools and turns
//! their output into [`Device`] records. Nothing here is cached: every scan
//! builds fresh records from live tool output.
//!
//! Failure policy:
//! - Enumeration failures yield an empty list (logged with their cause).
//! - A failed identity query drops that device from the scan.
//! - Failed disk-usage or battery sub-queries only leave those fields unset.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::{TimeoutConfig, ToolConfig};
use crate::error::Result;
use crate::executor::{CommandRunner, command_line};
use crate::info::{self, bool_field, bytes_to_gb, text_field, u64_field};

/// Device-info domain with storage figures.
pub const DISK_USAGE_DOMAIN: &str = "com.apple.disk_usage";

/// Device-info domain with battery figures.
pub const BATTERY_DOMAIN: &str = "com.apple.mobile.battery";

/// Label used when a device reports no usable name.
pub const FALLBACK_DEVICE_NAME: &str = "Device";

/// Charging state reported by the battery domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryState {
    Charging,
    Discharging,
    Unknown,
}

/// Whether the host is trusted by the device.
///
/// Only an explicit `TrustedHostAttached: false` counts as a denial; a
/// successful identity query without that signal is taken as trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrustState {
    Trusted,
    NotTrusted,
    /// The identity query succeeded but returned no properties.
    Unknown,
}

impl TrustState {
    fn from_identity(fields: &HashMap<String, String>) -> Self {
        if fields.is_empty() {
            return TrustState::Unknown;
        }
        match bool_field(fields, "TrustedHostAttached") {
            Ok(Some(false)) => TrustState::NotTrusted,
            _ => TrustState::Trusted,
        }
    }
}

/// A connected device, assembled from one scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub udid: String,

    // === Identity ===
    pub name: Option<String>,
    /// Hardware product code, e.g. "iPhone14,2".
    pub model: Option<String>,
    /// Marketing name for `model`, e.g. "iPhone 13 Pro".
    pub friendly_model: Option<String>,
    pub ios_version: Option<String>,
    pub build_version: Option<String>,
    pub hardware_model: Option<String>,
    pub serial_number: Option<String>,
    pub wifi_mac: Option<String>,
    pub bluetooth_mac: Option<String>,

    // === Storage (decimal GB) ===
    #[serde(rename = "storageTotalGB")]
    pub storage_total_gb: Option<f64>,
    #[serde(rename = "storageAvailableGB")]
    pub storage_available_gb: Option<f64>,
    #[serde(rename = "storageUsedGB")]
    pub storage_used_gb: Option<f64>,

    // === Battery ===
    pub battery_level_percent: Option<u8>,
    pub battery_state: Option<BatteryState>,

    pub trust: TrustState,
    /// True only when `trust` is [`TrustState::Trusted`].
    pub is_trusted: bool,
}

impl Device {
    /// Creates a device with only its identifier set.
    pub fn new(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            name: None,
            model: None,
            friendly_model: None,
            ios_version: None,
            build_version: None,
            hardware_model: None,
            serial_number: None,
            wifi_mac: None,
            bluetooth_mac: None,
            storage_total_gb: None,
            storage_available_gb: None,
            storage_used_gb: None,
            battery_level_percent: None,
            battery_state: None,
            trust: TrustState::Unknown,
            is_trusted: false,
        }
    }

    /// Sets the device name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Returns a name for display: device name, then model, then UDID.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.friendly_model.as_deref())
            .unwrap_or(&self.udid)
    }

    /// Returns the mount directory name: `<sanitized name>_<udid>`.
    pub fn mount_dir_name(&self) -> String {
        let name = self
            .name
            .as_deref()
            .map(sanitize_mount_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_string());
        format!("{}_{}", name, self.udid)
    }

    fn apply_identity(&mut self, fields: &HashMap<String, String>) {
        self.name = text_field(fields, "DeviceName");
        self.model = text_field(fields, "ProductType");
        self.friendly_model = self.model.as_deref().map(info::friendly_model_name);
        self.ios_version = text_field(fields, "ProductVersion");
        self.build_version = text_field(fields, "BuildVersion");
        self.hardware_model = text_field(fields, "HardwareModel");
        self.serial_number = text_field(fields, "SerialNumber");
        self.wifi_mac = text_field(fields, "WiFiAddress");
        self.bluetooth_mac = text_field(fields, "BluetoothAddress");
        self.trust = TrustState::from_identity(fields);
        self.is_trusted = self.trust == TrustState::Trusted;
    }

    fn apply_disk_usage(&mut self, fields: &HashMap<String, String>) {
        let total = u64_field(fields, "TotalDataCapacity")
            .and_then(|total| match total {
                Some(total) => Ok(Some(total)),
                None => u64_field(fields, "TotalDiskCapacity"),
            })
            .unwrap_or_else(|e| {
                log::warn!("{}: ignoring disk usage: {}", self.udid, e);
                None
            });
        let available = u64_field(fields, "TotalDataAvailable").unwrap_or_else(|e| {
            log::warn!("{}: ignoring disk usage: {}", self.udid, e);
            None
        });

        self.storage_total_gb = total.map(bytes_to_gb);
        self.storage_available_gb = available.map(bytes_to_gb);
        self.storage_used_gb = match (total, available) {
            (Some(total), Some(available)) => Some(bytes_to_gb(total.saturating_sub(available))),
            _ => None,
        };
    }

    fn apply_battery(&mut self, fields: &HashMap<String, String>) {
        self.battery_level_percent = match u64_field(fields, "BatteryCurrentCapacity") {
            Ok(level) => level.map(|l| l.min(100) as u8),
            Err(e) => {
                log::warn!("{}: ignoring battery level: {}", self.udid, e);
                None
            }
        };
        self.battery_state = if fields.is_empty() {
            None
        } else {
            Some(match bool_field(fields, "BatteryIsCharging") {
                Ok(Some(true)) => BatteryState::Charging,
                Ok(Some(false)) => BatteryState::Discharging,
                _ => BatteryState::Unknown,
            })
        };
    }
}

/// Sanitizes a device name for use as a directory name.
///
/// Removes path separators and characters that are awkward in file managers,
/// then trims surrounding whitespace. Spaces inside the name are kept.
pub fn sanitize_mount_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0'))
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .trim_matches('.')
        .trim()
        .to_string()
}

/// Enumerates connected devices and fetches their properties.
pub struct DeviceRegistry {
    runner: Arc<dyn CommandRunner>,
    tools: ToolConfig,
    timeouts: TimeoutConfig,
}

impl DeviceRegistry {
    /// Creates a registry that queries devices through `runner`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        tools: ToolConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            runner,
            tools,
            timeouts,
        }
    }

    /// Lists UDIDs of connected devices.
    ///
    /// Never fails: a missing tool, timeout or non-zero exit all produce an
    /// empty list, so "no devices" and "tool broken" look the same to callers.
    pub fn list_connected_identifiers(&self) -> Vec<String> {
        let program = &self.tools.device_list;
        let output = match self
            .runner
            .run(program, &["-l"], self.timeouts.list())
            .into_result(program)
        {
            Ok(output) => output,
            Err(e) => {
                log::warn!("device enumeration failed ({:?}): {}", e.kind(), e);
                return Vec::new();
            }
        };

        let mut udids: Vec<String> = Vec::new();
        for udid in output.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !udids.iter().any(|u| u == udid) {
                udids.push(udid.to_string());
            }
        }
        log::debug!("found {} device(s)", udids.len());
        udids
    }

    /// Fetches identity, storage and battery information for one device.
    ///
    /// Returns `None` if the identity query fails. Storage and battery
    /// sub-queries are best-effort.
    pub fn fetch_device_info(&self, udid: &str) -> Option<Device> {
        let identity = match self.query(udid, None) {
            Ok(fields) => fields,
            Err(e) => {
                log::warn!("could not read info for {} ({:?}): {}", udid, e.kind(), e);
                return None;
            }
        };

        let mut device = Device::new(udid);
        device.apply_identity(&identity);

        match self.query(udid, Some(DISK_USAGE_DOMAIN)) {
            Ok(fields) => device.apply_disk_usage(&fields),
            Err(e) => log::info!("{}: disk usage unavailable: {}", udid, e),
        }
        match self.query(udid, Some(BATTERY_DOMAIN)) {
            Ok(fields) => device.apply_battery(&fields),
            Err(e) => log::info!("{}: battery info unavailable: {}", udid, e),
        }

        if !device.is_trusted {
            log::warn!("{}: host trust is {:?}", udid, device.trust);
        }
        Some(device)
    }

    /// Lists devices and fetches each one in enumeration order.
    ///
    /// Devices whose identity query fails are skipped.
    pub fn refresh_all(&self) -> Vec<Device> {
        self.list_connected_identifiers()
            .into_iter()
            .filter_map(|udid| {
                let device = self.fetch_device_info(&udid);
                if device.is_none() {
                    log::info!("skipping device {}", udid);
                }
                device
            })
            .collect()
    }

    fn query(&self, udid: &str, domain: Option<&str>) -> Result<HashMap<String, String>> {
        let program = &self.tools.device_info;
        let mut args = vec!["-u", udid];
        let timeout = match domain {
            Some(domain) => {
                args.extend(["-q", domain]);
                self.timeouts.domain()
            }
            None => self.timeouts.info(),
        };

        let output = self
            .runner
            .run(program, &args, timeout)
            .into_result(&command_line(program, &args))?;
        Ok(info::parse_key_value_block(&output.stdout))
    }
}
