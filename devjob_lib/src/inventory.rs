use std::{collections::BTreeMap, io, process::Stdio, time::Duration};

use async_trait::async_trait;
use devjob_data::Device;
use tokio::{process::Command, time::timeout};
use tracing::warn;

const DEVICES_HEADER: &str = "List of devices attached";
const ERROR_STATES: &[&str] = &["offline", "no permissions", "unauthorized"];
const ADB_TIMEOUT: Duration = Duration::from_secs(10);

/// properties reported for every healthy device in listings
pub const LISTED_PROPERTIES: &[&str] = &[
    "ro.product.brand",
    "ro.product.manufacturer",
    "ro.product.model",
    "ro.product.device",
    "ro.build.fingerprint",
    "ro.build.type",
    "ro.build.id",
    "ro.build.version.release",
    "ro.build.version.sdk",
];

pub fn is_healthy_state(state: &str) -> bool {
    !ERROR_STATES.iter().any(|bad| state.starts_with(bad))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceFilter {
    All,
    Healthy,
    Unhealthy,
}

impl DeviceFilter {
    /// parses the `status` query parameter, unknown values select nothing
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            "ok" | "ready" | "good" | "alive" => Some(Self::Healthy),
            "error" | "err" | "bad" => Some(Self::Unhealthy),
            _ => None,
        }
    }

    pub fn matches(self, device: &Device) -> bool {
        match self {
            Self::All => true,
            Self::Healthy => device.healthy,
            Self::Unhealthy => !device.healthy,
        }
    }
}

/// Source of truth for which devices are attached.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn devices(&self) -> io::Result<Vec<Device>>;

    async fn property(&self, serial: &str, name: &str) -> io::Result<Option<String>>;

    /// fills in [`LISTED_PROPERTIES`] of a healthy device, a failing query only loses the value
    async fn describe(&self, mut device: Device) -> Device {
        if !device.healthy {
            return device;
        }
        for name in LISTED_PROPERTIES {
            match self.property(&device.serial, name).await {
                Ok(Some(value)) => {
                    device.properties.insert(name.to_string(), value);
                }
                Ok(None) => {}
                Err(err) => warn!("reading {} of {} failed: {}", name, device.serial, err),
            }
        }
        device
    }

    async fn is_healthy(&self, serial: &str) -> io::Result<bool> {
        Ok(self
            .devices()
            .await?
            .iter()
            .any(|device| device.serial == serial && device.healthy))
    }
}

/// Inventory backed by the `adb` command line tool.
pub struct AdbInventory {
    adb: String,
}

impl AdbInventory {
    pub fn new() -> Self {
        Self {
            adb: "adb".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> io::Result<String> {
        let output = Command::new(&self.adb)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = timeout(ADB_TIMEOUT, output)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "adb did not answer in time"))??;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for AdbInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceInventory for AdbInventory {
    async fn devices(&self) -> io::Result<Vec<Device>> {
        Ok(parse_adb_devices(&self.run(&["devices"]).await?))
    }

    async fn property(&self, serial: &str, name: &str) -> io::Result<Option<String>> {
        let value = self.run(&["-s", serial, "shell", "getprop", name]).await?;
        let value = value.trim();
        if value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }
}

/// parses `adb devices` output, anything before the header is adb daemon chatter
pub fn parse_adb_devices(out: &str) -> Vec<Device> {
    let body = match out.find(DEVICES_HEADER) {
        Some(index) => &out[index + DEVICES_HEADER.len()..],
        None => {
            warn!("unexpected adb devices output: {:?}", out);
            return Vec::new();
        }
    };
    body.lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(2, '\t');
            let serial = fields.next().filter(|serial| !serial.is_empty())?;
            let state = fields.next()?.trim();
            Some(Device {
                serial: serial.to_string(),
                state: state.to_string(),
                healthy: is_healthy_state(state),
                properties: BTreeMap::new(),
            })
        })
        .collect()
}

/// Fixed device list, for hosts without adb and for tests.
#[derive(Clone, Debug, Default)]
pub struct StaticInventory {
    devices: Vec<Device>,
    properties: BTreeMap<(String, String), String>,
}

impl StaticInventory {
    pub fn healthy(serials: &[&str]) -> Self {
        Self {
            devices: serials
                .iter()
                .map(|serial| Device {
                    serial: serial.to_string(),
                    state: "device".to_string(),
                    healthy: true,
                    properties: BTreeMap::new(),
                })
                .collect(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_device(mut self, serial: &str, state: &str) -> Self {
        self.devices.push(Device {
            serial: serial.to_string(),
            state: state.to_string(),
            healthy: is_healthy_state(state),
            properties: BTreeMap::new(),
        });
        self
    }

    pub fn with_property(mut self, serial: &str, name: &str, value: &str) -> Self {
        self.properties
            .insert((serial.to_string(), name.to_string()), value.to_string());
        self
    }
}

#[async_trait]
impl DeviceInventory for StaticInventory {
    async fn devices(&self) -> io::Result<Vec<Device>> {
        Ok(self.devices.clone())
    }

    async fn property(&self, serial: &str, name: &str) -> io::Result<Option<String>> {
        Ok(self
            .properties
            .get(&(serial.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod test {
    use crate::testing::RUNTIME;

    use super::{parse_adb_devices, DeviceFilter, DeviceInventory, StaticInventory};

    #[test]
    fn test_parse_adb_devices() {
        let out = "* daemon started successfully\nList of devices attached\n\
                   0123456789ABCDEF\tdevice\nemulator-5554\toffline\n\
                   HT4CJJT00001\tno permissions (user in plugdev group)\n\n";
        let devices = parse_adb_devices(out);
        assert_eq!(3, devices.len());
        assert_eq!("0123456789ABCDEF", devices[0].serial);
        assert!(devices[0].healthy);
        assert!(!devices[1].healthy);
        assert!(!devices[2].healthy);
        assert!(DeviceFilter::Unhealthy.matches(&devices[2]));
    }

    #[test]
    fn test_parse_adb_without_header() {
        assert!(parse_adb_devices("adb: command not found").is_empty());
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(Some(DeviceFilter::Healthy), DeviceFilter::parse("OK"));
        assert_eq!(Some(DeviceFilter::Unhealthy), DeviceFilter::parse("bad"));
        assert_eq!(None, DeviceFilter::parse("sideways"));
    }

    #[test]
    fn test_static_inventory() {
        let inventory = StaticInventory::healthy(&["X"])
            .with_device("Y", "offline")
            .with_property("X", "ro.product.model", "Pixel")
            .with_property("Y", "ro.product.model", "Nexus");
        RUNTIME.block_on(async {
            assert!(inventory.is_healthy("X").await.unwrap());
            assert!(!inventory.is_healthy("Y").await.unwrap());
            assert!(!inventory.is_healthy("Z").await.unwrap());
            assert_eq!(
                Some("Pixel".to_string()),
                inventory.property("X", "ro.product.model").await.unwrap()
            );
            let devices = inventory.devices().await.unwrap();
            let x = inventory.describe(devices[0].clone()).await;
            assert_eq!(1, x.properties.len());
            assert_eq!("Pixel", x.properties["ro.product.model"]);
            // unhealthy devices are not queried
            let y = inventory.describe(devices[1].clone()).await;
            assert!(y.properties.is_empty());
        });
    }
}
