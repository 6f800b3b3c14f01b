use super::operations::command::{
    parse_ata_security, parse_sanicap, sanicap_supports_sanitize,
};
use crate::config::InventoryConfig;
use crate::{CapabilityFlags, Device, Transport, WipeError, WipeResult};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Platform source of storage devices
pub trait InventorySource: Send + Sync {
    fn scan(&self) -> WipeResult<Vec<Device>>;
}

/// Devices seen by one enumeration, shared read-only with jobs
#[derive(Debug, Clone)]
pub struct InventorySnapshot {
    taken_at: DateTime<Utc>,
    devices: Vec<Arc<Device>>,
}

impl InventorySnapshot {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            taken_at: Utc::now(),
            devices: devices.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn find(&self, id: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Enumerates a source and applies configured exclusions
pub struct DeviceInventory {
    source: Arc<dyn InventorySource>,
    exclude: HashSet<String>,
}

impl DeviceInventory {
    pub fn new(source: Arc<dyn InventorySource>, exclude: &[String]) -> Self {
        Self {
            source,
            exclude: exclude.iter().cloned().collect(),
        }
    }

    pub fn enumerate(&self) -> WipeResult<InventorySnapshot> {
        let devices: Vec<Device> = self
            .source
            .scan()?
            .into_iter()
            .filter(|device| {
                let excluded = self.exclude.contains(device.id());
                if excluded {
                    tracing::debug!(device = device.id(), "Device excluded by configuration");
                }
                !excluded
            })
            .collect();

        tracing::info!(count = devices.len(), "Device inventory complete");
        Ok(InventorySnapshot::new(devices))
    }
}

/// Method support that can only be learned by asking the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbedCapabilities {
    pub sanitize: bool,
    pub secure_erase: bool,
}

pub trait CapabilityProbe: Send + Sync {
    fn probe(&self, node: &Path, transport: &Transport) -> WipeResult<ProbedCapabilities>;
}

/// Asks nvme-cli and hdparm
pub struct CommandProbe;

impl CapabilityProbe for CommandProbe {
    fn probe(&self, node: &Path, transport: &Transport) -> WipeResult<ProbedCapabilities> {
        let node = node.to_string_lossy();
        match transport {
            Transport::NVMe => {
                let output = Command::new("nvme").args(["id-ctrl", node.as_ref()]).output()?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(ProbedCapabilities {
                    sanitize: parse_sanicap(&stdout)
                        .map(sanicap_supports_sanitize)
                        .unwrap_or(false),
                    secure_erase: false,
                })
            }
            Transport::SATA => {
                let output = Command::new("hdparm").args(["-I", node.as_ref()]).output()?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(ProbedCapabilities {
                    sanitize: false,
                    secure_erase: parse_ata_security(&stdout)
                        .map(|s| s.supported)
                        .unwrap_or(false),
                })
            }
            _ => Ok(ProbedCapabilities::default()),
        }
    }
}

/// Reports nothing; every probed capability reads as unsupported
pub struct NullProbe;

impl CapabilityProbe for NullProbe {
    fn probe(&self, _node: &Path, _transport: &Transport) -> WipeResult<ProbedCapabilities> {
        Ok(ProbedCapabilities::default())
    }
}

/// Scans `<sysfs_root>/block` for whole-disk block devices
pub struct SysfsInventory {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    probe: Arc<dyn CapabilityProbe>,
}

impl SysfsInventory {
    pub fn new(config: &InventoryConfig) -> Self {
        Self::with_probe(config, Arc::new(CommandProbe))
    }

    pub fn with_probe(config: &InventoryConfig, probe: Arc<dyn CapabilityProbe>) -> Self {
        Self {
            sysfs_root: config.sysfs_root.clone(),
            dev_root: config.dev_root.clone(),
            probe,
        }
    }

    /// Check if device should be skipped
    pub(crate) fn should_skip_device(name: &str) -> bool {
        const VIRTUAL_PREFIXES: [&str; 6] = ["loop", "ram", "dm-", "sr", "zram", "md"];

        VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
            // eMMC hardware partitions are not separate devices
            || (name.starts_with("mmcblk") && (name.contains("boot") || name.contains("rpmb")))
    }

    /// Decode the transport from the kernel name and the resolved sysfs path
    pub(crate) fn decode_transport(name: &str, resolved: &str) -> Transport {
        if name.starts_with("nvme") {
            Transport::NVMe
        } else if name.starts_with("mmcblk") {
            Transport::EMMC
        } else if resolved.contains("/usb") {
            Transport::USB
        } else if name.starts_with("sd") {
            Transport::SATA
        } else {
            Transport::Unknown(name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string())
        }
    }

    fn read_attr(dir: &Path, attr: &str) -> Option<String> {
        fs::read_to_string(dir.join(attr))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn analyze(&self, name: &str, block_dir: &Path, node: PathBuf) -> Device {
        let resolved = fs::canonicalize(block_dir)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let transport = Self::decode_transport(name, &resolved);

        let model = Self::read_attr(block_dir, "device/model")
            .or_else(|| Self::read_attr(block_dir, "device/name"))
            .unwrap_or_else(|| "Unknown".to_string());
        let capacity_bytes = Self::read_attr(block_dir, "size")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|sectors| sectors * 512)
            .unwrap_or(0);
        let supports_trim = Self::read_attr(block_dir, "queue/discard_max_bytes")
            .and_then(|s| s.parse::<u64>().ok())
            .map(|max| max > 0)
            .unwrap_or(false);

        let probed = match self.probe.probe(&node, &transport) {
            Ok(probed) => probed,
            Err(e) => {
                tracing::warn!(device = name, error = %e, "Capability probe failed, assuming unsupported");
                ProbedCapabilities::default()
            }
        };

        Device::new(
            name,
            model,
            node,
            transport,
            CapabilityFlags {
                supports_sanitize: probed.sanitize,
                supports_secure_erase: probed.secure_erase,
                supports_trim,
            },
            capacity_bytes,
        )
    }
}

impl InventorySource for SysfsInventory {
    fn scan(&self) -> WipeResult<Vec<Device>> {
        let block_root = self.sysfs_root.join("block");
        let entries = fs::read_dir(&block_root).map_err(|e| {
            WipeError::Enumeration(format!("cannot read {}: {}", block_root.display(), e))
        })?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::should_skip_device(&name) {
                continue;
            }

            let node = self.dev_root.join(&name);
            if !node.exists() {
                tracing::debug!(device = %name, "No device node, skipping");
                continue;
            }
            devices.push(self.analyze(&name, &entry.path(), node));
        }

        devices.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(devices)
    }
}

/// Fixed device list
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    devices: Vec<Device>,
}

impl StaticInventory {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// One device of every transport, as shown by the demo workflow
    pub fn demo() -> Self {
        const GB: u64 = 1_000_000_000;
        Self::new(vec![
            Device::new(
                "nvme0n1",
                "Samsung SSD 980 PRO 1TB",
                "/dev/nvme0n1",
                Transport::NVMe,
                CapabilityFlags {
                    supports_sanitize: true,
                    supports_secure_erase: false,
                    supports_trim: true,
                },
                1000 * GB,
            ),
            Device::new(
                "sda",
                "Crucial MX500 500GB",
                "/dev/sda",
                Transport::SATA,
                CapabilityFlags {
                    supports_sanitize: false,
                    supports_secure_erase: true,
                    supports_trim: true,
                },
                500 * GB,
            ),
            Device::new(
                "sdb",
                "SanDisk Cruzer Blade 32GB",
                "/dev/sdb",
                Transport::USB,
                CapabilityFlags::default(),
                32 * GB,
            ),
            Device::new(
                "mmcblk0",
                "BJTD4R 32GB eMMC",
                "/dev/mmcblk0",
                Transport::EMMC,
                CapabilityFlags {
                    supports_trim: true,
                    ..Default::default()
                },
                32 * GB,
            ),
        ])
    }
}

impl InventorySource for StaticInventory {
    fn scan(&self) -> WipeResult<Vec<Device>> {
        Ok(self.devices.clone())
    }
}
