// Allow uppercase acronyms for industry-standard terms like NVMe, SATA, USB, EMMC
#![allow(clippy::upper_case_acronyms)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod drives;
pub mod error;
pub mod logging;
pub mod ui;
pub mod verification;
pub mod wipe_orchestrator;

// Re-export main wipe orchestrator for convenience
pub use config::WipeConfig;
pub use error::{ErrorKind, WipeError, WipeResult};
pub use wipe_orchestrator::{JobHandle, JobReport, WipeOrchestrator};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Storage transport as reported by the platform inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    NVMe,
    SATA,
    USB,
    EMMC,
    /// Transport string the inventory could not decode
    Unknown(String),
}

impl Transport {
    /// Decode a transport name, keeping the raw value when it is not recognised
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "nvme" => Transport::NVMe,
            "sata" | "ata" => Transport::SATA,
            "usb" => Transport::USB,
            "emmc" | "mmc" => Transport::EMMC,
            _ => Transport::Unknown(raw.trim().to_string()),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::NVMe => write!(f, "NVMe"),
            Transport::SATA => write!(f, "SATA"),
            Transport::USB => write!(f, "USB"),
            Transport::EMMC => write!(f, "eMMC"),
            Transport::Unknown(raw) if raw.is_empty() => write!(f, "unknown"),
            Transport::Unknown(raw) => write!(f, "unknown ({})", raw),
        }
    }
}

/// Raw capability flags gathered at inventory time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    pub supports_sanitize: bool,
    pub supports_secure_erase: bool,
    pub supports_trim: bool,
}

/// Closed set of method-eligibility classes a device can fall into.
///
/// Built once from transport and flags so method selection can match on it
/// exhaustively instead of probing optional booleans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum DeviceClass {
    Nvme { sanitize: bool },
    Sata { secure_erase: bool, trim: bool },
    Usb { trim: bool },
    Emmc { trim: bool },
    Undecodable { raw: String },
}

impl DeviceClass {
    pub fn from_parts(transport: &Transport, flags: CapabilityFlags) -> Self {
        match transport {
            Transport::NVMe => DeviceClass::Nvme {
                sanitize: flags.supports_sanitize,
            },
            Transport::SATA => DeviceClass::Sata {
                secure_erase: flags.supports_secure_erase,
                trim: flags.supports_trim,
            },
            Transport::USB => DeviceClass::Usb {
                trim: flags.supports_trim,
            },
            Transport::EMMC => DeviceClass::Emmc {
                trim: flags.supports_trim,
            },
            Transport::Unknown(raw) => DeviceClass::Undecodable { raw: raw.clone() },
        }
    }
}

/// Immutable snapshot of one storage device taken at inventory time.
///
/// Re-enumerating produces new snapshots; nothing mutates an existing one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    id: String,
    display_name: String,
    node: PathBuf,
    transport: Transport,
    capabilities: CapabilityFlags,
    capacity_bytes: u64,
    class: DeviceClass,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        node: impl Into<PathBuf>,
        transport: Transport,
        capabilities: CapabilityFlags,
        capacity_bytes: u64,
    ) -> Self {
        let class = DeviceClass::from_parts(&transport, capabilities);
        Self {
            id: id.into(),
            display_name: display_name.into(),
            node: node.into(),
            transport,
            capabilities,
            capacity_bytes,
            class,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Block device node, e.g. `/dev/nvme0n1`
    pub fn node(&self) -> &Path {
        &self.node
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn class(&self) -> &DeviceClass {
        &self.class
    }
}

/// NIST SP 800-88 sanitization tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SanitizationTier {
    Clear,
    Purge,
}

/// Standard a sanitization method is aligned with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StandardReference {
    pub standard: &'static str,
    pub tier: SanitizationTier,
}

impl fmt::Display for StandardReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.standard, self.tier)
    }
}

pub const NIST_800_88: &str = "NIST SP 800-88 Rev. 1";

/// Sanitization method. Produced by the method selector, never chosen ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    NvmeSanitize,   // NVMe Sanitize command
    AtaSecureErase, // ATA SECURITY ERASE UNIT
    TrimDiscard,    // Full-device discard
    SinglePassOverwrite,
}

impl Method {
    pub fn standard(&self) -> StandardReference {
        let tier = match self {
            Method::NvmeSanitize | Method::AtaSecureErase => SanitizationTier::Purge,
            Method::TrimDiscard | Method::SinglePassOverwrite => SanitizationTier::Clear,
        };
        StandardReference {
            standard: NIST_800_88,
            tier,
        }
    }

    /// Stable identifier, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::NvmeSanitize => "nvme-sanitize",
            Method::AtaSecureErase => "ata-secure-erase",
            Method::TrimDiscard => "trim-discard",
            Method::SinglePassOverwrite => "single-pass-overwrite",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Method::NvmeSanitize => "NVMe Sanitize",
            Method::AtaSecureErase => "ATA Secure Erase",
            Method::TrimDiscard => "TRIM / Discard",
            Method::SinglePassOverwrite => "Single-pass overwrite",
        }
    }

    /// Whether the device reports an authoritative completion status for this method
    pub fn supports_self_attestation(&self) -> bool {
        matches!(self, Method::NvmeSanitize)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
