// Method selection
//
// Deterministic priority over the closed device classes:
//   NVMe + sanitize       -> NVMe Sanitize
//   SATA + secure erase   -> ATA Secure Erase
//   USB + trim            -> TRIM / Discard
//   everything else       -> single-pass overwrite

use crate::{Device, DeviceClass, Method, WipeError};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    /// The device's strongest native purge command is available
    NativePurge,
    /// Flash behind a bridge that only forwards discard
    Discard,
    /// No eligible native command; overwrite fallback
    Fallback,
    /// Transport could not be decoded; overwrite fallback
    UndecodableTransport,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SelectionReason::NativePurge => "device supports a native purge command",
            SelectionReason::Discard => "USB bridge forwards discard",
            SelectionReason::Fallback => "no native sanitize command available",
            SelectionReason::UndecodableTransport => "transport could not be decoded",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub method: Method,
    pub reason: SelectionReason,
    /// Recorded as a job note when the device class could not be decoded
    pub mismatch: Option<WipeError>,
}

/// Pick the method for a device. Total and deterministic.
pub fn select(device: &Device) -> Method {
    select_with_reason(device).method
}

pub fn select_with_reason(device: &Device) -> Selection {
    let (method, reason) = match device.class() {
        DeviceClass::Nvme { sanitize: true } => (Method::NvmeSanitize, SelectionReason::NativePurge),
        DeviceClass::Sata {
            secure_erase: true, ..
        } => (Method::AtaSecureErase, SelectionReason::NativePurge),
        DeviceClass::Usb { trim: true } => (Method::TrimDiscard, SelectionReason::Discard),
        DeviceClass::Nvme { sanitize: false }
        | DeviceClass::Sata {
            secure_erase: false,
            ..
        }
        | DeviceClass::Usb { trim: false }
        | DeviceClass::Emmc { .. } => (Method::SinglePassOverwrite, SelectionReason::Fallback),
        DeviceClass::Undecodable { .. } => (
            Method::SinglePassOverwrite,
            SelectionReason::UndecodableTransport,
        ),
    };

    let mismatch = match device.class() {
        DeviceClass::Undecodable { raw } => Some(WipeError::CapabilityMismatch {
            device: device.id().to_string(),
            detail: format!("undecodable transport '{}'", raw),
        }),
        _ => None,
    };

    tracing::debug!(device = device.id(), %method, %reason, "Method selected");
    Selection {
        method,
        reason,
        mismatch,
    }
}
