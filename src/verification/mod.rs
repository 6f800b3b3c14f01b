//! Post-sanitization verification.
//!
//! Device self-attestation is authoritative when the method has one and the
//! backend can produce it. Otherwise a bounded random sample of regions is
//! read back and classified.

pub mod sampling;

pub use sampling::{RegionFinding, RegionIssue};

use crate::config::VerificationConfig;
use crate::drives::SanitizeBackend;
use crate::{Device, Method, WipeError, WipeResult};
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

/// Read access to device media
pub trait MediaReader: Send + Sync {
    fn read_region(&self, device: &Device, offset: u64, len: usize) -> WipeResult<Vec<u8>>;
}

/// Reads straight from the block device node
pub struct BlockDeviceReader;

impl MediaReader for BlockDeviceReader {
    fn read_region(&self, device: &Device, offset: u64, len: usize) -> WipeResult<Vec<u8>> {
        let mut file = File::open(device.node())?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationSource {
    SelfAttestation,
    Sampling,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub passed: bool,
    pub sampled_regions: u32,
    pub source: VerificationSource,
    pub findings: Vec<String>,
}

impl VerificationResult {
    /// Error to attach to the job when verification did not pass
    pub fn to_error(&self) -> Option<WipeError> {
        if self.passed {
            return None;
        }
        let detail = if self.findings.is_empty() {
            "verification did not pass".to_string()
        } else {
            self.findings.join("; ")
        };
        Some(WipeError::Verification(detail))
    }
}

pub struct Verifier {
    backend: Arc<dyn SanitizeBackend>,
    reader: Arc<dyn MediaReader>,
    config: VerificationConfig,
}

impl Verifier {
    pub fn new(
        backend: Arc<dyn SanitizeBackend>,
        reader: Arc<dyn MediaReader>,
        config: VerificationConfig,
    ) -> Self {
        Self {
            backend,
            reader,
            config,
        }
    }

    pub fn verify(&self, device: &Device, method: Method) -> WipeResult<VerificationResult> {
        self.verify_observed(device, method, &mut |_, _| {})
    }

    /// Verify, reporting `(regions_done, regions_total)` while sampling
    pub fn verify_observed(
        &self,
        device: &Device,
        method: Method,
        progress: &mut dyn FnMut(u32, u32),
    ) -> WipeResult<VerificationResult> {
        if self.config.prefer_self_attestation && method.supports_self_attestation() {
            if let Some(attestation) = self.backend.attestation(device, method)? {
                tracing::info!(
                    device = device.id(),
                    passed = attestation.passed,
                    "Using device self-attestation"
                );
                return Ok(VerificationResult {
                    passed: attestation.passed,
                    sampled_regions: 0,
                    source: VerificationSource::SelfAttestation,
                    findings: if attestation.passed {
                        Vec::new()
                    } else {
                        vec![attestation.detail]
                    },
                });
            }
        }

        self.sample(device, progress)
    }

    fn sample(
        &self,
        device: &Device,
        progress: &mut dyn FnMut(u32, u32),
    ) -> WipeResult<VerificationResult> {
        let offsets = sampling::sample_offsets(
            &mut rand::thread_rng(),
            device.capacity_bytes(),
            self.config.region_bytes,
            self.config.sample_regions,
        );
        let total = offsets.len() as u32;
        if total == 0 {
            return Err(WipeError::Verification(format!(
                "{} has no addressable regions to sample",
                device.id()
            )));
        }

        let mut sampled = 0;
        for offset in offsets {
            let len = (device.capacity_bytes() - offset).min(self.config.region_bytes as u64);
            let data = self
                .reader
                .read_region(device, offset, len as usize)
                .map_err(|e| {
                    WipeError::Verification(format!("cannot read offset {}: {}", offset, e))
                })?;
            sampled += 1;

            if let Some(finding) =
                sampling::classify_region(offset, &data, self.config.entropy_threshold)
            {
                tracing::warn!(device = device.id(), %finding, "Verification sample failed");
                progress(sampled, total);
                return Ok(VerificationResult {
                    passed: false,
                    sampled_regions: sampled,
                    source: VerificationSource::Sampling,
                    findings: vec![finding.to_string()],
                });
            }
            progress(sampled, total);
        }

        tracing::info!(device = device.id(), regions = sampled, "Verification sampling passed");
        Ok(VerificationResult {
            passed: true,
            sampled_regions: sampled,
            source: VerificationSource::Sampling,
            findings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::{FaultPlan, SimulatedBackend};
    use crate::{CapabilityFlags, Transport};

    fn device(id: &str, transport: Transport) -> Device {
        Device::new(
            id,
            "Test Device",
            format!("/dev/{}", id),
            transport,
            CapabilityFlags {
                supports_sanitize: true,
                ..Default::default()
            },
            1 << 20,
        )
    }

    fn config(sample_regions: u32) -> VerificationConfig {
        VerificationConfig {
            sample_regions,
            ..Default::default()
        }
    }

    fn verifier(backend: Arc<SimulatedBackend>, config: VerificationConfig) -> Verifier {
        Verifier::new(backend.clone(), backend, config)
    }

    #[test]
    fn test_sampling_passes_on_wiped_media() {
        let backend = Arc::new(SimulatedBackend::instant());
        let device = device("sdb", Transport::USB);
        backend
            .invoke(&device, Method::SinglePassOverwrite, &mut |_| {})
            .unwrap();

        let mut seen = Vec::new();
        let result = verifier(backend, config(16))
            .verify_observed(&device, Method::SinglePassOverwrite, &mut |done, total| {
                seen.push((done, total))
            })
            .unwrap();

        assert!(result.passed);
        assert_eq!(result.sampled_regions, 16);
        assert_eq!(result.source, VerificationSource::Sampling);
        assert_eq!(seen.last(), Some(&(16, 16)));
        assert!(result.to_error().is_none());
    }

    #[test]
    fn test_sampling_fails_on_residual_header() {
        let backend = Arc::new(SimulatedBackend::instant().with_fault(
            "sdb",
            FaultPlan {
                residual_after_wipe: true,
                ..Default::default()
            },
        ));
        let device = device("sdb", Transport::USB);
        backend
            .invoke(&device, Method::SinglePassOverwrite, &mut |_| {})
            .unwrap();

        let result = verifier(backend, config(16))
            .verify(&device, Method::SinglePassOverwrite)
            .unwrap();

        assert!(!result.passed);
        assert_eq!(result.sampled_regions, 1);
        assert_eq!(result.findings, vec!["PDF header at offset 0".to_string()]);
        assert!(matches!(result.to_error(), Some(WipeError::Verification(_))));
    }

    #[test]
    fn test_self_attestation_is_authoritative() {
        let backend = Arc::new(SimulatedBackend::instant());
        let device = device("nvme0n1", Transport::NVMe);
        backend
            .invoke(&device, Method::NvmeSanitize, &mut |_| {})
            .unwrap();

        let result = verifier(backend, config(16))
            .verify(&device, Method::NvmeSanitize)
            .unwrap();

        assert!(result.passed);
        assert_eq!(result.source, VerificationSource::SelfAttestation);
        assert_eq!(result.sampled_regions, 0);
    }

    #[test]
    fn test_sampling_when_attestation_not_preferred() {
        let backend = Arc::new(SimulatedBackend::instant());
        let device = device("nvme0n1", Transport::NVMe);
        backend
            .invoke(&device, Method::NvmeSanitize, &mut |_| {})
            .unwrap();

        let mut config = config(4);
        config.prefer_self_attestation = false;
        let result = verifier(backend, config)
            .verify(&device, Method::NvmeSanitize)
            .unwrap();

        assert_eq!(result.source, VerificationSource::Sampling);
        assert_eq!(result.sampled_regions, 4);
    }

    #[test]
    fn test_block_device_reader_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let mut content = vec![0u8; 8192];
        content[4096..4100].copy_from_slice(b"\x7FELF");
        std::fs::write(&path, &content).unwrap();

        let device = Device::new("img", "Image", &path, Transport::SATA, CapabilityFlags::default(), 8192);
        let region = BlockDeviceReader.read_region(&device, 4096, 4096).unwrap();

        assert_eq!(region.len(), 4096);
        assert!(region.starts_with(b"\x7FELF"));
    }
}
