use super::signing::{verify_signature, HashAlgorithm, SecretStore, SignatureAlgorithm};
use crate::config::CertificateConfig;
use crate::wipe_orchestrator::job::{JobState, ProgressEvent, WipeJob};
use crate::{Method, WipeError, WipeResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const CERTIFICATE_FILE_PREFIX: &str = "bitwiperz-certificate";

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Signed attestation that a device was sanitized.
///
/// Fields are private and there are no setters: a certificate is only built
/// by [`CertificateIssuer::issue`] or read back from its JSON encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    id: String,
    device_id: String,
    device_display_name: String,
    method: Method,
    standard: String,
    started_at: String,
    finished_at: String,
    log_hash: String,
    hash_algorithm: HashAlgorithm,
    signature: String,
    signature_algorithm: SignatureAlgorithm,
    key_id: String,
    public_key: String,
    issued_at: String,
}

impl Certificate {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_display_name(&self) -> &str {
        &self.device_display_name
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn standard(&self) -> &str {
        &self.standard
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn finished_at(&self) -> &str {
        &self.finished_at
    }

    pub fn log_hash(&self) -> &str {
        &self.log_hash
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn issued_at(&self) -> &str {
        &self.issued_at
    }

    /// Bytes covered by the signature: the JSON record with the signature cleared
    pub fn signing_payload(&self) -> WipeResult<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_vec(&unsigned)
            .map_err(|e| WipeError::Signing(format!("cannot encode signing payload: {}", e)))
    }

    /// Whether `log` hashes to the recorded log hash
    pub fn matches_log(&self, log: &[ProgressEvent]) -> bool {
        self.hash_algorithm.hex_digest(canonical_log(log).as_bytes()) == self.log_hash
    }

    pub fn to_json(&self) -> WipeResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| WipeError::Io(format!("cannot encode certificate: {}", e)))
    }

    pub fn from_json(json: &str) -> WipeResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| WipeError::Signing(format!("malformed certificate: {}", e)))
    }

    /// Human-readable attestation document. Every field appears verbatim.
    pub fn render_document(&self) -> String {
        let mut doc = String::new();
        doc.push_str("BitWiperz Data Sanitization Certificate\n");
        doc.push_str("=======================================\n\n");

        let rows = [
            ("Certificate ID", self.id.as_str()),
            ("Device ID", self.device_id.as_str()),
            ("Device", self.device_display_name.as_str()),
            ("Method", self.method.as_str()),
            ("Standard", self.standard.as_str()),
            ("Started at", self.started_at.as_str()),
            ("Finished at", self.finished_at.as_str()),
            ("Log hash", self.log_hash.as_str()),
            ("Hash algorithm", self.hash_algorithm.as_str()),
            ("Signature algorithm", self.signature_algorithm.as_str()),
            ("Signer key ID", self.key_id.as_str()),
            ("Signer public key", self.public_key.as_str()),
            ("Signature", self.signature.as_str()),
            ("Issued at", self.issued_at.as_str()),
        ];
        for (label, value) in rows {
            doc.push_str(&format!("{:<20} {}\n", format!("{}:", label), value));
        }

        doc.push_str(&format!(
            "\nThe device above was sanitized with {} in accordance with {}.\n",
            self.method.label(),
            self.standard
        ));
        doc
    }

    pub fn file_stem(&self) -> String {
        format!("{}-{}", CERTIFICATE_FILE_PREFIX, self.id)
    }

    /// Write the JSON record and the text document into `dir`
    pub fn save(&self, dir: &Path) -> WipeResult<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let json_path = dir.join(format!("{}.json", self.file_stem()));
        let text_path = dir.join(format!("{}.txt", self.file_stem()));
        std::fs::write(&json_path, self.to_json()?)?;
        std::fs::write(&text_path, self.render_document())?;
        tracing::info!(certificate_id = %self.id, path = %json_path.display(), "Certificate saved");
        Ok((json_path, text_path))
    }
}

/// One line per event: `seq|rfc3339-millis|stage|percent|kind-json`
pub fn canonical_log(log: &[ProgressEvent]) -> String {
    let mut out = String::new();
    for event in log {
        let kind = serde_json::to_string(&event.kind).unwrap_or_default();
        out.push_str(&format!(
            "{}|{}|{}|{}|{}\n",
            event.sequence,
            timestamp(event.timestamp),
            event.stage,
            event.percent,
            kind
        ));
    }
    out
}

/// Re-derive the signing payload and check it against the embedded public key.
///
/// `Ok(false)` means the certificate is well-formed but the signature does
/// not match; malformed hex is an error.
pub fn verify_certificate(certificate: &Certificate) -> WipeResult<bool> {
    let public_key = hex::decode(&certificate.public_key)
        .map_err(|e| WipeError::Signing(format!("malformed public key: {}", e)))?;
    let signature = hex::decode(&certificate.signature)
        .map_err(|e| WipeError::Signing(format!("malformed signature: {}", e)))?;
    let payload = certificate.signing_payload()?;

    Ok(verify_signature(
        certificate.signature_algorithm,
        &public_key,
        &payload,
        &signature,
    ))
}

/// Verify against a public key the caller already trusts.
///
/// A certificate carrying any other public key is rejected before its
/// signature is looked at, so a record re-signed with a fresh key fails.
pub fn verify_certificate_with(
    certificate: &Certificate,
    trusted_public_key: &[u8],
) -> WipeResult<bool> {
    let embedded = hex::decode(&certificate.public_key)
        .map_err(|e| WipeError::Signing(format!("malformed public key: {}", e)))?;
    if embedded != trusted_public_key {
        tracing::warn!(
            certificate_id = %certificate.id,
            key_id = %certificate.key_id,
            "Certificate is not signed by the trusted key"
        );
        return Ok(false);
    }
    verify_certificate(certificate)
}

/// Verify against the key registered under the certificate's `keyId`
pub fn verify_certificate_in(
    certificate: &Certificate,
    store: &dyn SecretStore,
) -> WipeResult<bool> {
    let trusted = store.public_key(&certificate.key_id)?;
    verify_certificate_with(certificate, &trusted)
}

/// Builds and signs certificates for completed jobs
pub struct CertificateIssuer {
    store: Arc<dyn SecretStore>,
    key_id: String,
    signature_algorithm: SignatureAlgorithm,
    hash_algorithm: HashAlgorithm,
}

impl CertificateIssuer {
    pub fn new(store: Arc<dyn SecretStore>, config: &CertificateConfig) -> Self {
        Self {
            store,
            key_id: config.key_id.clone(),
            signature_algorithm: config.signature_algorithm,
            hash_algorithm: config.hash_algorithm,
        }
    }

    pub fn issue(&self, job: &WipeJob) -> WipeResult<Certificate> {
        if job.state() != JobState::Done {
            return Err(WipeError::NotCertifiable {
                job_id: job.id().to_string(),
                state: job.state().to_string(),
            });
        }
        let (started_at, finished_at) = match (job.started_at(), job.finished_at()) {
            (Some(start), Some(finish)) => (start, finish),
            _ => {
                return Err(WipeError::NotCertifiable {
                    job_id: job.id().to_string(),
                    state: "missing timestamps".to_string(),
                })
            }
        };

        let key = self.store.signing_key(&self.key_id)?;
        if key.algorithm() != self.signature_algorithm {
            return Err(WipeError::Signing(format!(
                "key '{}' is {}, configured algorithm is {}",
                self.key_id,
                key.algorithm(),
                self.signature_algorithm
            )));
        }
        let signer = key.signer()?;

        let log_hash = self
            .hash_algorithm
            .hex_digest(canonical_log(job.log()).as_bytes());

        let mut certificate = Certificate {
            id: Uuid::new_v4().to_string(),
            device_id: job.device_id().to_string(),
            device_display_name: job.device_display_name().to_string(),
            method: job.method(),
            standard: job.method().standard().to_string(),
            started_at: timestamp(started_at),
            finished_at: timestamp(finished_at),
            log_hash,
            hash_algorithm: self.hash_algorithm,
            signature: String::new(), // Filled in below
            signature_algorithm: signer.algorithm(),
            key_id: self.key_id.clone(),
            public_key: hex::encode(signer.public_key()),
            issued_at: timestamp(Utc::now()),
        };

        let payload = certificate.signing_payload()?;
        certificate.signature = hex::encode(signer.sign(&payload)?);

        tracing::info!(
            certificate_id = %certificate.id,
            job_id = %job.id(),
            device = %certificate.device_id,
            key_id = %certificate.key_id,
            "Certificate issued"
        );
        Ok(certificate)
    }
}
