//! Layered configuration.
//!
//! Sources, lowest precedence first: built-in defaults, a TOML file (explicit
//! path or `config.toml` in the platform config directory), then environment
//! variables such as `BITWIPERZ__EXECUTION__MAX_PARALLEL_JOBS=2`.

use crate::crypto::signing::{HashAlgorithm, SignatureAlgorithm};
use crate::logging::LogConfig;
use crate::{WipeError, WipeResult};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "BITWIPERZ";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "bitwiperz", "bitwiperz")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WipeConfig {
    pub inventory: InventoryConfig,
    pub execution: ExecutionConfig,
    pub verification: VerificationConfig,
    pub certificate: CertificateConfig,
    pub audit: AuditConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Root of the sysfs mount
    pub sysfs_root: PathBuf,
    /// Directory holding device nodes
    pub dev_root: PathBuf,
    /// Device ids never offered for wiping
    pub exclude: Vec<String>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Total pre-check attempts, the first one included
    pub precheck_max_attempts: u32,
    pub precheck_base_delay_ms: u64,
    pub precheck_max_delay_ms: u64,
    /// Refuse to start when running on battery
    pub require_ac_power: bool,
    pub overwrite_chunk_bytes: usize,
    /// Poll interval for long-running device commands
    pub poll_interval_ms: u64,
    pub max_parallel_jobs: usize,
    /// Capacity of the progress event broadcast channel
    pub event_buffer: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            precheck_max_attempts: 3,
            precheck_base_delay_ms: 1000,
            precheck_max_delay_ms: 4000,
            require_ac_power: true,
            overwrite_chunk_bytes: 4 * 1024 * 1024, // 4MB chunks
            poll_interval_ms: 1000,
            max_parallel_jobs: num_cpus::get().max(1),
            event_buffer: 1024,
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Number of random regions read when sampling
    pub sample_regions: u32,
    pub region_bytes: usize,
    /// Minimum Shannon entropy (bits/byte) for a non-uniform region to pass
    pub entropy_threshold: f64,
    /// Trust device self-attestation where the method supports it
    pub prefer_self_attestation: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sample_regions: 64,
            region_bytes: 4096,
            entropy_threshold: 7.5,
            prefer_self_attestation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    /// Issue certificates for completed jobs
    pub enabled: bool,
    pub signature_algorithm: SignatureAlgorithm,
    pub hash_algorithm: HashAlgorithm,
    pub key_id: String,
    /// Secret store directory holding `<key_id>.pk8` files
    pub key_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        let key_dir = project_dirs()
            .map(|dirs| dirs.data_dir().join("keys"))
            .unwrap_or_else(|| PathBuf::from("./keys"));

        Self {
            enabled: true,
            signature_algorithm: SignatureAlgorithm::Ed25519,
            hash_algorithm: HashAlgorithm::Sha256,
            key_id: "default".to_string(),
            key_dir,
            output_dir: PathBuf::from("./certificates"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines audit log; auditing is disabled when unset
    pub path: Option<PathBuf>,
}

impl WipeConfig {
    /// Load configuration from the default file location and the environment
    pub fn load(explicit: Option<&Path>) -> WipeResult<Self> {
        let mut builder = Config::builder();

        match explicit {
            Some(path) => {
                builder = builder.add_source(File::from(path.to_path_buf()).required(true));
            }
            None => {
                if let Some(dirs) = project_dirs() {
                    let default_path = dirs.config_dir().join("config.toml");
                    builder = builder.add_source(File::from(default_path).required(false));
                }
            }
        }

        let config: WipeConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("inventory.exclude")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WipeError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> WipeResult<()> {
        if self.execution.precheck_max_attempts == 0 {
            return Err(WipeError::Config(
                "execution.precheck_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.execution.max_parallel_jobs == 0 {
            return Err(WipeError::Config(
                "execution.max_parallel_jobs must be at least 1".to_string(),
            ));
        }
        if self.execution.overwrite_chunk_bytes == 0 {
            return Err(WipeError::Config(
                "execution.overwrite_chunk_bytes must be non-zero".to_string(),
            ));
        }
        if self.execution.event_buffer == 0 {
            return Err(WipeError::Config(
                "execution.event_buffer must be non-zero".to_string(),
            ));
        }
        if self.verification.region_bytes == 0 {
            return Err(WipeError::Config(
                "verification.region_bytes must be non-zero".to_string(),
            ));
        }
        if !(0.0..=8.0).contains(&self.verification.entropy_threshold) {
            return Err(WipeError::Config(
                "verification.entropy_threshold must be between 0 and 8".to_string(),
            ));
        }
        if self.certificate.enabled && self.certificate.key_id.trim().is_empty() {
            return Err(WipeError::Config(
                "certificate.key_id must be set when certificates are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = WipeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.precheck_max_attempts, 3);
        assert_eq!(config.verification.sample_regions, 64);
        assert_eq!(
            config.certificate.signature_algorithm,
            SignatureAlgorithm::Ed25519
        );
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = WipeConfig::default();
        config.execution.precheck_max_attempts = 0;
        assert!(matches!(config.validate(), Err(WipeError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_entropy_threshold() {
        let mut config = WipeConfig::default();
        config.verification.entropy_threshold = 9.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_allows_empty_key_id_when_disabled() {
        let mut config = WipeConfig::default();
        config.certificate.enabled = false;
        config.certificate.key_id = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[execution]
precheck_max_attempts = 5
max_parallel_jobs = 2

[verification]
sample_regions = 8

[certificate]
signature_algorithm = "ecdsa-p256-sha256"
hash_algorithm = "sha512"
key_id = "lab-signer"
"#
        )
        .unwrap();

        let config = WipeConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.execution.precheck_max_attempts, 5);
        assert_eq!(config.execution.max_parallel_jobs, 2);
        assert_eq!(config.verification.sample_regions, 8);
        // Unset keys keep their defaults
        assert_eq!(config.verification.region_bytes, 4096);
        assert_eq!(
            config.certificate.signature_algorithm,
            SignatureAlgorithm::EcdsaP256Sha256
        );
        assert_eq!(config.certificate.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(config.certificate.key_id, "lab-signer");
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[verification]\nsample_regions = 8").unwrap();

        std::env::set_var("BITWIPERZ__VERIFICATION__SAMPLE_REGIONS", "16");
        let config = WipeConfig::load(Some(file.path()));
        std::env::remove_var("BITWIPERZ__VERIFICATION__SAMPLE_REGIONS");

        assert_eq!(config.unwrap().verification.sample_regions, 16);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let result = WipeConfig::load(Some(Path::new("/nonexistent/bitwiperz.toml")));
        assert!(matches!(result, Err(WipeError::Config(_))));
    }
}
