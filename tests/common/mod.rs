/// Common test utilities for integration tests
///
/// - mock_drive: file-backed drives filled with recognizable user data
/// - backends: sanitization backends that act on those files
#[allow(dead_code)]
pub mod backends;
#[allow(dead_code)]
pub mod mock_drive;

use bitwiperz::WipeConfig;
use std::path::Path;

/// Config tuned for small file-backed drives
#[allow(dead_code)]
pub fn test_config(output_dir: &Path) -> WipeConfig {
    let mut config = WipeConfig::default();
    config.verification.sample_regions = 16;
    config.verification.region_bytes = 4096;
    config.execution.overwrite_chunk_bytes = 64 * 1024;
    config.certificate.key_id = "integration".to_string();
    config.certificate.output_dir = output_dir.to_path_buf();
    config
}
