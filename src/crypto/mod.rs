pub mod certificates;
pub mod signing;

// Re-export
pub use certificates::{
    canonical_log, verify_certificate, verify_certificate_in, verify_certificate_with, Certificate,
    CertificateIssuer,
};
pub use signing::{
    FileSecretStore, HashAlgorithm, KeyMaterial, MemorySecretStore, SecretStore,
    SignatureAlgorithm,
};
