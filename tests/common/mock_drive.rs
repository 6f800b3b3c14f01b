//! File-backed mock drives
//!
//! The file starts with a PDF header followed by repeated plain-text records,
//! so unwiped content fails both the signature and the entropy checks.
use bitwiperz::{CapabilityFlags, Device, Transport};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;

const USER_RECORD: &[u8] = b"Invoice 2024-0042, customer Jane Example, total 1,337.00 EUR\n";

pub struct MockDrive {
    pub temp_file: NamedTempFile,
    size_bytes: u64,
}

impl MockDrive {
    pub fn with_user_data(size_kb: u64) -> std::io::Result<Self> {
        let mut temp_file = NamedTempFile::new()?;
        let size_bytes = size_kb * 1024;

        let mut content = b"%PDF-1.7\n".to_vec();
        while (content.len() as u64) < size_bytes {
            content.extend_from_slice(USER_RECORD);
        }
        content.truncate(size_bytes as usize);

        temp_file.write_all(&content)?;
        temp_file.flush()?;
        temp_file.seek(SeekFrom::Start(0))?;

        Ok(Self {
            temp_file,
            size_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_file.path()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// The drive as a USB stick without discard support
    pub fn as_usb_device(&self, id: &str) -> Arc<Device> {
        Arc::new(Device::new(
            id,
            "Mock USB Stick",
            self.path(),
            Transport::USB,
            CapabilityFlags::default(),
            self.size_bytes,
        ))
    }
}

pub fn is_all_zeros(path: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read(path)?.iter().all(|&b| b == 0))
}
