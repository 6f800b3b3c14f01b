/// Sanitization backends acting on file-backed mock drives
use bitwiperz::drives::operations::overwrite;
use bitwiperz::drives::operations::SelfReport;
use bitwiperz::drives::SanitizeBackend;
use bitwiperz::{Device, Method, WipeError, WipeResult};

/// Zero-fills the backing file for overwrite jobs
pub struct FileOverwriteBackend {
    pub chunk_bytes: usize,
}

impl SanitizeBackend for FileOverwriteBackend {
    fn pre_check(&self, device: &Device, _method: Method) -> WipeResult<()> {
        if !device.node().exists() {
            return Err(WipeError::PreCheck {
                attempts: 1,
                reason: format!("{} does not exist", device.node().display()),
            });
        }
        Ok(())
    }

    fn invoke(
        &self,
        device: &Device,
        method: Method,
        progress: &mut dyn FnMut(u8),
    ) -> WipeResult<()> {
        match method {
            Method::SinglePassOverwrite => overwrite::zero_fill(
                device.node(),
                device.capacity_bytes(),
                self.chunk_bytes,
                progress,
            ),
            other => Err(WipeError::Execution(format!(
                "{} is not available on a file-backed drive",
                other
            ))),
        }
    }

    fn self_report(&self, _device: &Device, _method: Method) -> WipeResult<SelfReport> {
        Ok(SelfReport {
            completed: true,
            summary: "overwrite finished".to_string(),
        })
    }
}

/// Reports success without touching the media
pub struct SilentFailureBackend;

impl SanitizeBackend for SilentFailureBackend {
    fn pre_check(&self, _device: &Device, _method: Method) -> WipeResult<()> {
        Ok(())
    }

    fn invoke(
        &self,
        _device: &Device,
        _method: Method,
        progress: &mut dyn FnMut(u8),
    ) -> WipeResult<()> {
        progress(100);
        Ok(())
    }

    fn self_report(&self, _device: &Device, _method: Method) -> WipeResult<SelfReport> {
        Ok(SelfReport {
            completed: true,
            summary: "device claims completion".to_string(),
        })
    }
}
