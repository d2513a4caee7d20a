//! DRM device access.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use drm::{ClientCapability, DriverCapability};
use tracing::info;

use crate::error::{Error, Result};

// DRM_PRIME_CAP_EXPORT
const PRIME_CAP_EXPORT: u64 = 0x2;

/// An open DRM card node. The drm-rs control traits hang off this handle;
/// everything display-side borrows it.
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for Card {}
impl drm::control::Device for Card {}

impl Card {
    /// Open the card read-write with close-on-exec and verify the two
    /// capabilities the pipeline cannot run without: dumb-buffer allocation
    /// and PRIME export.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        let card = Card(file);

        let dumb = drm::Device::get_driver_capability(&card, DriverCapability::DumbBuffer)?;
        if dumb == 0 {
            return Err(Error::MissingCapability {
                device: path.display().to_string(),
                what: "dumb buffers",
            });
        }

        let prime = drm::Device::get_driver_capability(&card, DriverCapability::Prime)?;
        if prime & PRIME_CAP_EXPORT == 0 {
            return Err(Error::MissingCapability {
                device: path.display().to_string(),
                what: "PRIME dmabuf export",
            });
        }

        info!("opened DRM card {}", path.display());
        Ok(card)
    }

    /// Enable universal-plane enumeration. Must happen before plane
    /// discovery, or overlay planes stay hidden.
    pub fn enable_universal_planes(&self) -> Result<()> {
        drm::Device::set_client_capability(self, ClientCapability::UniversalPlanes, true)?;
        Ok(())
    }
}
