//! Dumb-buffer allocation, DMA-BUF export and framebuffer registration.
//!
//! Each [`FrameBuffer`] owns up to three kernel resources acquired in this
//! order: the dumb-buffer allocation, the exported PRIME fd, the registered
//! framebuffer object. [`FrameBuffer::release`] closes whichever of them
//! exist, in reverse order, so rollback after a partial setup never leaks.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use drm::buffer::{Buffer, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::dumbbuffer::{DumbBuffer, DumbMapping};
use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};
use tracing::{debug, warn};

use crate::display::card::Card;
use crate::error::{Error, Result};

/// One physical allocation shared between the display and capture drivers.
pub struct FrameBuffer {
    bo: Option<DumbBuffer>,
    width: u32,
    height: u32,
    pitch: u32,
    size: u64,
    fb: Option<framebuffer::Handle>,
    dmabuf: Option<OwnedFd>,
}

/// AddFB2 parameter block: single-plane layout with the unused plane slots
/// zero-filled, as the multi-plane ioctl requires.
struct PlanarParams {
    handle: drm::buffer::Handle,
    size: (u32, u32),
    format: DrmFourcc,
    pitch: u32,
}

impl PlanarBuffer for PlanarParams {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        [self.pitch, 0, 0, 0]
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        [Some(self.handle), None, None, None]
    }

    fn offsets(&self) -> [u32; 4] {
        [0; 4]
    }
}

impl FrameBuffer {
    /// Request a linear buffer of the given geometry from the display
    /// driver. Failure is unrecoverable for the pipeline; the caller treats
    /// it as fatal.
    pub fn allocate(
        card: &Card,
        width: u32,
        height: u32,
        format: DrmFourcc,
        bpp: u32,
    ) -> Result<Self> {
        let bo = card.create_dumb_buffer((width, height), format, bpp)?;
        let pitch = bo.pitch();
        let size = u64::from(pitch) * u64::from(height);
        debug!("allocated {width}x{height} dumb buffer, pitch {pitch}");
        Ok(Self {
            bo: Some(bo),
            width,
            height,
            pitch,
            size,
            fb: None,
            dmabuf: None,
        })
    }

    /// Export the allocation as a process-transferable DMA-BUF handle. The
    /// handle is created once and stays valid for the buffer's lifetime;
    /// repeated calls return the same fd.
    pub fn export(&mut self, card: &Card) -> Result<RawFd> {
        if let Some(fd) = &self.dmabuf {
            return Ok(fd.as_raw_fd());
        }
        let bo = self.bo.as_ref().ok_or_else(Self::released_err)?;
        let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
        let fd = card.buffer_to_prime_fd(bo.handle(), flags)?;
        let raw = fd.as_raw_fd();
        self.dmabuf = Some(fd);
        Ok(raw)
    }

    /// Register the allocation as a scanout surface with the given pixel
    /// format and pitch. `width`/`height` describe the registered surface,
    /// which may be smaller than the allocation (the pool is oversized when
    /// the camera outruns the display mode).
    pub fn register_framebuffer(
        &mut self,
        card: &Card,
        format: DrmFourcc,
        width: u32,
        height: u32,
        pitch: u32,
    ) -> Result<framebuffer::Handle> {
        if let Some(fb) = self.fb {
            return Ok(fb);
        }
        let bo = self.bo.as_ref().ok_or_else(Self::released_err)?;
        let params = PlanarParams {
            handle: bo.handle(),
            size: (width, height),
            format,
            pitch,
        };
        let fb = card.add_planar_framebuffer(&params, FbCmd2Flags::empty())?;
        self.fb = Some(fb);
        Ok(fb)
    }

    /// Map the allocation for CPU access. The mapping unmaps on drop; it is
    /// only used for synthetic test content, never on the capture path.
    pub fn map<'a>(&'a mut self, card: &Card) -> Result<DumbMapping<'a>> {
        let bo = self.bo.as_mut().ok_or_else(Self::released_err)?;
        Ok(card.map_dumb_buffer(bo)?)
    }

    /// Tear down whatever was acquired, in reverse order of acquisition.
    /// Idempotent, and total against partially-initialized buffers.
    pub fn release(&mut self, card: &Card) {
        if let Some(fb) = self.fb.take() {
            if let Err(e) = card.destroy_framebuffer(fb) {
                warn!("destroy_framebuffer failed: {e}");
            }
        }
        // Dropping the OwnedFd closes the exported handle.
        self.dmabuf = None;
        if let Some(bo) = self.bo.take() {
            if let Err(e) = card.destroy_dumb_buffer(bo) {
                warn!("destroy_dumb_buffer failed: {e}");
            }
        }
    }

    fn released_err() -> Error {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "buffer already released",
        ))
    }

    pub fn framebuffer(&self) -> Option<framebuffer::Handle> {
        self.fb
    }

    pub fn dmabuf_fd(&self) -> Option<RawFd> {
        self.dmabuf.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}
