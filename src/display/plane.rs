//! Overlay-plane scanout control.

use drm::control::{crtc, framebuffer, plane, Device as ControlDevice, Event};

use tracing::{debug, info, warn};

use crate::display::card::Card;
use crate::display::output::DisplayTarget;
use crate::error::{Error, Result};
use crate::Rect;

// DRM_MODE_PAGE_FLIP_ASYNC: apply without waiting for vertical blank.
const PAGE_FLIP_ASYNC: u32 = 0x02;

/// Owns the plane identifiers usable on one CRTC.
pub struct PlaneCompositor {
    crtc: crtc::Handle,
    planes: Vec<plane::Handle>,
}

impl PlaneCompositor {
    /// Enumerate overlay planes that can drive `crtc` and scan out the
    /// given format. Universal-plane mode is enabled here first; without it
    /// the kernel hides most planes from enumeration.
    pub fn discover(card: &Card, crtc: crtc::Handle, fourcc: u32) -> Result<Self> {
        card.enable_universal_planes()?;

        let res = card.resource_handles()?;
        let mut planes = Vec::new();
        for handle in card.plane_handles()? {
            let info = match card.get_plane(handle) {
                Ok(info) => info,
                Err(e) => {
                    warn!("get_plane failed: {e}");
                    continue;
                }
            };
            if !res.filter_crtcs(info.possible_crtcs()).contains(&crtc) {
                continue;
            }
            if !info.formats().contains(&fourcc) {
                continue;
            }
            planes.push(handle);
        }

        info!("found {} usable plane(s) on crtc {:?}", planes.len(), crtc);
        Ok(Self { crtc, planes })
    }

    /// Plane assigned to stream `index`, one plane per stream.
    pub fn plane_for(&self, index: usize) -> Result<plane::Handle> {
        self.planes
            .get(index)
            .copied()
            .ok_or(Error::NoPlane { stream: index })
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    /// Initial modeset: establish the output mode with a first framebuffer
    /// bound, saving the pre-existing CRTC configuration beforehand so
    /// teardown can put it back.
    pub fn bind_crtc(
        &self,
        card: &Card,
        target: &mut DisplayTarget,
        fb: framebuffer::Handle,
    ) -> Result<()> {
        target.save_crtc(card)?;
        card.set_crtc(
            self.crtc,
            Some(fb),
            (0, 0),
            &[target.connector],
            Some(target.mode),
        )?;
        Ok(())
    }

    /// Atomically rebind a plane to a new framebuffer at a destination
    /// rectangle. The source rectangle covers the full captured frame, in
    /// the 16.16 fixed-point units the kernel expects. With `async_flip`
    /// the update applies without waiting for vertical blank, trading a
    /// possible tear for latency.
    pub fn set_plane(
        &self,
        card: &Card,
        plane: plane::Handle,
        fb: framebuffer::Handle,
        src: (u32, u32),
        dst: Rect,
        async_flip: bool,
    ) -> Result<()> {
        let flags = if async_flip { PAGE_FLIP_ASYNC } else { 0 };
        card.set_plane(
            plane,
            self.crtc,
            Some(fb),
            flags,
            (dst.x, dst.y, dst.width, dst.height),
            (0, 0, src.0 << 16, src.1 << 16),
        )?;
        Ok(())
    }

    /// Reapply the saved CRTC configuration. No-op when nothing was saved,
    /// or when restore already ran.
    pub fn restore(&self, card: &Card, target: &mut DisplayTarget) -> Result<()> {
        let Some(saved) = target.take_saved() else {
            return Ok(());
        };
        card.set_crtc(
            saved.crtc,
            saved.framebuffer,
            saved.position,
            &[target.connector],
            saved.mode,
        )?;
        info!("restored previous CRTC configuration");
        Ok(())
    }
}

/// Drain pending display events, returning how many scanout completions
/// were reported. Completion is the signal that the display engine has
/// finished reading a buffer.
pub fn drain_events(card: &Card) -> Result<u32> {
    let mut completions = 0;
    for event in card.receive_events()? {
        match event {
            Event::PageFlip(flip) => {
                debug!("page flip complete on {:?}, frame {}", flip.crtc, flip.frame);
                completions += 1;
            }
            Event::Vblank(_) => {}
            _ => {}
        }
    }
    Ok(completions)
}
