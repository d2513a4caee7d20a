//! Display output discovery and saved-CRTC bookkeeping.

use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, Mode, ModeTypeFlags};
use tracing::{info, warn};

use crate::display::card::Card;
use crate::error::{Error, Result};

/// CRTC configuration captured before the first modeset, reapplied on
/// teardown.
#[derive(Debug, Clone, Copy)]
pub struct SavedCrtc {
    pub crtc: crtc::Handle,
    pub framebuffer: Option<framebuffer::Handle>,
    pub position: (u32, u32),
    pub mode: Option<Mode>,
}

/// One active display output: a connected connector, its CRTC and the
/// negotiated mode.
pub struct DisplayTarget {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    pub mode: Mode,
    saved: Option<SavedCrtc>,
}

impl DisplayTarget {
    pub fn width(&self) -> u32 {
        u32::from(self.mode.size().0)
    }

    pub fn height(&self) -> u32 {
        u32::from(self.mode.size().1)
    }

    /// Capture the pre-existing CRTC configuration. Done once, before the
    /// first scanout call; later calls keep the original snapshot.
    pub fn save_crtc(&mut self, card: &Card) -> Result<()> {
        if self.saved.is_some() {
            return Ok(());
        }
        let info = card.get_crtc(self.crtc)?;
        self.saved = Some(SavedCrtc {
            crtc: self.crtc,
            framebuffer: info.framebuffer(),
            position: info.position(),
            mode: info.mode(),
        });
        Ok(())
    }

    /// Take the snapshot for restoration. Restoring consumes it, which is
    /// what makes teardown idempotent.
    pub fn take_saved(&mut self) -> Option<SavedCrtc> {
        self.saved.take()
    }
}

fn preferred_mode(modes: &[Mode]) -> Option<Mode> {
    modes
        .iter()
        .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
        .or_else(|| modes.first())
        .copied()
}

/// Enumerate connected outputs with at least one mode, preferred mode first.
/// Returns them in resource order; callers typically drive the first one.
pub fn discover(card: &Card) -> Result<Vec<DisplayTarget>> {
    let res = card.resource_handles()?;
    let mut targets = Vec::new();

    for &conn in res.connectors() {
        let info = match card.get_connector(conn, false) {
            Ok(info) => info,
            Err(e) => {
                warn!("get_connector failed: {e}");
                continue;
            }
        };
        if info.state() != connector::State::Connected || info.modes().is_empty() {
            continue;
        }

        for mode in info.modes() {
            let star = if mode.mode_type().contains(ModeTypeFlags::PREFERRED) {
                " *"
            } else {
                ""
            };
            info!("mode: {}x{}{star}", mode.size().0, mode.size().1);
        }

        let Some(mode) = preferred_mode(info.modes()) else {
            continue;
        };

        // Current encoder's CRTC when lit, otherwise the first CRTC the
        // connector's encoders can drive.
        let crtc = info
            .current_encoder()
            .and_then(|enc| card.get_encoder(enc).ok())
            .and_then(|enc| enc.crtc())
            .or_else(|| {
                info.encoders()
                    .iter()
                    .filter_map(|&enc| card.get_encoder(enc).ok())
                    .flat_map(|enc| res.filter_crtcs(enc.possible_crtcs()))
                    .next()
            });

        let Some(crtc) = crtc else {
            warn!("connector {:?} has no usable CRTC", info.interface());
            continue;
        };

        info!(
            "selected connector {:?}-{}: {}x{} on crtc {:?}",
            info.interface(),
            info.interface_id(),
            mode.size().0,
            mode.size().1,
            crtc
        );

        targets.push(DisplayTarget {
            connector: conn,
            crtc,
            mode,
            saved: None,
        });
    }

    if targets.is_empty() {
        return Err(Error::NoDisplay);
    }
    Ok(targets)
}
