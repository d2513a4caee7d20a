//! The real scanout backend: DRM card, planes and the shared buffer pools.

use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::RawFd;

use drm::control::{framebuffer, plane};
use tracing::{info, warn};

use crate::capture::AcceptedFormat;
use crate::display::buffer::FrameBuffer;
use crate::display::plane::drain_events;
use crate::display::{output, pattern, Card, DisplayTarget, PlaneCompositor};
use crate::error::{Error, Result};
use crate::pipeline::ScanoutSink;
use crate::{Config, PixelFormat, Rect};

/// One stream's plane binding and its buffer pool.
struct ScanoutLane {
    plane: plane::Handle,
    dst: Rect,
    /// Full captured frame, the source rectangle of every bind.
    src: (u32, u32),
    buffers: Vec<FrameBuffer>,
    framebuffers: Vec<framebuffer::Handle>,
}

/// Display half of the pipeline: owns the card, the compositor state and
/// every [`FrameBuffer`]. Dropping it releases the pools.
pub struct KmsScanout {
    card: Card,
    compositor: PlaneCompositor,
    target: DisplayTarget,
    lanes: Vec<ScanoutLane>,
    async_flip: bool,
}

fn build_pool(
    card: &Card,
    format: PixelFormat,
    accepted: &AcceptedFormat,
    count: u32,
) -> Result<Vec<FrameBuffer>> {
    let fourcc = format.drm_fourcc();
    let pitch = if accepted.pitch != 0 {
        accepted.pitch
    } else {
        accepted.width * format.bpp() / 8
    };

    let mut pool = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let result =
            FrameBuffer::allocate(card, accepted.width, accepted.height, fourcc, format.bpp())
                .and_then(|mut buf| {
                    buf.export(card)?;
                    buf.register_framebuffer(card, fourcc, accepted.width, accepted.height, pitch)?;
                    Ok(buf)
                });
        match result {
            Ok(buf) => pool.push(buf),
            Err(e) => {
                // Roll back whatever this pool acquired so far.
                for buf in &mut pool {
                    buf.release(card);
                }
                return Err(e);
            }
        }
    }
    Ok(pool)
}

impl KmsScanout {
    /// Open the card, pick the first usable output, and build one lane per
    /// stream: a plane, a destination rectangle, and a registered,
    /// exported buffer pool sized to the accepted capture format.
    ///
    /// Ends with the initial modeset binding stream 0's reserved buffer,
    /// which also snapshots the prior CRTC configuration.
    pub fn setup(config: &Config, accepted: &[AcceptedFormat]) -> Result<Self> {
        let card = Card::open(&config.card)?;
        let mut targets = output::discover(&card)?;
        let target = targets.swap_remove(0);

        let fourcc = config.format.drm_fourcc() as u32;
        let compositor = PlaneCompositor::discover(&card, target.crtc, fourcc)?;
        if compositor.plane_count() < config.streams.len() {
            return Err(Error::NoPlane {
                stream: compositor.plane_count(),
            });
        }

        let mut scanout = Self {
            card,
            compositor,
            target,
            lanes: Vec::with_capacity(config.streams.len()),
            async_flip: config.async_flip,
        };

        for (i, (stream, fmt)) in config.streams.iter().zip(accepted).enumerate() {
            let plane = scanout.compositor.plane_for(i)?;
            let buffers = build_pool(&scanout.card, config.format, fmt, config.buffer_count)?;
            let framebuffers = buffers
                .iter()
                .map(|b| b.framebuffer().expect("pool buffers are registered"))
                .collect();
            info!(
                "stream {i}: {} buffers on plane {:?}, dst ({}, {}) {}x{}",
                config.buffer_count,
                plane,
                stream.dst.x,
                stream.dst.y,
                stream.dst.width,
                stream.dst.height
            );
            scanout.lanes.push(ScanoutLane {
                plane,
                dst: stream.dst,
                src: (fmt.width, fmt.height),
                buffers,
                framebuffers,
            });
        }

        if config.test_pattern {
            scanout.fill_test_pattern(config.format)?;
        }

        let first_fb = scanout.lanes[0].framebuffers[0];
        scanout
            .compositor
            .bind_crtc(&scanout.card, &mut scanout.target, first_fb)?;

        Ok(scanout)
    }

    /// Exported handles for one lane's pool, in pool order. These are what
    /// the capture importer binds.
    pub fn dmabufs(&self, lane: usize) -> Vec<RawFd> {
        self.lanes[lane]
            .buffers
            .iter()
            .map(|b| b.dmabuf_fd().expect("pool buffers are exported"))
            .collect()
    }

    fn fill_test_pattern(&mut self, format: PixelFormat) -> Result<()> {
        if format != PixelFormat::Xrgb8888 {
            warn!("test pattern only supports XRGB8888, skipping fill");
            return Ok(());
        }
        for lane in &mut self.lanes {
            for buf in &mut lane.buffers {
                let (width, height, pitch) =
                    (buf.width() as usize, buf.height() as usize, buf.pitch() as usize);
                let mut map = buf.map(&self.card)?;
                pattern::fill_smpte_xrgb(&mut map, width, height, pitch);
            }
        }
        Ok(())
    }
}

impl ScanoutSink for KmsScanout {
    fn present(&mut self, stream: usize, index: u32) -> Result<()> {
        let lane = &self.lanes[stream];
        let fb = *lane
            .framebuffers
            .get(index as usize)
            .ok_or(Error::BadIndex {
                index,
                count: lane.framebuffers.len() as u32,
            })?;
        self.compositor
            .set_plane(&self.card, lane.plane, fb, lane.src, lane.dst, self.async_flip)
    }

    fn completions(&mut self) -> Result<u32> {
        drain_events(&self.card)
    }

    fn restore(&mut self) -> Result<()> {
        self.compositor.restore(&self.card, &mut self.target)
    }
}

impl AsFd for KmsScanout {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.card.as_fd()
    }
}

impl Drop for KmsScanout {
    fn drop(&mut self) {
        for lane in &mut self.lanes {
            for buf in &mut lane.buffers {
                buf.release(&self.card);
            }
        }
    }
}
