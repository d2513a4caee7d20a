//! V4L2 capture with externally-allocated DMA-BUF buffers.
//!
//! The high-level `v4l` API covers device open, capability queries and
//! single-planar streams; the multi-planar DMABUF queue/dequeue protocol is
//! issued through `v4l::v4l2::ioctl` with the raw kernel structs, the same
//! way the crate drives its own arenas internally.

use std::mem;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tracing::{debug, info};
use v4l::capability::Flags as CapFlags;
use v4l::v4l2;
use v4l::Device;

use crate::capture::format::{AcceptedFormat, PixelFormat};
use crate::error::{Error, Result};

/// Stream lifecycle. Operations are only valid in the state they are
/// documented for; calling them out of order is a caller bug, reported as
/// [`Error::StreamState`] rather than ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Unconfigured,
    FormatSet,
    BuffersBound,
    Streaming,
    Stopped,
}

impl StreamState {
    fn name(self) -> &'static str {
        match self {
            StreamState::Unconfigured => "UNCONFIGURED",
            StreamState::FormatSet => "FORMAT_SET",
            StreamState::BuffersBound => "BUFFERS_BOUND",
            StreamState::Streaming => "STREAMING",
            StreamState::Stopped => "STOPPED",
        }
    }
}

/// Driver-assigned pool slot and the shared handle bound to it.
#[derive(Debug, Clone, Copy)]
struct ImportedSlot {
    index: u32,
    dmabuf: RawFd,
}

/// One capture device importing a pool of shared buffers.
pub struct CaptureStream {
    device: Device,
    fd: RawFd,
    path: String,
    state: StreamState,
    format: Option<AcceptedFormat>,
    slots: Vec<ImportedSlot>,
}

impl CaptureStream {
    /// Open a capture device and assert the baseline capabilities the
    /// pipeline cannot run without: multi-planar capture and streaming I/O.
    pub fn open(path: &Path) -> Result<Self> {
        info!("opening capture device {}", path.display());
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("capture device: {} ({})", caps.card, caps.driver);

        if !caps
            .capabilities
            .intersects(CapFlags::VIDEO_CAPTURE | CapFlags::VIDEO_CAPTURE_MPLANE)
        {
            return Err(Error::MissingCapability {
                device: path.display().to_string(),
                what: "video capture",
            });
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(Error::MissingCapability {
                device: path.display().to_string(),
                what: "streaming I/O",
            });
        }

        let fd = device.handle().fd();
        // The retrieve contract requires a non-blocking dequeue.
        // SAFETY: `fd` is owned by `device`, which lives as long as `self`.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let flags = fcntl(borrowed, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
        fcntl(borrowed, FcntlArg::F_SETFL(flags))?;

        Ok(Self {
            device,
            fd,
            path: path.display().to_string(),
            state: StreamState::Unconfigured,
            format: None,
            slots: Vec::new(),
        })
    }

    fn expect_state(&self, op: &'static str, state: StreamState) -> Result<()> {
        if self.state != state {
            return Err(Error::StreamState {
                op,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// Request a resolution and pixel format, then read back what the driver
    /// actually accepted. The driver may silently rewrite geometry and
    /// pitch; all downstream sizing must come from the returned value.
    pub fn negotiate_format(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<AcceptedFormat> {
        self.expect_state("negotiate_format", StreamState::Unconfigured)?;

        let mut fmt: v4l2_sys::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;

        let mut pix_mp: v4l2_sys::v4l2_pix_format_mplane = unsafe { mem::zeroed() };
        pix_mp.width = width;
        pix_mp.height = height;
        pix_mp.pixelformat = format.v4l2_fourcc();
        pix_mp.field = v4l2_sys::v4l2_field_V4L2_FIELD_NONE;
        pix_mp.colorspace = v4l2_sys::v4l2_colorspace_V4L2_COLORSPACE_RAW;
        fmt.fmt.pix_mp = pix_mp;

        unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_S_FMT, &mut fmt as *mut _ as *mut c_void)?
        };

        // Re-read: S_FMT reports the negotiated result, but a fresh G_FMT is
        // the authoritative source for geometry and pitch.
        let mut fmt: v4l2_sys::v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_G_FMT, &mut fmt as *mut _ as *mut c_void)?
        };

        let accepted = unsafe {
            let pix_mp = &fmt.fmt.pix_mp;
            AcceptedFormat {
                width: pix_mp.width,
                height: pix_mp.height,
                pitch: pix_mp.plane_fmt[0].bytesperline,
                size: pix_mp.plane_fmt[0].sizeimage,
                fourcc: pix_mp.pixelformat,
                num_planes: u32::from(pix_mp.num_planes),
            }
        };

        info!(
            "{}: negotiated {}x{}, pitch {} bytes, {} plane(s)",
            self.path, accepted.width, accepted.height, accepted.pitch, accepted.num_planes
        );

        self.format = Some(accepted);
        self.state = StreamState::FormatSet;
        Ok(accepted)
    }

    /// Request a DMABUF pool of `dmabufs.len()` entries and associate each
    /// driver-assigned index with the shared handle at that index. A grant
    /// below two buffers is a fatal precondition failure.
    pub fn bind_buffers(&mut self, dmabufs: &[RawFd]) -> Result<u32> {
        self.expect_state("bind_buffers", StreamState::FormatSet)?;

        let mut req: v4l2_sys::v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = dmabufs.len() as u32;
        req.type_ = v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        req.memory = v4l2_sys::v4l2_memory_V4L2_MEMORY_DMABUF;

        let granted = unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_REQBUFS, &mut req as *mut _ as *mut c_void)
        };
        if let Err(e) = granted {
            if e.raw_os_error() == Some(libc::EINVAL) {
                return Err(Error::MissingCapability {
                    device: self.path.clone(),
                    what: "DMABUF import",
                });
            }
            return Err(e.into());
        }

        if req.count < 2 {
            return Err(Error::InsufficientBuffers {
                granted: req.count,
                required: 2,
            });
        }

        let count = req.count.min(dmabufs.len() as u32);
        self.slots.clear();
        for i in 0..count {
            let mut planes: [v4l2_sys::v4l2_plane; 1] = unsafe { mem::zeroed() };
            let mut buf: v4l2_sys::v4l2_buffer = unsafe { mem::zeroed() };
            buf.type_ = v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
            buf.memory = v4l2_sys::v4l2_memory_V4L2_MEMORY_DMABUF;
            buf.index = i;
            buf.length = 1;
            buf.m.planes = planes.as_mut_ptr();

            unsafe {
                v4l2::ioctl(
                    self.fd,
                    v4l2::vidioc::VIDIOC_QUERYBUF,
                    &mut buf as *mut _ as *mut c_void,
                )?
            };

            self.slots.push(ImportedSlot {
                index: buf.index,
                dmabuf: dmabufs[i as usize],
            });
        }

        info!("{}: bound {} DMABUF buffers", self.path, count);
        self.state = StreamState::BuffersBound;
        Ok(count)
    }

    /// Queue every buffer except index 0 and enable streaming. Index 0 is
    /// held back as the buffer immediately available for display, so the
    /// first scanout never stalls waiting for a capture to complete.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", StreamState::BuffersBound)?;

        let slots: Vec<ImportedSlot> = self.slots[1..].to_vec();
        for slot in slots {
            self.queue(slot.index, slot.dmabuf)?;
        }

        let mut ty =
            v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as std::os::raw::c_int;
        unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_STREAMON, &mut ty as *mut _ as *mut c_void)?
        };

        info!("{}: streaming with {} buffers", self.path, self.slots.len());
        self.state = StreamState::Streaming;
        Ok(())
    }

    /// Non-blocking attempt to reclaim one completed buffer.
    ///
    /// `Ok(None)` means nothing is ready yet; it is part of the normal
    /// contract, not an error. A hard device error is returned for the
    /// caller to log and confine to this cycle.
    pub fn retrieve(&mut self) -> Result<Option<u32>> {
        self.expect_state("retrieve", StreamState::Streaming)?;

        let mut planes: [v4l2_sys::v4l2_plane; 1] = unsafe { mem::zeroed() };
        let mut buf: v4l2_sys::v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = v4l2_sys::v4l2_memory_V4L2_MEMORY_DMABUF;
        buf.length = 1;
        buf.m.planes = planes.as_mut_ptr();

        let dequeued = unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_DQBUF, &mut buf as *mut _ as *mut c_void)
        };
        match dequeued {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if buf.index as usize >= self.slots.len() {
            return Err(Error::BadIndex {
                index: buf.index,
                count: self.slots.len() as u32,
            });
        }

        debug!("{}: captured buffer {}", self.path, buf.index);
        Ok(Some(buf.index))
    }

    /// Re-queue a previously retrieved buffer for the next capture cycle,
    /// rebinding it to `dmabuf`. The default design keeps the index<->handle
    /// mapping fixed, but a swapped backing buffer is accepted.
    pub fn submit(&mut self, index: u32, dmabuf: RawFd) -> Result<()> {
        self.expect_state("submit", StreamState::Streaming)?;
        let count = self.slots.len() as u32;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(Error::BadIndex { index, count })?;
        slot.dmabuf = dmabuf;
        self.queue(index, dmabuf)
    }

    /// Re-queue using the handle the index was bound with.
    pub fn resubmit(&mut self, index: u32) -> Result<()> {
        let dmabuf = self
            .slots
            .get(index as usize)
            .ok_or(Error::BadIndex {
                index,
                count: self.slots.len() as u32,
            })?
            .dmabuf;
        self.submit(index, dmabuf)
    }

    fn queue(&mut self, index: u32, dmabuf: RawFd) -> Result<()> {
        let mut planes: [v4l2_sys::v4l2_plane; 1] = unsafe { mem::zeroed() };
        planes[0].m.fd = dmabuf;

        let mut buf: v4l2_sys::v4l2_buffer = unsafe { mem::zeroed() };
        buf.type_ = v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
        buf.memory = v4l2_sys::v4l2_memory_V4L2_MEMORY_DMABUF;
        buf.index = index;
        buf.length = 1;
        buf.m.planes = planes.as_mut_ptr();

        unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_QBUF, &mut buf as *mut _ as *mut c_void)?
        };
        Ok(())
    }

    /// Disable streaming. Safe to call in any state, including before
    /// `start()` and a second time after a previous `stop()`.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != StreamState::Streaming {
            return Ok(());
        }
        let mut ty =
            v4l2_sys::v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE as std::os::raw::c_int;
        unsafe {
            v4l2::ioctl(self.fd, v4l2::vidioc::VIDIOC_STREAMOFF, &mut ty as *mut _ as *mut c_void)?
        };
        info!("{}: streaming stopped", self.path);
        self.state = StreamState::Stopped;
        Ok(())
    }

    pub fn accepted_format(&self) -> Option<AcceptedFormat> {
        self.format
    }

    pub fn buffer_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn path(&self) -> &str {
        &self.path
    }

}

impl AsFd for CaptureStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the fd is owned by `self.device`, which outlives the borrow.
        unsafe { BorrowedFd::borrow_raw(self.device.handle().fd()) }
    }
}
