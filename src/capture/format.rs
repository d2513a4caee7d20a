use drm::buffer::DrmFourcc;
use serde::{Deserialize, Serialize};

/// Pixel formats we support end to end (capture fourcc and scanout fourcc
/// must both exist, since the same physical buffer backs both).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed YUV 4:2:2, U Y0 V Y1. The default: cameras emit it and scanout
    /// hardware composites it without conversion.
    Uyvy,
    /// Packed YUV 4:2:2, Y0 U Y1 V.
    Yuyv,
    /// 32-bit RGB, used by the synthetic test-pattern path.
    Xrgb8888,
}

const fn fourcc(repr: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*repr)
}

impl PixelFormat {
    /// V4L2 pixel format code.
    pub fn v4l2_fourcc(self) -> u32 {
        match self {
            PixelFormat::Uyvy => fourcc(b"UYVY"),
            PixelFormat::Yuyv => fourcc(b"YUYV"),
            PixelFormat::Xrgb8888 => fourcc(b"BX24"),
        }
    }

    /// DRM framebuffer format code.
    pub fn drm_fourcc(self) -> DrmFourcc {
        match self {
            PixelFormat::Uyvy => DrmFourcc::Uyvy,
            PixelFormat::Yuyv => DrmFourcc::Yuyv,
            PixelFormat::Xrgb8888 => DrmFourcc::Xrgb8888,
        }
    }

    /// Bits per pixel of the packed representation.
    pub fn bpp(self) -> u32 {
        match self {
            PixelFormat::Uyvy | PixelFormat::Yuyv => 16,
            PixelFormat::Xrgb8888 => 32,
        }
    }
}

/// Format the capture driver actually accepted. `VIDIOC_S_FMT` may rewrite
/// resolution and pitch, so callers must size framebuffers from this, never
/// from the requested values.
#[derive(Debug, Clone, Copy)]
pub struct AcceptedFormat {
    pub width: u32,
    pub height: u32,
    /// Bytes per line of plane 0.
    pub pitch: u32,
    /// Total bytes per frame of plane 0.
    pub size: u32,
    pub fourcc: u32,
    pub num_planes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_match_kernel_encoding() {
        // 'U''Y''V''Y' little-endian
        assert_eq!(PixelFormat::Uyvy.v4l2_fourcc(), 0x5956_5955);
        assert_eq!(PixelFormat::Yuyv.v4l2_fourcc(), 0x5659_5559);
    }

    #[test]
    fn packed_yuv_is_two_bytes_per_pixel() {
        assert_eq!(PixelFormat::Uyvy.bpp(), 16);
        assert_eq!(PixelFormat::Xrgb8888.bpp(), 32);
    }
}
