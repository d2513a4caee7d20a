//! SMPTE color-bar test pattern.
//!
//! Fills a mapped XRGB8888 buffer with the classic three-band layout, used
//! to verify the scanout path without a camera attached.

fn rgb(r: u32, g: u32, b: u32) -> u32 {
    (r << 16) | (g << 8) | b
}

const TOP: [(u32, u32, u32); 7] = [
    (192, 192, 192), // grey
    (192, 192, 0),   // yellow
    (0, 192, 192),   // cyan
    (0, 192, 0),     // green
    (192, 0, 192),   // magenta
    (192, 0, 0),     // red
    (0, 0, 192),     // blue
];

const MIDDLE: [(u32, u32, u32); 7] = [
    (0, 0, 192),
    (19, 19, 19),
    (192, 0, 192),
    (19, 19, 19),
    (0, 192, 192),
    (19, 19, 19),
    (192, 192, 192),
];

const BOTTOM: [(u32, u32, u32); 8] = [
    (0, 33, 76),     // in-phase
    (255, 255, 255), // super white
    (50, 0, 106),    // quadrature
    (19, 19, 19),
    (9, 9, 9),   // 3.5%
    (19, 19, 19), // 7.5%
    (29, 29, 29), // 11.5%
    (19, 19, 19),
];

fn put(mem: &mut [u8], pitch: usize, x: usize, y: usize, color: u32) {
    let off = y * pitch + x * 4;
    mem[off..off + 4].copy_from_slice(&color.to_le_bytes());
}

/// Fill `mem` with SMPTE bars. `pitch` is in bytes; the buffer must hold at
/// least `pitch * height` bytes.
pub fn fill_smpte_xrgb(mem: &mut [u8], width: usize, height: usize, pitch: usize) {
    for y in 0..height * 6 / 9 {
        for x in 0..width {
            let (r, g, b) = TOP[x * 7 / width];
            put(mem, pitch, x, y, rgb(r, g, b));
        }
    }

    for y in height * 6 / 9..height * 7 / 9 {
        for x in 0..width {
            let (r, g, b) = MIDDLE[x * 7 / width];
            put(mem, pitch, x, y, rgb(r, g, b));
        }
    }

    for y in height * 7 / 9..height {
        for x in 0..width {
            let idx = if x < width * 5 / 7 {
                x * 4 / (width * 5 / 7)
            } else if x < width * 6 / 7 {
                (x - width * 5 / 7) * 3 / (width / 7) + 4
            } else {
                7
            };
            let (r, g, b) = BOTTOM[idx];
            put(mem, pitch, x, y, rgb(r, g, b));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_every_row() {
        let (w, h) = (70, 45);
        let pitch = w * 4;
        let mut mem = vec![0u8; pitch * h];
        fill_smpte_xrgb(&mut mem, w, h, pitch);

        // Top-left is grey, top-right is blue.
        assert_eq!(&mem[0..4], &rgb(192, 192, 192).to_le_bytes());
        let tr = (w - 1) * 4;
        assert_eq!(&mem[tr..tr + 4], &rgb(0, 0, 192).to_le_bytes());

        // Bottom-right corner comes from the last bottom entry.
        let br = (h - 1) * pitch + (w - 1) * 4;
        assert_eq!(&mem[br..br + 4], &rgb(19, 19, 19).to_le_bytes());
    }

    #[test]
    fn respects_pitch_larger_than_row() {
        let (w, h) = (14, 9);
        let pitch = w * 4 + 32;
        let mut mem = vec![0xAAu8; pitch * h];
        fill_smpte_xrgb(&mut mem, w, h, pitch);
        // Padding bytes between rows stay untouched.
        assert_eq!(mem[w * 4], 0xAA);
    }
}
