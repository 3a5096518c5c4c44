//! Pixel formats and frame capture.

use std::os::raw::c_uint;

/// Pixel layouts a core may select with `SET_PIXEL_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 0RGB1555, the libretro default.
    #[default]
    Rgb1555,
    Xrgb8888,
    Rgb565,
}

impl PixelFormat {
    /// Decode a libretro pixel format code; unknown codes are rejected.
    pub fn from_raw(code: c_uint) -> Option<Self> {
        match code {
            0 => Some(Self::Rgb1555),
            1 => Some(Self::Xrgb8888),
            2 => Some(Self::Rgb565),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb1555 | Self::Rgb565 => 2,
            Self::Xrgb8888 => 4,
        }
    }
}

/// Last frame presented by the core, as tightly packed RGBA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Frame {
    /// Convert a native frame into RGBA.
    ///
    /// `src` holds `height` rows of `pitch` bytes (the last row may be cut
    /// to its visible width). Returns false and leaves the frame untouched
    /// when `src` is too short for the given geometry.
    pub fn capture(&mut self, format: PixelFormat, src: &[u8], width: u32, height: u32, pitch: usize) -> bool {
        let (w, h) = (width as usize, height as usize);
        let row_bytes = w * format.bytes_per_pixel();
        if h > 0 && (pitch < row_bytes || src.len() < pitch * (h - 1) + row_bytes) {
            return false;
        }

        self.width = width;
        self.height = height;
        self.pixels.clear();
        self.pixels.reserve(w * h * 4);
        for y in 0..h {
            let row = &src[y * pitch..y * pitch + row_bytes];
            match format {
                PixelFormat::Xrgb8888 => {
                    for px in row.chunks_exact(4) {
                        let p = u32::from_ne_bytes([px[0], px[1], px[2], px[3]]);
                        self.pixels
                            .extend_from_slice(&[(p >> 16) as u8, (p >> 8) as u8, p as u8, 0xFF]);
                    }
                }
                PixelFormat::Rgb565 => {
                    for px in row.chunks_exact(2) {
                        let p = u16::from_ne_bytes([px[0], px[1]]);
                        let r = ((p >> 11) & 0x1F) as u8;
                        let g = ((p >> 5) & 0x3F) as u8;
                        let b = (p & 0x1F) as u8;
                        self.pixels
                            .extend_from_slice(&[expand5(r), (g << 2) | (g >> 4), expand5(b), 0xFF]);
                    }
                }
                PixelFormat::Rgb1555 => {
                    for px in row.chunks_exact(2) {
                        let p = u16::from_ne_bytes([px[0], px[1]]);
                        let r = ((p >> 10) & 0x1F) as u8;
                        let g = ((p >> 5) & 0x1F) as u8;
                        let b = (p & 0x1F) as u8;
                        self.pixels
                            .extend_from_slice(&[expand5(r), expand5(g), expand5(b), 0xFF]);
                    }
                }
            }
        }
        true
    }

    /// Binary PPM (P6) encoding of the frame, alpha dropped.
    pub fn to_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        for px in self.pixels.chunks_exact(4) {
            out.extend_from_slice(&px[..3]);
        }
        out
    }
}

fn expand5(v: u8) -> u8 {
    (v << 3) | (v >> 2)
}
