// Copyright 2021 The ADK Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Capturing, comparing, saving, and loading screenshots.
//!
//! A screenshot is a plain uncompressed pixel rectangle; capture itself is
//! a readback opcode on the render device, so this module only deals with
//! the pixels once they are on the CPU.

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use imagecrate::{self, ColorType, GenericImage};
use tga;

/// File container used when saving.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaveFileType {
    /// Uncompressed true-color TGA.
    Tga,
    /// PNG.
    Png,
}

impl SaveFileType {
    /// The conventional file extension, with dot.
    pub fn extension(&self) -> &'static str {
        match *self {
            SaveFileType::Tga => ".tga",
            SaveFileType::Png => ".png",
        }
    }
}

/// Screenshot IO failures.
#[derive(Debug)]
pub enum ScreenshotError {
    /// Underlying file IO failed.
    Io(::std::io::Error),
    /// The buffer is not a recognized TGA or PNG image.
    UnrecognizedFormat,
    /// PNG encode/decode failed.
    Codec(String),
}

impl fmt::Display for ScreenshotError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ScreenshotError::Io(ref e) => write!(f, "screenshot io error: {}", e),
            ScreenshotError::UnrecognizedFormat => write!(f, "unrecognized screenshot format"),
            ScreenshotError::Codec(ref m) => write!(f, "screenshot codec error: {}", m),
        }
    }
}

impl ::std::error::Error for ScreenshotError {
    fn description(&self) -> &str {
        "screenshot error"
    }
}

impl From<::std::io::Error> for ScreenshotError {
    fn from(e: ::std::io::Error) -> ScreenshotError {
        ScreenshotError::Io(e)
    }
}

/// An uncompressed pixel rectangle, rows top-down, `bpp` of 3 (RGB) or
/// 4 (RGBA).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Screenshot {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bpp: u32,
    /// Pixel rows, `width * height * bpp` bytes.
    pub pixels: Vec<u8>,
}

impl Screenshot {
    /// Wrap captured pixels.
    pub fn from_pixels(width: u32, height: u32, bpp: u32, pixels: Vec<u8>) -> Screenshot {
        assert!(bpp == 3 || bpp == 4);
        assert_eq!(pixels.len(), (width * height * bpp) as usize);
        Screenshot {
            width: width,
            height: height,
            bpp: bpp,
            pixels: pixels,
        }
    }

    /// Encode into an in-memory file of the given type.
    pub fn encode(&self, file_type: SaveFileType) -> Result<Vec<u8>, ScreenshotError> {
        match file_type {
            SaveFileType::Tga => Ok(tga::encode(self.width, self.height, self.bpp, &self.pixels)),
            SaveFileType::Png => {
                let mut out = Vec::new();
                let color = if self.bpp == 4 {
                    ColorType::RGBA(8)
                } else {
                    ColorType::RGB(8)
                };
                imagecrate::png::PNGEncoder::new(&mut out)
                    .encode(&self.pixels, self.width, self.height, color)
                    .map_err(|e| ScreenshotError::Codec(e.to_string()))?;
                Ok(out)
            }
        }
    }

    /// Save to `path`.
    pub fn save(&self, path: &Path, file_type: SaveFileType) -> Result<(), ScreenshotError> {
        let bytes = self.encode(file_type)?;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        Ok(())
    }

    /// Decode from an in-memory TGA or PNG file.
    pub fn load_from_memory(bytes: &[u8]) -> Result<Screenshot, ScreenshotError> {
        if let Some((w, h, bpp, pixels)) = tga::decode(bytes) {
            return Ok(Screenshot::from_pixels(w, h, bpp, pixels));
        }
        match imagecrate::load_from_memory(bytes) {
            Ok(img) => {
                let (w, h) = img.dimensions();
                let rgba = img.to_rgba();
                Ok(Screenshot::from_pixels(w, h, 4, rgba.into_raw()))
            }
            Err(_) => Err(ScreenshotError::UnrecognizedFormat),
        }
    }

    /// Load from `path`.
    pub fn load(path: &Path) -> Result<Screenshot, ScreenshotError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Screenshot::load_from_memory(&bytes)
    }

    /// Compare against a baseline. Every channel of every pixel must be
    /// within `tolerance`; the first breach is logged and fails the
    /// comparison.
    pub fn compare(&self, baseline: &Screenshot, tolerance: i32) -> bool {
        assert!(
            self.width == baseline.width
                && self.height == baseline.height
                && self.bpp == baseline.bpp
        );
        for (i, (&test, &base)) in self.pixels.iter().zip(baseline.pixels.iter()).enumerate() {
            let delta = (test as i32 - base as i32).abs();
            if delta > tolerance {
                let px = i as u32 / self.bpp;
                warn!(
                    "image tolerance exceeded comparing test case and baseline: delta {} at x {}, y {}, channel {}",
                    delta,
                    px % self.width,
                    px / self.width,
                    i as u32 % self.bpp
                );
                return false;
            }
        }
        true
    }

    /// Write diagnostic images for a failed comparison: an overlay copy of
    /// `self` with every out-of-tolerance pixel painted white, and a
    /// per-channel absolute delta image. Files are `<prefix>_overlay` and
    /// `<prefix>_deltas` with the container's extension. Returns true when
    /// at least one pixel breached the threshold.
    pub fn dump_deltas(
        &self,
        baseline: &Screenshot,
        threshold: i32,
        file_type: SaveFileType,
        prefix: &str,
    ) -> Result<bool, ScreenshotError> {
        assert!(
            self.width == baseline.width
                && self.height == baseline.height
                && self.bpp == baseline.bpp
        );
        let bpp = self.bpp as usize;
        let mut overlay = self.pixels.clone();
        let mut deltas = vec![0u8; self.pixels.len()];
        let mut breached = false;

        for px in 0..(self.width * self.height) as usize {
            let mut px_breached = false;
            for c in 0..bpp {
                let i = px * bpp + c;
                let delta = (self.pixels[i] as i32 - baseline.pixels[i] as i32).abs();
                deltas[i] = delta as u8;
                if delta > threshold {
                    px_breached = true;
                }
            }
            if px_breached {
                breached = true;
                for c in 0..bpp {
                    overlay[px * bpp + c] = 0xff;
                }
            }
        }

        let overlay_shot = Screenshot::from_pixels(self.width, self.height, self.bpp, overlay);
        let delta_shot = Screenshot::from_pixels(self.width, self.height, self.bpp, deltas);
        overlay_shot.save(
            Path::new(&format!("{}_overlay{}", prefix, file_type.extension())),
            file_type,
        )?;
        delta_shot.save(
            Path::new(&format!("{}_deltas{}", prefix, file_type.extension())),
            file_type,
        )?;
        Ok(breached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(w: u32, h: u32) -> Screenshot {
        let mut pixels = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let v = if (x + y) % 2 == 0 { 0xff } else { 0x20 };
                pixels.extend_from_slice(&[v, v / 2, v / 3, 0xff]);
            }
        }
        Screenshot::from_pixels(w, h, 4, pixels)
    }

    #[test]
    fn tga_round_trip_is_lossless() {
        let shot = checkerboard(8, 6);
        let bytes = shot.encode(SaveFileType::Tga).unwrap();
        let loaded = Screenshot::load_from_memory(&bytes).unwrap();
        assert!(loaded.compare(&shot, 0));
        assert_eq!(loaded, shot);
    }

    #[test]
    fn png_round_trip_is_lossless() {
        let shot = checkerboard(8, 6);
        let bytes = shot.encode(SaveFileType::Png).unwrap();
        let loaded = Screenshot::load_from_memory(&bytes).unwrap();
        assert!(loaded.compare(&shot, 0));
    }

    #[test]
    fn compare_respects_tolerance() {
        let base = checkerboard(4, 4);
        let mut test = base.clone();
        test.pixels[5] = test.pixels[5].wrapping_add(3);
        assert!(!test.compare(&base, 2));
        assert!(test.compare(&base, 3));
    }
}
