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

//! Image containers for the ADK core.
//!
//! The core consumes decoded pixel buffers; this crate supplies the image
//! descriptor those buffers travel with, the PVR/ETC1 container parser, the
//! screenshot capture/compare toolkit, and a bounded gzip inflate helper.

#[macro_use]
extern crate log;
extern crate adk_runtime;
extern crate flate2;
extern crate image as imagecrate;

pub mod gzip;
pub mod pvr;
pub mod screenshot;
mod tga;

pub use gzip::{inflate_gzip, GzipError};
pub use pvr::{load_pvr_from_memory, PvrError, PvrImage};
pub use screenshot::{Screenshot, ScreenshotError, SaveFileType};

/// How an image's payload bytes are encoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageEncoding {
    /// Raw rows of `bpp`-byte pixels.
    Uncompressed,
    /// ETC1 4x4 block compression, 8 bytes per block.
    Etc1,
}

/// Descriptor for a (sub-)image. `x`/`y` locate the region within a larger
/// surface for sub-uploads; a standalone image uses (0, 0).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageDesc {
    /// Payload encoding.
    pub encoding: ImageEncoding,
    /// Region origin within the destination surface.
    pub x: u32,
    /// Region origin within the destination surface.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Depth; always 1 for 2D surfaces.
    pub depth: u32,
    /// Bytes per pixel (uncompressed only).
    pub bpp: u32,
    /// Bytes per row (uncompressed only).
    pub pitch: u32,
    /// Bytes per slice (uncompressed only).
    pub spitch: u32,
    /// Total payload length in bytes.
    pub data_len: u32,
}

impl ImageDesc {
    /// Descriptor for a tightly packed uncompressed 2D image.
    pub fn uncompressed(width: u32, height: u32, bpp: u32) -> ImageDesc {
        ImageDesc {
            encoding: ImageEncoding::Uncompressed,
            x: 0,
            y: 0,
            width: width,
            height: height,
            depth: 1,
            bpp: bpp,
            pitch: width * bpp,
            spitch: width * height * bpp,
            data_len: width * height * bpp,
        }
    }

    /// Payload length for a block-compressed format with the given bytes
    /// per 4x4 block.
    pub fn block_compressed_len(width: u32, height: u32, bytes_per_block: u32) -> u32 {
        ((width + 3) / 4) * ((height + 3) / 4) * bytes_per_block
    }
}

/// A mipmap chain; level 0 is the base image. The core's canvas textures
/// are single-level.
#[derive(Clone, Debug)]
pub struct ImageMips {
    /// Per-level descriptors, base first.
    pub levels: Vec<ImageDesc>,
}

impl ImageMips {
    /// A single-level chain.
    pub fn single(desc: ImageDesc) -> ImageMips {
        ImageMips { levels: vec![desc] }
    }
}
