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

//! Canvas images.
//!
//! Decode happens out-of-line on the worker pool (the decoders themselves
//! are external; the canvas consumes decoded pixel buffers). Completion is
//! polled on the canvas thread, which realizes GPU textures and flips the
//! load status. Animated images (GIF frame rings, BIF sprite sheets) keep
//! their decoded frames CPU-side and re-upload on frame advance.

use std::sync::{Arc, Mutex, MutexGuard};

use adk_core::{PixelFormat, Resources, SamplerDesc, TextureUsage, TextureWrap};
use adk_imagelib::{ImageDesc, ImageEncoding, ImageMips};
use adk_runtime::HeapBlock;

use gl::{CgGlState, CgGlTexture};
use math::{rect, Rect};

/// Image async load status, polled by the application.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageLoadStatus {
    /// Resource allocation failed during load.
    OutOfMemory,
    /// The image service returned a proprietary error code; see
    /// `ripcut_error_code`.
    RipcutError,
    /// The image's file could not be read.
    FileError,
    /// The payload is not a supported image format.
    UnrecognizedImageFormat,
    /// General HTTP fetch error.
    HttpFetchError,
    /// The load was canceled.
    Aborted,
    /// Ready for use; draws sample the real texture.
    Complete,
    /// Load in progress.
    Pending,
}

/// Animation control for animated images.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageAnimationState {
    /// Paused; `Running` resumes from the stopped frame.
    Stopped,
    /// Advancing.
    Running,
    /// Restart from the first frame, then run.
    Restart,
}

/// One decoded animation frame.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    /// Frame pixels (same descriptor as the base image).
    pub pixels: Vec<u8>,
    /// Display duration in milliseconds (GIF frames).
    pub duration_ms: i32,
}

/// Decoded image data handed back by an external decoder.
pub struct DecodedImage {
    /// Pixel descriptor.
    pub desc: ImageDesc,
    /// Level-0 pixels.
    pub pixels: Vec<u8>,
    /// Optional alpha-mask plane (own descriptor + pixels).
    pub mask: Option<(ImageDesc, Vec<u8>)>,
    /// Animation frames beyond the first, if any.
    pub frames: Vec<DecodedFrame>,
    /// True for BIF sprite sheets (frame index driven externally),
    /// false for GIF timing-driven animation.
    pub is_bif: bool,
}

/// The result of a decode job.
pub type DecodeResult = Result<DecodedImage, (ImageLoadStatus, i32)>;

pub(crate) struct GifState {
    pub frames: Vec<DecodedFrame>,
    pub req_frame_count: u32,
    pub done_frame_count: u32,
    pub decoded_frame_count: u32,
    pub frame_remaining_duration_ms: i32,
}

pub(crate) struct BifState {
    pub frames: Vec<DecodedFrame>,
    pub req_frame_index: u32,
    pub decoded_frame_index: u32,
}

pub(crate) struct CgImageInner<R: Resources> {
    pub desc: ImageDesc,
    pub pixel_buffer: Vec<u8>,
    pub texture: Option<CgGlTexture<R>>,
    pub texture_mask: Option<CgGlTexture<R>>,
    pub num_frames: u32,
    pub gif: Option<GifState>,
    pub bif: Option<BifState>,
    pub status: ImageLoadStatus,
    pub animation: ImageAnimationState,
    pub ripcut_error_code: i32,
    // decoded data staged by the completion, waiting for texture realization
    pub staged: Option<DecodedImage>,
    // reservation against the owning canvas heap
    pub budget: Option<HeapBlock>,
}

/// A canvas image handle.
pub struct CgImage<R: Resources> {
    pub(crate) inner: Arc<Mutex<CgImageInner<R>>>,
}

impl<R: Resources> Clone for CgImage<R> {
    fn clone(&self) -> Self {
        CgImage {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Resources> CgImage<R> {
    pub(crate) fn new_pending() -> CgImage<R> {
        CgImage {
            inner: Arc::new(Mutex::new(CgImageInner {
                desc: ImageDesc::uncompressed(0, 0, 4),
                pixel_buffer: Vec::new(),
                texture: None,
                texture_mask: None,
                num_frames: 1,
                gif: None,
                bif: None,
                status: ImageLoadStatus::Pending,
                animation: ImageAnimationState::Stopped,
                ripcut_error_code: 0,
                staged: None,
                budget: None,
            })),
        }
    }

    /// An already-complete image over an existing texture (the glyph atlas
    /// and the white texture use this).
    pub fn from_texture(texture: CgGlTexture<R>, desc: ImageDesc) -> CgImage<R> {
        CgImage {
            inner: Arc::new(Mutex::new(CgImageInner {
                desc: desc,
                pixel_buffer: Vec::new(),
                texture: Some(texture),
                texture_mask: None,
                num_frames: 1,
                gif: None,
                bif: None,
                status: ImageLoadStatus::Complete,
                animation: ImageAnimationState::Stopped,
                ripcut_error_code: 0,
                staged: None,
                budget: None,
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<CgImageInner<R>> {
        self.inner.lock().unwrap()
    }

    /// Current load status.
    pub fn load_status(&self) -> ImageLoadStatus {
        self.lock().status
    }

    /// The service-specific error code for `RipcutError` loads.
    pub fn ripcut_error_code(&self) -> i32 {
        self.lock().ripcut_error_code
    }

    /// The image's natural rectangle, `(0, 0, w, h)`; zero until complete.
    pub fn image_rect(&self) -> Rect {
        let inner = self.lock();
        rect(0.0, 0.0, inner.desc.width as f32, inner.desc.height as f32)
    }

    /// Total frames (1 for still images).
    pub fn frame_count(&self) -> u32 {
        self.lock().num_frames
    }

    /// Request a BIF sprite-sheet frame; uploads on the next tick.
    pub fn set_frame_index(&self, index: u32) {
        let mut inner = self.lock();
        let count = inner.num_frames;
        if let Some(ref mut bif) = inner.bif {
            bif.req_frame_index = index.min(count.saturating_sub(1));
        }
    }

    /// Override texture wrap modes (pattern repeat).
    pub fn set_repeat(&self, repeat_x: bool, repeat_y: bool) {
        let mut inner = self.lock();
        if let Some(ref mut tex) = inner.texture {
            tex.sampler_state.u_wrap_mode = if repeat_x {
                TextureWrap::Wrap
            } else {
                TextureWrap::ClampToEdge
            };
            tex.sampler_state.v_wrap_mode = if repeat_y {
                TextureWrap::Wrap
            } else {
                TextureWrap::ClampToEdge
            };
        }
    }

    /// Drive GIF animation.
    pub fn set_animation_state(&self, state: ImageAnimationState) {
        let mut inner = self.lock();
        if state == ImageAnimationState::Restart {
            if let Some(ref mut gif) = inner.gif {
                gif.done_frame_count = 0;
                gif.frame_remaining_duration_ms = 0;
            }
            inner.animation = ImageAnimationState::Running;
        } else {
            inner.animation = state;
        }
    }

    /// Cancel an in-flight load; the completion path frees the decode
    /// result instead of installing it.
    pub fn abort_load(&self) {
        let mut inner = self.lock();
        if inner.status == ImageLoadStatus::Pending {
            inner.status = ImageLoadStatus::Aborted;
        }
    }

    /// True once draws will sample the real texture.
    pub fn is_drawable(&self) -> bool {
        let inner = self.lock();
        inner.status == ImageLoadStatus::Complete && inner.texture.is_some()
    }

    pub(crate) fn drawable_texture(&self) -> Option<CgGlTexture<R>> {
        let inner = self.lock();
        if inner.status == ImageLoadStatus::Complete {
            inner.texture.clone()
        } else {
            None
        }
    }

    pub(crate) fn drawable_mask(&self) -> Option<CgGlTexture<R>> {
        let inner = self.lock();
        if inner.status == ImageLoadStatus::Complete {
            inner.texture_mask.clone()
        } else {
            None
        }
    }

    /// Install a staged decode result (called by the canvas tick with its
    /// GL state). No-op until a decode completion staged data.
    pub(crate) fn realize_staged(&self, gl: &mut CgGlState<R>) {
        let mut inner = self.lock();
        if inner.status == ImageLoadStatus::Aborted {
            inner.staged = None;
            return;
        }
        let staged = match inner.staged.take() {
            Some(s) => s,
            None => return,
        };

        let format = match staged.desc.encoding {
            ImageEncoding::Etc1 => PixelFormat::Etc1,
            ImageEncoding::Uncompressed => {
                if staged.desc.bpp == 1 {
                    PixelFormat::R8Unorm
                } else {
                    PixelFormat::Rgba8Unorm
                }
            }
        };
        let usage = if staged.frames.is_empty() {
            TextureUsage::Static
        } else {
            TextureUsage::Dynamic
        };
        let texture = gl.stream.create_texture_2d(
            ImageMips::single(staged.desc),
            format,
            usage,
            SamplerDesc::default(),
            Some(&staged.pixels),
            "cg_image",
        );
        inner.texture = Some(CgGlTexture::new(texture));

        if let Some((mask_desc, mask_pixels)) = staged.mask {
            let mask = gl.stream.create_texture_2d(
                ImageMips::single(mask_desc),
                PixelFormat::R8Unorm,
                TextureUsage::Static,
                SamplerDesc::default(),
                Some(&mask_pixels),
                "cg_image_mask",
            );
            inner.texture_mask = Some(CgGlTexture::new(mask));
        }

        inner.desc = staged.desc;
        inner.pixel_buffer = staged.pixels;
        inner.num_frames = 1 + staged.frames.len() as u32;
        if !staged.frames.is_empty() {
            if staged.is_bif {
                inner.bif = Some(BifState {
                    frames: staged.frames,
                    req_frame_index: 0,
                    decoded_frame_index: 0,
                });
            } else {
                let first_duration = staged.frames[0].duration_ms;
                inner.gif = Some(GifState {
                    frames: staged.frames,
                    req_frame_count: 0,
                    done_frame_count: 0,
                    decoded_frame_count: 0,
                    frame_remaining_duration_ms: first_duration,
                });
                inner.animation = ImageAnimationState::Running;
            }
        }
        inner.status = ImageLoadStatus::Complete;
    }

    /// Advance GIF timing by `delta_ms`, re-uploading the texture when the
    /// frame flips.
    pub(crate) fn tick_gif(&self, gl: &mut CgGlState<R>, delta_ms: i32) {
        let mut inner = self.lock();
        if inner.animation != ImageAnimationState::Running {
            return;
        }
        let texture = match inner.texture.clone() {
            Some(t) => t,
            None => return,
        };
        let upload = {
            let gif = match inner.gif {
                Some(ref mut g) => g,
                None => return,
            };
            if gif.frames.is_empty() {
                return;
            }
            gif.frame_remaining_duration_ms -= delta_ms;
            if gif.frame_remaining_duration_ms > 0 {
                None
            } else {
                gif.done_frame_count = (gif.done_frame_count + 1) % (gif.frames.len() as u32 + 1);
                gif.decoded_frame_count = gif.done_frame_count;
                let frame = gif.done_frame_count;
                let (pixels, duration);
                if frame == 0 {
                    pixels = None; // base frame lives in pixel_buffer
                    duration = gif.frames[0].duration_ms;
                } else {
                    let f = &gif.frames[frame as usize - 1];
                    pixels = Some(f.pixels.clone());
                    duration = if (frame as usize) < gif.frames.len() {
                        gif.frames[frame as usize].duration_ms
                    } else {
                        gif.frames[0].duration_ms
                    };
                }
                gif.frame_remaining_duration_ms += duration.max(1);
                Some(pixels)
            }
        };
        if let Some(pixels) = upload {
            let bytes = match pixels {
                Some(p) => p,
                None => inner.pixel_buffer.clone(),
            };
            gl.stream.upload_texture(&texture.texture, &bytes);
        }
    }

    /// Upload the requested BIF frame if it changed.
    pub(crate) fn tick_bif(&self, gl: &mut CgGlState<R>) {
        let mut inner = self.lock();
        let texture = match inner.texture.clone() {
            Some(t) => t,
            None => return,
        };
        let pixels = {
            let bif = match inner.bif {
                Some(ref mut b) => b,
                None => return,
            };
            if bif.req_frame_index == bif.decoded_frame_index {
                return;
            }
            bif.decoded_frame_index = bif.req_frame_index;
            let idx = bif.req_frame_index as usize;
            if idx == 0 {
                None
            } else {
                Some(bif.frames[idx - 1].pixels.clone())
            }
        };
        let bytes = match pixels {
            Some(p) => p,
            None => inner.pixel_buffer.clone(),
        };
        gl.stream.upload_texture(&texture.texture, &bytes);
    }
}
