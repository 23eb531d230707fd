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

//! The application delivery kit core.
//!
//! Hosts streaming-media client applications on constrained consumer
//! devices. This crate is the 2D canvas rendering engine (paths, images,
//! nine-slice panels, SDF rounded rects, video composition), the glyph
//! atlas and text pipeline on top of it, and the bus-facing services
//! (structured logging, metrics, commandlets). The render command pipeline
//! lives in `adk_core`, the message bus in `adk_cncbus`, reserved-memory
//! allocators in `adk_runtime`, and image containers in `adk_imagelib`.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log as log_crate;
extern crate adk_cncbus;
extern crate adk_core;
extern crate adk_imagelib;
extern crate adk_runtime;
extern crate rusttype;

pub mod cmdlets;
pub mod context;
pub mod font;
pub mod gl;
pub mod image;
pub mod log;
pub mod math;
pub mod metrics;
pub mod path;

pub use cmdlets::{CmdletFn, Cmdlets, CMDLET_FLAG};
pub use context::{BlendMode, CanvasConfig, CanvasDimensions, CgContext, CgState, ClipRect,
                  ClipState, ImageTiling, MemoryMode, MemoryRegion, PathOptions, SdfRectParams,
                  SubtitleFrame, VideoFrame, VideoService, CG_DEFAULT_MAX_STATES,
                  CG_DEFAULT_MAX_TESSELLATION_STEPS};
pub use font::{is_accepted_http_status, CgFontContext, CgFontFile, FontFillOptions,
               FontLoadStatus, FontMetrics, MosaicContext, TextBlockOptions,
               TextBlockPageOffsets};
pub use gl::{CgGlConfig, CgGlState, CgGlTexture, CgVertex, SdfRectBorderUniforms,
             SdfRectUniforms};
pub use image::{CgImage, DecodeResult, DecodedFrame, DecodedImage, ImageAnimationState,
                ImageLoadStatus};
pub use math::{color, rect, vec2, Affine, Box2, Color, Margins, Rads, Rect, Vec2};
pub use path::{Path, Rotation, Subpath, SubpathWrap, TessellationParams, Winding};

pub use log::{log_get_min_level, log_msg_print_basic, log_set_min_level, BusLogger, LogLevel,
              LogReceiverHooks, LogRecordHeader, NUM_LOG_LEVELS};
pub use metrics::{MemoryFootprint, MetricType, MetricsPublisher, TimeToFirstInteraction};
