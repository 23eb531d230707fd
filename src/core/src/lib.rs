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

//! Multithreaded rendering, command queue, and RHI.
//!
//! The renderer is broken into two fundamental pieces, frontend and
//! backend. The frontend is comprised of command buffers that are submitted
//! for processing by the backend's device loop; fences mark submitted-work
//! points and gate both CPU frees and GPU resource teardown.
//!
//! Render resource lifecycle: a frontend handle is a cheap clone; once
//! every external clone is gone the device destroys the underlying RHI
//! object, but never before the resource's last-use fence retires.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
extern crate adk_imagelib;
extern crate adk_runtime;
extern crate draw_state;

pub mod command;
pub mod device;
pub mod dummy;
pub mod resources;
pub mod rhi;

// pipeline state descriptors come from draw_state, as in the rest of the
// gfx-era stack
pub use draw_state::state;
pub use draw_state::target;

pub use command::{CmdBuf, CmdBufOrder, Command, DataBuffer, DataPointer, Fence, WaitMode,
                  NULL_FENCE};
pub use device::{CmdStream, DeviceCreateError, RenderDevice, RenderDeviceConfig};
pub use dummy::{DummyRhi, DummyResources, DummyStats};
pub use resources::{BlendState, BlendStateDesc, ColorMask, DepthStencilState,
                    DepthStencilStateDesc, Mesh, MeshChannelDesc, MeshDataLayout,
                    MeshDataLayoutDesc, MeshElementDesc, PixelFormat, Program, RasterizerState,
                    RasterizerStateDesc, RenderMemoryUsage, RenderTarget, Resources, RhiError,
                    SamplerDesc, Texture, TextureCreateDesc, TextureFilter, TextureUsage,
                    TextureWrap, UniformBuffer, VertexSemantic};
pub use rhi::{DrawMode, Rhi, RhiCaps};

/// The number of frames that can be queued to render before the frame
/// boundary blocks on the device.
pub const RENDER_MAX_PENDING_FRAMES: usize = 1;
