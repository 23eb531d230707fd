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

//! Render resources.
//!
//! Frontend handles are reference-counted wrappers around RHI objects. A
//! handle is created immediately; the RHI object behind it is installed by
//! the device thread when the creation opcode executes. Teardown is
//! deferred: the device destroys the RHI object only after every external
//! handle is dropped and the resource's recorded last-use fence retires.

use std::fmt;
use std::sync::{Arc, Mutex};

use adk_imagelib::{ImageDesc, ImageMips};
use draw_state::state;

use command::{Fence, NULL_FENCE};
use rhi::Rhi;

/// Associated RHI object types. Mirrors the finite set of render resource
/// kinds; every handle type must be shareable across the device thread
/// boundary.
pub trait Resources: Clone + fmt::Debug + Eq + PartialEq + Sized + 'static {
    /// GPU texture object.
    type Texture: Clone + fmt::Debug + Send + Sync + 'static;
    /// Linked shader program.
    type Program: Clone + fmt::Debug + Send + Sync + 'static;
    /// Vertex layout object.
    type MeshDataLayout: Clone + fmt::Debug + Send + Sync + 'static;
    /// Mesh (vertex channel buffers + layout binding).
    type Mesh: Clone + fmt::Debug + Send + Sync + 'static;
    /// Blend state object.
    type BlendState: Clone + fmt::Debug + Send + Sync + 'static;
    /// Depth/stencil state object.
    type DepthStencilState: Clone + fmt::Debug + Send + Sync + 'static;
    /// Rasterizer state object.
    type RasterizerState: Clone + fmt::Debug + Send + Sync + 'static;
    /// Uniform buffer object.
    type UniformBuffer: Clone + fmt::Debug + Send + Sync + 'static;
    /// Render target object.
    type RenderTarget: Clone + fmt::Debug + Send + Sync + 'static;
}

/// Error produced by the RHI when creating or updating an object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RhiError {
    /// Human-readable description from the driver layer.
    pub message: String,
}

impl fmt::Display for RhiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rhi error: {}", self.message)
    }
}

impl ::std::error::Error for RhiError {
    fn description(&self) -> &str {
        "rhi error"
    }
}

/// Texture pixel formats supported by the canvas stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    /// Single 8-bit channel (the glyph atlas).
    R8Unorm,
    /// 8-bit RGBA.
    Rgba8Unorm,
    /// ETC1 block compression, 8 bytes per 4x4 block.
    Etc1,
}

impl PixelFormat {
    /// Payload length in bytes for a `width` x `height` image.
    pub fn data_len(&self, width: u32, height: u32) -> u32 {
        match *self {
            PixelFormat::R8Unorm => width * height,
            PixelFormat::Rgba8Unorm => width * height * 4,
            PixelFormat::Etc1 => ImageDesc::block_compressed_len(width, height, 8),
        }
    }
}

/// Texture sampling filter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextureFilter {
    /// Nearest texel.
    Nearest,
    /// Linear interpolation.
    Linear,
}

/// Texture coordinate wrap behavior.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextureWrap {
    /// Clamp to edge texels.
    ClampToEdge,
    /// Repeat.
    Wrap,
    /// Mirrored repeat.
    Mirror,
}

/// Sampler descriptor attached to a texture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    /// Minification filter.
    pub min_filter: TextureFilter,
    /// Magnification filter.
    pub max_filter: TextureFilter,
    /// U coordinate wrap.
    pub u_wrap_mode: TextureWrap,
    /// V coordinate wrap.
    pub v_wrap_mode: TextureWrap,
    /// W coordinate wrap.
    pub w_wrap_mode: TextureWrap,
    /// Border color for border-clamped samplers.
    pub border_color: [f32; 4],
    /// Anisotropy cap; 1 disables.
    pub max_anisotropy: u8,
}

impl Default for SamplerDesc {
    fn default() -> SamplerDesc {
        SamplerDesc {
            min_filter: TextureFilter::Linear,
            max_filter: TextureFilter::Linear,
            u_wrap_mode: TextureWrap::ClampToEdge,
            v_wrap_mode: TextureWrap::ClampToEdge,
            w_wrap_mode: TextureWrap::ClampToEdge,
            border_color: [1.0, 1.0, 1.0, 1.0],
            max_anisotropy: 1,
        }
    }
}

/// Expected update frequency for a texture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TextureUsage {
    /// Uploaded once.
    Static,
    /// Updated during rendering (atlas, video planes).
    Dynamic,
}

/// Everything the device needs to realize a texture.
#[derive(Clone, Debug)]
pub struct TextureCreateDesc {
    /// Mip chain; level 0 carries the dimensions.
    pub mips: ImageMips,
    /// Pixel format of every level.
    pub format: PixelFormat,
    /// Update frequency.
    pub usage: TextureUsage,
    /// Sampler state.
    pub sampler: SamplerDesc,
}

/// Which shader input a vertex element feeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VertexSemantic {
    /// 2D position.
    Position,
    /// Color, doubling as UV in the canvas vertex.
    Color,
}

/// One element of a vertex channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MeshElementDesc {
    /// Input this element feeds.
    pub semantic: VertexSemantic,
    /// Byte offset within the vertex.
    pub offset: usize,
    /// Float component count.
    pub count: usize,
}

/// One interleaved vertex channel.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshChannelDesc {
    /// Vertex stride in bytes.
    pub stride: usize,
    /// Elements inside one vertex.
    pub elements: Vec<MeshElementDesc>,
}

/// Mesh vertex layout: one descriptor per channel.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshDataLayoutDesc {
    /// Channel descriptors.
    pub channels: Vec<MeshChannelDesc>,
}

bitflags!(
    /// Channels written to the color target.
    pub struct ColorMask: u8 {
        /// Red.
        const RED = 0x1;
        /// Green.
        const GREEN = 0x2;
        /// Blue.
        const BLUE = 0x4;
        /// Alpha.
        const ALPHA = 0x8;
        /// All channels.
        const ALL = 0xf;
        /// Color channels without alpha.
        const COLOR = 0x7;
    }
);

/// Blend descriptor: optional blend function plus the color write mask.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendStateDesc {
    /// Blend function; `None` writes source values through.
    pub blend: Option<state::Blend>,
    /// Channels written to the target.
    pub color_write_mask: ColorMask,
}

/// Depth/stencil descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthStencilStateDesc {
    /// Depth test; `None` disables.
    pub depth: Option<state::Depth>,
    /// Stencil test; `None` disables.
    pub stencil: Option<state::Stencil>,
}

/// Rasterizer descriptor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RasterizerStateDesc {
    /// Fill/cull configuration.
    pub rasterizer: state::Rasterizer,
    /// Whether the scissor rect applies.
    pub scissor_enabled: bool,
}

/// Tracked render memory, updated on resource creation/destruction when
/// tracking is enabled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RenderMemoryUsage {
    /// High-water mark of `total_memory`.
    pub peak_memory: u64,
    /// Bytes currently alive.
    pub total_memory: u64,
    /// Bytes held by meshes.
    pub mesh_memory: u64,
    /// Bytes held by textures.
    pub texture_memory: u64,
    /// Bytes held by uniform buffers.
    pub uniform_buffer_memory: u64,
}

pub(crate) enum RhiSlot<T> {
    Pending,
    Ready(T),
    Failed(RhiError),
}

/// Shared header of every resource: debug tag plus the last-use fence that
/// gates destruction.
pub struct ResourceInner<H, D> {
    pub(crate) tag: &'static str,
    pub(crate) fence: Mutex<Fence>,
    pub(crate) desc: D,
    pub(crate) slot: Mutex<RhiSlot<H>>,
}

impl<H, D> ResourceInner<H, D> {
    pub(crate) fn new(desc: D, tag: &'static str) -> Arc<ResourceInner<H, D>> {
        Arc::new(ResourceInner {
            tag: tag,
            fence: Mutex::new(NULL_FENCE),
            desc: desc,
            slot: Mutex::new(RhiSlot::Pending),
        })
    }

    pub(crate) fn install(&self, result: Result<H, RhiError>) {
        let mut slot = self.slot.lock().unwrap();
        match result {
            Ok(handle) => *slot = RhiSlot::Ready(handle),
            Err(e) => {
                error!("resource '{}' creation failed: {}", self.tag, e);
                *slot = RhiSlot::Failed(e);
            }
        }
    }

    pub(crate) fn with_handle<T, F: FnOnce(&H) -> T>(&self, f: F) -> Option<T> {
        match *self.slot.lock().unwrap() {
            RhiSlot::Ready(ref h) => Some(f(h)),
            _ => None,
        }
    }

    pub(crate) fn take_handle(&self) -> Option<H> {
        let mut slot = self.slot.lock().unwrap();
        match ::std::mem::replace(&mut *slot, RhiSlot::Pending) {
            RhiSlot::Ready(h) => Some(h),
            other => {
                *slot = other;
                None
            }
        }
    }
}

macro_rules! resource_handle {
    ($(#[$doc:meta])* $name:ident, $rhi_ty:ident, $desc:ty) => {
        $(#[$doc])*
        pub struct $name<R: Resources>(pub(crate) Arc<ResourceInner<R::$rhi_ty, $desc>>);

        impl<R: Resources> $name<R> {
            /// Debug tag supplied at creation.
            pub fn tag(&self) -> &'static str {
                self.0.tag
            }

            /// The fence gating this resource's destruction.
            pub fn last_use_fence(&self) -> Fence {
                *self.0.fence.lock().unwrap()
            }

            /// Record a use: destruction is deferred past `fence`.
            pub fn set_last_use_fence(&self, fence: Fence) {
                *self.0.fence.lock().unwrap() = fence;
            }

            /// True once the device realized the RHI object.
            pub fn is_ready(&self) -> bool {
                match *self.0.slot.lock().unwrap() {
                    RhiSlot::Ready(_) => true,
                    _ => false,
                }
            }

            /// The creation error, if the device failed to realize this
            /// resource.
            pub fn error(&self) -> Option<RhiError> {
                match *self.0.slot.lock().unwrap() {
                    RhiSlot::Failed(ref e) => Some(e.clone()),
                    _ => None,
                }
            }
        }

        impl<R: Resources> Clone for $name<R> {
            fn clone(&self) -> Self {
                $name(self.0.clone())
            }
        }

        impl<R: Resources> PartialEq for $name<R> {
            fn eq(&self, other: &Self) -> bool {
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl<R: Resources> fmt::Debug for $name<R> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.tag)
            }
        }
    };
}

resource_handle! {
    /// A 2D texture plus its sampler descriptor.
    Texture, Texture, TextureCreateDesc
}
resource_handle! {
    /// A linked shader program created from a vertex/fragment binary pair.
    Program, Program, ()
}
resource_handle! {
    /// A mesh vertex layout.
    MeshDataLayout, MeshDataLayout, MeshDataLayoutDesc
}
resource_handle! {
    /// A mesh: per-channel GPU buffers bound to a layout.
    Mesh, Mesh, MeshDesc
}
resource_handle! {
    /// A blend state object.
    BlendState, BlendState, BlendStateDesc
}
resource_handle! {
    /// A depth/stencil state object.
    DepthStencilState, DepthStencilState, DepthStencilStateDesc
}
resource_handle! {
    /// A rasterizer state object.
    RasterizerState, RasterizerState, RasterizerStateDesc
}
resource_handle! {
    /// A typed uniform block.
    UniformBuffer, UniformBuffer, UniformBufferDesc
}
resource_handle! {
    /// An offscreen render target.
    RenderTarget, RenderTarget, ()
}

/// Mesh creation data: byte sizes of the channel buffers (contents are
/// uploaded indirectly via mesh-channel-data opcodes).
#[derive(Debug)]
pub struct MeshDesc {
    /// Per-channel buffer sizes in bytes.
    pub channel_sizes: Vec<usize>,
    /// Content hash of the most recent indirect upload.
    pub(crate) hash: Mutex<u32>,
}

/// Uniform buffer creation data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UniformBufferDesc {
    /// Block size in bytes.
    pub size: usize,
}

impl<R: Resources> Texture<R> {
    /// Width of mip level 0.
    pub fn width(&self) -> u32 {
        self.0.desc.mips.levels[0].width
    }

    /// Height of mip level 0.
    pub fn height(&self) -> u32 {
        self.0.desc.mips.levels[0].height
    }

    /// Pixel format.
    pub fn format(&self) -> PixelFormat {
        self.0.desc.format
    }

    /// Sampler descriptor the texture was created with.
    pub fn sampler(&self) -> SamplerDesc {
        self.0.desc.sampler
    }
}

impl<R: Resources> Mesh<R> {
    /// Total bytes across channel buffers.
    pub fn byte_size(&self) -> usize {
        self.0.desc.channel_sizes.iter().sum()
    }

    /// Hash of the most recent channel upload.
    pub fn hash(&self) -> u32 {
        *self.0.desc.hash.lock().unwrap()
    }

    pub(crate) fn set_hash(&self, hash: u32) {
        *self.0.desc.hash.lock().unwrap() = hash;
    }
}

impl<R: Resources> UniformBuffer<R> {
    /// Block size in bytes.
    pub fn size(&self) -> usize {
        self.0.desc.size
    }
}

/// Device-side record of a live resource; the tag dispatches teardown.
pub(crate) enum AnyResource<R: Resources> {
    Texture(Arc<ResourceInner<R::Texture, TextureCreateDesc>>),
    Program(Arc<ResourceInner<R::Program, ()>>),
    MeshDataLayout(Arc<ResourceInner<R::MeshDataLayout, MeshDataLayoutDesc>>),
    Mesh(Arc<ResourceInner<R::Mesh, MeshDesc>>),
    BlendState(Arc<ResourceInner<R::BlendState, BlendStateDesc>>),
    DepthStencilState(Arc<ResourceInner<R::DepthStencilState, DepthStencilStateDesc>>),
    RasterizerState(Arc<ResourceInner<R::RasterizerState, RasterizerStateDesc>>),
    UniformBuffer(Arc<ResourceInner<R::UniformBuffer, UniformBufferDesc>>),
    RenderTarget(Arc<ResourceInner<R::RenderTarget, ()>>),
}

impl<R: Resources> AnyResource<R> {
    /// External handle count (excluding this tracker entry).
    pub fn external_refs(&self) -> usize {
        self.strong_count() - 1
    }

    fn strong_count(&self) -> usize {
        match *self {
            AnyResource::Texture(ref a) => Arc::strong_count(a),
            AnyResource::Program(ref a) => Arc::strong_count(a),
            AnyResource::MeshDataLayout(ref a) => Arc::strong_count(a),
            AnyResource::Mesh(ref a) => Arc::strong_count(a),
            AnyResource::BlendState(ref a) => Arc::strong_count(a),
            AnyResource::DepthStencilState(ref a) => Arc::strong_count(a),
            AnyResource::RasterizerState(ref a) => Arc::strong_count(a),
            AnyResource::UniformBuffer(ref a) => Arc::strong_count(a),
            AnyResource::RenderTarget(ref a) => Arc::strong_count(a),
        }
    }

    /// The fence that must retire before teardown.
    pub fn fence(&self) -> Fence {
        match *self {
            AnyResource::Texture(ref a) => *a.fence.lock().unwrap(),
            AnyResource::Program(ref a) => *a.fence.lock().unwrap(),
            AnyResource::MeshDataLayout(ref a) => *a.fence.lock().unwrap(),
            AnyResource::Mesh(ref a) => *a.fence.lock().unwrap(),
            AnyResource::BlendState(ref a) => *a.fence.lock().unwrap(),
            AnyResource::DepthStencilState(ref a) => *a.fence.lock().unwrap(),
            AnyResource::RasterizerState(ref a) => *a.fence.lock().unwrap(),
            AnyResource::UniformBuffer(ref a) => *a.fence.lock().unwrap(),
            AnyResource::RenderTarget(ref a) => *a.fence.lock().unwrap(),
        }
    }

    /// Bytes this resource accounts for in tracking, by category.
    /// Returns `(texture, mesh, uniform)` byte deltas.
    pub fn tracked_bytes(&self) -> (u64, u64, u64) {
        match *self {
            AnyResource::Texture(ref a) => {
                let bytes: u64 = a
                    .desc
                    .mips
                    .levels
                    .iter()
                    .map(|l| a.desc.format.data_len(l.width, l.height) as u64)
                    .sum();
                (bytes, 0, 0)
            }
            AnyResource::Mesh(ref a) => {
                let bytes: u64 = a.desc.channel_sizes.iter().map(|&s| s as u64).sum();
                (0, bytes, 0)
            }
            AnyResource::UniformBuffer(ref a) => (0, 0, a.desc.size as u64),
            _ => (0, 0, 0),
        }
    }

    /// Tear down the RHI object (if it was ever realized).
    pub fn destroy<D: Rhi<Resources = R>>(self, rhi: &mut D) {
        match self {
            AnyResource::Texture(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_texture(h);
                }
            }
            AnyResource::Program(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_program(h);
                }
            }
            AnyResource::MeshDataLayout(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_mesh_data_layout(h);
                }
            }
            AnyResource::Mesh(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_mesh(h);
                }
            }
            AnyResource::BlendState(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_blend_state(h);
                }
            }
            AnyResource::DepthStencilState(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_depth_stencil_state(h);
                }
            }
            AnyResource::RasterizerState(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_rasterizer_state(h);
                }
            }
            AnyResource::UniformBuffer(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_uniform_buffer(h);
                }
            }
            AnyResource::RenderTarget(a) => {
                if let Some(h) = a.take_handle() {
                    rhi.destroy_render_target(h);
                }
            }
        }
    }
}
