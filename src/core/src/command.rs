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

//! Command buffers: typed opcodes with inline data, recycled through the
//! device free list and fenced by retirement generation.

use std::mem;
use std::sync::Arc;

use draw_state::target;

use resources::{BlendStateDesc, DepthStencilStateDesc, MeshDataLayoutDesc, MeshDesc,
                RasterizerStateDesc, ResourceInner, Resources, SamplerDesc, TextureCreateDesc,
                UniformBufferDesc};
use rhi::DrawMode;

type Offset = u32;
type Size = u32;

/// The place of some data in the data buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataPointer(Offset, Size);

/// A buffer of data accompanying the commands. It can be vertex data,
/// texture updates, uniform blocks, or shader binaries.
pub struct DataBuffer {
    buf: Vec<u8>,
}

impl DataBuffer {
    /// Create a fresh new data buffer.
    pub fn new() -> DataBuffer {
        DataBuffer { buf: Vec::new() }
    }

    /// Clear all the data but retain the allocated storage.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Copy a given slice into the buffer, return the offset and the size.
    pub fn add_bytes(&mut self, bytes: &[u8]) -> DataPointer {
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        DataPointer(offset as Offset, bytes.len() as Size)
    }

    /// Return a reference to a stored data object.
    pub fn get_ref(&self, data: DataPointer) -> &[u8] {
        let DataPointer(offset, size) = data;
        &self.buf[offset as usize..offset as usize + size as usize]
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// A point in the stream of submitted work: `(buffer, counter)`. Retired
/// once the device's done-count for that buffer passes the counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fence {
    pub(crate) buf_index: usize,
    pub(crate) counter: i32,
}

/// The always-retired fence.
pub const NULL_FENCE: Fence = Fence {
    buf_index: 0,
    counter: 0,
};

impl Fence {
    /// True for the null fence.
    pub fn is_null(&self) -> bool {
        self.counter == 0
    }
}

impl Default for Fence {
    fn default() -> Fence {
        NULL_FENCE
    }
}

/// Whether a buffer's execution must respect submission order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmdBufOrder {
    /// May execute out of order relative to other unordered buffers.
    Unordered,
    /// Executes strictly in submission order.
    Ordered,
}

/// Blocking behavior for command-buffer acquisition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitMode {
    /// Fail fast when no buffer is free.
    NoWait,
    /// Block until the device loop frees one.
    Wait,
}

/// One decoded render opcode. Resource references are handle clones, so a
/// queued command keeps its resources alive until it executes.
pub enum Command<R: Resources> {
    /// Realize a texture; inline data, when present, is the level-0 payload.
    CreateTexture(Arc<ResourceInner<R::Texture, TextureCreateDesc>>, Option<DataPointer>),
    /// Link a program from inline vertex/fragment binaries.
    CreateProgram(Arc<ResourceInner<R::Program, ()>>, DataPointer, DataPointer),
    /// Realize a mesh vertex layout (descriptor copied inline at record).
    CreateMeshDataLayout(Arc<ResourceInner<R::MeshDataLayout, MeshDataLayoutDesc>>),
    /// Realize a mesh with empty channel buffers.
    CreateMesh(
        Arc<ResourceInner<R::Mesh, MeshDesc>>,
        Arc<ResourceInner<R::MeshDataLayout, MeshDataLayoutDesc>>,
    ),
    /// Realize a blend state.
    CreateBlendState(Arc<ResourceInner<R::BlendState, BlendStateDesc>>),
    /// Realize a depth/stencil state.
    CreateDepthStencilState(Arc<ResourceInner<R::DepthStencilState, DepthStencilStateDesc>>),
    /// Realize a rasterizer state.
    CreateRasterizerState(Arc<ResourceInner<R::RasterizerState, RasterizerStateDesc>>),
    /// Realize a uniform buffer, optionally with inline initial contents.
    CreateUniformBuffer(Arc<ResourceInner<R::UniformBuffer, UniformBufferDesc>>, Option<DataPointer>),
    /// Realize a render target.
    CreateRenderTarget(Arc<ResourceInner<R::RenderTarget, ()>>),

    /// Copy inline data into a uniform buffer at a byte offset.
    UploadUniformData {
        /// Destination block.
        buffer: Arc<ResourceInner<R::UniformBuffer, UniformBufferDesc>>,
        /// Byte offset within the block.
        offset: usize,
        /// Inline payload.
        data: DataPointer,
    },
    /// Copy inline vertex data into a mesh channel.
    UploadMeshChannelData {
        /// Destination mesh.
        mesh: Arc<ResourceInner<R::Mesh, MeshDesc>>,
        /// Channel index.
        channel: usize,
        /// First element to overwrite.
        first_elem: usize,
        /// Element count.
        num_elems: usize,
        /// Element stride in bytes.
        stride: usize,
        /// Inline payload.
        data: DataPointer,
    },
    /// Replace a texture's level-0 contents.
    UploadTexture {
        /// Destination texture.
        texture: Arc<ResourceInner<R::Texture, TextureCreateDesc>>,
        /// Inline payload covering the whole level.
        data: DataPointer,
    },
    /// Update a sub-rectangle of a texture's level 0.
    UploadSubTexture {
        /// Destination texture.
        texture: Arc<ResourceInner<R::Texture, TextureCreateDesc>>,
        /// Destination rectangle `(x, y, width, height)`.
        region: (u32, u32, u32, u32),
        /// Inline payload, tightly packed rows.
        data: DataPointer,
    },

    /// Bind a blend state.
    SetBlendState(Arc<ResourceInner<R::BlendState, BlendStateDesc>>),
    /// Bind a depth/stencil state with a stencil reference value.
    SetDepthStencilState(Arc<ResourceInner<R::DepthStencilState, DepthStencilStateDesc>>, u8),
    /// Bind a rasterizer state.
    SetRasterizerState(Arc<ResourceInner<R::RasterizerState, RasterizerStateDesc>>),
    /// Set the scissor rectangle.
    SetScissorRect(target::Rect),
    /// Set the viewport dimensions.
    SetViewport {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// Clear the color target (and stencil) to a constant.
    Clear {
        /// RGBA clear color.
        color: [f32; 4],
    },
    /// Bind a shader program.
    BindProgram(Arc<ResourceInner<R::Program, ()>>),
    /// Bind a texture (with sampler override) to a slot.
    BindTexture {
        /// Texture slot.
        slot: usize,
        /// Bound texture.
        texture: Arc<ResourceInner<R::Texture, TextureCreateDesc>>,
        /// Sampler for this bind.
        sampler: SamplerDesc,
    },
    /// Bind a uniform buffer to a slot.
    BindUniformBuffer {
        /// Uniform slot.
        slot: usize,
        /// Bound block.
        buffer: Arc<ResourceInner<R::UniformBuffer, UniformBufferDesc>>,
    },
    /// Bind the mesh subsequent draws source vertices from.
    BindMesh(Arc<ResourceInner<R::Mesh, MeshDesc>>),
    /// Draw a primitive range from the bound mesh.
    Draw {
        /// Primitive mode.
        mode: DrawMode,
        /// First vertex.
        first: usize,
        /// Vertex count.
        count: usize,
    },
}

/// A byte-budgeted buffer of render opcodes with inline data. Buffers are
/// recycled through the owning device's free list; `gen` is the retirement
/// generation used by fences.
pub struct CmdBuf<R: Resources> {
    pub(crate) index: usize,
    pub(crate) commands: Vec<Command<R>>,
    pub(crate) data: DataBuffer,
    pub(crate) bytes_used: usize,
    pub(crate) capacity: usize,
    pub(crate) gen: i32,
}

impl<R: Resources> CmdBuf<R> {
    pub(crate) fn new(index: usize, capacity: usize) -> CmdBuf<R> {
        CmdBuf {
            index: index,
            commands: Vec::new(),
            data: DataBuffer::new(),
            bytes_used: 0,
            capacity: capacity,
            gen: 0,
        }
    }

    /// Identity of this buffer within its device.
    pub fn index(&self) -> usize {
        self.index
    }

    /// True when no commands have been written since the last recycle.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Bytes of the budget consumed.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Write an opcode with no inline payload. Returns false when the
    /// buffer budget cannot fit it.
    pub fn write(&mut self, cmd: Command<R>) -> bool {
        let cost = mem::size_of::<Command<R>>();
        if self.bytes_used + cost > self.capacity {
            return false;
        }
        self.bytes_used += cost;
        self.commands.push(cmd);
        true
    }

    /// Write an opcode carrying `data` inline. The closure receives the
    /// inline pointer once the copy is budgeted. Returns false when the
    /// buffer cannot fit the command plus its payload.
    pub fn write_with_data<F>(&mut self, data: &[u8], f: F) -> bool
    where
        F: FnOnce(DataPointer) -> Command<R>,
    {
        let cost = mem::size_of::<Command<R>>() + data.len();
        if self.bytes_used + cost > self.capacity {
            return false;
        }
        self.bytes_used += cost;
        let ptr = self.data.add_bytes(data);
        self.commands.push(f(ptr));
        true
    }

    /// Like `write_with_data`, but budgeting two inline payloads at once
    /// (program creation carries both shader binaries).
    pub fn write_with_data2<F>(&mut self, a: &[u8], b: &[u8], f: F) -> bool
    where
        F: FnOnce(DataPointer, DataPointer) -> Command<R>,
    {
        let cost = mem::size_of::<Command<R>>() + a.len() + b.len();
        if self.bytes_used + cost > self.capacity {
            return false;
        }
        self.bytes_used += cost;
        let pa = self.data.add_bytes(a);
        let pb = self.data.add_bytes(b);
        self.commands.push(f(pa, pb));
        true
    }

    /// Drop contents and rewind the budget, retaining storage.
    pub(crate) fn clear(&mut self) {
        self.commands.clear();
        self.data.clear();
        self.bytes_used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_buffer_round_trip() {
        let mut buf = DataBuffer::new();
        let a = buf.add_bytes(&[1, 2]);
        let b = buf.add_bytes(&[5, 6, 7, 8]);
        assert_eq!(a, DataPointer(0, 2));
        assert_eq!(b, DataPointer(2, 4));
        assert_eq!(buf.get_ref(a), &[1, 2]);
        assert_eq!(buf.get_ref(b), &[5, 6, 7, 8]);
        buf.clear();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn null_fence() {
        assert!(NULL_FENCE.is_null());
        assert!(Fence::default().is_null());
    }
}
