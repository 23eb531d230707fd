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

//! The rendering hardware interface.
//!
//! The device loop decodes command buffers into calls on this trait. A
//! backend runs entirely on the device thread(s); handles it returns are
//! shared with the frontend through the resource wrappers.

use draw_state::target;

use resources::{BlendStateDesc, DepthStencilStateDesc, MeshDataLayoutDesc, RasterizerStateDesc,
                Resources, RhiError, SamplerDesc, TextureCreateDesc};

/// Primitive assembly modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrawMode {
    /// Independent triangles.
    Triangles,
    /// Triangle strip (degenerate-restart capable).
    TriangleStrip,
    /// Triangle fan.
    TriangleFan,
    /// Line strip.
    LineStrip,
}

/// Capabilities the frontend adapts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RhiCaps {
    /// Whether `update_sub_texture` is available; consoles without it get
    /// whole-surface uploads gated on the previous upload's fence.
    pub supports_sub_texture_update: bool,
    /// Device threads the backend tolerates.
    pub max_device_threads: usize,
}

impl Default for RhiCaps {
    fn default() -> RhiCaps {
        RhiCaps {
            supports_sub_texture_update: true,
            max_device_threads: 1,
        }
    }
}

/// The abstract device. One instance is moved onto the device thread(s) at
/// render-device creation.
pub trait Rhi: Send + 'static {
    /// Handle family this backend produces.
    type Resources: Resources;

    /// Backend capabilities; queried once at device creation.
    fn caps(&self) -> RhiCaps;

    /// Create a 2D texture; `data`, when present, is the level-0 payload.
    fn create_texture(
        &mut self,
        desc: &TextureCreateDesc,
        data: Option<&[u8]>,
    ) -> Result<<Self::Resources as Resources>::Texture, RhiError>;
    /// Destroy a texture.
    fn destroy_texture(&mut self, texture: <Self::Resources as Resources>::Texture);
    /// Replace a texture's level-0 contents.
    fn update_texture(&mut self, texture: &<Self::Resources as Resources>::Texture, data: &[u8]);
    /// Update a sub-rectangle of a texture's level 0; only called when
    /// `caps().supports_sub_texture_update`.
    fn update_sub_texture(
        &mut self,
        texture: &<Self::Resources as Resources>::Texture,
        region: (u32, u32, u32, u32),
        data: &[u8],
    );

    /// Link a program from vertex/fragment binaries.
    fn create_program(
        &mut self,
        vert: &[u8],
        frag: &[u8],
    ) -> Result<<Self::Resources as Resources>::Program, RhiError>;
    /// Destroy a program.
    fn destroy_program(&mut self, program: <Self::Resources as Resources>::Program);

    /// Create a mesh vertex layout.
    fn create_mesh_data_layout(
        &mut self,
        desc: &MeshDataLayoutDesc,
    ) -> Result<<Self::Resources as Resources>::MeshDataLayout, RhiError>;
    /// Destroy a layout.
    fn destroy_mesh_data_layout(&mut self, layout: <Self::Resources as Resources>::MeshDataLayout);

    /// Create a mesh with empty channel buffers of the given byte sizes.
    fn create_mesh(
        &mut self,
        channel_sizes: &[usize],
        layout: &<Self::Resources as Resources>::MeshDataLayout,
    ) -> Result<<Self::Resources as Resources>::Mesh, RhiError>;
    /// Destroy a mesh.
    fn destroy_mesh(&mut self, mesh: <Self::Resources as Resources>::Mesh);
    /// Copy elements into a mesh channel.
    fn upload_mesh_channel_data(
        &mut self,
        mesh: &<Self::Resources as Resources>::Mesh,
        channel: usize,
        first_elem: usize,
        num_elems: usize,
        stride: usize,
        data: &[u8],
    );

    /// Create a blend state.
    fn create_blend_state(
        &mut self,
        desc: &BlendStateDesc,
    ) -> Result<<Self::Resources as Resources>::BlendState, RhiError>;
    /// Destroy a blend state.
    fn destroy_blend_state(&mut self, state: <Self::Resources as Resources>::BlendState);

    /// Create a depth/stencil state.
    fn create_depth_stencil_state(
        &mut self,
        desc: &DepthStencilStateDesc,
    ) -> Result<<Self::Resources as Resources>::DepthStencilState, RhiError>;
    /// Destroy a depth/stencil state.
    fn destroy_depth_stencil_state(
        &mut self,
        state: <Self::Resources as Resources>::DepthStencilState,
    );

    /// Create a rasterizer state.
    fn create_rasterizer_state(
        &mut self,
        desc: &RasterizerStateDesc,
    ) -> Result<<Self::Resources as Resources>::RasterizerState, RhiError>;
    /// Destroy a rasterizer state.
    fn destroy_rasterizer_state(
        &mut self,
        state: <Self::Resources as Resources>::RasterizerState,
    );

    /// Create a uniform buffer, optionally with initial contents.
    fn create_uniform_buffer(
        &mut self,
        size: usize,
        initial: Option<&[u8]>,
    ) -> Result<<Self::Resources as Resources>::UniformBuffer, RhiError>;
    /// Destroy a uniform buffer.
    fn destroy_uniform_buffer(&mut self, buffer: <Self::Resources as Resources>::UniformBuffer);
    /// Copy bytes into a uniform buffer at a byte offset.
    fn update_uniform_buffer(
        &mut self,
        buffer: &<Self::Resources as Resources>::UniformBuffer,
        offset: usize,
        data: &[u8],
    );

    /// Create a render target.
    fn create_render_target(
        &mut self,
    ) -> Result<<Self::Resources as Resources>::RenderTarget, RhiError>;
    /// Destroy a render target.
    fn destroy_render_target(&mut self, target: <Self::Resources as Resources>::RenderTarget);

    /// Bind a blend state.
    fn set_blend_state(&mut self, state: &<Self::Resources as Resources>::BlendState);
    /// Bind a depth/stencil state with a stencil reference value.
    fn set_depth_stencil_state(
        &mut self,
        state: &<Self::Resources as Resources>::DepthStencilState,
        stencil_ref: u8,
    );
    /// Bind a rasterizer state.
    fn set_rasterizer_state(&mut self, state: &<Self::Resources as Resources>::RasterizerState);
    /// Set the scissor rectangle.
    fn set_scissor_rect(&mut self, rect: target::Rect);
    /// Set the viewport.
    fn set_viewport(&mut self, width: u32, height: u32);
    /// Clear the bound target's color (and stencil).
    fn clear(&mut self, color: [f32; 4]);
    /// Bind a program.
    fn bind_program(&mut self, program: &<Self::Resources as Resources>::Program);
    /// Bind a texture + sampler to a slot.
    fn bind_texture(
        &mut self,
        slot: usize,
        texture: &<Self::Resources as Resources>::Texture,
        sampler: &SamplerDesc,
    );
    /// Bind a uniform buffer to a slot.
    fn bind_uniform_buffer(
        &mut self,
        slot: usize,
        buffer: &<Self::Resources as Resources>::UniformBuffer,
    );
    /// Bind the mesh vertices are drawn from.
    fn bind_mesh(&mut self, mesh: &<Self::Resources as Resources>::Mesh);
    /// Draw `count` vertices starting at `first` from the bound mesh.
    fn draw(&mut self, mode: DrawMode, first: usize, count: usize);
}
