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

//! Dummy backend.
//!
//! Has no rendering capability but fully exercises the command pipeline;
//! tests introspect its recorded operations through shared stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use draw_state::target;

use resources::{BlendStateDesc, DepthStencilStateDesc, MeshDataLayoutDesc, RasterizerStateDesc,
                Resources, RhiError, SamplerDesc, TextureCreateDesc};
use rhi::{DrawMode, Rhi, RhiCaps};

/// Handle family of the dummy backend: opaque ids.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DummyResources {}

impl Resources for DummyResources {
    type Texture = u32;
    type Program = u32;
    type MeshDataLayout = u32;
    type Mesh = u32;
    type BlendState = u32;
    type DepthStencilState = u32;
    type RasterizerState = u32;
    type UniformBuffer = u32;
    type RenderTarget = u32;
}

/// One recorded draw call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DrawRecord {
    /// Primitive mode.
    pub mode: DrawMode,
    /// First vertex.
    pub first: usize,
    /// Vertex count.
    pub count: usize,
    /// Mesh id bound at the draw.
    pub mesh: u32,
}

/// Counters and logs recorded by the dummy backend, shared with tests.
#[derive(Default)]
pub struct DummyStats {
    /// Objects created, by any type.
    pub creates: AtomicUsize,
    /// Objects destroyed, by any type.
    pub destroys: AtomicUsize,
    /// Executed draw calls in order.
    pub draws: Mutex<Vec<DrawRecord>>,
    /// `(mesh id, num_elems)` per channel upload, in order.
    pub mesh_uploads: Mutex<Vec<(u32, usize)>>,
    /// Raw payload of every channel upload, in order (vertex inspection).
    pub mesh_upload_data: Mutex<Vec<Vec<u8>>>,
    /// `(texture id, region)` per sub-texture update, in order.
    pub sub_texture_updates: Mutex<Vec<(u32, (u32, u32, u32, u32))>>,
    /// Whole-texture updates, by texture id.
    pub texture_updates: Mutex<Vec<u32>>,
    /// Uniform upload byte payloads in order.
    pub uniform_uploads: Mutex<Vec<Vec<u8>>>,
    /// Scissor rect log.
    pub scissor_rects: Mutex<Vec<target::Rect>>,
    /// Bound blend-state ids in order.
    pub blend_binds: Mutex<Vec<u32>>,
    /// Bound depth/stencil ids with reference values, in order.
    pub depth_stencil_binds: Mutex<Vec<(u32, u8)>>,
    /// Bound program ids in order.
    pub program_binds: Mutex<Vec<u32>>,
    /// Clear colors in order.
    pub clears: Mutex<Vec<[f32; 4]>>,
}

impl DummyStats {
    /// Live object count.
    pub fn live_objects(&self) -> isize {
        self.creates.load(Ordering::SeqCst) as isize - self.destroys.load(Ordering::SeqCst) as isize
    }

    /// Total vertices drawn across every draw call.
    pub fn total_verts_drawn(&self) -> usize {
        self.draws.lock().unwrap().iter().map(|d| d.count).sum()
    }
}

/// A backend with no GPU behind it.
pub struct DummyRhi {
    stats: Arc<DummyStats>,
    next_id: u32,
    bound_mesh: u32,
    sub_texture_updates_supported: bool,
}

impl DummyRhi {
    /// Create a backend and the stats block tests hold on to.
    pub fn new() -> (DummyRhi, Arc<DummyStats>) {
        DummyRhi::with_caps(true)
    }

    /// Create a backend, optionally denying sub-texture updates (console
    /// profile).
    pub fn with_caps(sub_texture_updates_supported: bool) -> (DummyRhi, Arc<DummyStats>) {
        let stats = Arc::new(DummyStats::default());
        (
            DummyRhi {
                stats: stats.clone(),
                next_id: 1,
                bound_mesh: 0,
                sub_texture_updates_supported: sub_texture_updates_supported,
            },
            stats,
        )
    }

    fn create(&mut self) -> Result<u32, RhiError> {
        self.stats.creates.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn destroy(&mut self, _id: u32) {
        self.stats.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

impl Rhi for DummyRhi {
    type Resources = DummyResources;

    fn caps(&self) -> RhiCaps {
        RhiCaps {
            supports_sub_texture_update: self.sub_texture_updates_supported,
            max_device_threads: 1,
        }
    }

    fn create_texture(
        &mut self,
        _desc: &TextureCreateDesc,
        _data: Option<&[u8]>,
    ) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_texture(&mut self, texture: u32) {
        self.destroy(texture)
    }

    fn update_texture(&mut self, texture: &u32, _data: &[u8]) {
        self.stats.texture_updates.lock().unwrap().push(*texture);
    }

    fn update_sub_texture(&mut self, texture: &u32, region: (u32, u32, u32, u32), _data: &[u8]) {
        assert!(self.sub_texture_updates_supported);
        self.stats
            .sub_texture_updates
            .lock()
            .unwrap()
            .push((*texture, region));
    }

    fn create_program(&mut self, _vert: &[u8], _frag: &[u8]) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_program(&mut self, program: u32) {
        self.destroy(program)
    }

    fn create_mesh_data_layout(&mut self, _desc: &MeshDataLayoutDesc) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_mesh_data_layout(&mut self, layout: u32) {
        self.destroy(layout)
    }

    fn create_mesh(&mut self, _channel_sizes: &[usize], _layout: &u32) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_mesh(&mut self, mesh: u32) {
        self.destroy(mesh)
    }

    fn upload_mesh_channel_data(
        &mut self,
        mesh: &u32,
        _channel: usize,
        _first_elem: usize,
        num_elems: usize,
        _stride: usize,
        data: &[u8],
    ) {
        self.stats.mesh_uploads.lock().unwrap().push((*mesh, num_elems));
        self.stats.mesh_upload_data.lock().unwrap().push(data.to_vec());
    }

    fn create_blend_state(&mut self, _desc: &BlendStateDesc) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_blend_state(&mut self, state: u32) {
        self.destroy(state)
    }

    fn create_depth_stencil_state(
        &mut self,
        _desc: &DepthStencilStateDesc,
    ) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_depth_stencil_state(&mut self, state: u32) {
        self.destroy(state)
    }

    fn create_rasterizer_state(&mut self, _desc: &RasterizerStateDesc) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_rasterizer_state(&mut self, state: u32) {
        self.destroy(state)
    }

    fn create_uniform_buffer(
        &mut self,
        _size: usize,
        _initial: Option<&[u8]>,
    ) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_uniform_buffer(&mut self, buffer: u32) {
        self.destroy(buffer)
    }

    fn update_uniform_buffer(&mut self, _buffer: &u32, _offset: usize, data: &[u8]) {
        self.stats.uniform_uploads.lock().unwrap().push(data.to_vec());
    }

    fn create_render_target(&mut self) -> Result<u32, RhiError> {
        self.create()
    }

    fn destroy_render_target(&mut self, target: u32) {
        self.destroy(target)
    }

    fn set_blend_state(&mut self, state: &u32) {
        self.stats.blend_binds.lock().unwrap().push(*state);
    }

    fn set_depth_stencil_state(&mut self, state: &u32, stencil_ref: u8) {
        self.stats
            .depth_stencil_binds
            .lock()
            .unwrap()
            .push((*state, stencil_ref));
    }

    fn set_rasterizer_state(&mut self, _state: &u32) {}

    fn set_scissor_rect(&mut self, rect: target::Rect) {
        self.stats.scissor_rects.lock().unwrap().push(rect);
    }

    fn set_viewport(&mut self, _width: u32, _height: u32) {}

    fn clear(&mut self, color: [f32; 4]) {
        self.stats.clears.lock().unwrap().push(color);
    }

    fn bind_program(&mut self, program: &u32) {
        self.stats.program_binds.lock().unwrap().push(*program);
    }

    fn bind_texture(&mut self, _slot: usize, _texture: &u32, _sampler: &SamplerDesc) {}

    fn bind_uniform_buffer(&mut self, _slot: usize, _buffer: &u32) {}

    fn bind_mesh(&mut self, mesh: &u32) {
        self.bound_mesh = *mesh;
    }

    fn draw(&mut self, mode: DrawMode, first: usize, count: usize) {
        self.stats.draws.lock().unwrap().push(DrawRecord {
            mode: mode,
            first: first,
            count: count,
            mesh: self.bound_mesh,
        });
    }
}
