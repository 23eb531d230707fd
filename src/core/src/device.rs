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

//! The render device: command-buffer pools, the device loop, fences, and
//! command streams.
//!
//! The device loop pulls ordered buffers strictly FIFO and unordered
//! buffers opportunistically, decodes opcodes into RHI calls, advances the
//! done-count, recycles the buffer, and signals waiters. Resource teardown
//! rides the same loop: after each buffer a sweep destroys RHI objects
//! whose frontend handles are gone and whose last-use fence has retired.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use adk_runtime::crc32;
use draw_state::target;

use command::{CmdBuf, CmdBufOrder, Command, DataPointer, Fence, WaitMode, NULL_FENCE};
use resources::{AnyResource, BlendState, BlendStateDesc, DepthStencilState,
                DepthStencilStateDesc, Mesh, MeshDataLayout, MeshDataLayoutDesc, MeshDesc,
                PixelFormat, Program, RasterizerState, RasterizerStateDesc, RenderMemoryUsage,
                RenderTarget, ResourceInner, Resources, RhiError, SamplerDesc, Texture,
                TextureCreateDesc, TextureUsage, UniformBuffer, UniformBufferDesc};
use rhi::{DrawMode, Rhi, RhiCaps};

use adk_imagelib::ImageMips;

/// Creation-time device configuration.
#[derive(Clone, Copy, Debug)]
pub struct RenderDeviceConfig {
    /// Number of pooled command buffers.
    pub num_cmd_buffers: usize,
    /// Byte budget of each command buffer.
    pub cmd_buf_size: usize,
    /// Device threads to run; clamped by the backend's caps.
    pub max_threads: usize,
    /// Frames that may be in flight before `device_frame` blocks.
    pub max_pending_frames: usize,
    /// Whether resource memory statistics are maintained.
    pub enable_resource_tracking: bool,
}

impl Default for RenderDeviceConfig {
    fn default() -> RenderDeviceConfig {
        RenderDeviceConfig {
            num_cmd_buffers: 16,
            cmd_buf_size: 256 * 1024,
            max_threads: 1,
            max_pending_frames: ::RENDER_MAX_PENDING_FRAMES,
            enable_resource_tracking: false,
        }
    }
}

/// Why device creation failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceCreateError {
    /// `num_cmd_buffers` was zero.
    NoCommandBuffers,
    /// `cmd_buf_size` cannot hold even one command.
    CommandBufferTooSmall,
    /// `max_threads` was zero.
    NoThreads,
}

impl ::std::fmt::Display for DeviceCreateError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        let msg = match *self {
            DeviceCreateError::NoCommandBuffers => "device needs at least one command buffer",
            DeviceCreateError::CommandBufferTooSmall => "command buffer size too small",
            DeviceCreateError::NoThreads => "device needs at least one thread",
        };
        write!(f, "{}", msg)
    }
}

impl ::std::error::Error for DeviceCreateError {
    fn description(&self) -> &str {
        "render device creation error"
    }
}

struct Queues<R: Resources> {
    ordered: VecDeque<CmdBuf<R>>,
    unordered: VecDeque<CmdBuf<R>>,
    free: Vec<CmdBuf<R>>,
    ordered_in_flight: bool,
    quit: bool,
}

pub(crate) struct Shared<R: Resources> {
    queues: Mutex<Queues<R>>,
    queued: Condvar,
    retired: Condvar,
    done_gens: Vec<AtomicI32>,
    submitted: AtomicI32,
    executed: AtomicI32,
    tracking_enabled: bool,
    tracking: Mutex<RenderMemoryUsage>,
}

impl<R: Resources> Shared<R> {
    pub(crate) fn check_fence(&self, fence: Fence) -> bool {
        if fence.is_null() {
            return true;
        }
        self.done_gens[fence.buf_index].load(Ordering::Acquire) >= fence.counter
    }

    fn wait_fence(&self, fence: Fence) {
        if self.check_fence(fence) {
            return;
        }
        let mut queues = self.queues.lock().unwrap();
        while !self.check_fence(fence) {
            queues = self.retired.wait(queues).unwrap();
        }
        drop(queues);
    }

    fn get_cmd_buf(&self, wait_mode: WaitMode) -> Option<CmdBuf<R>> {
        let mut queues = self.queues.lock().unwrap();
        loop {
            if let Some(buf) = queues.free.pop() {
                return Some(buf);
            }
            if wait_mode == WaitMode::NoWait {
                return None;
            }
            queues = self.retired.wait(queues).unwrap();
        }
    }

    fn submit_cmd_buf(&self, mut buf: CmdBuf<R>, order: CmdBufOrder) -> Fence {
        let mut queues = self.queues.lock().unwrap();
        buf.gen += 1;
        let fence = Fence {
            buf_index: buf.index,
            counter: buf.gen,
        };
        self.submitted.fetch_add(1, Ordering::Release);
        match order {
            CmdBufOrder::Ordered => queues.ordered.push_back(buf),
            CmdBufOrder::Unordered => queues.unordered.push_back(buf),
        }
        self.queued.notify_one();
        fence
    }

    fn track_create(&self, res: &AnyResource<R>) {
        if !self.tracking_enabled {
            return;
        }
        let (tex, mesh, uni) = res.tracked_bytes();
        let mut usage = self.tracking.lock().unwrap();
        usage.texture_memory += tex;
        usage.mesh_memory += mesh;
        usage.uniform_buffer_memory += uni;
        usage.total_memory += tex + mesh + uni;
        if usage.total_memory > usage.peak_memory {
            usage.peak_memory = usage.total_memory;
        }
    }

    fn track_destroy(&self, res: &AnyResource<R>) {
        if !self.tracking_enabled {
            return;
        }
        let (tex, mesh, uni) = res.tracked_bytes();
        let mut usage = self.tracking.lock().unwrap();
        usage.texture_memory -= tex;
        usage.mesh_memory -= mesh;
        usage.uniform_buffer_memory -= uni;
        usage.total_memory -= tex + mesh + uni;
    }
}

struct DeviceSide<D: Rhi> {
    rhi: D,
    tracked: Vec<AnyResource<D::Resources>>,
}

/// The render device. Owns the command-buffer pool and the device
/// thread(s); dropped, it drains remaining work and joins them.
pub struct RenderDevice<R: Resources> {
    shared: Arc<Shared<R>>,
    caps: RhiCaps,
    threads: Vec<thread::JoinHandle<()>>,
    frame_fences: Mutex<VecDeque<Fence>>,
    max_pending_frames: usize,
    tag: &'static str,
}

impl<R: Resources> RenderDevice<R> {
    /// Create a rendering device from a specific RHI. Command buffers and
    /// device threads are built up front; no allocation happens on the
    /// submission paths afterwards.
    pub fn new<D>(
        rhi: D,
        config: RenderDeviceConfig,
        tag: &'static str,
    ) -> Result<RenderDevice<R>, DeviceCreateError>
    where
        D: Rhi<Resources = R>,
    {
        if config.num_cmd_buffers == 0 {
            return Err(DeviceCreateError::NoCommandBuffers);
        }
        if config.cmd_buf_size < mem::size_of::<Command<R>>() {
            return Err(DeviceCreateError::CommandBufferTooSmall);
        }
        if config.max_threads == 0 {
            return Err(DeviceCreateError::NoThreads);
        }

        let caps = rhi.caps();
        let num_threads = ::std::cmp::min(config.max_threads, caps.max_device_threads.max(1));

        let mut free = Vec::with_capacity(config.num_cmd_buffers);
        let mut done_gens = Vec::with_capacity(config.num_cmd_buffers);
        for i in 0..config.num_cmd_buffers {
            free.push(CmdBuf::new(i, config.cmd_buf_size));
            done_gens.push(AtomicI32::new(0));
        }

        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues {
                ordered: VecDeque::new(),
                unordered: VecDeque::new(),
                free: free,
                ordered_in_flight: false,
                quit: false,
            }),
            queued: Condvar::new(),
            retired: Condvar::new(),
            done_gens: done_gens,
            submitted: AtomicI32::new(0),
            executed: AtomicI32::new(0),
            tracking_enabled: config.enable_resource_tracking,
            tracking: Mutex::new(RenderMemoryUsage::default()),
        });

        let side = Arc::new(Mutex::new(DeviceSide {
            rhi: rhi,
            tracked: Vec::new(),
        }));

        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let side = side.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-device-{}", tag, i))
                .spawn(move || device_loop(side, shared))
                .expect("spawn render device thread");
            threads.push(handle);
        }

        Ok(RenderDevice {
            shared: shared,
            caps: caps,
            threads: threads,
            frame_fences: Mutex::new(VecDeque::new()),
            max_pending_frames: config.max_pending_frames,
            tag: tag,
        })
    }

    /// Backend capabilities.
    pub fn caps(&self) -> RhiCaps {
        self.caps
    }

    /// Debug tag the device was created with.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Create a command stream over this device's buffer pool.
    pub fn create_cmd_stream(&self) -> CmdStream<R> {
        CmdStream {
            shared: self.shared.clone(),
            buf: None,
            last_fence: NULL_FENCE,
            flush_enabled: true,
        }
    }

    /// Get an available command buffer. THREAD SAFE. With `Wait`, blocks
    /// until the device loop frees one.
    pub fn get_cmd_buf(&self, wait_mode: WaitMode) -> Option<CmdBuf<R>> {
        self.shared.get_cmd_buf(wait_mode)
    }

    /// Submit a command buffer for processing. THREAD SAFE. Ordered
    /// buffers execute in submit order; unordered buffers may not.
    pub fn submit_cmd_buf(&self, buf: CmdBuf<R>, order: CmdBufOrder) -> Fence {
        self.shared.submit_cmd_buf(buf, order)
    }

    /// Returns true if the device has processed the fence.
    pub fn check_fence(&self, fence: Fence) -> bool {
        self.shared.check_fence(fence)
    }

    /// Waits until the fence has been processed by the device.
    pub fn wait_fence(&self, fence: Fence) {
        self.shared.wait_fence(fence)
    }

    /// Frame boundary: flushes the stream and blocks while more than
    /// `max_pending_frames` frames are unretired. Call once per
    /// application frame.
    pub fn device_frame(&self, stream: &mut CmdStream<R>) {
        let fence = stream.flush(WaitMode::NoWait);
        let mut fences = self.frame_fences.lock().unwrap();
        fences.push_back(fence);
        while fences.len() > self.max_pending_frames {
            let oldest = fences.pop_front().unwrap();
            drop(fences);
            self.shared.wait_fence(oldest);
            fences = self.frame_fences.lock().unwrap();
        }
    }

    /// Runs all submitted command buffers, blocking until they complete.
    pub fn flush_device(&self) {
        let mut queues = self.shared.queues.lock().unwrap();
        while self.shared.executed.load(Ordering::Acquire)
            < self.shared.submitted.load(Ordering::Acquire)
        {
            queues = self.shared.retired.wait(queues).unwrap();
        }
        drop(queues);
    }

    /// Current tracked memory statistics (zeroes when tracking disabled).
    pub fn memory_usage(&self) -> RenderMemoryUsage {
        *self.shared.tracking.lock().unwrap()
    }

    /// Log tracked resource metrics.
    pub fn log_resource_tracking(&self) {
        let usage = self.memory_usage();
        info!(
            "{}: render memory: total {} peak {} (tex {} mesh {} uniform {})",
            self.tag,
            usage.total_memory,
            usage.peak_memory,
            usage.texture_memory,
            usage.mesh_memory,
            usage.uniform_buffer_memory
        );
    }
}

impl<R: Resources> Drop for RenderDevice<R> {
    fn drop(&mut self) {
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.quit = true;
            self.shared.queued.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// A command stream: a latched command buffer plus the last produced
/// fence. Commands are written via write-or-flush; when a command does not
/// fit the stream submits the buffer, latches a fresh one, and retries.
/// Streams with `flush` disabled treat overflow as a program error.
pub struct CmdStream<R: Resources> {
    shared: Arc<Shared<R>>,
    buf: Option<CmdBuf<R>>,
    last_fence: Fence,
    flush_enabled: bool,
}

impl<R: Resources> CmdStream<R> {
    /// Disable automatic flushing; overflow becomes a program error.
    pub fn set_flush_enabled(&mut self, enabled: bool) {
        self.flush_enabled = enabled;
    }

    fn latch(&mut self) -> &mut CmdBuf<R> {
        if self.buf.is_none() {
            self.buf = Some(
                self.shared
                    .get_cmd_buf(WaitMode::Wait)
                    .expect("blocking cmd buf acquisition"),
            );
        }
        self.buf.as_mut().unwrap()
    }

    fn ensure_write<F>(&mut self, write: F)
    where
        F: Fn(&mut CmdBuf<R>) -> bool,
    {
        if write(self.latch()) {
            return;
        }
        assert!(self.flush_enabled, "command stream overflow with flush disabled");
        self.flush(WaitMode::NoWait);
        let ok = write(self.latch());
        assert!(ok, "command too large for a command buffer");
    }

    /// Submit any unflushed commands; returns a fence that completes only
    /// after every command written so far has executed.
    pub fn flush(&mut self, wait_mode: WaitMode) -> Fence {
        if let Some(buf) = self.buf.take() {
            if buf.is_empty() {
                // nothing written; hand the buffer straight back
                let mut queues = self.shared.queues.lock().unwrap();
                queues.free.push(buf);
                self.shared.retired.notify_all();
            } else {
                self.last_fence = self.shared.submit_cmd_buf(buf, CmdBufOrder::Ordered);
            }
        }
        if wait_mode == WaitMode::Wait {
            self.shared.wait_fence(self.last_fence);
        }
        self.last_fence
    }

    /// A fence covering every command written to the stream so far. May
    /// refer to unsubmitted writes; pair with the conditional-flush
    /// helpers before checking or waiting.
    pub fn stream_fence(&self) -> Fence {
        match self.buf {
            Some(ref buf) if !buf.is_empty() => Fence {
                buf_index: buf.index,
                counter: buf.gen + 1,
            },
            _ => self.last_fence,
        }
    }

    fn fence_is_unsubmitted(&self, fence: Fence) -> bool {
        match self.buf {
            Some(ref buf) => buf.index == fence.buf_index && buf.gen < fence.counter,
            None => false,
        }
    }

    /// Check a fence, first flushing the stream if the fence was taken
    /// after unsubmitted command data.
    pub fn conditional_flush_and_check_fence(&mut self, fence: Fence) -> bool {
        if self.fence_is_unsubmitted(fence) {
            self.flush(WaitMode::NoWait);
        }
        self.shared.check_fence(fence)
    }

    /// Wait a fence, first flushing the stream if the fence was taken
    /// after unsubmitted command data.
    pub fn conditional_flush_and_wait_fence(&mut self, fence: Fence) {
        if self.fence_is_unsubmitted(fence) {
            self.flush(WaitMode::NoWait);
        }
        self.shared.wait_fence(fence)
    }

    /// Check a fence without touching the stream.
    pub fn check_fence(&self, fence: Fence) -> bool {
        self.shared.check_fence(fence)
    }

    /// Wait a fence without touching the stream.
    pub fn wait_fence(&self, fence: Fence) {
        self.shared.wait_fence(fence)
    }

    // ---- resource creation ----

    /// Create a 2D texture from a mip chain; `data`, when present, is
    /// copied inline as the level-0 payload.
    pub fn create_texture_2d(
        &mut self,
        mips: ImageMips,
        format: PixelFormat,
        usage: TextureUsage,
        sampler: SamplerDesc,
        data: Option<&[u8]>,
        tag: &'static str,
    ) -> Texture<R> {
        let inner = ResourceInner::new(
            TextureCreateDesc {
                mips: mips,
                format: format,
                usage: usage,
                sampler: sampler,
            },
            tag,
        );
        match data {
            Some(bytes) => {
                let arc = inner.clone();
                self.ensure_write(move |buf| {
                    let arc = arc.clone();
                    buf.write_with_data(bytes, move |ptr| Command::CreateTexture(arc, Some(ptr)))
                });
            }
            None => {
                let arc = inner.clone();
                self.ensure_write(move |buf| buf.write(Command::CreateTexture(arc.clone(), None)));
            }
        }
        let handle = Texture(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a program from a precompiled binary pair; the bytecode is
    /// copied inline and the regions may be freed after this call.
    pub fn create_program_from_binary(
        &mut self,
        vert_program: &[u8],
        frag_program: &[u8],
        tag: &'static str,
    ) -> Program<R> {
        let inner: Arc<ResourceInner<R::Program, ()>> = ResourceInner::new((), tag);
        {
            let arc = inner.clone();
            self.ensure_write(move |buf| {
                let arc = arc.clone();
                buf.write_with_data2(vert_program, frag_program, move |vert, frag| {
                    Command::CreateProgram(arc, vert, frag)
                })
            });
        }
        let handle = Program(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a mesh data layout; the descriptor is copied and the
    /// original may be dropped after this call.
    pub fn create_mesh_data_layout(
        &mut self,
        desc: MeshDataLayoutDesc,
        tag: &'static str,
    ) -> MeshDataLayout<R> {
        let inner = ResourceInner::new(desc, tag);
        {
            let arc = inner.clone();
            self.ensure_write(move |buf| buf.write(Command::CreateMeshDataLayout(arc.clone())));
        }
        let handle = MeshDataLayout(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a mesh with empty channel buffers; contents arrive through
    /// `upload_mesh_channel_data`.
    pub fn create_mesh(
        &mut self,
        channel_sizes: &[usize],
        layout: &MeshDataLayout<R>,
        tag: &'static str,
    ) -> Mesh<R> {
        let inner = ResourceInner::new(
            MeshDesc {
                channel_sizes: channel_sizes.to_vec(),
                hash: Mutex::new(0),
            },
            tag,
        );
        {
            let arc = inner.clone();
            let layout = layout.0.clone();
            self.ensure_write(move |buf| {
                buf.write(Command::CreateMesh(arc.clone(), layout.clone()))
            });
        }
        let handle = Mesh(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a blend state object.
    pub fn create_blend_state(&mut self, desc: BlendStateDesc, tag: &'static str) -> BlendState<R> {
        let inner = ResourceInner::new(desc, tag);
        {
            let arc = inner.clone();
            self.ensure_write(move |buf| buf.write(Command::CreateBlendState(arc.clone())));
        }
        let handle = BlendState(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a depth/stencil state object.
    pub fn create_depth_stencil_state(
        &mut self,
        desc: DepthStencilStateDesc,
        tag: &'static str,
    ) -> DepthStencilState<R> {
        let inner = ResourceInner::new(desc, tag);
        {
            let arc = inner.clone();
            self.ensure_write(move |buf| {
                buf.write(Command::CreateDepthStencilState(arc.clone()))
            });
        }
        let handle = DepthStencilState(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a rasterizer state object.
    pub fn create_rasterizer_state(
        &mut self,
        desc: RasterizerStateDesc,
        tag: &'static str,
    ) -> RasterizerState<R> {
        let inner = ResourceInner::new(desc, tag);
        {
            let arc = inner.clone();
            self.ensure_write(move |buf| buf.write(Command::CreateRasterizerState(arc.clone())));
        }
        let handle = RasterizerState(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a uniform buffer, optionally copying initial contents inline.
    pub fn create_uniform_buffer(
        &mut self,
        size: usize,
        initial: Option<&[u8]>,
        tag: &'static str,
    ) -> UniformBuffer<R> {
        let inner = ResourceInner::new(UniformBufferDesc { size: size }, tag);
        match initial {
            Some(bytes) => {
                let arc = inner.clone();
                self.ensure_write(move |buf| {
                    let arc = arc.clone();
                    buf.write_with_data(bytes, move |ptr| {
                        Command::CreateUniformBuffer(arc, Some(ptr))
                    })
                });
            }
            None => {
                let arc = inner.clone();
                self.ensure_write(move |buf| {
                    buf.write(Command::CreateUniformBuffer(arc.clone(), None))
                });
            }
        }
        let handle = UniformBuffer(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    /// Create a render target.
    pub fn create_render_target(&mut self, tag: &'static str) -> RenderTarget<R> {
        let inner: Arc<ResourceInner<R::RenderTarget, ()>> = ResourceInner::new((), tag);
        {
            let arc = inner.clone();
            self.ensure_write(move |buf| buf.write(Command::CreateRenderTarget(arc.clone())));
        }
        let handle = RenderTarget(inner);
        handle.set_last_use_fence(self.stream_fence());
        handle
    }

    // ---- uploads ----

    /// Copy data inline into a uniform buffer at a byte offset; the source
    /// may be freed after this call. Returns false if the single command
    /// cannot fit even an empty buffer (callers surface or trap).
    pub fn upload_uniform_data_no_flush(
        &mut self,
        uniform_buffer: &UniformBuffer<R>,
        data: &[u8],
        offset: usize,
    ) -> bool {
        let arc = uniform_buffer.0.clone();
        let ok = self.latch().write_with_data(data, move |ptr| Command::UploadUniformData {
            buffer: arc,
            offset: offset,
            data: ptr,
        });
        if ok {
            uniform_buffer.set_last_use_fence(self.stream_fence());
        }
        ok
    }

    /// Copy data inline into a uniform buffer, flushing on overflow.
    pub fn upload_uniform_data(
        &mut self,
        uniform_buffer: &UniformBuffer<R>,
        data: &[u8],
        offset: usize,
    ) {
        let arc = uniform_buffer.0.clone();
        self.ensure_write(move |buf| {
            let arc = arc.clone();
            buf.write_with_data(data, move |ptr| Command::UploadUniformData {
                buffer: arc,
                offset: offset,
                data: ptr,
            })
        });
        uniform_buffer.set_last_use_fence(self.stream_fence());
    }

    /// Copy vertex data inline into a mesh channel. Returns the data hash
    /// recorded on the mesh.
    pub fn upload_mesh_channel_data(
        &mut self,
        mesh: &Mesh<R>,
        channel: usize,
        first_elem: usize,
        num_elems: usize,
        stride: usize,
        data: &[u8],
    ) -> u32 {
        debug_assert_eq!(data.len(), num_elems * stride);
        let arc = mesh.0.clone();
        self.ensure_write(move |buf| {
            let arc = arc.clone();
            buf.write_with_data(data, move |ptr| Command::UploadMeshChannelData {
                mesh: arc,
                channel: channel,
                first_elem: first_elem,
                num_elems: num_elems,
                stride: stride,
                data: ptr,
            })
        });
        let hash = crc32(data);
        mesh.set_hash(hash);
        mesh.set_last_use_fence(self.stream_fence());
        hash
    }

    /// Replace a texture's level-0 contents.
    pub fn upload_texture(&mut self, texture: &Texture<R>, data: &[u8]) {
        let arc = texture.0.clone();
        self.ensure_write(move |buf| {
            let arc = arc.clone();
            buf.write_with_data(data, move |ptr| Command::UploadTexture {
                texture: arc,
                data: ptr,
            })
        });
        texture.set_last_use_fence(self.stream_fence());
    }

    /// Update a sub-rectangle of a texture's level 0.
    pub fn upload_sub_texture(
        &mut self,
        texture: &Texture<R>,
        region: (u32, u32, u32, u32),
        data: &[u8],
    ) {
        let arc = texture.0.clone();
        self.ensure_write(move |buf| {
            let arc = arc.clone();
            buf.write_with_data(data, move |ptr| Command::UploadSubTexture {
                texture: arc,
                region: region,
                data: ptr,
            })
        });
        texture.set_last_use_fence(self.stream_fence());
    }

    // ---- state + draw ----

    /// Bind a blend state.
    pub fn set_blend_state(&mut self, state: &BlendState<R>) {
        let arc = state.0.clone();
        self.ensure_write(move |buf| buf.write(Command::SetBlendState(arc.clone())));
        state.set_last_use_fence(self.stream_fence());
    }

    /// Bind a depth/stencil state with a stencil reference value.
    pub fn set_depth_stencil_state(&mut self, state: &DepthStencilState<R>, stencil_ref: u8) {
        let arc = state.0.clone();
        self.ensure_write(move |buf| {
            buf.write(Command::SetDepthStencilState(arc.clone(), stencil_ref))
        });
        state.set_last_use_fence(self.stream_fence());
    }

    /// Bind a rasterizer state.
    pub fn set_rasterizer_state(&mut self, state: &RasterizerState<R>) {
        let arc = state.0.clone();
        self.ensure_write(move |buf| buf.write(Command::SetRasterizerState(arc.clone())));
        state.set_last_use_fence(self.stream_fence());
    }

    /// Set the scissor rectangle.
    pub fn set_scissor_rect(&mut self, rect: target::Rect) {
        self.ensure_write(move |buf| buf.write(Command::SetScissorRect(rect)));
    }

    /// Set the viewport.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.ensure_write(move |buf| {
            buf.write(Command::SetViewport {
                width: width,
                height: height,
            })
        });
    }

    /// Clear the color target (and stencil).
    pub fn clear(&mut self, color: [f32; 4]) {
        self.ensure_write(move |buf| buf.write(Command::Clear { color: color }));
    }

    /// Bind a program.
    pub fn bind_program(&mut self, program: &Program<R>) {
        let arc = program.0.clone();
        self.ensure_write(move |buf| buf.write(Command::BindProgram(arc.clone())));
        program.set_last_use_fence(self.stream_fence());
    }

    /// Bind a texture + sampler to a slot.
    pub fn bind_texture(&mut self, slot: usize, texture: &Texture<R>, sampler: SamplerDesc) {
        let arc = texture.0.clone();
        self.ensure_write(move |buf| {
            buf.write(Command::BindTexture {
                slot: slot,
                texture: arc.clone(),
                sampler: sampler,
            })
        });
        texture.set_last_use_fence(self.stream_fence());
    }

    /// Bind a uniform buffer to a slot.
    pub fn bind_uniform_buffer(&mut self, slot: usize, buffer: &UniformBuffer<R>) {
        let arc = buffer.0.clone();
        self.ensure_write(move |buf| {
            buf.write(Command::BindUniformBuffer {
                slot: slot,
                buffer: arc.clone(),
            })
        });
        buffer.set_last_use_fence(self.stream_fence());
    }

    /// Bind the mesh subsequent draws source vertices from.
    pub fn bind_mesh(&mut self, mesh: &Mesh<R>) {
        let arc = mesh.0.clone();
        self.ensure_write(move |buf| buf.write(Command::BindMesh(arc.clone())));
        mesh.set_last_use_fence(self.stream_fence());
    }

    /// Draw a vertex range from the bound mesh.
    pub fn draw(&mut self, mode: DrawMode, first: usize, count: usize) {
        self.ensure_write(move |buf| {
            buf.write(Command::Draw {
                mode: mode,
                first: first,
                count: count,
            })
        });
    }
}

fn device_loop<D: Rhi>(side: Arc<Mutex<DeviceSide<D>>>, shared: Arc<Shared<D::Resources>>) {
    loop {
        let pulled = {
            let mut queues = shared.queues.lock().unwrap();
            loop {
                if !queues.ordered_in_flight {
                    if let Some(buf) = queues.ordered.pop_front() {
                        queues.ordered_in_flight = true;
                        break Some((buf, true));
                    }
                }
                if let Some(buf) = queues.unordered.pop_front() {
                    break Some((buf, false));
                }
                if queues.quit {
                    break None;
                }
                queues = shared.queued.wait(queues).unwrap();
            }
        };

        let (mut buf, was_ordered) = match pulled {
            Some(pair) => pair,
            None => {
                // drain the sweep before the backend goes away
                let mut side = side.lock().unwrap();
                sweep_resources(&mut *side, &shared, true);
                return;
            }
        };

        {
            let mut side = side.lock().unwrap();
            let commands = mem::replace(&mut buf.commands, Vec::new());
            for cmd in commands {
                execute_command(&mut *side, cmd, &buf, &shared);
            }
            // retire before sweeping so same-buffer last uses count
            shared.done_gens[buf.index].store(buf.gen, Ordering::Release);
            sweep_resources(&mut *side, &shared, false);
        }

        shared.executed.fetch_add(1, Ordering::Release);
        buf.clear();
        {
            let mut queues = shared.queues.lock().unwrap();
            if was_ordered {
                queues.ordered_in_flight = false;
            }
            queues.free.push(buf);
            shared.queued.notify_all();
            shared.retired.notify_all();
        }
    }
}

fn track_and_push<D: Rhi>(
    side: &mut DeviceSide<D>,
    shared: &Shared<D::Resources>,
    res: AnyResource<D::Resources>,
) {
    shared.track_create(&res);
    side.tracked.push(res);
}

fn execute_command<D: Rhi>(
    side: &mut DeviceSide<D>,
    cmd: Command<D::Resources>,
    buf: &CmdBuf<D::Resources>,
    shared: &Shared<D::Resources>,
) {
    let data_of = |ptr: DataPointer| buf.data.get_ref(ptr);
    match cmd {
        Command::CreateTexture(inner, data) => {
            let result = side.rhi.create_texture(&inner.desc, data.map(&data_of));
            inner.install(result);
            track_and_push(side, shared, AnyResource::Texture(inner));
        }
        Command::CreateProgram(inner, vert, frag) => {
            let result = side.rhi.create_program(data_of(vert), data_of(frag));
            inner.install(result);
            track_and_push(side, shared, AnyResource::Program(inner));
        }
        Command::CreateMeshDataLayout(inner) => {
            let result = side.rhi.create_mesh_data_layout(&inner.desc);
            inner.install(result);
            track_and_push(side, shared, AnyResource::MeshDataLayout(inner));
        }
        Command::CreateMesh(inner, layout) => {
            let result = match layout.with_handle(|l| l.clone()) {
                Some(l) => side.rhi.create_mesh(&inner.desc.channel_sizes, &l),
                None => Err(RhiError {
                    message: "mesh layout was never realized".to_string(),
                }),
            };
            inner.install(result);
            track_and_push(side, shared, AnyResource::Mesh(inner));
        }
        Command::CreateBlendState(inner) => {
            let result = side.rhi.create_blend_state(&inner.desc);
            inner.install(result);
            track_and_push(side, shared, AnyResource::BlendState(inner));
        }
        Command::CreateDepthStencilState(inner) => {
            let result = side.rhi.create_depth_stencil_state(&inner.desc);
            inner.install(result);
            track_and_push(side, shared, AnyResource::DepthStencilState(inner));
        }
        Command::CreateRasterizerState(inner) => {
            let result = side.rhi.create_rasterizer_state(&inner.desc);
            inner.install(result);
            track_and_push(side, shared, AnyResource::RasterizerState(inner));
        }
        Command::CreateUniformBuffer(inner, initial) => {
            let result = side
                .rhi
                .create_uniform_buffer(inner.desc.size, initial.map(&data_of));
            inner.install(result);
            track_and_push(side, shared, AnyResource::UniformBuffer(inner));
        }
        Command::CreateRenderTarget(inner) => {
            let result = side.rhi.create_render_target();
            inner.install(result);
            track_and_push(side, shared, AnyResource::RenderTarget(inner));
        }
        Command::UploadUniformData { buffer, offset, data } => {
            let bytes = data_of(data);
            buffer.with_handle(|h| side.rhi.update_uniform_buffer(h, offset, bytes));
        }
        Command::UploadMeshChannelData {
            mesh,
            channel,
            first_elem,
            num_elems,
            stride,
            data,
        } => {
            let bytes = data_of(data);
            mesh.with_handle(|h| {
                side.rhi
                    .upload_mesh_channel_data(h, channel, first_elem, num_elems, stride, bytes)
            });
        }
        Command::UploadTexture { texture, data } => {
            let bytes = data_of(data);
            texture.with_handle(|h| side.rhi.update_texture(h, bytes));
        }
        Command::UploadSubTexture { texture, region, data } => {
            let bytes = data_of(data);
            texture.with_handle(|h| side.rhi.update_sub_texture(h, region, bytes));
        }
        Command::SetBlendState(inner) => {
            inner.with_handle(|h| side.rhi.set_blend_state(h));
        }
        Command::SetDepthStencilState(inner, stencil_ref) => {
            inner.with_handle(|h| side.rhi.set_depth_stencil_state(h, stencil_ref));
        }
        Command::SetRasterizerState(inner) => {
            inner.with_handle(|h| side.rhi.set_rasterizer_state(h));
        }
        Command::SetScissorRect(rect) => side.rhi.set_scissor_rect(rect),
        Command::SetViewport { width, height } => side.rhi.set_viewport(width, height),
        Command::Clear { color } => side.rhi.clear(color),
        Command::BindProgram(inner) => {
            inner.with_handle(|h| side.rhi.bind_program(h));
        }
        Command::BindTexture { slot, texture, sampler } => {
            texture.with_handle(|h| side.rhi.bind_texture(slot, h, &sampler));
        }
        Command::BindUniformBuffer { slot, buffer } => {
            buffer.with_handle(|h| side.rhi.bind_uniform_buffer(slot, h));
        }
        Command::BindMesh(inner) => {
            inner.with_handle(|h| side.rhi.bind_mesh(h));
        }
        Command::Draw { mode, first, count } => side.rhi.draw(mode, first, count),
    }
}

fn sweep_resources<D: Rhi>(
    side: &mut DeviceSide<D>,
    shared: &Shared<D::Resources>,
    force: bool,
) {
    let mut i = 0;
    while i < side.tracked.len() {
        let destroy = {
            let res = &side.tracked[i];
            res.external_refs() == 0 && (force || shared.check_fence(res.fence()))
        };
        if destroy {
            let res = side.tracked.swap_remove(i);
            shared.track_destroy(&res);
            res.destroy(&mut side.rhi);
        } else {
            i += 1;
        }
    }
}
