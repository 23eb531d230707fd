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

extern crate adk_core;
extern crate adk_imagelib;
extern crate env_logger;

use std::sync::Arc;

use adk_core::{CmdBufOrder, ColorMask, Command, DrawMode, DummyRhi, DummyStats, MeshChannelDesc,
               MeshDataLayoutDesc, MeshElementDesc, PixelFormat, RenderDevice,
               RenderDeviceConfig, SamplerDesc, TextureUsage, VertexSemantic, WaitMode};
use adk_imagelib::{ImageDesc, ImageMips};

type Device = RenderDevice<adk_core::DummyResources>;

fn make_device(config: RenderDeviceConfig) -> (Device, Arc<DummyStats>) {
    let _ = env_logger::try_init();
    let (rhi, stats) = DummyRhi::new();
    let device = RenderDevice::new(rhi, config, "test-device").unwrap();
    (device, stats)
}

fn canvas_layout() -> MeshDataLayoutDesc {
    MeshDataLayoutDesc {
        channels: vec![MeshChannelDesc {
            stride: 24,
            elements: vec![
                MeshElementDesc {
                    semantic: VertexSemantic::Position,
                    offset: 0,
                    count: 2,
                },
                MeshElementDesc {
                    semantic: VertexSemantic::Color,
                    offset: 8,
                    count: 4,
                },
            ],
        }],
    }
}

#[test]
fn submitted_buffers_retire() {
    let (device, stats) = make_device(RenderDeviceConfig::default());
    let mut fences = Vec::new();
    for i in 0..8 {
        let mut buf = device.get_cmd_buf(WaitMode::Wait).unwrap();
        assert!(buf.write(Command::Clear {
            color: [i as f32, 0.0, 0.0, 1.0],
        }));
        fences.push(device.submit_cmd_buf(buf, CmdBufOrder::Ordered));
    }
    for fence in &fences {
        device.wait_fence(*fence);
        assert!(device.check_fence(*fence));
    }
    device.flush_device();
    let clears = stats.clears.lock().unwrap().clone();
    assert_eq!(clears.len(), 8);
    // ordered buffers execute strictly in submission order
    for (i, c) in clears.iter().enumerate() {
        assert_eq!(c[0], i as f32);
    }
}

#[test]
fn no_wait_exhaustion_returns_none() {
    let mut config = RenderDeviceConfig::default();
    config.num_cmd_buffers = 2;
    let (device, _stats) = make_device(config);
    let a = device.get_cmd_buf(WaitMode::NoWait);
    let b = device.get_cmd_buf(WaitMode::NoWait);
    assert!(a.is_some() && b.is_some());
    assert!(device.get_cmd_buf(WaitMode::NoWait).is_none());
    // recycling restores availability
    device.submit_cmd_buf(a.unwrap(), CmdBufOrder::Ordered);
    device.flush_device();
    assert!(device.get_cmd_buf(WaitMode::NoWait).is_some());
}

#[test]
fn stream_write_or_flush_produces_multiple_buffers() {
    let mut config = RenderDeviceConfig::default();
    config.cmd_buf_size = 2048; // small enough to overflow quickly
    let (device, stats) = make_device(config);
    let mut stream = device.create_cmd_stream();

    for _ in 0..200 {
        stream.draw(DrawMode::Triangles, 0, 3);
    }
    let fence = stream.flush(WaitMode::Wait);
    assert!(device.check_fence(fence));
    assert_eq!(stats.draws.lock().unwrap().len(), 200);
}

#[test]
fn stream_fence_conditionally_flushes() {
    let (device, stats) = make_device(RenderDeviceConfig::default());
    let mut stream = device.create_cmd_stream();

    stream.clear([0.0, 0.0, 0.0, 1.0]);
    let fence = stream.stream_fence();
    // the fence refers to unsubmitted writes; a bare check must not pass
    assert!(!stream.check_fence(fence));
    stream.conditional_flush_and_wait_fence(fence);
    assert!(stream.check_fence(fence));
    assert_eq!(stats.clears.lock().unwrap().len(), 1);
}

#[test]
fn uniform_and_mesh_uploads_copy_inline() {
    let (device, stats) = make_device(RenderDeviceConfig::default());
    let mut stream = device.create_cmd_stream();

    let layout = stream.create_mesh_data_layout(canvas_layout(), "layout");
    let mesh = stream.create_mesh(&[24 * 64], &layout, "mesh");
    let ub = stream.create_uniform_buffer(64, None, "uniforms");

    let verts = vec![0u8; 24 * 6];
    let hash = stream.upload_mesh_channel_data(&mesh, 0, 0, 6, 24, &verts);
    assert_eq!(hash, mesh.hash());

    let block = [1u8, 2, 3, 4];
    stream.upload_uniform_data(&ub, &block, 0);
    stream.flush(WaitMode::Wait);

    assert_eq!(stats.mesh_uploads.lock().unwrap()[0].1, 6);
    assert_eq!(stats.uniform_uploads.lock().unwrap()[0], block.to_vec());
    assert!(mesh.is_ready() && ub.is_ready() && layout.is_ready());
}

#[test]
fn resources_destroy_only_after_last_handle_drops() {
    let (device, stats) = make_device(RenderDeviceConfig::default());
    let mut stream = device.create_cmd_stream();

    let mips = ImageMips::single(ImageDesc::uncompressed(16, 16, 4));
    let tex = stream.create_texture_2d(
        mips,
        PixelFormat::Rgba8Unorm,
        TextureUsage::Static,
        SamplerDesc::default(),
        None,
        "tex",
    );
    stream.bind_texture(0, &tex, SamplerDesc::default());
    stream.flush(WaitMode::Wait);
    assert!(tex.is_ready());
    assert_eq!(stats.live_objects(), 1);

    // a held handle keeps the RHI object alive across further submissions
    stream.clear([0.0; 4]);
    stream.flush(WaitMode::Wait);
    assert_eq!(stats.live_objects(), 1);

    drop(tex);
    // the sweep runs on the device thread after the next buffer executes
    stream.clear([0.0; 4]);
    stream.flush(WaitMode::Wait);
    assert_eq!(stats.live_objects(), 0);
}

#[test]
fn destroy_waits_for_last_use_fence() {
    let (device, stats) = make_device(RenderDeviceConfig::default());
    let mut stream = device.create_cmd_stream();

    let ub = stream.create_uniform_buffer(16, None, "uniforms");
    stream.flush(WaitMode::Wait);

    // record a use into an unsubmitted buffer, then drop the handle; the
    // queued command itself pins the resource until it executes, and the
    // recorded fence pins it past execution
    stream.bind_uniform_buffer(0, &ub);
    let use_fence = ub.last_use_fence();
    drop(ub);
    assert_eq!(stats.live_objects(), 1);

    stream.flush(WaitMode::Wait);
    assert!(device.check_fence(use_fence));
    // one more buffer to run the sweep after retirement
    stream.clear([0.0; 4]);
    stream.flush(WaitMode::Wait);
    assert_eq!(stats.live_objects(), 0);
}

#[test]
fn device_frame_throttles_pending_frames() {
    let mut config = RenderDeviceConfig::default();
    config.max_pending_frames = 1;
    let (device, stats) = make_device(config);
    let mut stream = device.create_cmd_stream();

    for i in 0..10 {
        stream.clear([i as f32, 0.0, 0.0, 1.0]);
        device.device_frame(&mut stream);
    }
    device.flush_device();
    assert_eq!(stats.clears.lock().unwrap().len(), 10);
}

#[test]
fn state_objects_bind_in_order() {
    let (device, stats) = make_device(RenderDeviceConfig::default());
    let mut stream = device.create_cmd_stream();

    let blend = stream.create_blend_state(
        adk_core::BlendStateDesc {
            blend: None,
            color_write_mask: ColorMask::ALL,
        },
        "blend",
    );
    let dss = stream.create_depth_stencil_state(
        adk_core::DepthStencilStateDesc {
            depth: None,
            stencil: None,
        },
        "dss",
    );
    stream.set_blend_state(&blend);
    stream.set_depth_stencil_state(&dss, 7);
    stream.flush(WaitMode::Wait);

    assert_eq!(stats.blend_binds.lock().unwrap().len(), 1);
    assert_eq!(stats.depth_stencil_binds.lock().unwrap()[0].1, 7);
}

#[test]
fn tracking_accounts_texture_bytes() {
    let mut config = RenderDeviceConfig::default();
    config.enable_resource_tracking = true;
    let (device, _stats) = make_device(config);
    let mut stream = device.create_cmd_stream();

    let mips = ImageMips::single(ImageDesc::uncompressed(32, 8, 1));
    let tex = stream.create_texture_2d(
        mips,
        PixelFormat::R8Unorm,
        TextureUsage::Dynamic,
        SamplerDesc::default(),
        None,
        "atlas",
    );
    stream.flush(WaitMode::Wait);
    let usage = device.memory_usage();
    assert_eq!(usage.texture_memory, 32 * 8);
    assert_eq!(usage.total_memory, 32 * 8);
    assert_eq!(usage.peak_memory, 32 * 8);

    drop(tex);
    stream.clear([0.0; 4]);
    stream.flush(WaitMode::Wait);
    let usage = device.memory_usage();
    assert_eq!(usage.total_memory, 0);
    assert_eq!(usage.peak_memory, 32 * 8);
}
