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

//! Canvas fixture over the dummy backend.

extern crate adk;
extern crate adk_core;
extern crate adk_imagelib;
extern crate adk_runtime;
extern crate env_logger;

use std::sync::Arc;

use adk::{color, rect, vec2, BlendMode, CanvasConfig, CanvasDimensions, CgContext, CgImage,
          ClipState, ImageTiling, Margins, PathOptions, SdfRectParams, Winding};
use adk_core::{DrawMode, DummyRhi, DummyStats, PixelFormat, RenderDevice, RenderDeviceConfig,
               SamplerDesc, TextureUsage, WaitMode};
use adk_imagelib::{ImageDesc, ImageMips};
use adk_runtime::ThreadPool;

type Ctx = CgContext<adk_core::DummyResources>;

fn make_canvas() -> (Ctx, Arc<DummyStats>) {
    make_canvas_with(CanvasConfig::default())
}

fn make_canvas_with(config: CanvasConfig) -> (Ctx, Arc<DummyStats>) {
    let _ = env_logger::try_init();
    let (rhi, stats) = DummyRhi::new();
    let device = RenderDevice::new(rhi, RenderDeviceConfig::default(), "canvas-test").unwrap();
    let pool = Arc::new(ThreadPool::new(1, "canvas-test-worker"));
    let ctx = CgContext::new(
        device,
        pool,
        CanvasDimensions {
            virtual_width: 1280,
            virtual_height: 720,
            display_width: 1280,
            display_height: 720,
        },
        config,
    );
    (ctx, stats)
}

fn flush(ctx: &mut Ctx) {
    ctx.gl.stream.flush(WaitMode::Wait);
}

fn draws_since(stats: &DummyStats, mark: usize) -> Vec<adk_core::dummy::DrawRecord> {
    stats.draws.lock().unwrap()[mark..].to_vec()
}

fn draw_mark(stats: &DummyStats) -> usize {
    stats.draws.lock().unwrap().len()
}

fn complete_image(ctx: &mut Ctx, width: u32, height: u32) -> CgImage<adk_core::DummyResources> {
    let desc = ImageDesc::uncompressed(width, height, 4);
    let tex = ctx.gl.stream.create_texture_2d(
        ImageMips::single(desc),
        PixelFormat::Rgba8Unorm,
        TextureUsage::Static,
        SamplerDesc::default(),
        None,
        "test_image",
    );
    CgImage::from_texture(adk::CgGlTexture::new(tex), desc)
}

fn decode_verts(bytes: &[u8]) -> Vec<[f32; 6]> {
    assert_eq!(bytes.len() % 24, 0);
    bytes
        .chunks(24)
        .map(|v| {
            let mut out = [0f32; 6];
            for (i, f) in v.chunks(4).enumerate() {
                let bits = f[0] as u32
                    | ((f[1] as u32) << 8)
                    | ((f[2] as u32) << 16)
                    | ((f[3] as u32) << 24);
                out[i] = f32::from_bits(bits);
            }
            out
        })
        .collect()
}

#[test]
fn triangle_fill_emits_fan_plus_feather() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);

    ctx.begin_path();
    ctx.move_to(vec2(0.0, 0.0));
    ctx.line_to(vec2(100.0, 0.0));
    ctx.line_to(vec2(0.0, 100.0));
    ctx.close_path();

    let mark = draw_mark(&stats);
    ctx.fill();
    flush(&mut ctx);

    // one subpath of size 3, closed, CW after normalization
    assert_eq!(ctx.path().subpaths.len(), 1);
    let sp = &ctx.path().subpaths[0];
    assert_eq!(sp.len(), 3);
    assert!(sp.closed);
    assert_eq!(sp.winding(), Winding::Cw);

    // exactly one feather strip plus one interior fan, stencil untouched
    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[0].mode, DrawMode::TriangleStrip);
    assert_eq!(draws[0].count, (3 - 1) * 4 + 2);
    assert_eq!(draws[1].mode, DrawMode::TriangleFan);
    assert_eq!(draws[1].count, 3 * 2 - 2);
}

#[test]
fn ccw_input_is_normalized_to_cw() {
    let (mut ctx, _stats) = make_canvas();
    ctx.begin(16);
    ctx.begin_path();
    // wound the other way
    ctx.move_to(vec2(0.0, 0.0));
    ctx.line_to(vec2(0.0, 100.0));
    ctx.line_to(vec2(100.0, 0.0));
    ctx.close_path();
    ctx.fill();
    assert_eq!(ctx.path().subpaths[0].winding(), Winding::Cw);
}

#[test]
fn concave_fill_uses_stencil_passes() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    ctx.begin_path();
    ctx.move_to(vec2(0.0, 0.0));
    ctx.line_to(vec2(100.0, 0.0));
    ctx.line_to(vec2(50.0, 50.0)); // notch
    ctx.line_to(vec2(100.0, 100.0));
    ctx.line_to(vec2(0.0, 100.0));
    ctx.close_path();

    let mark = draw_mark(&stats);
    let dss_mark = stats.depth_stencil_binds.lock().unwrap().len();
    ctx.fill_with_options(PathOptions::CONCAVE);
    flush(&mut ctx);

    // fan, feather, fan again
    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 3);
    assert_eq!(draws[0].mode, DrawMode::TriangleFan);
    assert_eq!(draws[1].mode, DrawMode::TriangleStrip);
    assert_eq!(draws[2].mode, DrawMode::TriangleFan);
    // accum, eq, neq, off
    let dss = stats.depth_stencil_binds.lock().unwrap();
    assert_eq!(dss.len() - dss_mark, 4);
}

#[test]
fn no_feather_option_skips_the_band() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    ctx.begin_path();
    ctx.move_to(vec2(0.0, 0.0));
    ctx.line_to(vec2(100.0, 0.0));
    ctx.line_to(vec2(0.0, 100.0));
    ctx.close_path();
    let mark = draw_mark(&stats);
    ctx.fill_with_options(PathOptions::NO_FEATHER);
    flush(&mut ctx);
    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].mode, DrawMode::TriangleFan);
}

#[test]
fn stroke_emits_ten_verts_per_segment() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    ctx.begin_path();
    ctx.move_to(vec2(0.0, 0.0));
    ctx.line_to(vec2(100.0, 0.0));
    ctx.line_to(vec2(100.0, 100.0));
    ctx.end_path();
    let mark = draw_mark(&stats);
    ctx.stroke();
    flush(&mut ctx);
    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].mode, DrawMode::TriangleStrip);
    // open subpath of 3 points: 10 * (n - 1)
    assert_eq!(draws[0].count, 10 * 2);
}

#[test]
fn nine_slice_emits_exactly_28_vertices() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    let image = complete_image(&mut ctx, 512, 512);

    let mark = draw_mark(&stats);
    let upload_mark = stats.mesh_upload_data.lock().unwrap().len();
    ctx.draw_image_9slice(
        &image,
        Margins {
            left: 16.0,
            right: 16.0,
            top: 16.0,
            bottom: 16.0,
        },
        rect(0.0, 0.0, 256.0, 256.0),
    );
    flush(&mut ctx);

    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].mode, DrawMode::TriangleStrip);
    assert_eq!(draws[0].count, 28);

    // uv marks at the margin boundaries
    let uploads = stats.mesh_upload_data.lock().unwrap();
    let verts = decode_verts(&uploads[upload_mark]);
    assert_eq!(verts.len(), 28);
    let u0 = 16.0 / 512.0;
    let u1 = 1.0 - 16.0 / 512.0;
    // vert 2 is the top-left inner corner (p2 at u0,v0)
    assert!((verts[2][2] - u0).abs() < 1.0e-6);
    assert!((verts[2][3] - u0).abs() < 1.0e-6);
    // vert 4 is the top-right inner corner (p6 at u1,v0)
    assert!((verts[4][2] - u1).abs() < 1.0e-6);
    // the center quad closes on p6/p13/p8
    assert!((verts[25][2] - u1).abs() < 1.0e-6 && (verts[25][3] - u0).abs() < 1.0e-6);
    assert!((verts[26][2] - u0).abs() < 1.0e-6 && (verts[26][3] - u1).abs() < 1.0e-6);
    assert!((verts[27][2] - u1).abs() < 1.0e-6 && (verts[27][3] - u1).abs() < 1.0e-6);
}

#[test]
fn sdf_rect_uniforms_carry_box_and_roundness() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);

    let mark = draw_mark(&stats);
    ctx.sdf_fill_rect_rounded(
        rect(0.0, 0.0, 200.0, 100.0),
        SdfRectParams {
            roundness: 20.0,
            fade: 1.0,
            border_width: 0.0,
            border_color: color(1.0, 0.0, 0.0, 1.0),
        },
    );
    flush(&mut ctx);

    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].mode, DrawMode::Triangles);
    assert_eq!(draws[0].count, 6);

    let uploads = stats.uniform_uploads.lock().unwrap();
    let floats = decode_floats(uploads.last().unwrap());
    // box.centerpoint = (100, 50), box.half_dim = (100, 50)
    assert_eq!(&floats[4..8], &[100.0, 50.0, 100.0, 50.0]);
    // roundness and fade scale with the (identity) transform
    assert_eq!(floats[8], 20.0);
    assert_eq!(floats[9], 1.0);
}

#[test]
fn sdf_border_binds_the_border_shader() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);

    ctx.sdf_fill_rect_rounded(
        rect(0.0, 0.0, 200.0, 100.0),
        SdfRectParams {
            roundness: 20.0,
            fade: 0.0,
            border_width: 0.0,
            border_color: color(1.0, 0.0, 0.0, 1.0),
        },
    );
    flush(&mut ctx);
    let plain_program = *stats.program_binds.lock().unwrap().last().unwrap();

    ctx.sdf_fill_rect_rounded(
        rect(0.0, 0.0, 200.0, 100.0),
        SdfRectParams {
            roundness: 20.0,
            fade: 0.0,
            border_width: 2.0,
            border_color: color(1.0, 0.0, 0.0, 1.0),
        },
    );
    flush(&mut ctx);
    let border_program = *stats.program_binds.lock().unwrap().last().unwrap();
    assert!(border_program != plain_program);

    // stroke uniforms: width at slot 10, color at 12..16
    let uploads = stats.uniform_uploads.lock().unwrap();
    let floats = decode_floats(uploads.last().unwrap());
    assert_eq!(floats[10], 2.0);
    assert_eq!(&floats[12..16], &[1.0, 0.0, 0.0, 1.0]);

    // tiled image fills accept every tiling mode
    let image = complete_image(&mut ctx, 64, 64);
    for &tiling in &[ImageTiling::Stretch, ImageTiling::Relative, ImageTiling::Absolute] {
        ctx.sdf_fill_image_rect_rounded(
            &image,
            rect(10.0, 10.0, 100.0, 60.0),
            SdfRectParams::default(),
            tiling,
        );
    }
    flush(&mut ctx);
}

fn decode_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks(4)
        .map(|f| {
            f32::from_bits(
                f[0] as u32 | ((f[1] as u32) << 8) | ((f[2] as u32) << 16) | ((f[3] as u32) << 24),
            )
        })
        .collect()
}

#[test]
fn save_restore_round_trips_state() {
    let (mut ctx, _stats) = make_canvas();
    ctx.begin(16);
    ctx.set_global_alpha(0.5);
    ctx.save();
    ctx.set_global_alpha(0.25);
    ctx.translate(vec2(10.0, 10.0));
    assert_eq!(ctx.global_alpha(), 0.25);
    ctx.restore();
    assert_eq!(ctx.global_alpha(), 0.5);
    assert_eq!(ctx.state_depth(), 0);
}

#[test]
#[should_panic(expected = "save")]
fn save_beyond_max_states_is_a_program_error() {
    let mut config = CanvasConfig::default();
    config.max_states = 4;
    let (mut ctx, _stats) = make_canvas_with(config);
    ctx.begin(16);
    for _ in 0..10 {
        ctx.save();
    }
}

#[test]
#[should_panic(expected = "save/restore")]
fn restore_at_depth_zero_is_a_program_error() {
    let (mut ctx, _stats) = make_canvas();
    ctx.begin(16);
    ctx.restore();
}

#[test]
fn clip_rect_only_intersects() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    ctx.set_clip_state(ClipState::Enabled);
    ctx.set_clip_rect(rect(10.0, 10.0, 500.0, 500.0));
    ctx.set_clip_rect(rect(0.0, 0.0, 100.0, 2000.0));

    let clip = ctx.clip();
    assert_eq!(clip.x0, 10.0);
    assert_eq!(clip.y0, 10.0);
    assert_eq!(clip.x1, 100.0);
    assert_eq!(clip.y1, 510.0);

    // the scissor reaches the device once something draws
    ctx.fill_rect(rect(0.0, 0.0, 50.0, 50.0));
    flush(&mut ctx);
    let rects = stats.scissor_rects.lock().unwrap();
    let last = rects.last().unwrap();
    assert_eq!((last.x, last.y), (10, 10));
    assert_eq!((last.w, last.h), (90, 500));
}

#[test]
fn punchthrough_blend_mode_fix_coerces_blend() {
    let mut config = CanvasConfig::default();
    config.enable_punchthrough_blend_mode_fix = true;
    let (mut ctx, _stats) = make_canvas_with(config);
    ctx.begin(16);

    // no video texture active: the requested mode sticks
    ctx.set_blend_mode(BlendMode::Blit);
    assert_eq!(ctx.blend_mode(), BlendMode::Blit);
}

#[test]
fn draw_image_of_pending_image_uses_fill_style() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    let pending: CgImage<adk_core::DummyResources> = {
        // a load that will never complete in this frame
        ctx.load_image_async(adk::MemoryRegion::Low, || {
            Err((adk::ImageLoadStatus::Aborted, 0))
        })
    };
    let mark = draw_mark(&stats);
    ctx.draw_image(&pending, vec2(0.0, 0.0));
    flush(&mut ctx);
    // still draws a quad (flat fill) even with no texture
    let draws = draws_since(&stats, mark);
    assert_eq!(draws.len(), 1);
    assert_eq!(draws[0].count, 4);
}

#[test]
fn image_load_completes_through_the_pool() {
    let (rhi, _stats) = DummyRhi::new();
    let device = RenderDevice::new(rhi, RenderDeviceConfig::default(), "canvas-test").unwrap();
    let pool = Arc::new(ThreadPool::new(1, "canvas-test-worker"));
    let mut ctx: Ctx = CgContext::new(
        device,
        pool.clone(),
        CanvasDimensions {
            virtual_width: 1280,
            virtual_height: 720,
            display_width: 1280,
            display_height: 720,
        },
        CanvasConfig::default(),
    );

    let image = ctx.load_image_async(adk::MemoryRegion::Low, || {
        Ok(adk::DecodedImage {
            desc: ImageDesc::uncompressed(4, 4, 4),
            pixels: vec![0x7f; 4 * 4 * 4],
            mask: None,
            frames: Vec::new(),
            is_bif: false,
        })
    });
    assert_eq!(image.load_status(), adk::ImageLoadStatus::Pending);

    // wait for the decode, then the next frame boundary installs it
    pool.drain();
    ctx.begin(16);
    assert_eq!(image.load_status(), adk::ImageLoadStatus::Complete);
    assert_eq!(image.image_rect(), rect(0.0, 0.0, 4.0, 4.0));
    assert!(image.is_drawable());

    ctx.image_free(image);
}

#[test]
fn vertex_banks_wrap_under_load() {
    let mut config = CanvasConfig::default();
    config.gl.max_verts_per_vertex_bank = 64;
    let (mut ctx, stats) = make_canvas_with(config);
    ctx.begin(16);
    // each quad takes 4 verts; hundreds of quads force bank cycling
    let image = complete_image(&mut ctx, 16, 16);
    for i in 0..200 {
        ctx.draw_image(&image, vec2(i as f32, 0.0));
    }
    flush(&mut ctx);
    assert_eq!(
        stats
            .draws
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.count == 4)
            .count(),
        200
    );
}
