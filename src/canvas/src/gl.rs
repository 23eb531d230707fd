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

//! Canvas rendering backend.
//!
//! Owns the canvas shader set, blend/rasterizer/depth-stencil objects, the
//! streaming vertex banks, and the uniform block, and turns canvas-level
//! binds into command-stream writes. Vertex banks are sized by
//! configuration and cycled under fence discipline: switching to a bank
//! waits out its previous use.

use adk_core::state;
use adk_core::target;
use adk_core::{BlendState, BlendStateDesc, CmdStream, ColorMask, DepthStencilState,
               DepthStencilStateDesc, DrawMode, Fence, Mesh, MeshChannelDesc, MeshDataLayout,
               MeshDataLayoutDesc, MeshElementDesc, PixelFormat, Program, RasterizerState,
               RasterizerStateDesc, RenderDevice, Resources, SamplerDesc, Texture,
               TextureCreateDesc, TextureUsage, UniformBuffer, VertexSemantic, WaitMode};
use adk_imagelib::{ImageDesc, ImageMips};

use math::{Box2, Color, Vec2};

// precompiled canvas shader pair identifiers; the RHI resolves these to the
// platform's shader binaries
const VERT_CANVAS: &'static [u8] = b"cg/canvas.vert";
const FRAG_COLOR: &'static [u8] = b"cg/color.frag";
const FRAG_COLOR_RGB_FILL_ALPHA_RED: &'static [u8] = b"cg/color_rgb_fill_alpha_red.frag";
const FRAG_COLOR_ALPHA_MASK: &'static [u8] = b"cg/color_alpha_mask.frag";
const FRAG_COLOR_ALPHA_TEST: &'static [u8] = b"cg/color_alpha_test.frag";
const FRAG_COLOR_ALPHA_TEST_RGB_FILL_ALPHA_RED: &'static [u8] =
    b"cg/color_alpha_test_rgb_fill_alpha_red.frag";
const FRAG_SDF_RECT: &'static [u8] = b"cg/sdf_rect.frag";
const FRAG_SDF_RECT_BORDER: &'static [u8] = b"cg/sdf_rect_border.frag";
const FRAG_VIDEO: &'static [u8] = b"cg/video.frag";
const FRAG_VIDEO_HDR: &'static [u8] = b"cg/video_hdr.frag";

/// Bytes per canvas vertex.
pub const VERTEX_STRIDE: usize = 24;

/// The canvas vertex: position plus a color channel that doubles as UV.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CgVertex {
    /// Position x.
    pub x: f32,
    /// Position y.
    pub y: f32,
    /// Red / u.
    pub r: f32,
    /// Green / v.
    pub g: f32,
    /// Blue (unused, always 0).
    pub b: f32,
    /// Alpha.
    pub a: f32,
}

/// Serialize vertices for a mesh channel upload.
pub fn verts_as_bytes(verts: &[CgVertex]) -> Vec<u8> {
    let mut out = Vec::with_capacity(verts.len() * VERTEX_STRIDE);
    for v in verts {
        for &f in &[v.x, v.y, v.r, v.g, v.b, v.a] {
            let bits = f.to_bits();
            out.push(bits as u8);
            out.push((bits >> 8) as u8);
            out.push((bits >> 16) as u8);
            out.push((bits >> 24) as u8);
        }
    }
    out
}

/// A texture plus the sampler used when binding it; pattern draws override
/// the wrap modes without touching the texture itself.
#[derive(Clone, Debug)]
pub struct CgGlTexture<R: Resources> {
    /// The GPU texture.
    pub texture: Texture<R>,
    /// Per-bind sampler state.
    pub sampler_state: SamplerDesc,
}

impl<R: Resources> CgGlTexture<R> {
    /// Wrap a texture with its creation-time sampler.
    pub fn new(texture: Texture<R>) -> CgGlTexture<R> {
        let sampler = texture.sampler();
        CgGlTexture {
            texture: texture,
            sampler_state: sampler,
        }
    }
}

/// SDF rounded-rect uniforms.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SdfRectUniforms {
    /// Box center/half-dim in device space.
    pub rect_box: Box2,
    /// Corner radius in device space.
    pub roundness: f32,
    /// Extra anti-alias band.
    pub fade: f32,
}

/// SDF rounded-rect uniforms with a border stroke.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SdfRectBorderUniforms {
    /// Common rect uniforms.
    pub sdf_rect_uniforms: SdfRectUniforms,
    /// Stroke color.
    pub stroke_color: Color,
    /// Stroke width in device space.
    pub stroke_size: f32,
}

/// Canvas GL configuration.
#[derive(Clone, Copy, Debug)]
pub struct CgGlConfig {
    /// Vertex capacity of each streaming bank.
    pub max_verts_per_vertex_bank: usize,
    /// Number of streaming banks cycled under fences.
    pub num_vertex_banks: usize,
}

impl Default for CgGlConfig {
    fn default() -> CgGlConfig {
        CgGlConfig {
            max_verts_per_vertex_bank: 16 * 1024,
            num_vertex_banks: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct ScissorState {
    x0: i32,
    y0: i32,
    x1: i32,
    y1: i32,
    enabled: bool,
}

struct VertexBank<R: Resources> {
    mesh: Mesh<R>,
    fence: Fence,
    verts: Vec<CgVertex>,
}

struct Shaders<R: Resources> {
    color: Program<R>,
    color_rgb_fill_alpha_red: Program<R>,
    color_alpha_mask: Program<R>,
    color_alpha_test: Program<R>,
    color_alpha_test_rgb_fill_alpha_red: Program<R>,
    sdf_rect: Program<R>,
    sdf_rect_border: Program<R>,
    video: Program<R>,
    video_hdr: Program<R>,
}

enum BlendMode {
    Off,
    AlphaRgb,
    AlphaAll,
    Blit,
}

/// The canvas render backend state.
pub struct CgGlState<R: Resources> {
    /// The canvas's command stream into the render device.
    pub stream: CmdStream<R>,
    config: CgGlConfig,

    banks: Vec<VertexBank<R>>,
    active_bank: usize,
    map_ofs: usize,
    vertex_ofs: usize,
    map_count: usize,
    map_active: bool,
    last_draw_base: usize,

    shaders: Shaders<R>,
    mesh_layout: MeshDataLayout<R>,
    uniforms: UniformBuffer<R>,

    /// The canvas's 1x1 white texture, used when no image is bound.
    pub white: CgGlTexture<R>,

    bs_blend_off_color_write_mask_rgb: BlendState<R>,
    bs_blend_off_color_write_mask_none: BlendState<R>,
    bs_blend_alpha_color_write_mask_rgb: BlendState<R>,
    bs_blend_alpha_color_write_mask_all: BlendState<R>,
    bs_blend_blit: BlendState<R>,
    bs_blend_font: BlendState<R>,

    rs_scissor_off: RasterizerState<R>,
    rs_scissor_on: RasterizerState<R>,

    dss_stencil_off: DepthStencilState<R>,
    dss_stencil_accum: DepthStencilState<R>,
    dss_stencil_eq: DepthStencilState<R>,
    dss_stencil_neq: DepthStencilState<R>,

    cur_blend: BlendMode,
    scissor_rhi: ScissorState,
    scissor_canvas: ScissorState,
}

fn alpha_blend() -> state::Blend {
    let channel = state::BlendChannel {
        equation: state::Equation::Add,
        source: state::Factor::ZeroPlus(state::BlendValue::SourceAlpha),
        destination: state::Factor::OneMinus(state::BlendValue::SourceAlpha),
    };
    state::Blend {
        color: channel,
        alpha: channel,
    }
}

fn stencil_side(fun: state::Comparison, op_pass: state::StencilOp) -> state::StencilSide {
    state::StencilSide {
        fun: fun,
        mask_read: 0xff,
        mask_write: 0xff,
        op_fail: state::StencilOp::Keep,
        op_depth_fail: state::StencilOp::Keep,
        op_pass: op_pass,
    }
}

fn stencil_state(fun: state::Comparison, op_pass: state::StencilOp) -> state::Stencil {
    let side = stencil_side(fun, op_pass);
    state::Stencil {
        front: side,
        back: side,
    }
}

impl<R: Resources> CgGlState<R> {
    /// Build the backend over a device: shader set, state objects, vertex
    /// banks, white texture.
    pub fn new(device: &RenderDevice<R>, config: CgGlConfig) -> CgGlState<R> {
        assert!(config.num_vertex_banks >= 2);
        assert!(config.max_verts_per_vertex_bank > 0);
        let mut stream = device.create_cmd_stream();

        let shaders = Shaders {
            color: stream.create_program_from_binary(VERT_CANVAS, FRAG_COLOR, "cg_color"),
            color_rgb_fill_alpha_red: stream.create_program_from_binary(
                VERT_CANVAS,
                FRAG_COLOR_RGB_FILL_ALPHA_RED,
                "cg_color_rgb_fill_alpha_red",
            ),
            color_alpha_mask: stream.create_program_from_binary(
                VERT_CANVAS,
                FRAG_COLOR_ALPHA_MASK,
                "cg_color_alpha_mask",
            ),
            color_alpha_test: stream.create_program_from_binary(
                VERT_CANVAS,
                FRAG_COLOR_ALPHA_TEST,
                "cg_color_alpha_test",
            ),
            color_alpha_test_rgb_fill_alpha_red: stream.create_program_from_binary(
                VERT_CANVAS,
                FRAG_COLOR_ALPHA_TEST_RGB_FILL_ALPHA_RED,
                "cg_color_alpha_test_rgb_fill_alpha_red",
            ),
            sdf_rect: stream.create_program_from_binary(VERT_CANVAS, FRAG_SDF_RECT, "cg_sdf_rect"),
            sdf_rect_border: stream.create_program_from_binary(
                VERT_CANVAS,
                FRAG_SDF_RECT_BORDER,
                "cg_sdf_rect_border",
            ),
            video: stream.create_program_from_binary(VERT_CANVAS, FRAG_VIDEO, "cg_video"),
            video_hdr: stream.create_program_from_binary(VERT_CANVAS, FRAG_VIDEO_HDR, "cg_video_hdr"),
        };

        let mesh_layout = stream.create_mesh_data_layout(
            MeshDataLayoutDesc {
                channels: vec![MeshChannelDesc {
                    stride: VERTEX_STRIDE,
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
            },
            "cg_vertex_layout",
        );

        let mut banks = Vec::with_capacity(config.num_vertex_banks);
        for _ in 0..config.num_vertex_banks {
            let mesh = stream.create_mesh(
                &[config.max_verts_per_vertex_bank * VERTEX_STRIDE],
                &mesh_layout,
                "cg_vertex_bank",
            );
            banks.push(VertexBank {
                mesh: mesh,
                fence: Fence::default(),
                verts: vec![CgVertex::default(); config.max_verts_per_vertex_bank],
            });
        }

        let uniforms = stream.create_uniform_buffer(32 * 4, None, "cg_uniforms");

        let white = {
            let desc = ImageDesc::uncompressed(1, 1, 4);
            let tex = stream.create_texture_2d(
                ImageMips::single(desc),
                PixelFormat::Rgba8Unorm,
                TextureUsage::Static,
                SamplerDesc::default(),
                Some(&[0xff, 0xff, 0xff, 0xff]),
                "cg_white",
            );
            CgGlTexture::new(tex)
        };

        let bs_off_rgb = stream.create_blend_state(
            BlendStateDesc {
                blend: None,
                color_write_mask: ColorMask::COLOR,
            },
            "cg_bs_off_rgb",
        );
        let bs_off_none = stream.create_blend_state(
            BlendStateDesc {
                blend: None,
                color_write_mask: ColorMask::empty(),
            },
            "cg_bs_off_none",
        );
        let bs_alpha_rgb = stream.create_blend_state(
            BlendStateDesc {
                blend: Some(alpha_blend()),
                color_write_mask: ColorMask::COLOR,
            },
            "cg_bs_alpha_rgb",
        );
        let bs_alpha_all = stream.create_blend_state(
            BlendStateDesc {
                blend: Some(alpha_blend()),
                color_write_mask: ColorMask::ALL,
            },
            "cg_bs_alpha_all",
        );
        let bs_blit = stream.create_blend_state(
            BlendStateDesc {
                blend: None,
                color_write_mask: ColorMask::ALL,
            },
            "cg_bs_blit",
        );
        let bs_font = stream.create_blend_state(
            BlendStateDesc {
                blend: Some(alpha_blend()),
                color_write_mask: ColorMask::COLOR,
            },
            "cg_bs_font",
        );

        let rs_scissor_off = stream.create_rasterizer_state(
            RasterizerStateDesc {
                rasterizer: state::Rasterizer::new_fill(),
                scissor_enabled: false,
            },
            "cg_rs_scissor_off",
        );
        let rs_scissor_on = stream.create_rasterizer_state(
            RasterizerStateDesc {
                rasterizer: state::Rasterizer::new_fill(),
                scissor_enabled: true,
            },
            "cg_rs_scissor_on",
        );

        let dss_off = stream.create_depth_stencil_state(
            DepthStencilStateDesc {
                depth: None,
                stencil: None,
            },
            "cg_dss_off",
        );
        let dss_accum = stream.create_depth_stencil_state(
            DepthStencilStateDesc {
                depth: None,
                stencil: Some(stencil_state(
                    state::Comparison::Always,
                    state::StencilOp::Invert,
                )),
            },
            "cg_dss_accum",
        );
        let dss_eq = stream.create_depth_stencil_state(
            DepthStencilStateDesc {
                depth: None,
                stencil: Some(stencil_state(state::Comparison::Equal, state::StencilOp::Keep)),
            },
            "cg_dss_eq",
        );
        let dss_neq = stream.create_depth_stencil_state(
            DepthStencilStateDesc {
                depth: None,
                stencil: Some(stencil_state(
                    state::Comparison::NotEqual,
                    state::StencilOp::Keep,
                )),
            },
            "cg_dss_neq",
        );

        CgGlState {
            stream: stream,
            config: config,
            banks: banks,
            active_bank: 0,
            map_ofs: 0,
            vertex_ofs: 0,
            map_count: 0,
            map_active: false,
            last_draw_base: 0,
            shaders: shaders,
            mesh_layout: mesh_layout,
            uniforms: uniforms,
            white: white,
            bs_blend_off_color_write_mask_rgb: bs_off_rgb,
            bs_blend_off_color_write_mask_none: bs_off_none,
            bs_blend_alpha_color_write_mask_rgb: bs_alpha_rgb,
            bs_blend_alpha_color_write_mask_all: bs_alpha_all,
            bs_blend_blit: bs_blit,
            bs_blend_font: bs_font,
            rs_scissor_off: rs_scissor_off,
            rs_scissor_on: rs_scissor_on,
            dss_stencil_off: dss_off,
            dss_stencil_accum: dss_accum,
            dss_stencil_eq: dss_eq,
            dss_stencil_neq: dss_neq,
            cur_blend: BlendMode::AlphaRgb,
            scissor_rhi: ScissorState::default(),
            scissor_canvas: ScissorState::default(),
        }
    }

    /// The configured per-bank vertex capacity.
    pub fn max_verts_per_vertex_bank(&self) -> usize {
        self.config.max_verts_per_vertex_bank
    }

    /// The mesh layout shared by the vertex banks and text meshes.
    pub fn mesh_layout(&self) -> &MeshDataLayout<R> {
        &self.mesh_layout
    }

    /// Begin a canvas frame: viewport, clear, default states.
    pub fn state_begin(&mut self, width: i32, height: i32, clear_color: u32) {
        self.stream.set_viewport(width as u32, height as u32);
        let c = [
            ((clear_color >> 24) & 0xff) as f32 / 255.0,
            ((clear_color >> 16) & 0xff) as f32 / 255.0,
            ((clear_color >> 8) & 0xff) as f32 / 255.0,
            (clear_color & 0xff) as f32 / 255.0,
        ];
        self.stream.clear(c);
        let off = self.dss_stencil_off.clone();
        self.stream.set_depth_stencil_state(&off, 0);
        self.set_mode_blend_alpha_rgb();
        let rs = self.rs_scissor_off.clone();
        self.stream.set_rasterizer_state(&rs);
        self.scissor_rhi = ScissorState::default();
    }

    /// End a canvas frame: submit pending commands.
    pub fn state_end(&mut self) -> Fence {
        self.stream.flush(WaitMode::NoWait)
    }

    // ---- vertex banks ----

    /// Reserve `count` vertices in the active bank, switching (and fencing)
    /// banks on overflow. Writes go through `set_vert` until
    /// `finish_vertex_range`.
    pub fn map_vertex_range(&mut self, count: usize) {
        assert!(!self.map_active, "vertex range already mapped");
        assert!(
            count <= self.config.max_verts_per_vertex_bank,
            "vertex range exceeds bank capacity"
        );
        if self.vertex_ofs + count > self.config.max_verts_per_vertex_bank {
            self.active_bank = (self.active_bank + 1) % self.banks.len();
            let fence = self.banks[self.active_bank].fence;
            // the new bank may still be in flight
            self.stream.conditional_flush_and_wait_fence(fence);
            self.vertex_ofs = 0;
        }
        self.map_ofs = self.vertex_ofs;
        self.map_count = count;
        self.map_active = true;
    }

    /// Write one vertex of the mapped range. The blue channel is reserved
    /// and always zero.
    pub fn set_vert(&mut self, idx: usize, pos: Vec2, col: Color) {
        debug_assert!(self.map_active, "set_vert outside a mapped range");
        debug_assert!(idx < self.map_count);
        self.banks[self.active_bank].verts[self.map_ofs + idx] = CgVertex {
            x: pos.x,
            y: pos.y,
            r: col.r,
            g: col.g,
            b: 0.0,
            a: col.a,
        };
    }

    /// Duplicate an already-written vertex of the mapped range.
    pub fn copy_vert(&mut self, src: usize, dst: usize) {
        debug_assert!(src < dst);
        let v = self.banks[self.active_bank].verts[self.map_ofs + src];
        self.banks[self.active_bank].verts[self.map_ofs + dst] = v;
    }

    /// Copy a prebuilt vertex block into the mapped range starting at
    /// `idx` (text meshes stage vertices CPU-side first).
    pub fn set_verts(&mut self, idx: usize, verts: &[CgVertex]) {
        debug_assert!(self.map_active);
        debug_assert!(idx + verts.len() <= self.map_count);
        let base = self.map_ofs + idx;
        self.banks[self.active_bank].verts[base..base + verts.len()].copy_from_slice(verts);
    }

    /// Close the mapped range and upload exactly the mapped count.
    pub fn finish_vertex_range(&mut self) {
        let count = self.map_count;
        self.finish_vertex_range_with_count(count);
    }

    /// Close the mapped range, uploading `count` vertices (which may be
    /// less than the reservation when the producer came up short).
    pub fn finish_vertex_range_with_count(&mut self, count: usize) {
        assert!(self.map_active, "unbalanced finish_vertex_range");
        debug_assert!(count <= self.map_count);
        self.map_active = false;
        self.last_draw_base = self.map_ofs;
        if count > 0 {
            let bytes = {
                let bank = &self.banks[self.active_bank];
                verts_as_bytes(&bank.verts[self.map_ofs..self.map_ofs + count])
            };
            let mesh = self.banks[self.active_bank].mesh.clone();
            self.stream
                .upload_mesh_channel_data(&mesh, 0, self.map_ofs, count, VERTEX_STRIDE, &bytes);
        }
        // the whole reservation is consumed even when fewer verts were
        // written
        self.vertex_ofs = self.map_ofs + self.map_count;
        let fence = self.stream.stream_fence();
        self.banks[self.active_bank].fence = fence;
    }

    /// Draw from the most recently finished range: `offset` is relative to
    /// the start of that range.
    pub fn draw(&mut self, mode: DrawMode, count: usize, offset: usize) {
        assert!(!self.map_active, "draw inside a mapped vertex range");
        self.apply_scissor_state();
        let mesh = self.banks[self.active_bank].mesh.clone();
        self.stream.bind_mesh(&mesh);
        self.stream.draw(mode, self.last_draw_base + offset, count);
        let fence = self.stream.stream_fence();
        self.banks[self.active_bank].fence = fence;
    }

    /// Draw from an externally owned mesh (memoized text).
    pub fn draw_mesh(&mut self, mesh: &Mesh<R>, mode: DrawMode, count: usize, offset: usize) {
        self.apply_scissor_state();
        self.stream.bind_mesh(mesh);
        self.stream.draw(mode, offset, count);
    }

    // ---- blend / stencil modes ----

    /// Disable blending (RGB writes only).
    pub fn set_mode_blend_off(&mut self) {
        let bs = self.bs_blend_off_color_write_mask_rgb.clone();
        self.stream.set_blend_state(&bs);
        self.cur_blend = BlendMode::Off;
    }

    /// Source-alpha blend into RGB only.
    pub fn set_mode_blend_alpha_rgb(&mut self) {
        let bs = self.bs_blend_alpha_color_write_mask_rgb.clone();
        self.stream.set_blend_state(&bs);
        self.cur_blend = BlendMode::AlphaRgb;
    }

    /// Source-alpha blend into all channels.
    pub fn set_mode_blend_alpha_all(&mut self) {
        let bs = self.bs_blend_alpha_color_write_mask_all.clone();
        self.stream.set_blend_state(&bs);
        self.cur_blend = BlendMode::AlphaAll;
    }

    /// Straight copy, all channels.
    pub fn set_mode_blit(&mut self) {
        let bs = self.bs_blend_blit.clone();
        self.stream.set_blend_state(&bs);
        self.cur_blend = BlendMode::Blit;
    }

    fn reapply_color_blend(&mut self) {
        let bs = match self.cur_blend {
            BlendMode::Off => self.bs_blend_off_color_write_mask_rgb.clone(),
            BlendMode::AlphaRgb => self.bs_blend_alpha_color_write_mask_rgb.clone(),
            BlendMode::AlphaAll => self.bs_blend_alpha_color_write_mask_all.clone(),
            BlendMode::Blit => self.bs_blend_blit.clone(),
        };
        self.stream.set_blend_state(&bs);
    }

    /// Stencil accumulate pass: invert stencil, no color writes.
    pub fn set_mode_stencil_accum(&mut self) {
        let dss = self.dss_stencil_accum.clone();
        self.stream.set_depth_stencil_state(&dss, 0);
        let bs = self.bs_blend_off_color_write_mask_none.clone();
        self.stream.set_blend_state(&bs);
    }

    /// Color where stencil equals the reference (the feather band pass).
    pub fn set_mode_stencil_eq(&mut self) {
        let dss = self.dss_stencil_eq.clone();
        self.stream.set_depth_stencil_state(&dss, 0);
        self.reapply_color_blend();
    }

    /// Color where stencil differs from the reference (the interior pass).
    pub fn set_mode_stencil_neq(&mut self) {
        let dss = self.dss_stencil_neq.clone();
        self.stream.set_depth_stencil_state(&dss, 0);
        self.reapply_color_blend();
    }

    /// Back to plain rendering.
    pub fn set_mode_stencil_off(&mut self) {
        let dss = self.dss_stencil_off.clone();
        self.stream.set_depth_stencil_state(&dss, 0);
        self.reapply_color_blend();
    }

    // ---- shader binds ----

    fn upload_uniform_floats(&mut self, floats: &[f32]) {
        let mut bytes = Vec::with_capacity(floats.len() * 4);
        for &f in floats {
            let bits = f.to_bits();
            bytes.push(bits as u8);
            bytes.push((bits >> 8) as u8);
            bytes.push((bits >> 16) as u8);
            bytes.push((bits >> 24) as u8);
        }
        let ub = self.uniforms.clone();
        self.stream.upload_uniform_data(&ub, &bytes, 0);
        self.stream.bind_uniform_buffer(0, &ub);
    }

    fn bind_tex_or_white(&mut self, slot: usize, tex: Option<&CgGlTexture<R>>) {
        let (texture, sampler) = match tex {
            Some(t) => (t.texture.clone(), t.sampler_state),
            None => (self.white.texture.clone(), self.white.sampler_state),
        };
        self.stream.bind_texture(slot, &texture, sampler);
    }

    /// Plain color shader (optionally textured).
    pub fn bind_color_shader(&mut self, fill: &Color, tex: Option<&CgGlTexture<R>>) {
        let program = self.shaders.color.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        self.upload_uniform_floats(&[fill.r, fill.g, fill.b, fill.a]);
    }

    /// Text shader: RGB from the fill style, alpha from the texture's red
    /// channel (the R8 glyph atlas).
    pub fn bind_color_rgb_fill_alpha_red_shader(
        &mut self,
        fill: &Color,
        tex: Option<&CgGlTexture<R>>,
    ) {
        let program = self.shaders.color_rgb_fill_alpha_red.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        self.upload_uniform_floats(&[fill.r, fill.g, fill.b, fill.a]);
    }

    /// Two-texture shader: color from `tex`, alpha multiplied by `mask`.
    pub fn bind_color_shader_alpha_mask(
        &mut self,
        fill: &Color,
        tex: Option<&CgGlTexture<R>>,
        mask: Option<&CgGlTexture<R>>,
    ) {
        let program = self.shaders.color_alpha_mask.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        self.bind_tex_or_white(1, mask);
        self.upload_uniform_floats(&[fill.r, fill.g, fill.b, fill.a]);
    }

    /// Alpha-test shader with threshold.
    pub fn bind_color_shader_alpha_test(
        &mut self,
        fill: &Color,
        tex: Option<&CgGlTexture<R>>,
        threshold: f32,
    ) {
        let program = self.shaders.color_alpha_test.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        self.upload_uniform_floats(&[fill.r, fill.g, fill.b, fill.a, threshold, 0.0, 0.0, 0.0]);
    }

    /// Alpha-test variant of the text shader.
    pub fn bind_color_shader_alpha_rgb_fill_alpha_red_test(
        &mut self,
        fill: &Color,
        tex: Option<&CgGlTexture<R>>,
        threshold: f32,
    ) {
        let program = self.shaders.color_alpha_test_rgb_fill_alpha_red.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        self.upload_uniform_floats(&[fill.r, fill.g, fill.b, fill.a, threshold, 0.0, 0.0, 0.0]);
    }

    /// SDF rounded-rect shader.
    pub fn bind_sdf_rect_shader(
        &mut self,
        fill: &Color,
        tex: Option<&CgGlTexture<R>>,
        uniforms: SdfRectUniforms,
    ) {
        let program = self.shaders.sdf_rect.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        self.upload_uniform_floats(&[
            fill.r,
            fill.g,
            fill.b,
            fill.a,
            uniforms.rect_box.centerpoint.x,
            uniforms.rect_box.centerpoint.y,
            uniforms.rect_box.half_dim.x,
            uniforms.rect_box.half_dim.y,
            uniforms.roundness,
            uniforms.fade,
            0.0,
            0.0,
        ]);
    }

    /// SDF rounded-rect shader with a border stroke.
    pub fn bind_sdf_rect_border_shader(
        &mut self,
        fill: &Color,
        tex: Option<&CgGlTexture<R>>,
        uniforms: SdfRectBorderUniforms,
    ) {
        let program = self.shaders.sdf_rect_border.clone();
        self.stream.bind_program(&program);
        self.bind_tex_or_white(0, tex);
        let u = &uniforms.sdf_rect_uniforms;
        self.upload_uniform_floats(&[
            fill.r,
            fill.g,
            fill.b,
            fill.a,
            u.rect_box.centerpoint.x,
            u.rect_box.centerpoint.y,
            u.rect_box.half_dim.x,
            u.rect_box.half_dim.y,
            u.roundness,
            u.fade,
            uniforms.stroke_size,
            0.0,
            uniforms.stroke_color.r,
            uniforms.stroke_color.g,
            uniforms.stroke_color.b,
            uniforms.stroke_color.a,
        ]);
    }

    /// YUV video shader (SDR or HDR10).
    pub fn bind_video_shader(
        &mut self,
        fill: &Color,
        chroma: &Texture<R>,
        luma: &Texture<R>,
        luma_tex_dim: (i32, i32),
        chroma_tex_dim: (i32, i32),
        framesize_dim: (i32, i32),
        hdr10: bool,
    ) {
        let program = if hdr10 {
            self.shaders.video_hdr.clone()
        } else {
            self.shaders.video.clone()
        };
        self.stream.bind_program(&program);
        self.stream.bind_texture(0, luma, SamplerDesc::default());
        self.stream.bind_texture(1, chroma, SamplerDesc::default());
        self.upload_uniform_floats(&[
            fill.r,
            fill.g,
            fill.b,
            fill.a,
            luma_tex_dim.0 as f32,
            luma_tex_dim.1 as f32,
            chroma_tex_dim.0 as f32,
            chroma_tex_dim.1 as f32,
            framesize_dim.0 as f32,
            framesize_dim.1 as f32,
            0.0,
            0.0,
        ]);
    }

    // ---- scissor ----

    /// Record the scissor rectangle requested by the canvas.
    pub fn set_scissor_rect(&mut self, x0: i32, y0: i32, x1: i32, y1: i32) {
        self.scissor_canvas.x0 = x0;
        self.scissor_canvas.y0 = y0;
        self.scissor_canvas.x1 = x1;
        self.scissor_canvas.y1 = y1;
    }

    /// Enable or disable scissoring.
    pub fn enable_scissor(&mut self, enabled: bool) {
        self.scissor_canvas.enabled = enabled;
    }

    /// Push the canvas scissor state to the RHI when it drifted.
    pub fn apply_scissor_state(&mut self) {
        if self.scissor_rhi == self.scissor_canvas {
            return;
        }
        let rs = if self.scissor_canvas.enabled {
            self.rs_scissor_on.clone()
        } else {
            self.rs_scissor_off.clone()
        };
        self.stream.set_rasterizer_state(&rs);
        if self.scissor_canvas.enabled {
            let s = self.scissor_canvas;
            let w = (s.x1 - s.x0).max(0);
            let h = (s.y1 - s.y0).max(0);
            self.stream.set_scissor_rect(target::Rect {
                x: s.x0.max(0) as u16,
                y: s.y0.max(0) as u16,
                w: w as u16,
                h: h as u16,
            });
        }
        self.scissor_rhi = self.scissor_canvas;
    }

    /// Free a texture wrapper. Destruction is deferred by the device until
    /// the texture's last-use fence retires.
    pub fn texture_free(&mut self, tex: CgGlTexture<R>) {
        let fence = self.stream.stream_fence();
        tex.texture.set_last_use_fence(fence);
        drop(tex);
    }
}
