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

//! The 2D canvas context: state stack, draw operations, image and video
//! composition.

use std::sync::Arc;

use adk_core::{DrawMode, RenderDevice, Resources, Texture};
use adk_imagelib::ImageDesc;
use adk_runtime::{GuardPageMode, Heap, ThreadPool, ThreadSafeHeap};

use font::MosaicContext;
use gl::{CgGlConfig, CgGlState, CgGlTexture, SdfRectBorderUniforms, SdfRectUniforms};
use image::{CgImage, DecodeResult, ImageLoadStatus};
use math::{color, rect, vec2, Affine, Box2, Color, Margins, Rads, Rect, Vec2};
use path::{Path, Rotation, SubpathWrap, TessellationParams, Winding};

/// Default canvas state stack depth.
pub const CG_DEFAULT_MAX_STATES: u32 = 128;
/// Default tessellation step bound.
pub const CG_DEFAULT_MAX_TESSELLATION_STEPS: u32 = 10;

const MITER_CLAMP: f32 = 32.0;

bitflags!(
    /// Path rendering options.
    pub struct PathOptions: u32 {
        /// The path may be concave; fill through the stencil trick.
        const CONCAVE = 1;
        /// Skip the anti-aliased outer feather band.
        const NO_FEATHER = 2;
    }
);

/// Canvas blend modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlendMode {
    /// Source-alpha blend, RGB channels only.
    SrcAlphaRgb,
    /// Source-alpha blend, all channels.
    SrcAlphaAll,
    /// Straight copy.
    Blit,
    /// Alpha-test against the state threshold.
    AlphaTest,
}

/// Scissor clip toggle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClipState {
    /// Clipping applies.
    Enabled,
    /// Clipping is off (the rect is still tracked).
    Disabled,
}

/// Image tiling for the SDF image fills.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageTiling {
    /// Source UVs cover the padded rect exactly.
    Stretch,
    /// Tile at the image's natural size scaled by the transform.
    Relative,
    /// UV origin follows world position, preserving tiling under
    /// translation.
    Absolute,
}

/// SDF rounded-rect draw parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SdfRectParams {
    /// Corner radius in canvas units.
    pub roundness: f32,
    /// Extra anti-alias band.
    pub fade: f32,
    /// Border stroke width; 0 disables the border shader.
    pub border_width: f32,
    /// Border stroke color.
    pub border_color: Color,
}

/// Which canvas heap backs a loading resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryRegion {
    /// Lives in the high region; must be freed before entering low mode.
    High,
    /// Lives in the low region.
    Low,
    /// Loads high, transitions low on completion.
    HighToLow,
}

/// Canvas memory mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryMode {
    /// High heap mapped and available.
    High,
    /// High heap torn down; only low-region resources remain.
    Low,
}

/// The scissor clip tracked per state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipRect {
    /// Left.
    pub x0: f32,
    /// Top.
    pub y0: f32,
    /// Right.
    pub x1: f32,
    /// Bottom.
    pub y1: f32,
    /// Whether clipping applies.
    pub clip_state: ClipState,
}

/// One canvas state record.
pub struct CgState<R: Resources> {
    /// Current transform.
    pub transform: Affine,
    /// Stroke color.
    pub stroke_style: Color,
    /// Fill color.
    pub fill_style: Color,
    /// Clip rectangle + toggle.
    pub clip: ClipRect,
    /// Global alpha multiplier.
    pub global_alpha: f32,
    /// Stroke width.
    pub line_width: f32,
    /// Anti-alias band width.
    pub feather: f32,
    /// Image bound as the fill style.
    pub image: Option<CgImage<R>>,
    /// Alpha-test threshold.
    pub alpha_test_threshold: f32,
    /// Active blend mode.
    pub blend_mode: BlendMode,
}

impl<R: Resources> CgState<R> {
    fn initial(width: i32, height: i32) -> CgState<R> {
        CgState {
            transform: Affine::identity(),
            stroke_style: color(1.0, 1.0, 1.0, 1.0),
            fill_style: color(1.0, 1.0, 1.0, 1.0),
            clip: ClipRect {
                x0: 0.0,
                y0: 0.0,
                x1: width as f32,
                y1: height as f32,
                clip_state: ClipState::Disabled,
            },
            global_alpha: 1.0,
            line_width: 1.0,
            feather: 1.0,
            image: None,
            alpha_test_threshold: 0.5,
            blend_mode: BlendMode::SrcAlphaRgb,
        }
    }

    pub(crate) fn clone_record(&self) -> CgState<R> {
        CgState {
            transform: self.transform,
            stroke_style: self.stroke_style,
            fill_style: self.fill_style,
            clip: self.clip,
            global_alpha: self.global_alpha,
            line_width: self.line_width,
            feather: self.feather,
            image: self.image.clone(),
            alpha_test_threshold: self.alpha_test_threshold,
            blend_mode: self.blend_mode,
        }
    }
}

/// Canvas configuration (enumerated; see the platform manifest).
#[derive(Clone, Copy, Debug)]
pub struct CanvasConfig {
    /// State stack depth bound.
    pub max_states: u32,
    /// Tessellation step bound.
    pub max_tessellation_steps: u32,
    /// Glyph atlas width; 0 means the virtual display width.
    pub font_atlas_width: u32,
    /// Glyph atlas height; 0 means the virtual display height.
    pub font_atlas_height: u32,
    /// Whether text meshes are memoized.
    pub text_mesh_cache_enabled: bool,
    /// Text mesh cache capacity.
    pub text_mesh_cache_size: u32,
    /// Coerce the punch-through blend mode to source-alpha RGB while a
    /// video texture is active.
    pub enable_punchthrough_blend_mode_fix: bool,
    /// Vertex bank sizing.
    pub gl: CgGlConfig,
    /// Scratch budget for gzip inflate.
    pub gzip_working_space: usize,
    /// Guard page mode for the canvas heaps.
    pub guard_page_mode: GuardPageMode,
    /// Low heap size in bytes.
    pub low_mem_size: usize,
    /// High heap size in bytes (mapped on demand).
    pub high_mem_size: usize,
    /// Font raster scratchpad size in bytes.
    pub font_scratchpad_size: usize,
}

impl Default for CanvasConfig {
    fn default() -> CanvasConfig {
        CanvasConfig {
            max_states: CG_DEFAULT_MAX_STATES,
            max_tessellation_steps: CG_DEFAULT_MAX_TESSELLATION_STEPS,
            font_atlas_width: 0,
            font_atlas_height: 0,
            text_mesh_cache_enabled: true,
            text_mesh_cache_size: 64,
            enable_punchthrough_blend_mode_fix: false,
            gl: CgGlConfig::default(),
            gzip_working_space: 256 * 1024,
            guard_page_mode: GuardPageMode::Disabled,
            low_mem_size: 8 * 1024 * 1024,
            high_mem_size: 8 * 1024 * 1024,
            font_scratchpad_size: 512 * 1024,
        }
    }
}

/// Virtual and physical display dimensions.
#[derive(Clone, Copy, Debug)]
pub struct CanvasDimensions {
    /// Virtual (layout) width.
    pub virtual_width: i32,
    /// Virtual (layout) height.
    pub virtual_height: i32,
    /// Physical display width.
    pub display_width: i32,
    /// Physical display height.
    pub display_height: i32,
}

/// A video frame delivered by the external video service.
pub struct VideoFrame<R: Resources> {
    /// Luma plane; `None` means punch-through playback.
    pub luma: Option<Texture<R>>,
    /// Chroma plane.
    pub chroma: Option<Texture<R>>,
    /// True for HDR10 content.
    pub hdr10: bool,
    /// Luma texture dimensions.
    pub luma_tex_dim: (i32, i32),
    /// Chroma texture dimensions.
    pub chroma_tex_dim: (i32, i32),
    /// Frame dimensions.
    pub framesize_dim: (i32, i32),
}

/// A composited subtitle frame.
pub struct SubtitleFrame<R: Resources> {
    /// The subtitle surface.
    pub texture: Texture<R>,
    /// Placement in canvas space.
    pub rect: Rect,
}

/// The external video/subtitle provider consumed by `blit_video_frame`.
pub trait VideoService<R: Resources> {
    /// The current video frame.
    fn current_video_frame(&mut self) -> VideoFrame<R>;
    /// The current subtitle frame for the given video rect, if any.
    fn current_subtitle_frame(&mut self, input_rect: Rect) -> Option<SubtitleFrame<R>>;
    /// Return a video frame after composition.
    fn done_video_frame(&mut self, frame: VideoFrame<R>);
    /// Return a subtitle frame after composition.
    fn done_subtitle_frame(&mut self, frame: SubtitleFrame<R>);
}

/// The 2D canvas rendering context.
pub struct CgContext<R: Resources> {
    /// The render device the canvas draws through.
    pub device: RenderDevice<R>,
    /// The canvas render backend.
    pub gl: CgGlState<R>,
    pub(crate) mosaic: MosaicContext<R>,
    pub(crate) thread_pool: Arc<ThreadPool>,
    pub(crate) heap_low: ThreadSafeHeap,
    pub(crate) heap_high: Option<ThreadSafeHeap>,
    config: CanvasConfig,

    path: Path,
    states: Vec<CgState<R>>,
    state_idx: usize,

    width: i32,
    height: i32,
    view_scale_x: f32,
    view_scale_y: f32,
    clear_color: u32,

    memory_mode: MemoryMode,
    gifs: Vec<CgImage<R>>,
    loading_images: Vec<CgImage<R>>,
    using_video_texture: bool,
    video: Option<Box<dyn VideoService<R>>>,
}

impl<R: Resources> CgContext<R> {
    /// Build a canvas over a render device.
    pub fn new(
        device: RenderDevice<R>,
        thread_pool: Arc<ThreadPool>,
        dims: CanvasDimensions,
        config: CanvasConfig,
    ) -> CgContext<R> {
        assert!(config.max_states > 0);
        let mut gl = CgGlState::new(&device, config.gl);

        let heap_low = ThreadSafeHeap::new(Heap::new(
            config.low_mem_size,
            8,
            "canvas_heap_low",
            config.guard_page_mode,
        ));

        let atlas_w = if config.font_atlas_width != 0 {
            config.font_atlas_width
        } else {
            dims.virtual_width as u32
        };
        let atlas_h = if config.font_atlas_height != 0 {
            config.font_atlas_height
        } else {
            dims.virtual_height as u32
        };
        let mut mosaic = MosaicContext::new(&mut gl, &config, atlas_w, atlas_h);
        mosaic.set_sub_texture_support(device.caps().supports_sub_texture_update);

        let mut states = Vec::with_capacity(config.max_states as usize);
        states.push(CgState::initial(dims.virtual_width, dims.virtual_height));

        CgContext {
            device: device,
            gl: gl,
            mosaic: mosaic,
            thread_pool: thread_pool,
            heap_low: heap_low,
            heap_high: None,
            config: config,
            path: Path::new(),
            states: states,
            state_idx: 0,
            width: dims.virtual_width,
            height: dims.virtual_height,
            view_scale_x: dims.display_width as f32 / dims.virtual_width as f32,
            view_scale_y: dims.display_height as f32 / dims.virtual_height as f32,
            clear_color: 0x0000_00ff,
            memory_mode: MemoryMode::Low,
            gifs: Vec::new(),
            loading_images: Vec::new(),
            using_video_texture: false,
            video: None,
        }
    }

    /// Install the video service used by `blit_video_frame`.
    pub fn set_video_service(&mut self, service: Box<dyn VideoService<R>>) {
        self.video = Some(service);
    }

    /// Virtual canvas width.
    pub fn width(&self) -> i32 {
        self.width
    }

    /// Virtual canvas height.
    pub fn height(&self) -> i32 {
        self.height
    }

    /// Canvas configuration.
    pub fn config(&self) -> &CanvasConfig {
        &self.config
    }

    pub(crate) fn cur_state(&self) -> &CgState<R> {
        &self.states[self.state_idx]
    }

    fn cur_state_mut(&mut self) -> &mut CgState<R> {
        &mut self.states[self.state_idx]
    }

    // ---- frame boundary ----

    /// Begin a canvas frame: poll load completions, tick animations, reset
    /// the transform, and open the GL frame.
    pub fn begin(&mut self, delta_time_ms: i32) {
        self.using_video_texture = false;
        self.thread_pool.run_completions();

        // realize decode results staged by the completions
        let mut still_loading = Vec::new();
        let loading = ::std::mem::replace(&mut self.loading_images, Vec::new());
        for img in loading {
            img.realize_staged(&mut self.gl);
            match img.load_status() {
                ImageLoadStatus::Pending => still_loading.push(img),
                ImageLoadStatus::Complete => {
                    // charge the pixel budget against the low heap; a load
                    // the heap cannot cover surfaces as out-of-memory
                    let budget = {
                        let size = img.lock().desc.data_len as usize;
                        self.heap_low
                            .with(|h| h.unchecked_alloc(size.max(1), "cg_image_pixels"))
                    };
                    match budget {
                        Some(block) => {
                            img.lock().budget = Some(block);
                            let animated = {
                                let inner = img.lock();
                                inner.gif.is_some() || inner.bif.is_some()
                            };
                            if animated {
                                self.gifs.push(img.clone());
                            }
                        }
                        None => {
                            let mut inner = img.lock();
                            inner.status = ImageLoadStatus::OutOfMemory;
                            inner.texture = None;
                            inner.texture_mask = None;
                        }
                    }
                }
                _ => {}
            }
        }
        self.loading_images = still_loading;

        self.tick_gifs(delta_time_ms);
        self.cur_state_mut().transform = Affine::identity();
        let (w, h, clear) = (self.width, self.height, self.clear_color);
        self.gl.state_begin(w, h, clear);
    }

    /// End a canvas frame: submit, reset the path and the state stack.
    pub fn end(&mut self) {
        self.gl.state_end();
        self.path.reset();
        self.state_idx = 0;
        let initial = CgState::initial(self.width, self.height);
        self.states.clear();
        self.states.push(initial);
    }

    /// Frame boundary against the render device; blocks while too many
    /// frames are in flight.
    pub fn device_frame(&mut self) {
        self.device.device_frame(&mut self.gl.stream);
    }

    fn tick_gifs(&mut self, delta_ms: i32) {
        let gifs = self.gifs.clone();
        for gif in &gifs {
            gif.tick_gif(&mut self.gl, delta_ms);
        }
        let loading = self.loading_images.clone();
        for img in &loading {
            img.tick_bif(&mut self.gl);
        }
        // completed bifs tick too
        for img in &gifs {
            img.tick_bif(&mut self.gl);
        }
    }

    // ---- state stack ----

    /// Push a copy of the current state. Saving past the configured depth
    /// is a program error.
    pub fn save(&mut self) {
        assert!(
            self.state_idx + 1 < self.config.max_states as usize,
            "cannot save more canvas states, max states allowed: {}",
            self.config.max_states
        );
        let copy = self.cur_state().clone_record();
        self.state_idx += 1;
        if self.state_idx == self.states.len() {
            self.states.push(copy);
        } else {
            self.states[self.state_idx] = copy;
        }
    }

    /// Pop to the previous state, reapplying its clip. Restoring at depth
    /// zero is a program error.
    pub fn restore(&mut self) {
        assert!(self.state_idx != 0, "mismatched canvas save/restore");
        self.state_idx -= 1;
        let clip = self.cur_state().clip;
        self.apply_clip(clip);
    }

    /// Current state stack depth (0 = base state).
    pub fn state_depth(&self) -> usize {
        self.state_idx
    }

    /// Reset the current transform.
    pub fn identity(&mut self) {
        self.cur_state_mut().transform = Affine::identity();
    }

    /// Current global alpha.
    pub fn global_alpha(&self) -> f32 {
        self.cur_state().global_alpha
    }

    /// Set the global alpha multiplier.
    pub fn set_global_alpha(&mut self, alpha: f32) {
        self.cur_state_mut().global_alpha = alpha;
    }

    /// Current feather width.
    pub fn feather(&self) -> f32 {
        self.cur_state().feather
    }

    /// Set the anti-alias feather width.
    pub fn set_feather(&mut self, feather: f32) {
        self.cur_state_mut().feather = feather;
    }

    /// Set the frame clear color (0xRRGGBBAA).
    pub fn set_clear_color(&mut self, clear: u32) {
        self.clear_color = clear;
    }

    /// Current alpha-test threshold.
    pub fn alpha_test_threshold(&self) -> f32 {
        self.cur_state().alpha_test_threshold
    }

    /// Set the alpha-test threshold.
    pub fn set_alpha_test_threshold(&mut self, threshold: f32) {
        self.cur_state_mut().alpha_test_threshold = threshold;
    }

    /// Current blend mode.
    pub fn blend_mode(&self) -> BlendMode {
        self.cur_state().blend_mode
    }

    /// Set the blend mode. While a video texture is active and the
    /// punch-through fix is enabled, the mode is coerced to source-alpha
    /// RGB.
    pub fn set_blend_mode(&mut self, mode: BlendMode) {
        if self.using_video_texture && self.config.enable_punchthrough_blend_mode_fix {
            self.cur_state_mut().blend_mode = BlendMode::SrcAlphaRgb;
        } else {
            self.cur_state_mut().blend_mode = mode;
        }
    }

    /// Set the stroke width.
    pub fn set_line_width(&mut self, width: f32) {
        self.cur_state_mut().line_width = width;
    }

    /// Stroke color from 0..255 channel values.
    pub fn stroke_style(&mut self, c: Color) {
        self.cur_state_mut().stroke_style =
            color(c.r / 255.0, c.g / 255.0, c.b / 255.0, c.a / 255.0);
    }

    /// Fill color from 0..255 channel values; unbinds any fill image.
    pub fn fill_style(&mut self, c: Color) {
        let state = self.cur_state_mut();
        state.fill_style = color(c.r / 255.0, c.g / 255.0, c.b / 255.0, c.a / 255.0);
        state.image = None;
    }

    /// Fill color from a packed `0xRGB` value; unbinds any fill image.
    pub fn fill_style_hex(&mut self, packed: i32) {
        let state = self.cur_state_mut();
        state.fill_style = Color::from_hex(packed);
        state.image = None;
    }

    /// Fill with an image modulated by a color.
    pub fn fill_style_image(&mut self, c: Color, image: &CgImage<R>) {
        self.fill_style(c);
        self.cur_state_mut().image = Some(image.clone());
    }

    /// Fill with an image modulated by a packed hex color.
    pub fn fill_style_image_hex(&mut self, packed: i32, image: &CgImage<R>) {
        self.fill_style_hex(packed);
        self.cur_state_mut().image = Some(image.clone());
    }

    // ---- transform ----

    /// Rotate the current transform.
    pub fn rotate(&mut self, angle: Rads) {
        self.cur_state_mut().transform.rotate(angle.rads);
    }

    /// Scale the current transform.
    pub fn scale(&mut self, s: Vec2) {
        self.cur_state_mut().transform.scale(s.x, s.y);
    }

    /// Translate the current transform.
    pub fn translate(&mut self, t: Vec2) {
        self.cur_state_mut().transform.translate(t.x, t.y);
    }

    // ---- path building ----

    fn tess_params(&self) -> TessellationParams {
        TessellationParams {
            transform: &self.states[self.state_idx].transform,
            max_tessellation_steps: self.config.max_tessellation_steps,
        }
    }

    /// Start a fresh path.
    pub fn begin_path(&mut self) {
        self.path.reset();
    }

    /// Finish the in-progress subpath without closing it.
    pub fn end_path(&mut self) {
        self.path.end_subpath();
    }

    /// Close and finish the in-progress subpath.
    pub fn close_path(&mut self) {
        self.path.close_subpath();
    }

    /// Begin a subpath at `pos`.
    pub fn move_to(&mut self, pos: Vec2) {
        let transform = self.states[self.state_idx].transform;
        self.path.move_to(&transform, pos);
    }

    /// Line to `pos`.
    pub fn line_to(&mut self, pos: Vec2) {
        let transform = self.states[self.state_idx].transform;
        self.path.line_to(&transform, pos);
    }

    /// Append an axis-aligned rectangle subpath.
    pub fn rect_path(&mut self, r: Rect) {
        let transform = self.states[self.state_idx].transform;
        self.path.push_rect(&transform, r);
    }

    /// Append a rounded rectangle subpath.
    pub fn rounded_rect_path(&mut self, r: Rect, radius: f32) {
        let transform = self.states[self.state_idx].transform;
        let max_steps = self.config.max_tessellation_steps;
        self.path.push_rounded_rect(
            TessellationParams {
                transform: &transform,
                max_tessellation_steps: max_steps,
            },
            r,
            radius,
        );
    }

    /// Quadratic Bézier to `(x, y)`.
    pub fn quad_bezier_to(&mut self, cpx: f32, cpy: f32, x: f32, y: f32) {
        let transform = self.states[self.state_idx].transform;
        let max_steps = self.config.max_tessellation_steps;
        self.path.quad_bezier_to(
            TessellationParams {
                transform: &transform,
                max_tessellation_steps: max_steps,
            },
            cpx,
            cpy,
            x,
            y,
        );
    }

    /// Arc around `pos`.
    pub fn arc(&mut self, pos: Vec2, radius: f32, start: Rads, end: Rads, rotation: Rotation) {
        let transform = self.states[self.state_idx].transform;
        let max_steps = self.config.max_tessellation_steps;
        self.path.arc(
            TessellationParams {
                transform: &transform,
                max_tessellation_steps: max_steps,
            },
            pos,
            radius,
            start,
            end,
            rotation,
        );
    }

    /// Two-tangent arc.
    pub fn arc_to(&mut self, pos1: Vec2, pos2: Vec2, radius: f32) {
        let transform = self.states[self.state_idx].transform;
        let max_steps = self.config.max_tessellation_steps;
        self.path.arc_to(
            TessellationParams {
                transform: &transform,
                max_tessellation_steps: max_steps,
            },
            pos1,
            pos2,
            radius,
        );
    }

    /// Direct access to the built path (test introspection).
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ---- fills and strokes ----

    /// Fill the current path (convex fast path).
    pub fn fill(&mut self) {
        self.fill_with_options(PathOptions::empty());
    }

    /// Fill the current path. CCW subpaths are normalized to CW first.
    pub fn fill_with_options(&mut self, options: PathOptions) {
        if self.path.cur.len() > 0 {
            self.path.close_subpath();
        }
        let mut subpaths = ::std::mem::replace(&mut self.path.subpaths, Vec::new());
        for subpath in &mut subpaths {
            if subpath.winding() == Winding::Ccw {
                subpath.reverse_points();
            }
            let state_idx = self.state_idx;
            subpath_fill(&mut self.gl, subpath, &self.states[state_idx], options);
        }
        self.path.subpaths = subpaths;
    }

    /// Stroke the current path.
    pub fn stroke(&mut self) {
        self.stroke_with_options(PathOptions::empty());
    }

    /// Stroke the current path with options.
    pub fn stroke_with_options(&mut self, options: PathOptions) {
        if self.path.cur.len() > 0 {
            self.path.end_subpath();
        }
        let mut subpaths = ::std::mem::replace(&mut self.path.subpaths, Vec::new());
        for subpath in &mut subpaths {
            if subpath.winding() == Winding::Ccw {
                subpath.reverse_points();
            }
            let state_idx = self.state_idx;
            subpath_stroke(&mut self.gl, subpath, &self.states[state_idx], options);
        }
        self.path.subpaths = subpaths;
    }

    /// Fill an axis-aligned rectangle without touching the current path.
    pub fn fill_rect(&mut self, r: Rect) {
        let transform = self.states[self.state_idx].transform;
        let mut path = Path::new();
        path.push_rect(&transform, r);
        let state_idx = self.state_idx;
        subpath_fill(
            &mut self.gl,
            &path.subpaths[0],
            &self.states[state_idx],
            PathOptions::empty(),
        );
    }

    /// Stroke an axis-aligned rectangle without touching the current path.
    pub fn stroke_rect(&mut self, r: Rect) {
        let transform = self.states[self.state_idx].transform;
        let mut path = Path::new();
        path.push_rect(&transform, r);
        let state_idx = self.state_idx;
        subpath_stroke(
            &mut self.gl,
            &path.subpaths[0],
            &self.states[state_idx],
            PathOptions::empty(),
        );
    }

    /// Fill a rectangle with opaque black (the canvas "clear").
    pub fn clear_rect(&mut self, r: Rect) {
        let transform = self.states[self.state_idx].transform;
        let mut path = Path::new();
        path.push_rect(&transform, r);
        let old = self.cur_state().fill_style;
        self.cur_state_mut().fill_style = color(0.0, 0.0, 0.0, 1.0);
        let state_idx = self.state_idx;
        subpath_fill(
            &mut self.gl,
            &path.subpaths[0],
            &self.states[state_idx],
            PathOptions::empty(),
        );
        self.cur_state_mut().fill_style = old;
    }

    // ---- images ----

    /// Draw an image's `src` rectangle into `dst`.
    pub fn draw_image_rect(&mut self, image: &CgImage<R>, src: Rect, dst: Rect) {
        let state_idx = self.state_idx;
        let (p0, p1, p2, p3) = {
            let xform = &self.states[state_idx].transform;
            (
                xform.apply(vec2(dst.x, dst.y)),
                xform.apply(vec2(dst.x + dst.width, dst.y)),
                xform.apply(vec2(dst.x + dst.width, dst.y + dst.height)),
                xform.apply(vec2(dst.x, dst.y + dst.height)),
            )
        };

        let drawable = image.drawable_texture();
        let mask = image.drawable_mask();

        let iw = 1.0 / drawable.as_ref().map_or(1.0, |t| t.texture.width() as f32);
        let ih = 1.0 / drawable.as_ref().map_or(1.0, |t| t.texture.height() as f32);
        let u = src.x * iw;
        let v = src.y * ih;
        let w = src.width * iw;
        let h = src.height * ih;

        let a = self.states[state_idx].fill_style.a * self.states[state_idx].global_alpha;

        self.gl.map_vertex_range(4);
        self.gl.set_vert(0, p0, color(u, v, 0.0, a));
        self.gl.set_vert(1, p1, color(u + w, v, 0.0, a));
        self.gl.set_vert(2, p2, color(u + w, v + h, 0.0, a));
        self.gl.set_vert(3, p3, color(u, v + h, 0.0, a));
        self.gl.finish_vertex_range();

        let fill = self.states[state_idx].fill_style;
        if drawable.is_none() {
            select_blend_and_shader(&mut self.gl, &self.states[state_idx], &fill, None, false);
        } else if mask.is_some() {
            select_blend_and_shader_alpha_mask(
                &mut self.gl,
                &self.states[state_idx],
                &fill,
                drawable.as_ref(),
                mask.as_ref(),
            );
        } else {
            select_blend_and_shader(
                &mut self.gl,
                &self.states[state_idx],
                &fill,
                drawable.as_ref(),
                false,
            );
        }

        self.gl.draw(DrawMode::TriangleFan, 4, 0);
    }

    /// Draw an image at its natural size.
    pub fn draw_image(&mut self, image: &CgImage<R>, pos: Vec2) {
        let r = image.image_rect();
        let (iw, ih) = if image.is_drawable() {
            (r.width, r.height)
        } else {
            (1.0, 1.0)
        };
        self.draw_image_rect(image, rect(0.0, 0.0, iw, ih), rect(pos.x, pos.y, iw, ih));
    }

    /// Draw an image scaled into `dst`.
    pub fn draw_image_scale(&mut self, image: &CgImage<R>, dst: Rect) {
        let r = image.image_rect();
        let (iw, ih) = if image.is_drawable() {
            (r.width, r.height)
        } else {
            (1.0, 1.0)
        };
        self.draw_image_rect(image, rect(0.0, 0.0, iw, ih), dst);
    }

    /// Draw an image with a separate alpha-mask image. Alpha-test blend
    /// with a mask is unsupported and falls back to blit.
    pub fn draw_image_rect_alpha_mask(
        &mut self,
        image: &CgImage<R>,
        mask: &CgImage<R>,
        src: Rect,
        dst: Rect,
    ) {
        let state_idx = self.state_idx;
        let (p0, p1, p2, p3) = {
            let xform = &self.states[state_idx].transform;
            (
                xform.apply(vec2(dst.x, dst.y)),
                xform.apply(vec2(dst.x + dst.width, dst.y)),
                xform.apply(vec2(dst.x + dst.width, dst.y + dst.height)),
                xform.apply(vec2(dst.x, dst.y + dst.height)),
            )
        };
        let drawable = image.drawable_texture();
        let mask_tex = mask.drawable_texture();

        let iw = 1.0 / drawable.as_ref().map_or(1.0, |t| t.texture.width() as f32);
        let ih = 1.0 / drawable.as_ref().map_or(1.0, |t| t.texture.height() as f32);
        let u = src.x * iw;
        let v = src.y * ih;
        let w = src.width * iw;
        let h = src.height * ih;
        let a = self.states[state_idx].fill_style.a * self.states[state_idx].global_alpha;

        self.gl.map_vertex_range(4);
        self.gl.set_vert(0, p0, color(u, v, 0.0, a));
        self.gl.set_vert(1, p1, color(u + w, v, 0.0, a));
        self.gl.set_vert(2, p2, color(u + w, v + h, 0.0, a));
        self.gl.set_vert(3, p3, color(u, v + h, 0.0, a));
        self.gl.finish_vertex_range();

        let fill = self.states[state_idx].fill_style;
        select_blend_and_shader_alpha_mask(
            &mut self.gl,
            &self.states[state_idx],
            &fill,
            drawable.as_ref(),
            mask_tex.as_ref(),
        );
        self.gl.draw(DrawMode::TriangleFan, 4, 0);
    }

    /// Draw an image as a nine-slice panel: corners 1:1, edges stretched
    /// along one axis, center stretched along both. Emits exactly 28
    /// vertices as a degenerate-restarted strip.
    pub fn draw_image_9slice(&mut self, image: &CgImage<R>, margin: Margins, dst: Rect) {
        if dst.width <= 0.0 || dst.height <= 0.0 {
            return;
        }
        let state_idx = self.state_idx;
        let drawable = image.drawable_texture();
        let sw = drawable.as_ref().map_or(0.0, |t| 1.0 / t.texture.width() as f32);
        let sh = drawable.as_ref().map_or(0.0, |t| 1.0 / t.texture.height() as f32);

        let xf = self.states[state_idx].transform;
        let p = |x: f32, y: f32| xf.apply(vec2(x, y));

        let p0 = p(dst.x, dst.y);
        let p1 = p(dst.x, dst.y + margin.top);
        let p2 = p(dst.x + margin.left, dst.y + margin.top);
        let p3 = p(dst.x + margin.left, dst.y);
        let p4 = p(dst.x + dst.width - margin.right, dst.y);
        let p5 = p(dst.x + dst.width, dst.y);
        let p6 = p(dst.x + dst.width - margin.right, dst.y + margin.top);
        let p7 = p(dst.x + dst.width, dst.y + margin.top);
        let p8 = p(dst.x + dst.width - margin.right, dst.y + dst.height - margin.top);
        let p9 = p(dst.x + dst.width, dst.y + dst.height - margin.top);
        let p10 = p(dst.x + dst.width - margin.right, dst.y + dst.height);
        let p11 = p(dst.x + dst.width, dst.y + dst.height);
        let p12 = p(dst.x, dst.y + dst.height - margin.top);
        let p13 = p(dst.x + margin.left, dst.y + dst.height - margin.top);
        let p14 = p(dst.x, dst.y + dst.height);
        let p15 = p(dst.x + margin.left, dst.y + dst.height);

        let a = self.states[state_idx].fill_style.a * self.states[state_idx].global_alpha;

        let u0 = margin.left * sw;
        let u1 = 1.0 - margin.right * sw;
        let v0 = margin.top * sh;
        let v1 = 1.0 - margin.bottom * sh;

        self.gl.map_vertex_range(28);
        let mut i = 0;
        {
            let gl = &mut self.gl;
            let mut vert = |pos: Vec2, u: f32, v: f32| {
                gl.set_vert(i, pos, color(u, v, 0.0, a));
                i += 1;
            };

            // top margin
            vert(p1, 0.0, v0);
            vert(p0, 0.0, 0.0);
            vert(p2, u0, v0);
            vert(p3, u0, 0.0);
            vert(p6, u1, v0);
            vert(p4, u1, 0.0);
            vert(p5, 1.0, 0.0);
            vert(p5, 1.0, 0.0); // degen- restart tristrip
            vert(p7, 1.0, v0);
            vert(p6, u1, v0);

            // right margin
            vert(p9, 1.0, v1);
            vert(p8, u1, v1);
            vert(p11, 1.0, 1.0);
            vert(p10, u1, 1.0);
            vert(p10, u1, 1.0); // degen- restart tristrip

            // bottom margin
            vert(p8, u1, v1);
            vert(p15, u0, 1.0);
            vert(p13, u0, v1);
            vert(p14, 0.0, 1.0);
            vert(p12, 0.0, v1);
            vert(p12, 0.0, v1); // degen- restart tristrip

            // left margin
            vert(p13, u0, v1);
            vert(p1, 0.0, v0);
            vert(p2, u0, v0);
            vert(p2, u0, v0); // degen- restart tristrip

            // center
            vert(p6, u1, v0);
            vert(p13, u0, v1);
            vert(p8, u1, v1);
        }
        assert_eq!(i, 28);
        self.gl.finish_vertex_range();

        let fill = self.states[state_idx].fill_style;
        select_blend_and_shader(
            &mut self.gl,
            &self.states[state_idx],
            &fill,
            drawable.as_ref(),
            false,
        );
        self.gl.draw(DrawMode::TriangleStrip, 28, 0);
    }

    // ---- SDF rounded rects ----

    fn get_box(&self, r: Rect) -> Box2 {
        let xform = &self.states[self.state_idx].transform;
        let p00 = xform.apply(vec2(r.x, r.y));
        let p01 = xform.apply(vec2(r.x + r.width, r.y));
        let p10 = xform.apply(vec2(r.x, r.y + r.height));
        let width = p01.x - p00.x;
        let height = p10.y - p00.y;
        Box2 {
            centerpoint: vec2(p00.x + width / 2.0, p00.y + height / 2.0),
            half_dim: vec2(width / 2.0, height / 2.0),
        }
    }

    fn set_quad_verts(&mut self, inverse_img_dims: Vec2, src: Rect, dst: Rect, alpha: f32) {
        let u0 = src.x * inverse_img_dims.x;
        let v0 = src.y * inverse_img_dims.y;
        let u1 = u0 + src.width * inverse_img_dims.x;
        let v1 = v0 + src.height * inverse_img_dims.y;

        let xform = self.states[self.state_idx].transform;
        let p00 = xform.apply(vec2(dst.x, dst.y));
        let p01 = xform.apply(vec2(dst.x + dst.width, dst.y));
        let p11 = xform.apply(vec2(dst.x + dst.width, dst.y + dst.height));
        let p10 = xform.apply(vec2(dst.x, dst.y + dst.height));

        self.gl.set_vert(0, p00, color(u0, v0, 0.0, alpha));
        self.gl.set_vert(1, p01, color(u1, v0, 0.0, alpha));
        self.gl.set_vert(2, p11, color(u1, v1, 0.0, alpha));
        self.gl.set_vert(3, p11, color(u1, v1, 0.0, alpha));
        self.gl.set_vert(4, p10, color(u0, v1, 0.0, alpha));
        self.gl.set_vert(5, p00, color(u0, v0, 0.0, alpha));
    }

    fn finish_and_draw_sdf_rect(
        &mut self,
        drawable: Option<&CgGlTexture<R>>,
        rect_box: Box2,
        params: SdfRectParams,
        stroke: bool,
    ) {
        debug_assert!(
            !stroke || params.fade == 0.0,
            "strokes and fades together produce bad output"
        );
        self.gl.finish_vertex_range();
        self.gl.set_mode_blend_alpha_rgb();

        let uniforms = SdfRectUniforms {
            rect_box: rect_box,
            roundness: params.roundness,
            fade: params.fade,
        };
        let fill = self.states[self.state_idx].fill_style;
        if stroke {
            self.gl.bind_sdf_rect_border_shader(
                &fill,
                drawable,
                SdfRectBorderUniforms {
                    sdf_rect_uniforms: uniforms,
                    stroke_color: params.border_color,
                    stroke_size: params.border_width,
                },
            );
        } else {
            self.gl.bind_sdf_rect_shader(&fill, drawable, uniforms);
        }
        self.gl.draw(DrawMode::Triangles, 6, 0);
    }

    /// Draw an image `src` rect into a rounded `dst` rect via the SDF
    /// shader (no tiling, no border).
    pub fn sdf_draw_image_rect_rounded(
        &mut self,
        image: &CgImage<R>,
        src: Rect,
        dst: Rect,
        params: SdfRectParams,
    ) {
        let scale = self.states[self.state_idx].transform.get_scale();
        let smallest = dst.width.min(dst.height);
        let radius = (params.roundness.min(smallest / 2.0)).max(0.0) * scale;
        let rect_box = self.get_box(dst);

        let drawable = image.drawable_texture();
        let iw = 1.0 / drawable.as_ref().map_or(1.0, |t| t.texture.width() as f32);
        let ih = 1.0 / drawable.as_ref().map_or(1.0, |t| t.texture.height() as f32);
        let alpha =
            self.states[self.state_idx].fill_style.a * self.states[self.state_idx].global_alpha;

        self.gl.map_vertex_range(6);
        self.set_quad_verts(vec2(iw, ih), src, dst, alpha);
        self.finish_and_draw_sdf_rect(
            drawable.as_ref(),
            rect_box,
            SdfRectParams {
                roundness: radius,
                fade: params.fade.max(0.0) * scale,
                border_width: params.border_width,
                border_color: params.border_color,
            },
            false,
        );
    }

    /// Fill a rounded rect with a tiled image via the SDF shader; a
    /// positive border width adds a stroked outline.
    pub fn sdf_fill_image_rect_rounded(
        &mut self,
        image: &CgImage<R>,
        dst: Rect,
        params: SdfRectParams,
        tiling: ImageTiling,
    ) {
        let scale = self.states[self.state_idx].transform.get_scale();
        let drawable = image.drawable_texture();
        let smallest = dst.width.min(dst.height);
        let radius = (params.roundness.min(smallest / 2.0)).max(0.0) * scale;
        let rect_box = self.get_box(dst);
        let src = image.image_rect();
        let src = if src.width > 0.0 && src.height > 0.0 {
            src
        } else {
            rect(0.0, 0.0, 1.0, 1.0)
        };

        let inverse_img_dims = vec2(1.0 / src.width, 1.0 / src.height);
        let uv_repeats = if tiling == ImageTiling::Stretch {
            vec2(
                (src.width + params.border_width * 2.0) / src.width,
                (src.height + params.border_width * 2.0) / src.height,
            )
        } else {
            vec2(
                (dst.width + params.border_width * 2.0) / (src.width / scale),
                (dst.height + params.border_width * 2.0) / (src.height / scale),
            )
        };

        let dst_rect = rect(
            dst.x - params.border_width,
            dst.y - params.border_width,
            dst.width + 2.0 * params.border_width,
            dst.height + 2.0 * params.border_width,
        );

        let src_start = match tiling {
            ImageTiling::Relative | ImageTiling::Stretch => vec2(
                if params.border_width > 0.0 {
                    src.width - params.border_width
                } else {
                    src.x
                },
                if params.border_width > 0.0 {
                    src.height - params.border_width
                } else {
                    src.y
                },
            ),
            ImageTiling::Absolute => vec2(
                (dst_rect.x * scale) % src.width,
                (dst_rect.y * scale) % src.height,
            ),
        };

        let src_rect = rect(
            src_start.x,
            src_start.y,
            src.width * uv_repeats.x,
            src.height * uv_repeats.y,
        );

        let alpha =
            self.states[self.state_idx].fill_style.a * self.states[self.state_idx].global_alpha;
        self.gl.map_vertex_range(6);
        self.set_quad_verts(inverse_img_dims, src_rect, dst_rect, alpha);
        self.finish_and_draw_sdf_rect(
            drawable.as_ref(),
            rect_box,
            SdfRectParams {
                roundness: radius,
                fade: params.fade.max(0.0) * scale,
                border_width: params.border_width,
                border_color: params.border_color,
            },
            params.border_width > 0.0,
        );
    }

    /// Fill a rounded rect with the current fill color via the SDF shader.
    pub fn sdf_fill_rect_rounded(&mut self, r: Rect, params: SdfRectParams) {
        let white = CgImage::from_texture(
            self.gl.white.clone(),
            ImageDesc::uncompressed(1, 1, 4),
        );
        self.sdf_fill_image_rect_rounded(&white, r, params, ImageTiling::Stretch);
    }

    // ---- video ----

    /// Composite the current video frame (or punch-through) plus any
    /// subtitle frame into `r`.
    pub fn blit_video_frame(&mut self, r: Rect) {
        let state_idx = self.state_idx;
        let fill_alpha =
            self.states[state_idx].fill_style.a * self.states[state_idx].global_alpha;

        let mut video = match self.video.take() {
            Some(v) => v,
            None => {
                // no service: plain punch-through rectangle
                self.draw_punchthrough_or_video(r, 0.0, None);
                return;
            }
        };

        let subtitle = video.current_subtitle_frame(r);
        let frame = video.current_video_frame();
        let has_video = frame.luma.is_some() && frame.chroma.is_some();

        // the punch-through step is redundant if the subtitles are
        // full-screen and we are doing punch-through video
        let skip_punchthrough = match subtitle {
            Some(ref sub) if !has_video => sub.rect == r,
            _ => false,
        };

        self.using_video_texture = has_video;
        let video_alpha = if has_video { fill_alpha } else { 0.0 };

        if !skip_punchthrough {
            self.draw_punchthrough_or_video(r, video_alpha, if has_video { Some(&frame) } else { None });
        }

        if let Some(sub) = subtitle {
            let xform = self.states[state_idx].transform;
            let (sr, tex) = (sub.rect, sub.texture.clone());
            self.gl.map_vertex_range(4);
            self.gl.set_vert(0, xform.apply(vec2(sr.x, sr.y)), color(0.0, 0.0, 0.0, fill_alpha));
            self.gl.set_vert(
                1,
                xform.apply(vec2(sr.x + sr.width, sr.y)),
                color(1.0, 0.0, 0.0, fill_alpha),
            );
            self.gl.set_vert(
                2,
                xform.apply(vec2(sr.x + sr.width, sr.y + sr.height)),
                color(1.0, 1.0, 0.0, fill_alpha),
            );
            self.gl.set_vert(
                3,
                xform.apply(vec2(sr.x, sr.y + sr.height)),
                color(0.0, 1.0, 0.0, fill_alpha),
            );
            self.gl.finish_vertex_range();

            let fill = self.states[state_idx].fill_style;
            let wrapped = CgGlTexture::new(tex);
            self.gl.bind_color_shader(&fill, Some(&wrapped));
            if has_video {
                // background video texture: alpha blend captions
                self.gl.set_mode_blend_alpha_rgb();
            } else {
                // punch-through with captions
                self.gl.set_mode_blit();
            }
            self.gl.draw(DrawMode::TriangleFan, 4, 0);
            video.done_subtitle_frame(sub);
        }

        video.done_video_frame(frame);
        self.video = Some(video);
    }

    fn draw_punchthrough_or_video(
        &mut self,
        r: Rect,
        video_alpha: f32,
        frame: Option<&VideoFrame<R>>,
    ) {
        let state_idx = self.state_idx;
        let xform = self.states[state_idx].transform;
        self.gl.map_vertex_range(4);
        self.gl
            .set_vert(0, xform.apply(vec2(r.x, r.y)), color(0.0, 0.0, 0.0, video_alpha));
        self.gl.set_vert(
            1,
            xform.apply(vec2(r.x + r.width, r.y)),
            color(1.0, 0.0, 0.0, video_alpha),
        );
        self.gl.set_vert(
            2,
            xform.apply(vec2(r.x + r.width, r.y + r.height)),
            color(1.0, 1.0, 0.0, video_alpha),
        );
        self.gl.set_vert(
            3,
            xform.apply(vec2(r.x, r.y + r.height)),
            color(0.0, 1.0, 0.0, video_alpha),
        );
        self.gl.finish_vertex_range();

        match frame {
            Some(f) => {
                let fill = self.states[state_idx].fill_style;
                let luma = f.luma.clone().unwrap();
                let chroma = f.chroma.clone().unwrap();
                self.gl.bind_video_shader(
                    &fill,
                    &chroma,
                    &luma,
                    f.luma_tex_dim,
                    f.chroma_tex_dim,
                    f.framesize_dim,
                    f.hdr10,
                );
            }
            None => {
                let black = color(0.0, 0.0, 0.0, 0.0);
                self.gl.bind_color_shader(&black, None);
                self.gl.set_mode_blit();
            }
        }
        self.gl.draw(DrawMode::TriangleFan, 4, 0);
    }

    // ---- patterns ----

    /// A pattern view of an image with the given repeats.
    pub fn pattern(&self, image: &CgImage<R>, repeat_x: bool, repeat_y: bool) -> CgImage<R> {
        let inner = image.lock();
        let pattern = match inner.texture.clone() {
            Some(tex) => {
                let img = CgImage::from_texture(tex, inner.desc);
                img.set_repeat(repeat_x, repeat_y);
                img
            }
            None => CgImage::new_pending(),
        };
        pattern
    }

    // ---- clip ----

    /// Intersect the clip rect with `r` (transformed). The clip only ever
    /// shrinks until a restore.
    pub fn set_clip_rect(&mut self, r: Rect) {
        assert!(r.width >= 0.0 && r.height >= 0.0);
        let state_idx = self.state_idx;
        let xform = self.states[state_idx].transform;
        let c0 = xform.apply(vec2(r.x, r.y));
        let c1 = xform.apply(vec2(r.x, r.y + r.height));
        let c2 = xform.apply(vec2(r.x + r.width, r.y));
        let c3 = xform.apply(vec2(r.x + r.width, r.y + r.height));

        let x0 = c0.x.min(c1.x).min(c2.x.min(c3.x));
        let y0 = c0.y.min(c1.y).min(c2.y.min(c3.y));
        let x1 = c0.x.max(c1.x).max(c2.x.max(c3.x));
        let y1 = c0.y.max(c1.y).max(c2.y.max(c3.y));

        let clip = {
            let clip = &mut self.states[state_idx].clip;
            clip.x0 = x0.max(clip.x0);
            clip.y0 = y0.max(clip.y0);
            // never wind up with a negative width or height
            clip.x1 = x1.min(clip.x1).max(clip.x0);
            clip.y1 = y1.min(clip.y1).max(clip.y0);
            *clip
        };
        self.apply_clip(clip);
    }

    /// Toggle clipping.
    pub fn set_clip_state(&mut self, clip_state: ClipState) {
        self.cur_state_mut().clip.clip_state = clip_state;
        self.gl.enable_scissor(clip_state == ClipState::Enabled);
    }

    /// Current clip rect (tests).
    pub fn clip(&self) -> ClipRect {
        self.cur_state().clip
    }

    fn apply_clip(&mut self, clip: ClipRect) {
        self.gl.set_scissor_rect(
            (clip.x0 * self.view_scale_x) as i32,
            (clip.y0 * self.view_scale_y) as i32,
            (clip.x1 * self.view_scale_x) as i32,
            (clip.y1 * self.view_scale_y) as i32,
        );
        self.gl.enable_scissor(clip.clip_state == ClipState::Enabled);
    }

    // ---- image loading ----

    /// Launch an asynchronous image load. The decode job runs on the
    /// worker pool; completion is installed at the next `begin`.
    pub fn load_image_async<F>(&mut self, region: MemoryRegion, decoder: F) -> CgImage<R>
    where
        F: FnOnce() -> DecodeResult + Send + 'static,
    {
        let image = CgImage::new_pending();
        let handle = image.clone();

        // budget the decode against the owning heap; exhaustion surfaces
        // as an out-of-memory load status
        let budget_ok = match region {
            MemoryRegion::Low => true,
            MemoryRegion::High | MemoryRegion::HighToLow => self.heap_high.is_some(),
        };
        if !budget_ok {
            image.lock().status = ImageLoadStatus::OutOfMemory;
            return image;
        }

        self.thread_pool.enqueue(move || {
            let result = decoder();
            Box::new(move || {
                let mut inner = handle.lock();
                if inner.status == ImageLoadStatus::Aborted {
                    return;
                }
                match result {
                    Ok(decoded) => {
                        inner.staged = Some(decoded);
                    }
                    Err((status, ripcut_code)) => {
                        inner.status = status;
                        inner.ripcut_error_code = ripcut_code;
                    }
                }
            })
        });
        self.loading_images.push(image.clone());
        image
    }

    /// Free an image; GPU teardown is deferred past its last-use fence.
    pub fn image_free(&mut self, image: CgImage<R>) {
        image.abort_load();
        self.gifs.retain(|g| !Arc::ptr_eq(&g.inner, &image.inner));
        self.loading_images
            .retain(|g| !Arc::ptr_eq(&g.inner, &image.inner));
        let fence = self.gl.stream.stream_fence();
        let mut inner = image.lock();
        if let Some(ref tex) = inner.texture {
            tex.texture.set_last_use_fence(fence);
        }
        if let Some(ref tex) = inner.texture_mask {
            tex.texture.set_last_use_fence(fence);
        }
        if let Some(block) = inner.budget.take() {
            self.heap_low.with(|h| h.free(block));
        }
    }

    // ---- memory modes ----

    /// Current memory mode.
    pub fn memory_mode(&self) -> MemoryMode {
        self.memory_mode
    }

    /// Switch memory modes. Entering low tears down the high heap (after
    /// reporting leaks in debug); entering high maps it on demand.
    /// High-resident loads must be drained before entering low.
    pub fn set_memory_mode(&mut self, mode: MemoryMode) {
        match mode {
            MemoryMode::Low => {
                if let Some(high) = self.heap_high.take() {
                    high.with(|h| h.debug_print_leaks());
                }
                self.memory_mode = MemoryMode::Low;
            }
            MemoryMode::High => {
                if self.heap_high.is_none() {
                    self.heap_high = Some(ThreadSafeHeap::new(Heap::new(
                        self.config.high_mem_size,
                        8,
                        "canvas_heap_high",
                        self.config.guard_page_mode,
                    )));
                }
                self.memory_mode = MemoryMode::High;
            }
        }
    }

    /// Log heap usage for both canvas heaps.
    pub fn dump_heap_usage(&self) {
        self.heap_low.with(|h| h.dump_usage());
        if let Some(ref high) = self.heap_high {
            high.with(|h| h.dump_usage());
        }
    }
}

/// Select blend state and shader for a plain (optionally textured) draw.
/// `rgb_fill_alpha_red` selects the text shader family that takes RGB from
/// the fill style and alpha from the texture's red channel.
pub(crate) fn select_blend_and_shader<R: Resources>(
    gl: &mut CgGlState<R>,
    state: &CgState<R>,
    fill: &Color,
    tex: Option<&CgGlTexture<R>>,
    rgb_fill_alpha_red: bool,
) {
    let bind_color = |gl: &mut CgGlState<R>| {
        if rgb_fill_alpha_red {
            gl.bind_color_rgb_fill_alpha_red_shader(fill, tex);
        } else {
            gl.bind_color_shader(fill, tex);
        }
    };
    match state.blend_mode {
        BlendMode::Blit => {
            gl.set_mode_blit();
            bind_color(gl);
        }
        BlendMode::AlphaTest => {
            gl.set_mode_blit();
            if rgb_fill_alpha_red {
                gl.bind_color_shader_alpha_rgb_fill_alpha_red_test(
                    fill,
                    tex,
                    state.alpha_test_threshold,
                );
            } else {
                gl.bind_color_shader_alpha_test(fill, tex, state.alpha_test_threshold);
            }
        }
        BlendMode::SrcAlphaAll => {
            gl.set_mode_blend_alpha_all();
            bind_color(gl);
        }
        BlendMode::SrcAlphaRgb => {
            gl.set_mode_blend_alpha_rgb();
            bind_color(gl);
        }
    }
}

/// Alpha-mask variant of the blend/shader selection. Alpha-test has no
/// masked shader and falls back to blit.
pub(crate) fn select_blend_and_shader_alpha_mask<R: Resources>(
    gl: &mut CgGlState<R>,
    state: &CgState<R>,
    fill: &Color,
    tex: Option<&CgGlTexture<R>>,
    mask: Option<&CgGlTexture<R>>,
) {
    match state.blend_mode {
        BlendMode::AlphaTest | BlendMode::Blit => gl.set_mode_blit(),
        BlendMode::SrcAlphaAll => gl.set_mode_blend_alpha_all(),
        BlendMode::SrcAlphaRgb => gl.set_mode_blend_alpha_rgb(),
    }
    gl.bind_color_shader_alpha_mask(fill, tex, mask);
}

/// Stroke one subpath: an inner solid band of `line_width` plus an outer
/// feather band fading to zero alpha, as one degenerate-restarted strip of
/// `10 * (n - 1)` (+10 when closed) vertices.
fn subpath_stroke<R: Resources>(
    gl: &mut CgGlState<R>,
    subpath: &::path::Subpath,
    state: &CgState<R>,
    _options: PathOptions,
) {
    if subpath.len() < 2 {
        return;
    }

    let feather = state.feather;
    let stroke_color = color(
        state.stroke_style.r,
        state.stroke_style.g,
        state.stroke_style.b,
        state.stroke_style.a * state.global_alpha,
    );
    let count = subpath.len() as i32;
    let closed = subpath.closed;
    let tri_strip_size = (count as usize - 1) * 10 + if closed { 10 } else { 0 };
    let radius = state.line_width * 0.5;
    let mut idx = 0;

    let (mut q0, mut q1, mut q2, mut q3);
    let (mut q4, mut q5, mut q6, mut q7);
    q1 = vec2(0.0, 0.0);
    q3 = vec2(0.0, 0.0);
    q5 = vec2(0.0, 0.0);
    q7 = vec2(0.0, 0.0);
    let mut cache_valid = false;

    gl.map_vertex_range(tri_strip_size);

    for i in 0..count - 1 {
        let wrap_mode = if closed {
            SubpathWrap::Normal
        } else {
            SubpathWrap::Tangent
        };
        let p0 = subpath.at(i - 1, wrap_mode);
        let p1 = subpath.at(i, SubpathWrap::Normal);
        let p2 = subpath.at(i + 1, SubpathWrap::Normal);
        let p3 = subpath.at(i + 2, wrap_mode);

        if p1 == p2 {
            continue;
        }

        let bi_normal = p2.sub(p1).normalize();
        let normal = bi_normal.rot90();

        // miter length is proportional to the angle between the binormal
        // and normal, clamped to avoid spikes at near-180 degree joins
        let tan1 = p3.sub(p2).normalize().add(bi_normal).normalize().rot90();
        let miter1k = radius / normal.dot(tan1);
        let miter1 = tan1.scale(miter1k.max(0.0).min(MITER_CLAMP));

        // optimal, ccw wound, single tristrip order:
        //
        //    6----7  feather top
        //    4----5  line top
        // p1 ------ p2
        //    2----3  line bot
        //    0----1  feather bot

        if !cache_valid {
            cache_valid = true;
            q5 = p2.add(miter1);
            q7 = q5.add(tan1.scale(feather));
            q3 = p2.sub(miter1);
            q1 = q3.sub(tan1.scale(feather));

            let tan0 = p1.sub(p0).normalize().add(bi_normal).normalize().rot90();
            let miter0k = radius / normal.dot(tan0);
            let miter0 = tan0.scale(miter0k.max(0.0).min(MITER_CLAMP));

            q4 = p1.add(miter0);
            q6 = q4.add(tan0.scale(feather));
            q2 = p1.sub(miter0);
            q0 = q2.sub(tan0.scale(feather));
        } else {
            // cached previous column
            q0 = q1;
            q2 = q3;
            q4 = q5;
            q6 = q7;

            q5 = p2.add(miter1);
            q7 = q5.add(tan1.scale(feather));
            q3 = p2.sub(miter1);
            q1 = q3.sub(tan1.scale(feather));
        }

        // output continuous tristrip (10 verts per segment total)
        let z = color(0.0, 0.0, 0.0, 0.0);
        let a = color(0.0, 0.0, 0.0, stroke_color.a);
        gl.set_vert(idx, q0, z); // degenerate restart
        gl.set_vert(idx + 1, q0, z);
        gl.set_vert(idx + 2, q0, z);
        gl.set_vert(idx + 3, q1, z); // row 0
        gl.set_vert(idx + 4, q2, a);
        gl.set_vert(idx + 5, q3, a); // row 1
        gl.set_vert(idx + 6, q4, a);
        gl.set_vert(idx + 7, q5, a); // row 2
        gl.set_vert(idx + 8, q6, z);
        gl.set_vert(idx + 9, q7, z); // row 3
        idx += 10;

        // close the loop back to the first column
        if closed && i == count - 2 {
            gl.set_vert(idx, q1, z); // degenerate restart
            gl.set_vert(idx + 1, q1, z);
            gl.set_vert(idx + 2, q1, z);
            gl.copy_vert(2, idx + 3); // row 0
            gl.set_vert(idx + 4, q3, a);
            gl.copy_vert(4, idx + 5); // row 1
            gl.set_vert(idx + 6, q5, a);
            gl.copy_vert(6, idx + 7); // row 2
            gl.set_vert(idx + 8, q7, z);
            gl.copy_vert(8, idx + 9); // row 3
            idx += 10;
        }
    }

    gl.finish_vertex_range();
    select_blend_and_shader(gl, state, &stroke_color, None, false);
    gl.draw(DrawMode::TriangleStrip, idx, 0);
}

/// Fill one closed subpath: a feather strip plus an interior fan. Convex
/// paths draw both directly; concave paths route the fan through the
/// stencil accumulate/equal/not-equal passes.
fn subpath_fill<R: Resources>(
    gl: &mut CgGlState<R>,
    subpath: &::path::Subpath,
    state: &CgState<R>,
    options: PathOptions,
) {
    if !subpath.closed || subpath.len() < 3 {
        return;
    }

    let feather = state.feather;
    let fill_color = color(
        state.fill_style.r,
        state.fill_style.g,
        state.fill_style.b,
        state.fill_style.a * state.global_alpha,
    );
    let count = subpath.len() as i32;
    let tri_strip_size = (count as usize - 1) * 4 + 2;
    let fan_size = count as usize * 2 - 2;
    let fidx0 = tri_strip_size;
    let mut tidx = 0;
    let mut fidx = fidx0;

    let image = state.image.as_ref().and_then(|img| img.drawable_texture());
    let w = image.as_ref().map_or(1.0, |t| 1.0 / t.texture.width() as f32);
    let h = image.as_ref().map_or(1.0, |t| 1.0 / t.texture.height() as f32);
    let a = fill_color.a;

    gl.map_vertex_range(tri_strip_size + fan_size);

    let (mut q0, mut q1, mut q2, mut q3);
    q2 = vec2(0.0, 0.0);
    q3 = vec2(0.0, 0.0);
    let mut cache_valid = false;

    for i in 0..count - 1 {
        let p0 = subpath.at(i - 1, SubpathWrap::Normal);
        let p1 = subpath.at(i, SubpathWrap::Normal);
        let p2 = subpath.at(i + 1, SubpathWrap::Normal);
        let p3 = subpath.at(i + 2, SubpathWrap::Normal);

        if p1 == p2 {
            continue;
        }

        let bi_normal = p2.sub(p1).normalize();
        let tan1 = p3.sub(p2).normalize().add(bi_normal).normalize().rot90();

        // single tristrip feather band:
        //
        //    0----2   line
        // p1 |  / | p2
        //    1----3   feather
        if !cache_valid {
            cache_valid = true;
            let tan0 = p1.sub(p0).normalize().add(bi_normal).normalize().rot90();
            q0 = p1.sub(tan0.scale(feather));
            q1 = p1;
            q2 = p2.sub(tan1.scale(feather));
            q3 = p2;
        } else {
            // cached previous column
            q0 = q2;
            q1 = q3;
            q2 = p2.sub(tan1.scale(feather));
            q3 = p2;
        }

        // feather strip
        gl.set_vert(tidx, q0, color(q0.x * w, q0.y * h, 0.0, 0.0));
        gl.set_vert(tidx + 1, q1, color(q1.x * w, q1.y * h, 0.0, a));
        gl.set_vert(tidx + 2, q2, color(q2.x * w, q2.y * h, 0.0, 0.0));
        gl.set_vert(tidx + 3, q3, color(q3.x * w, q3.y * h, 0.0, a));
        tidx += 4;

        // interior fan
        gl.set_vert(fidx, q1, color(q1.x * w, q1.y * h, 0.0, a));
        gl.set_vert(fidx + 1, q3, color(q3.x * w, q3.y * h, 0.0, a));
        fidx += 2;

        if i == count - 2 {
            gl.copy_vert(0, tidx);
            gl.copy_vert(1, tidx + 1);
            tidx += 2;
        }
    }

    gl.finish_vertex_range();

    select_blend_and_shader(gl, state, &fill_color, image.as_ref(), false);

    let fan_count = fidx - fidx0;
    if options.contains(PathOptions::CONCAVE) {
        // fill
        gl.set_mode_stencil_accum();
        gl.draw(DrawMode::TriangleFan, fan_count, fidx0);
        // feather
        gl.set_mode_stencil_eq();
        gl.draw(DrawMode::TriangleStrip, tidx, 0);
        // fill
        gl.set_mode_stencil_neq();
        gl.draw(DrawMode::TriangleFan, fan_count, fidx0);
        gl.set_mode_stencil_off();
    } else {
        // feather
        if !options.contains(PathOptions::NO_FEATHER) {
            gl.draw(DrawMode::TriangleStrip, tidx, 0);
        }
        // fill
        gl.draw(DrawMode::TriangleFan, fan_count, fidx0);
    }
}
