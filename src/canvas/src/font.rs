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

//! Canvas font backend.
//!
//! Maintains the R8 glyph atlas, per-font glyph caches, the sub-image
//! upload ring bounded by fences, text block layout, and the text-mesh
//! memoization cache.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use adk_core::{DrawMode, Fence, Mesh, PixelFormat, Resources, SamplerDesc, TextureUsage,
               WaitMode};
use adk_imagelib::{ImageDesc, ImageMips};
use adk_runtime::{lower_bound, utf8, Heap, HeapBlock, LinearBlockAllocator};
use adk_runtime::{crc32, update_crc32};
use adk_runtime::GuardPageMode;
use rusttype::{point, Font, Scale};

use context::{select_blend_and_shader, CanvasConfig, CgContext, CgState};
use gl::{verts_as_bytes, CgGlState, CgGlTexture, CgVertex};
use math::{rect, vec2, Affine, Rect, Vec2};

const VERTS_PER_QUAD: usize = 6;
const NON_BREAKING_SPACE: u32 = 0xa0;
const DEFAULT_ATLAS_UPLOAD_QUEUE_LIMIT: usize = 64;
const MAX_UNIQUE_GLYPHS_PER_RASTER_PASS: usize = 16;
const ATLAS_PACK_PADDING: u32 = 1;

bitflags!(
    /// Single-call text fill alignment.
    pub struct FontFillOptions: u32 {
        /// Left align.
        const ALIGN_LEFT = 1 << 0;
        /// Center align.
        const ALIGN_CENTER = 1 << 1;
        /// Right align.
        const ALIGN_RIGHT = 1 << 2;
        /// Top align.
        const ALIGN_TOP = 1 << 3;
        /// Bottom align.
        const ALIGN_BOTTOM = 1 << 4;
    }
);

bitflags!(
    /// Text block layout options.
    pub struct TextBlockOptions: u32 {
        /// Left-align each line.
        const ALIGN_LINE_LEFT = 1 << 0;
        /// Center each line.
        const ALIGN_LINE_CENTER = 1 << 1;
        /// Right-align each line.
        const ALIGN_LINE_RIGHT = 1 << 2;
        /// Block to the top of the rect.
        const ALIGN_TEXT_TOP = 1 << 3;
        /// Center the block vertically.
        const ALIGN_TEXT_CENTER = 1 << 4;
        /// Block to the bottom of the rect.
        const ALIGN_TEXT_BOTTOM = 1 << 5;
        /// Render the last partial line instead of culling it.
        const ALLOW_BLOCK_BOUNDS_OVERFLOW = 1 << 6;
        /// Treat `extra_line_spacing` as a relative height multiplier
        /// (1.0 = normal, 1.2 = 120% line height) instead of an absolute
        /// offset.
        const LINE_SPACE_RELATIVE = 1 << 7;
    }
);

/// Measured text metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FontMetrics {
    /// Rendered block bounds.
    pub bounds: Rect,
    /// Baseline offset from the block top.
    pub baseline: f32,
}

/// First/last rendered byte offsets of a scrolled text block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TextBlockPageOffsets {
    /// Offset of the first displayed byte.
    pub begin_offset: u32,
    /// Offset one past the last displayed byte.
    pub end_offset: u32,
}

/// Font async load status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FontLoadStatus {
    /// Allocation failed during load.
    OutOfMemory,
    /// The font file could not be read.
    FileError,
    /// The bytes are not a parseable TrueType font.
    FontParseError,
    /// General HTTP fetch error.
    HttpFetchError,
    /// The load was canceled.
    Aborted,
    /// Parsed and ready.
    Complete,
    /// Load in progress.
    Pending,
}

/// HTTP status codes accepted by font/image fetches: success plus the
/// common redirects.
pub fn is_accepted_http_status(code: u32) -> bool {
    match code {
        200 | 301 | 302 | 303 | 307 | 308 => true,
        _ => false,
    }
}

struct FontFileShared {
    id: i32,
    status: Mutex<FontLoadStatus>,
    font: Mutex<Option<Font<'static>>>,
}

/// A parsed TrueType font file, shared by font contexts.
pub struct CgFontFile {
    shared: Arc<FontFileShared>,
}

impl Clone for CgFontFile {
    fn clone(&self) -> Self {
        CgFontFile {
            shared: self.shared.clone(),
        }
    }
}

impl CgFontFile {
    /// Current load status.
    pub fn load_status(&self) -> FontLoadStatus {
        *self.shared.status.lock().unwrap()
    }

    /// Stable id used by glyph caches and text-mesh fingerprints.
    pub fn id(&self) -> i32 {
        self.shared.id
    }

    /// Cancel an in-flight load; the completion path frees the parse
    /// result instead of installing it.
    pub fn abort_load(&self) {
        let mut status = self.shared.status.lock().unwrap();
        if *status == FontLoadStatus::Pending {
            *status = FontLoadStatus::Aborted;
        }
    }

    fn with_font<T, F: FnOnce(&Font<'static>) -> T>(&self, f: F) -> T {
        let guard = self.shared.font.lock().unwrap();
        f(guard.as_ref().expect("font file not loaded"))
    }
}

fn parse_font(bytes: Vec<u8>) -> Result<Font<'static>, ()> {
    match Font::from_bytes(bytes) {
        Ok(font) => Ok(font),
        Err(_) => Err(()),
    }
}

/// A font context: a font file at a pixel height with layout knobs.
pub struct CgFontContext {
    pub(crate) font_index: usize,
    /// Size the context was created at.
    pub size: f32,
    /// Size used when rendering (virtual size override).
    pub virtual_size: f32,
    /// Baseline offset.
    pub baseline: f32,
}

pub(crate) struct MosaicFontData {
    font_file: CgFontFile,
    height: i32,
    tab_space_multiplier: i32,
    missing_glyph_codepoint: Option<u32>,
}

impl MosaicFontData {
    fn scale(&self) -> Scale {
        Scale::uniform(self.height as f32)
    }

    fn ascent(&self) -> f32 {
        self.font_file
            .with_font(|f| f.v_metrics(self.scale()).ascent)
    }

    fn glyph_exists(&self, cp: u32) -> bool {
        match ::std::char::from_u32(cp) {
            Some(ch) => self
                .font_file
                .with_font(|f| f.glyph(ch).id().0 != 0),
            None => false,
        }
    }

    fn advance(&self, cp: u32) -> f32 {
        let scale = self.scale();
        match ::std::char::from_u32(cp) {
            Some(ch) => self
                .font_file
                .with_font(|f| f.glyph(ch).scaled(scale).h_metrics().advance_width),
            None => 0.0,
        }
    }

    fn kern(&self, a: u32, b: u32) -> f32 {
        let scale = self.scale();
        match (::std::char::from_u32(a), ::std::char::from_u32(b)) {
            (Some(ca), Some(cb)) => self.font_file.with_font(|f| f.pair_kerning(scale, ca, cb)),
            _ => 0.0,
        }
    }
}

// ---- glyph cache ----

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CodepointState {
    Uninit,
    Rasterized,
    NoBackingGlyph,
    PackingFailed,
}

#[derive(Clone, Copy, Debug)]
struct CodepointInfo {
    tex_x: i16,
    tex_y: i16,
    tex_w: i16,
    tex_h: i16,
    x_off: f32,
    y_off: f32,
    x_advance: f32,
    state: CodepointState,
}

impl Default for CodepointInfo {
    fn default() -> CodepointInfo {
        CodepointInfo {
            tex_x: 0,
            tex_y: 0,
            tex_w: 0,
            tex_h: 0,
            x_off: 0.0,
            y_off: 0.0,
            x_advance: 0.0,
            state: CodepointState::Uninit,
        }
    }
}

struct FontGlyphCache {
    font_index: usize,
    // kept sorted so lookups binary search
    codepoints: Vec<u32>,
    infos: Vec<CodepointInfo>,
    num_unrasterized: u32,
}

impl FontGlyphCache {
    fn new(font_index: usize) -> FontGlyphCache {
        FontGlyphCache {
            font_index: font_index,
            codepoints: Vec::new(),
            infos: Vec::new(),
            num_unrasterized: 0,
        }
    }

    fn find(&self, cp: u32) -> Option<usize> {
        if self.codepoints.is_empty() {
            return None;
        }
        let idx = lower_bound(&self.codepoints, &cp, |a, b| a < b);
        if idx != self.codepoints.len() && self.codepoints[idx] == cp {
            Some(idx)
        } else {
            None
        }
    }

    fn info(&self, cp: u32) -> Option<CodepointInfo> {
        self.find(cp).map(|i| self.infos[i])
    }

    // returns true when the codepoint was new
    fn try_push(&mut self, cp: u32) -> bool {
        if self.find(cp).is_some() {
            return false;
        }
        let idx = lower_bound(&self.codepoints, &cp, |a, b| a < b);
        self.codepoints.insert(idx, cp);
        self.infos.insert(idx, CodepointInfo::default());
        self.num_unrasterized += 1;
        true
    }
}

// ---- atlas packing ----

struct ShelfPacker {
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    row_height: u32,
}

impl ShelfPacker {
    fn new(width: u32, height: u32) -> ShelfPacker {
        ShelfPacker {
            width: width,
            height: height,
            x: ATLAS_PACK_PADDING,
            y: ATLAS_PACK_PADDING,
            row_height: 0,
        }
    }

    fn reset(&mut self) {
        self.x = ATLAS_PACK_PADDING;
        self.y = ATLAS_PACK_PADDING;
        self.row_height = 0;
    }

    fn pack(&mut self, w: u32, h: u32) -> Option<(u32, u32)> {
        let pw = w + ATLAS_PACK_PADDING;
        let ph = h + ATLAS_PACK_PADDING;
        if self.x + pw > self.width {
            self.x = ATLAS_PACK_PADDING;
            self.y += self.row_height;
            self.row_height = 0;
        }
        if self.x + pw > self.width || self.y + ph > self.height {
            return None;
        }
        let pos = (self.x, self.y);
        self.x += pw;
        if ph > self.row_height {
            self.row_height = ph;
        }
        Some(pos)
    }
}

struct DirtyRegion {
    x0: u32,
    y0: u32,
    x1: u32,
    y1: u32,
}

impl DirtyRegion {
    fn empty() -> DirtyRegion {
        DirtyRegion {
            x0: u32::max_value(),
            y0: u32::max_value(),
            x1: 0,
            y1: 0,
        }
    }

    fn grow(&mut self, x0: u32, y0: u32, x1: u32, y1: u32) {
        self.x0 = self.x0.min(x0);
        self.y0 = self.y0.min(y0);
        self.x1 = self.x1.max(x1);
        self.y1 = self.y1.max(y1);
    }
}

struct GlyphRaster {
    packer: ShelfPacker,
    caches: Vec<FontGlyphCache>,
    atlas_dirty: bool,
    dirty: DirtyRegion,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RasterizeOutcome {
    PartialFailure,
    RenderableRasterized,
}

struct UploadRegion {
    fence: Fence,
    block: Option<HeapBlock>,
}

struct AtlasState<R: Resources> {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    texture: CgGlTexture<R>,
    regions: Vec<UploadRegion>,
    free_regions: Vec<usize>,
    pending_regions: ::std::collections::VecDeque<usize>,
    sub_image_heap: Heap,
    // whole-surface fence used when the RHI lacks sub-texture updates
    image_fence: Fence,
}

/// The font/text subsystem state, owned by the canvas.
pub struct MosaicContext<R: Resources> {
    pub(crate) fonts: Vec<Option<MosaicFontData>>,
    pub(crate) font_index: usize,
    max_width: u32,
    max_height: u32,
    atlas: AtlasState<R>,
    raster: GlyphRaster,
    lba: LinearBlockAllocator,
    missing_glyph_codepoint: Option<u32>,
    font_id_counter: i32,
    text_mesh_cache: Option<TextMeshCache<R>>,
    supports_sub_texture_update: bool,
}

impl<R: Resources> MosaicContext<R> {
    pub(crate) fn new(
        gl: &mut CgGlState<R>,
        config: &CanvasConfig,
        width: u32,
        height: u32,
    ) -> MosaicContext<R> {
        let atlas_size = (width * height) as usize;
        let texture = {
            let mut desc = ImageDesc::uncompressed(width, height, 1);
            desc.bpp = 1;
            let tex = gl.stream.create_texture_2d(
                ImageMips::single(desc),
                PixelFormat::R8Unorm,
                TextureUsage::Dynamic,
                SamplerDesc::default(),
                None,
                "cg_font_atlas",
            );
            CgGlTexture::new(tex)
        };

        let mut regions = Vec::with_capacity(DEFAULT_ATLAS_UPLOAD_QUEUE_LIMIT);
        let mut free_regions = Vec::with_capacity(DEFAULT_ATLAS_UPLOAD_QUEUE_LIMIT);
        for i in 0..DEFAULT_ATLAS_UPLOAD_QUEUE_LIMIT {
            regions.push(UploadRegion {
                fence: Fence::default(),
                block: None,
            });
            free_regions.push(i);
        }

        MosaicContext {
            fonts: Vec::new(),
            font_index: 0,
            max_width: width,
            max_height: height,
            atlas: AtlasState {
                pixels: vec![0u8; atlas_size],
                width: width,
                height: height,
                texture: texture,
                regions: regions,
                free_regions: free_regions,
                pending_regions: ::std::collections::VecDeque::new(),
                sub_image_heap: Heap::new(
                    atlas_size.max(4096),
                    8,
                    "mosaic_ctx_atlas_sub_image_heap",
                    GuardPageMode::Disabled,
                ),
                image_fence: Fence::default(),
            },
            raster: GlyphRaster {
                packer: ShelfPacker::new(width, height),
                caches: Vec::new(),
                atlas_dirty: false,
                dirty: DirtyRegion::empty(),
            },
            lba: LinearBlockAllocator::new(config.font_scratchpad_size, "font_atlas_lba"),
            missing_glyph_codepoint: None,
            font_id_counter: 0,
            text_mesh_cache: if config.text_mesh_cache_enabled {
                Some(TextMeshCache::new(config.text_mesh_cache_size as usize))
            } else {
                None
            },
            supports_sub_texture_update: true,
        }
    }

    pub(crate) fn set_sub_texture_support(&mut self, supported: bool) {
        self.supports_sub_texture_update = supported;
    }

    /// The atlas texture (drawn by the text shaders; also useful to debug
    /// draw the atlas itself).
    pub fn atlas_texture(&self) -> &CgGlTexture<R> {
        &self.atlas.texture
    }

    fn font(&self, index: usize) -> &MosaicFontData {
        self.fonts[index].as_ref().expect("font slot is empty")
    }

    fn bound_font(&self) -> &MosaicFontData {
        self.font(self.font_index)
    }

    pub(crate) fn font_bind(&mut self, index: usize) {
        assert!(index < self.fonts.len() && self.fonts[index].is_some());
        self.font_index = index;
    }

    fn font_load(&mut self, file: &CgFontFile, height: f32, tab_space_multiplier: i32) -> usize {
        assert!(file.load_status() == FontLoadStatus::Complete && tab_space_multiplier > 0);
        let data = MosaicFontData {
            font_file: file.clone(),
            height: height as i32,
            tab_space_multiplier: tab_space_multiplier,
            missing_glyph_codepoint: None,
        };
        // reuse a freed slot before growing the table
        for (i, slot) in self.fonts.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(data);
                return i;
            }
        }
        self.fonts.push(Some(data));
        self.fonts.len() - 1
    }

    fn font_free(&mut self, index: usize) {
        self.fonts[index] = None;
    }

    fn missing_glyph_cp(&self, font: &MosaicFontData) -> u32 {
        font.missing_glyph_codepoint
            .or(self.missing_glyph_codepoint)
            .unwrap_or(' ' as u32)
    }

    fn find_cache(&mut self, font_index: usize) -> usize {
        if let Some(pos) = self
            .raster
            .caches
            .iter()
            .position(|c| c.font_index == font_index)
        {
            return pos;
        }
        self.raster.caches.push(FontGlyphCache::new(font_index));
        self.raster.caches.len() - 1
    }

    fn destroy_cache(&mut self, font_index: usize) {
        self.raster.caches.retain(|c| c.font_index != font_index);
    }

    // ---- rasterization ----

    fn rasterize_pending(
        &mut self,
        cache_idx: usize,
        first_codepoint: u32,
    ) -> RasterizeOutcome {
        if self.raster.caches[cache_idx].num_unrasterized == 0 {
            return RasterizeOutcome::RenderableRasterized;
        }

        // always pack the first glyph so forward progress is guaranteed
        // even when the packer fails partway through a batch
        let mut outcome = RasterizeOutcome::RenderableRasterized;
        if let Some(i) = self.raster.caches[cache_idx].find(first_codepoint) {
            if self.raster.caches[cache_idx].infos[i].state == CodepointState::Uninit {
                if self.rasterize_one(cache_idx, i) == RasterizeOutcome::PartialFailure {
                    outcome = RasterizeOutcome::PartialFailure;
                }
            }
        }

        // remaining uninitialized codepoints in bounded batches
        loop {
            let batch: Vec<usize> = {
                let cache = &self.raster.caches[cache_idx];
                cache
                    .infos
                    .iter()
                    .enumerate()
                    .filter(|&(_, info)| info.state == CodepointState::Uninit)
                    .map(|(i, _)| i)
                    .take(MAX_UNIQUE_GLYPHS_PER_RASTER_PASS)
                    .collect()
            };
            if batch.is_empty() {
                break;
            }
            self.lba.reset();
            for i in batch {
                if self.rasterize_one(cache_idx, i) == RasterizeOutcome::PartialFailure {
                    outcome = RasterizeOutcome::PartialFailure;
                }
            }
        }

        self.raster.caches[cache_idx].num_unrasterized = 0;
        outcome
    }

    fn rasterize_one(&mut self, cache_idx: usize, info_idx: usize) -> RasterizeOutcome {
        let cp = self.raster.caches[cache_idx].codepoints[info_idx];
        let font_index = self.raster.caches[cache_idx].font_index;
        let is_control = is_control_character(cp);

        let (exists, advance) = {
            let font = self.font(font_index);
            (font.glyph_exists(cp), font.advance(cp))
        };

        if !exists && !is_control {
            let info = &mut self.raster.caches[cache_idx].infos[info_idx];
            info.state = CodepointState::NoBackingGlyph;
            info.x_advance = advance;
            return RasterizeOutcome::RenderableRasterized;
        }

        // rasterize coverage into pack-pass scratch, then blit into the
        // atlas at the packed position
        let raster = {
            let font = self.font(font_index);
            let scale = font.scale();
            let ch = ::std::char::from_u32(cp).unwrap_or(' ');
            font.font_file.with_font(|f| {
                let glyph = f.glyph(ch).scaled(scale).positioned(point(0.0, 0.0));
                glyph.pixel_bounding_box().map(|bb| {
                    let w = (bb.max.x - bb.min.x) as u32;
                    let h = (bb.max.y - bb.min.y) as u32;
                    let mut coverage = vec![0u8; (w * h) as usize];
                    glyph.draw(|x, y, v| {
                        coverage[(y * w + x) as usize] = (v * 255.0) as u8;
                    });
                    (w, h, bb.min.x as f32, bb.min.y as f32, coverage)
                })
            })
        };

        let (w, h, x_off, y_off, coverage) = match raster {
            Some(r) => r,
            None => {
                // zero-coverage glyph (space): renderable, no atlas rect
                let info = &mut self.raster.caches[cache_idx].infos[info_idx];
                info.state = CodepointState::Rasterized;
                info.x_advance = advance;
                return RasterizeOutcome::RenderableRasterized;
            }
        };

        // stage through the pack-pass scratch allocator
        let staged = self.lba.allocate(4, coverage.len());
        if let Some(span) = staged {
            self.lba.bytes_mut(span).copy_from_slice(&coverage);
        }

        match self.raster.packer.pack(w, h) {
            Some((x, y)) => {
                let src: &[u8] = match staged {
                    Some(span) => self.lba.bytes_mut(span),
                    None => &coverage[..],
                };
                // blit rows into the atlas surface
                for row in 0..h {
                    let dst_ofs = ((y + row) * self.atlas.width + x) as usize;
                    self.atlas.pixels[dst_ofs..dst_ofs + w as usize]
                        .copy_from_slice(&src[(row * w) as usize..((row + 1) * w) as usize]);
                }

                let pad = ATLAS_PACK_PADDING;
                self.raster.dirty.grow(
                    x.saturating_sub(pad),
                    y.saturating_sub(pad),
                    (x + w + pad).min(self.atlas.width),
                    (y + h + pad).min(self.atlas.height),
                );
                self.raster.atlas_dirty = true;

                let info = &mut self.raster.caches[cache_idx].infos[info_idx];
                info.tex_x = x as i16;
                info.tex_y = y as i16;
                info.tex_w = w as i16;
                info.tex_h = h as i16;
                info.x_off = x_off;
                info.y_off = y_off;
                info.x_advance = advance;
                info.state = CodepointState::Rasterized;
                RasterizeOutcome::RenderableRasterized
            }
            None => {
                let info = &mut self.raster.caches[cache_idx].infos[info_idx];
                info.x_advance = advance;
                info.state = CodepointState::PackingFailed;
                RasterizeOutcome::PartialFailure
            }
        }
    }

    fn try_rasterize_glyphs(
        &mut self,
        cache_idx: usize,
        text: &[u8],
    ) -> RasterizeOutcome {
        // ' ' and the missing-glyph indicator first, so fallback always
        // has a rasterized glyph to lean on
        self.raster.caches[cache_idx].try_push(' ' as u32);
        let missing = {
            let font_index = self.raster.caches[cache_idx].font_index;
            let font = self.font(font_index);
            self.missing_glyph_cp(font)
        };
        self.raster.caches[cache_idx].try_push(missing);
        let mut outcome = self.rasterize_pending(cache_idx, missing);

        let mut pos = 0;
        while pos < text.len() {
            match utf8::decode(&text[pos..]) {
                Some((cp, len)) => {
                    pos += len;
                    self.raster.caches[cache_idx].try_push(cp);
                }
                None => break,
            }
        }

        let first = utf8::decode(text).map(|(cp, _)| cp).unwrap_or(' ' as u32);
        if self.rasterize_pending(cache_idx, first) == RasterizeOutcome::PartialFailure {
            outcome = RasterizeOutcome::PartialFailure;
        }
        outcome
    }

    /// Drop every glyph cache and restart the packer; subsequent lookups
    /// miss and re-rasterize.
    fn raster_reset(&mut self, gl: &mut CgGlState<R>) {
        if !self.supports_sub_texture_update {
            // pending whole-surface upload still reads the pixels
            let fence = self.atlas.image_fence;
            gl.stream.conditional_flush_and_wait_fence(fence);
        }
        self.raster.caches.clear();
        self.raster.packer.reset();
        self.raster.atlas_dirty = false;
        self.raster.dirty = DirtyRegion::empty();
        for b in &mut self.atlas.pixels {
            *b = 0;
        }
    }

    fn rebuild_font_atlas(
        &mut self,
        gl: &mut CgGlState<R>,
        font_index: usize,
        text: &[u8],
    ) -> (usize, RasterizeOutcome) {
        self.raster_reset(gl);
        let cache_idx = self.find_cache(font_index);
        let outcome = self.try_rasterize_glyphs(cache_idx, text);
        (cache_idx, outcome)
    }

    // ---- atlas upload ----

    fn region_try_pop_free(&mut self) -> Option<usize> {
        match self.atlas.free_regions.pop() {
            Some(idx) => {
                self.atlas.pending_regions.push_back(idx);
                Some(idx)
            }
            None => None,
        }
    }

    fn region_free_retired(&mut self, gl: &mut CgGlState<R>) {
        while let Some(&idx) = self.atlas.pending_regions.front() {
            if !gl.stream.check_fence(self.atlas.regions[idx].fence) {
                break;
            }
            self.atlas.pending_regions.pop_front();
            if let Some(block) = self.atlas.regions[idx].block.take() {
                self.atlas.sub_image_heap.free(block);
            }
            self.atlas.regions[idx].fence = Fence::default();
            self.atlas.free_regions.push(idx);
        }
    }

    fn alloc_sub_texture_region(&mut self, gl: &mut CgGlState<R>, size: usize) -> usize {
        self.region_free_retired(gl);
        let idx = match self.region_try_pop_free() {
            Some(idx) => idx,
            None => {
                // ring exhausted: wait out the oldest outstanding upload
                let oldest = *self.atlas.pending_regions.front().unwrap();
                let fence = self.atlas.regions[oldest].fence;
                gl.stream.conditional_flush_and_wait_fence(fence);
                self.region_free_retired(gl);
                self.region_try_pop_free().expect("upload ring must have a free region")
            }
        };

        let block = match self.atlas.sub_image_heap.unchecked_alloc(size, "atlas_sub_image") {
            Some(b) => Some(b),
            None => {
                // enough nodes but not enough staging space; drain the
                // pendings and retry
                if let Some(&last) = self.atlas.pending_regions.back() {
                    let fence = self.atlas.regions[last].fence;
                    gl.stream.conditional_flush_and_wait_fence(fence);
                }
                self.region_free_retired(gl);
                Some(self.atlas.sub_image_heap.alloc(size, "atlas_sub_image"))
            }
        };
        self.atlas.regions[idx].block = block;
        idx
    }

    /// Push the dirty atlas region to the GPU. Desktop RHIs get a
    /// sub-rectangle copy through the fenced upload ring; others wait the
    /// previous whole-surface upload and re-send everything.
    fn flush_atlas(&mut self, gl: &mut CgGlState<R>) {
        if !self.raster.atlas_dirty {
            return;
        }
        self.raster.atlas_dirty = false;

        if self.supports_sub_texture_update {
            let x0 = self.raster.dirty.x0.min(self.atlas.width);
            let y0 = self.raster.dirty.y0.min(self.atlas.height);
            let x1 = self.raster.dirty.x1.max(x0);
            let y1 = self.raster.dirty.y1.max(y0);
            let w = x1 - x0;
            let h = y1 - y0;
            if w == 0 || h == 0 {
                return;
            }

            let region_idx = self.alloc_sub_texture_region(gl, (w * h) as usize);
            // gather the dirty rows into the staging block
            let mut staged = vec![0u8; (w * h) as usize];
            for row in 0..h {
                let src = ((y0 + row) * self.atlas.width + x0) as usize;
                let dst = (row * w) as usize;
                staged[dst..dst + w as usize]
                    .copy_from_slice(&self.atlas.pixels[src..src + w as usize]);
            }
            if let Some(ref block) = self.atlas.regions[region_idx].block {
                self.atlas
                    .sub_image_heap
                    .bytes_mut(block)
                    .copy_from_slice(&staged);
            }
            gl.stream
                .upload_sub_texture(&self.atlas.texture.texture, (x0, y0, w, h), &staged);
            self.atlas.regions[region_idx].fence = gl.stream.flush(WaitMode::NoWait);
        } else {
            let fence = self.atlas.image_fence;
            gl.stream.conditional_flush_and_wait_fence(fence);
            let pixels = self.atlas.pixels.clone();
            gl.stream.upload_texture(&self.atlas.texture.texture, &pixels);
            self.atlas.image_fence = gl.stream.flush(WaitMode::NoWait);
        }

        self.raster.dirty = DirtyRegion::empty();
    }
}

fn is_whitespace(cp: u32) -> bool {
    cp == '\t' as u32 || cp == ' ' as u32
}

fn is_newline(cp: u32) -> bool {
    cp == '\n' as u32 || cp == '\r' as u32
}

fn is_control_character(cp: u32) -> bool {
    is_whitespace(cp) || is_newline(cp) || cp == NON_BREAKING_SPACE
}

fn byte_at(text: &[u8], pos: usize) -> u32 {
    if pos < text.len() {
        text[pos] as u32
    } else {
        0
    }
}

// ---- layout ----

struct LinebreakResult {
    // byte offset where the line breaks
    position: usize,
    // width up to the last renderable (non-whitespace) boundary
    last_renderable_width: f32,
    // full accumulated width including trailing whitespace
    line_width: f32,
}

fn find_linebreak_position<R: Resources>(
    mosaic: &MosaicContext<R>,
    max_line_width: f32,
    text: &[u8],
) -> LinebreakResult {
    let mut result = LinebreakResult {
        position: 0,
        last_renderable_width: 0.0,
        line_width: 0.0,
    };

    // a line that starts on a newline immediately consumes it
    if is_newline(byte_at(text, 0)) {
        result.position = 1;
        return result;
    }

    let font = mosaic.bound_font();
    let missing_cp = mosaic.missing_glyph_cp(font);
    let missing_width = font.advance(missing_cp);
    let tab_width = font.advance(' ' as u32) * font.tab_space_multiplier as f32;

    let mut pos = 0;
    let mut curr_line_width = 0.0f32;
    let mut line_width_no_white_space = 0.0f32;
    let mut last_codepoint = 0u32;

    while pos < text.len() {
        let (cp, len) = match utf8::decode(&text[pos..]) {
            Some(d) => d,
            None => break,
        };
        last_codepoint = cp;
        pos += len;
        let next_cp = utf8::decode(&text[pos..]).map(|(c, _)| c).unwrap_or(0);

        let advance = if cp == '\t' as u32 {
            tab_width
        } else if font.glyph_exists(cp) {
            font.advance(cp)
        } else {
            missing_width
        };
        curr_line_width += advance;
        if next_cp != 0 {
            curr_line_width += font.kern(if cp == '\t' as u32 { ' ' as u32 } else { cp }, next_cp);
        }

        if curr_line_width > max_line_width {
            break;
        }

        if !is_whitespace(cp) && !is_newline(cp) {
            line_width_no_white_space = curr_line_width;
        }

        if is_newline(next_cp) {
            if !is_whitespace(cp) {
                result.last_renderable_width = line_width_no_white_space;
                result.position = pos;
            }
            break;
        }

        if (!is_whitespace(cp) && is_whitespace(next_cp))
            || !is_whitespace(byte_at(text, result.position))
        {
            result.last_renderable_width = line_width_no_white_space;
            result.position = pos;
        }
    }

    if curr_line_width < max_line_width
        && pos >= text.len()
        && !(is_whitespace(last_codepoint) || is_newline(last_codepoint))
    {
        result.last_renderable_width = curr_line_width;
        result.position = pos;
    }

    result.line_width = curr_line_width;
    result
}

fn skip_trailing_white_space_and_first_newline(text: &[u8], start_of_line: usize, pos: &mut usize) {
    // do not over-consume a line that *is* a newline
    if is_newline(byte_at(text, start_of_line)) {
        return;
    }
    while is_whitespace(byte_at(text, *pos)) {
        *pos += 1;
    }
    if is_newline(byte_at(text, *pos)) {
        // CRLF counts as one newline
        if byte_at(text, *pos) == '\r' as u32 && byte_at(text, *pos + 1) == '\n' as u32 {
            *pos += 2;
        } else {
            *pos += 1;
        }
    }
}

struct LineHeightArgs<'a> {
    curr_height: f32,
    line_height: f32,
    max_height: f32,
    max_line_width: f32,
    space_width: f32,
    tab_width: f32,
    ellipses_width: f32,
    text: &'a [u8],
}

// lookahead used by the ellipsis decision: how tall the block becomes by
// the time the next word renders, counting forced breaks from leading
// whitespace runs
fn line_height_at_next_word<R: Resources>(mosaic: &MosaicContext<R>, args: LineHeightArgs) -> f32 {
    if !is_whitespace(byte_at(args.text, 0)) && !is_newline(byte_at(args.text, 0)) {
        return args.curr_height;
    }

    let mut curr_line_height = args.curr_height;
    let mut curr_line_width = 0.0f32;
    let mut got_space_contribution_for_this_line = false;
    let mut pos = 0;

    while pos < args.text.len() && curr_line_height < args.max_height {
        let b = byte_at(args.text, pos);
        if is_newline(b) {
            curr_line_width = 0.0;
            got_space_contribution_for_this_line = false;
            if b == '\r' as u32 && byte_at(args.text, pos + 1) == '\n' as u32 {
                pos += 2;
            } else {
                pos += 1;
            }
            curr_line_height += args.line_height;
        } else if is_whitespace(b) {
            curr_line_width += if b == ' ' as u32 {
                args.space_width
            } else {
                args.tab_width
            };
            if curr_line_width > args.max_line_width && !got_space_contribution_for_this_line {
                got_space_contribution_for_this_line = true;
                curr_line_width = 0.0;
                curr_line_height += args.line_height;
            }
            pos += 1;
        } else {
            break;
        }
    }

    if curr_line_width + args.ellipses_width > args.max_line_width {
        curr_line_height += args.line_height;
    } else if curr_line_width > 0.0 {
        // verify the next word plus the ellipses can still break cleanly
        let lb = find_linebreak_position(
            mosaic,
            args.max_line_width - args.ellipses_width - curr_line_width,
            &args.text[pos..],
        );
        let after = byte_at(args.text, pos + lb.position);
        if after != 0 && !is_whitespace(after) && !is_newline(after) {
            curr_line_height += args.line_height;
        }
    }
    curr_line_height
}

fn calculate_line_offset(box_width: f32, line_width: f32, options: TextBlockOptions) -> f32 {
    if options.contains(TextBlockOptions::ALIGN_LINE_CENTER) {
        (box_width - line_width) / 2.0
    } else if options.contains(TextBlockOptions::ALIGN_LINE_RIGHT) {
        box_width - line_width
    } else {
        0.0
    }
}

fn line_height_for<R: Resources>(
    mosaic: &MosaicContext<R>,
    extra_line_spacing: f32,
    options: TextBlockOptions,
) -> f32 {
    let font_height = mosaic.bound_font().height as f32;
    if options.contains(TextBlockOptions::LINE_SPACE_RELATIVE) {
        font_height * extra_line_spacing
    } else {
        font_height + extra_line_spacing
    }
}

// ---- partial text drawing ----

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DrawTextStatus {
    // codepoint missing from the glyph cache; a rasterize pass may fit it
    // without an atlas flush
    CodepointNotInCache,
    // glyph missing from the atlas; flush, reset, and rebuild to continue
    GlyphNotInAtlas,
    // vertex reservation exhausted; flush and remap to continue
    NoMoreIndices,
    Complete,
}

/// A text block's mesh under construction (also the memoized cache entry).
pub(crate) struct TextMesh<R: Resources> {
    verts: Vec<CgVertex>,
    vert_index: usize,
    reserved_verts: usize,
    total_glyphs: usize,
    glyphs_drawn: usize,
    r_mesh: Option<Mesh<R>>,
    fence: Fence,
    bounding_box: Rect,
}

impl<R: Resources> TextMesh<R> {
    fn with_reservation(reserved: usize) -> TextMesh<R> {
        TextMesh {
            verts: Vec::with_capacity(reserved),
            vert_index: 0,
            reserved_verts: reserved,
            total_glyphs: 0,
            glyphs_drawn: 0,
            r_mesh: None,
            fence: Fence::default(),
            bounding_box: Rect::default(),
        }
    }
}

fn draw_partial_text<R: Resources>(
    mosaic: &mut MosaicContext<R>,
    cache_idx: usize,
    mesh: &mut TextMesh<R>,
    transform: &Affine,
    offset: Vec2,
    fill_alpha: f32,
    text: &[u8],
    start: usize,
    end: usize,
) -> (DrawTextStatus, usize, f32) {
    let mut pos = start;
    let mut curr_width = offset.x;

    if is_newline(byte_at(text, pos)) {
        return (DrawTextStatus::Complete, pos + 1, curr_width);
    }

    let uv_inverse_width = 1.0 / mosaic.max_width as f32;
    let uv_inverse_height = 1.0 / mosaic.max_height as f32;

    let (font_baseline, tab_mult, missing_info) = {
        let font = mosaic.font(mosaic.raster.caches[cache_idx].font_index);
        let missing_cp = mosaic.missing_glyph_cp(font);
        let lookup = if font.glyph_exists(missing_cp) {
            missing_cp
        } else {
            ' ' as u32
        };
        (
            font.ascent(),
            font.tab_space_multiplier,
            mosaic.raster.caches[cache_idx].info(lookup),
        )
    };

    while pos != end {
        if mesh.vert_index + VERTS_PER_QUAD > mesh.reserved_verts {
            return (DrawTextStatus::NoMoreIndices, pos, curr_width);
        }

        let (cp, len) = match utf8::decode(&text[pos..]) {
            Some(d) => d,
            None => return (DrawTextStatus::Complete, end, curr_width),
        };
        let is_tab = cp == '\t' as u32;
        let lookup_cp = if is_tab { ' ' as u32 } else { cp };

        let mut info = match mosaic.raster.caches[cache_idx].info(lookup_cp) {
            Some(info) => info,
            None => return (DrawTextStatus::CodepointNotInCache, pos, curr_width),
        };
        if info.state == CodepointState::NoBackingGlyph && !is_control_character(cp) {
            match missing_info {
                Some(mi) if mi.state == CodepointState::Rasterized => info = mi,
                _ => return (DrawTextStatus::GlyphNotInAtlas, pos, curr_width),
            }
        } else if info.state != CodepointState::Rasterized {
            return (DrawTextStatus::GlyphNotInAtlas, pos, curr_width);
        }

        pos += len;

        let x = info.tex_x as f32;
        let y = info.tex_y as f32;
        let w = info.tex_w as f32;
        let h = info.tex_h as f32;
        let x0 = curr_width + info.x_off;
        let y0 = offset.y + info.y_off + font_baseline;
        let x1 = x0 + w;
        let y1 = y0 + h;

        curr_width += info.x_advance * if is_tab { tab_mult as f32 } else { 1.0 };
        if let Some((next_cp, _)) = utf8::decode(&text[pos..]) {
            let font = mosaic.font(mosaic.raster.caches[cache_idx].font_index);
            curr_width += font.kern(cp, next_cp);
        }

        if is_whitespace(cp) {
            continue;
        }

        let quad_tl = transform.apply(vec2(x0, y0));
        let quad_tr = transform.apply(vec2(x1, y0));
        let quad_br = transform.apply(vec2(x1, y1));
        let quad_bl = transform.apply(vec2(x0, y1));

        let u0 = x * uv_inverse_width;
        let v0 = y * uv_inverse_height;
        let u1 = u0 + w * uv_inverse_width;
        let v1 = v0 + h * uv_inverse_height;

        let push = |verts: &mut Vec<CgVertex>, p: Vec2, u: f32, v: f32| {
            verts.push(CgVertex {
                x: p.x,
                y: p.y,
                r: u,
                g: v,
                b: 0.0,
                a: fill_alpha,
            });
        };
        push(&mut mesh.verts, quad_tl, u0, v0);
        push(&mut mesh.verts, quad_tr, u1, v0);
        push(&mut mesh.verts, quad_br, u1, v1);
        push(&mut mesh.verts, quad_br, u1, v1);
        push(&mut mesh.verts, quad_bl, u0, v1);
        push(&mut mesh.verts, quad_tl, u0, v0);
        mesh.vert_index += VERTS_PER_QUAD;
        mesh.glyphs_drawn += 1;
    }
    (DrawTextStatus::Complete, pos, curr_width)
}

// force commit per string: atlas first, then the staged block through the
// vertex banks
fn flush_and_draw_mesh<R: Resources>(
    mosaic: &mut MosaicContext<R>,
    gl: &mut CgGlState<R>,
    state: &CgState<R>,
    mesh: &mut TextMesh<R>,
    max_verts_per_bank: usize,
) {
    if mesh.vert_index == 0 {
        return;
    }
    mosaic.flush_atlas(gl);

    gl.map_vertex_range(mesh.reserved_verts.min(max_verts_per_bank));
    gl.set_verts(0, &mesh.verts[..mesh.vert_index]);
    let written = mesh.vert_index;
    gl.finish_vertex_range_with_count(written);

    let fill = state.fill_style;
    let atlas = mosaic.atlas.texture.clone();
    select_blend_and_shader(gl, state, &fill, Some(&atlas), true);
    gl.draw(DrawMode::Triangles, written, 0);

    if mesh.glyphs_drawn < mesh.total_glyphs {
        mesh.reserved_verts =
            ((mesh.total_glyphs - mesh.glyphs_drawn) * VERTS_PER_QUAD).min(max_verts_per_bank);
        mesh.verts.clear();
        mesh.vert_index = 0;
    }
}

// ---- text mesh memoization ----

#[derive(Clone, Copy, Debug, PartialEq)]
struct TextMeshIdBlock {
    crc: u32,
    str_len: u32,
    font_id: i32,
    first_n_chars: [u8; 7],
    has_ellipses: bool,
    scroll_offset: f32,
    options: TextBlockOptions,
    // the transformed rect corners (not actually a rect)
    rect: Rect,
}

fn affine_apply_rect(transform: &Affine, r: Rect) -> Rect {
    let tl = transform.apply(vec2(r.x, r.y));
    let br = transform.apply(vec2(r.x + r.width, r.y + r.height));
    rect(tl.x, tl.y, br.x, br.y)
}

fn f32_bytes(f: f32) -> [u8; 4] {
    let bits = f.to_bits();
    [bits as u8, (bits >> 8) as u8, (bits >> 16) as u8, (bits >> 24) as u8]
}

fn make_id_block(
    transform: &Affine,
    font_id: i32,
    text_rect: Rect,
    scroll_offset: f32,
    extra_line_spacing: f32,
    text: &[u8],
    ellipses: Option<&[u8]>,
    options: TextBlockOptions,
) -> TextMeshIdBlock {
    let mut first = [0u8; 7];
    let n = text.len().min(7);
    first[..n].copy_from_slice(&text[..n]);

    let mut crc = crc32(&f32_bytes(text_rect.x));
    crc = update_crc32(crc, &f32_bytes(text_rect.y));
    crc = update_crc32(crc, &f32_bytes(text_rect.width));
    crc = update_crc32(crc, &f32_bytes(text_rect.height));
    crc = update_crc32(crc, &[font_id as u8, (font_id >> 8) as u8]);
    crc = update_crc32(crc, &f32_bytes(scroll_offset));
    crc = update_crc32(crc, &f32_bytes(extra_line_spacing));
    crc = update_crc32(crc, text);
    if let Some(e) = ellipses {
        crc = update_crc32(crc, e);
    }
    let opts = options.bits();
    crc = update_crc32(crc, &[opts as u8, (opts >> 8) as u8, (opts >> 16) as u8, (opts >> 24) as u8]);

    TextMeshIdBlock {
        crc: crc,
        str_len: text.len() as u32,
        font_id: font_id,
        first_n_chars: first,
        has_ellipses: ellipses.is_some(),
        scroll_offset: scroll_offset,
        options: options,
        rect: affine_apply_rect(transform, text_rect),
    }
}

struct TextMeshCacheNode<R: Resources> {
    id_block: TextMeshIdBlock,
    mesh: TextMesh<R>,
}

/// Fixed-capacity recency list of memoized text meshes.
struct TextMeshCache<R: Resources> {
    // most recently used first
    active: Vec<TextMeshCacheNode<R>>,
    capacity: usize,
}

impl<R: Resources> TextMeshCache<R> {
    fn new(capacity: usize) -> TextMeshCache<R> {
        TextMeshCache {
            active: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn find(&mut self, id: &TextMeshIdBlock) -> Option<usize> {
        match self.active.iter().position(|n| n.id_block == *id) {
            Some(pos) => {
                // most recently used up front, least used at the tail
                let node = self.active.remove(pos);
                self.active.insert(0, node);
                Some(0)
            }
            None => None,
        }
    }

    fn insert(&mut self, gl: &mut CgGlState<R>, id: TextMeshIdBlock, mesh: TextMesh<R>) -> usize {
        if self.active.len() == self.capacity {
            // reuse the oldest slot
            let old = self.active.pop().unwrap();
            release_text_mesh(gl, old.mesh);
        }
        self.active.insert(
            0,
            TextMeshCacheNode {
                id_block: id,
                mesh: mesh,
            },
        );
        0
    }

    fn evict_all(&mut self, gl: &mut CgGlState<R>) {
        for node in self.active.drain(..) {
            release_text_mesh(gl, node.mesh);
        }
    }
}

fn release_text_mesh<R: Resources>(gl: &mut CgGlState<R>, mesh: TextMesh<R>) {
    if let Some(ref r_mesh) = mesh.r_mesh {
        // teardown happens after the mesh's last use retires
        gl.stream.conditional_flush_and_wait_fence(mesh.fence);
        let fence = gl.stream.stream_fence();
        r_mesh.set_last_use_fence(fence);
    }
}

// ---- public canvas text API ----

impl<R: Resources> CgContext<R> {
    /// Begin an asynchronous font file load from the application bundle.
    pub fn load_font_file_async(&mut self, filepath: &str) -> CgFontFile {
        let id = self.mosaic.font_id_counter;
        self.mosaic.font_id_counter += 1;
        let shared = Arc::new(FontFileShared {
            id: id,
            status: Mutex::new(FontLoadStatus::Pending),
            font: Mutex::new(None),
        });
        let file = CgFontFile {
            shared: shared.clone(),
        };
        let path = PathBuf::from(filepath);
        let url = filepath.to_string();

        self.thread_pool.enqueue(move || {
            let read = ::std::fs::read(&path);
            Box::new(move || {
                let mut status = shared.status.lock().unwrap();
                if *status == FontLoadStatus::Aborted {
                    return;
                }
                match read {
                    Err(_) => {
                        warn!("font loading failed, could not open file: [{}]", url);
                        *status = FontLoadStatus::FileError;
                    }
                    Ok(bytes) => match parse_font(bytes) {
                        Ok(font) => {
                            *shared.font.lock().unwrap() = Some(font);
                            *status = FontLoadStatus::Complete;
                        }
                        Err(()) => {
                            warn!("font parse failed: [{}]", url);
                            *status = FontLoadStatus::FontParseError;
                        }
                    },
                }
            })
        });
        file
    }

    /// Install a font from bytes already in memory (bundled fonts, tests).
    pub fn load_font_file_from_memory(&mut self, bytes: Vec<u8>) -> CgFontFile {
        let id = self.mosaic.font_id_counter;
        self.mosaic.font_id_counter += 1;
        let (status, font) = match parse_font(bytes) {
            Ok(font) => (FontLoadStatus::Complete, Some(font)),
            Err(()) => (FontLoadStatus::FontParseError, None),
        };
        CgFontFile {
            shared: Arc::new(FontFileShared {
                id: id,
                status: Mutex::new(status),
                font: Mutex::new(font),
            }),
        }
    }

    /// Drop a font file reference; an in-flight load flips to aborted and
    /// the completion path frees instead of installing.
    pub fn font_file_free(&mut self, file: CgFontFile) {
        file.abort_load();
    }

    /// Create a font context at a pixel height.
    pub fn create_font_context(
        &mut self,
        file: &CgFontFile,
        size: f32,
        tab_space_multiplier: i32,
    ) -> CgFontContext {
        let index = self.mosaic.font_load(file, size, tab_space_multiplier);
        CgFontContext {
            font_index: index,
            size: size,
            virtual_size: size,
            baseline: size,
        }
    }

    /// Free a font context and its glyph cache.
    pub fn font_context_free(&mut self, font_ctx: CgFontContext) {
        self.mosaic.destroy_cache(font_ctx.font_index);
        self.mosaic.font_free(font_ctx.font_index);
    }

    /// Clamp and set the context's rendering size override.
    pub fn font_set_virtual_size(&mut self, font_ctx: &mut CgFontContext, size: f32) {
        font_ctx.virtual_size = size.max(4.0).min(150.0);
    }

    /// Set the global missing-glyph indicator; `None` resets to a space.
    pub fn set_global_missing_glyph_indicator(&mut self, indicator: Option<&str>) {
        self.mosaic.missing_glyph_codepoint = indicator
            .and_then(|s| utf8::decode(s.as_bytes()))
            .map(|(cp, _)| cp);
    }

    /// Set the per-context missing-glyph indicator (wins over the global
    /// one); `None` resets.
    pub fn set_font_context_missing_glyph_indicator(
        &mut self,
        font_ctx: &CgFontContext,
        indicator: Option<&str>,
    ) {
        let cp = indicator
            .and_then(|s| utf8::decode(s.as_bytes()))
            .map(|(c, _)| c);
        if let Some(ref mut font) = self.mosaic.fonts[font_ctx.font_index] {
            font.missing_glyph_codepoint = cp;
        }
    }

    /// Rasterize `characters` into the atlas ahead of use.
    pub fn font_precache_glyphs(&mut self, font_ctx: &CgFontContext, characters: &str) {
        self.mosaic.font_bind(font_ctx.font_index);
        let cache_idx = self.mosaic.find_cache(font_ctx.font_index);
        self.mosaic
            .try_rasterize_glyphs(cache_idx, characters.as_bytes());
    }

    /// Clear the atlas and every glyph cache.
    pub fn font_clear_glyph_cache(&mut self) {
        let CgContext {
            ref mut mosaic,
            ref mut gl,
            ..
        } = *self;
        mosaic.raster_reset(gl);
    }

    /// Measure a single line of text.
    pub fn text_measure(&mut self, font_ctx: &CgFontContext, text: &str) -> FontMetrics {
        self.mosaic.font_bind(font_ctx.font_index);
        let bounds = self.get_text_block_extents(
            font_ctx,
            ::std::f32::INFINITY,
            0.0,
            text,
            TextBlockOptions::empty(),
        );
        FontMetrics {
            bounds: bounds,
            baseline: self.mosaic.bound_font().ascent(),
        }
    }

    /// Extents of a text block wrapped at `max_line_width`. The returned
    /// width is the widest line including trailing whitespace.
    pub fn get_text_block_extents(
        &mut self,
        font_ctx: &CgFontContext,
        max_line_width: f32,
        extra_line_spacing: f32,
        text: &str,
        options: TextBlockOptions,
    ) -> Rect {
        self.mosaic.font_bind(font_ctx.font_index);
        let bytes = text.as_bytes();
        let mut extents = Rect::default();
        let mut widest = 0.0f32;
        if bytes.is_empty() {
            return extents;
        }
        let line_height = line_height_for(&self.mosaic, extra_line_spacing, options);
        let mut pos = 0;
        while pos < bytes.len() {
            let start_of_line = pos;
            let lb = find_linebreak_position(&self.mosaic, max_line_width, &bytes[pos..]);
            pos += lb.position.max(1);
            if lb.line_width > widest {
                widest = lb.line_width;
            }
            skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);
            extents.height += line_height;
            if extents.width < lb.last_renderable_width {
                extents.width = lb.last_renderable_width;
            }
        }
        extents.width = widest;
        extents
    }

    /// Height of a wrapped text block.
    pub fn get_text_block_height(
        &mut self,
        font_ctx: &CgFontContext,
        max_line_width: f32,
        extra_line_spacing: f32,
        text: &str,
        options: TextBlockOptions,
    ) -> f32 {
        self.get_text_block_extents(font_ctx, max_line_width, extra_line_spacing, text, options)
            .height
    }

    /// Byte offsets of the first/last displayed characters for a scrolled
    /// block.
    pub fn get_text_block_page_offsets(
        &mut self,
        font_ctx: &CgFontContext,
        text_rect: Rect,
        scroll_offset: f32,
        extra_line_spacing: f32,
        text: &str,
        options: TextBlockOptions,
    ) -> TextBlockPageOffsets {
        self.mosaic.font_bind(font_ctx.font_index);
        let bytes = text.as_bytes();
        let mut offsets = TextBlockPageOffsets::default();
        if bytes.is_empty() {
            return offsets;
        }

        let line_height = line_height_for(&self.mosaic, extra_line_spacing, options);
        let max_y = text_rect.y + text_rect.height;
        let mut curr_y = text_rect.y + scroll_offset;
        let mut pos = 0;
        let mut first_displayable = 0;
        let mut have_first = false;

        while pos < bytes.len() {
            let start_of_line = pos;
            let lb = find_linebreak_position(&self.mosaic, text_rect.width, &bytes[pos..]);
            pos += lb.position.max(1);

            let cull_limit = if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                text_rect.y - line_height
            } else {
                text_rect.y
            };
            if curr_y < cull_limit {
                curr_y += line_height;
                skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);
                continue;
            }

            if !have_first {
                have_first = true;
                first_displayable = start_of_line;
            }

            skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);
            curr_y += line_height;

            let y_limit = if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                curr_y
            } else {
                curr_y + line_height
            };
            if y_limit > max_y {
                break;
            }
        }

        offsets.begin_offset = first_displayable as u32;
        offsets.end_offset = pos.min(bytes.len()) as u32;
        offsets
    }

    /// Fill a single run of text at `pos`.
    pub fn fill_text(&mut self, font_ctx: &CgFontContext, pos: Vec2, text: &str) -> FontMetrics {
        self.fill_text_block_with_options(
            font_ctx,
            rect(pos.x, pos.y, ::std::f32::INFINITY, ::std::f32::INFINITY),
            0.0,
            0.0,
            text,
            None,
            TextBlockOptions::empty(),
        )
    }

    /// Fill a single run of text with anchor alignment around `pos`.
    pub fn fill_text_with_options(
        &mut self,
        font_ctx: &CgFontContext,
        pos: Vec2,
        text: &str,
        options: FontFillOptions,
    ) -> FontMetrics {
        let mut x_off = pos.x;
        let mut y_off = pos.y;

        let bounds = if options.contains(FontFillOptions::ALIGN_LEFT)
            && options.contains(FontFillOptions::ALIGN_TOP)
        {
            Rect::default()
        } else {
            self.mosaic.font_bind(font_ctx.font_index);
            self.get_text_block_extents(
                font_ctx,
                ::std::f32::INFINITY,
                0.0,
                text,
                TextBlockOptions::empty(),
            )
        };

        if options.contains(FontFillOptions::ALIGN_LEFT) {
        } else if options.contains(FontFillOptions::ALIGN_RIGHT) {
            x_off -= bounds.width;
        } else {
            x_off -= bounds.width * 0.5;
        }

        if options.contains(FontFillOptions::ALIGN_TOP) {
        } else if options.contains(FontFillOptions::ALIGN_BOTTOM) {
            y_off -= bounds.height;
        } else {
            y_off -= bounds.height * 0.5;
        }

        self.fill_text_block_with_options(
            font_ctx,
            rect(x_off, y_off, ::std::f32::INFINITY, ::std::f32::INFINITY),
            0.0,
            0.0,
            text,
            None,
            TextBlockOptions::empty(),
        )
    }

    /// Fill a wrapped text block. The workhorse text call: wraps, aligns,
    /// scrolls, applies ellipses, and (when enabled) memoizes the built
    /// mesh.
    pub fn fill_text_block_with_options(
        &mut self,
        font_ctx: &CgFontContext,
        text_rect: Rect,
        text_scroll_offset: f32,
        extra_line_spacing: f32,
        text: &str,
        optional_ellipses: Option<&str>,
        options: TextBlockOptions,
    ) -> FontMetrics {
        self.mosaic.font_bind(font_ctx.font_index);

        // vertical block alignment shifts the input rect by the measured
        // extents
        let mut input_rect = text_rect;
        if options
            .intersects(TextBlockOptions::ALIGN_TEXT_BOTTOM | TextBlockOptions::ALIGN_TEXT_CENTER)
        {
            let extents = self.get_text_block_extents(
                font_ctx,
                text_rect.width,
                extra_line_spacing,
                text,
                options,
            );
            if extents.height < text_rect.height {
                if options.contains(TextBlockOptions::ALIGN_TEXT_BOTTOM) {
                    input_rect.y += text_rect.height - extents.height;
                } else {
                    input_rect.y += (text_rect.height - extents.height) / 2.0;
                }
                input_rect.height = extents.height;
            }
        }

        let bounds = if self.mosaic.text_mesh_cache.is_some() {
            self.draw_text_block_memoized(
                font_ctx,
                input_rect,
                text_scroll_offset,
                extra_line_spacing,
                text,
                optional_ellipses,
                options,
            )
        } else {
            self.draw_text_block(
                input_rect,
                text_scroll_offset,
                extra_line_spacing,
                text,
                optional_ellipses,
                options,
            )
        };

        FontMetrics {
            bounds: bounds,
            baseline: self.mosaic.bound_font().ascent(),
        }
    }

    // immediate-mode text block: layout and stream through the vertex
    // banks, flushing as reservations fill
    fn draw_text_block(
        &mut self,
        text_rect: Rect,
        scroll_offset: f32,
        extra_line_spacing: f32,
        text: &str,
        optional_ellipses: Option<&str>,
        options: TextBlockOptions,
    ) -> Rect {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Rect::default();
        }
        let mut bounding = rect(text_rect.x, text_rect.y, 0.0, 0.0);
        let max_verts = self.gl.max_verts_per_vertex_bank();
        let font_index = self.mosaic.font_index;
        let mut cache_idx = self.mosaic.find_cache(font_index);

        let line_height = line_height_for(&self.mosaic, extra_line_spacing, options);
        debug_assert!(line_height.abs() >= 1.0);

        let mut mesh: TextMesh<R> =
            TextMesh::with_reservation((bytes.len() * VERTS_PER_QUAD).min(max_verts));
        mesh.total_glyphs = bytes.len();

        let ellipses_bytes = optional_ellipses.map(|e| e.as_bytes());
        let ellipses_width = match ellipses_bytes {
            Some(e) => {
                find_linebreak_position(&self.mosaic, ::std::f32::INFINITY, e).last_renderable_width
            }
            None => 0.0,
        };

        let (space_width, tab_width) = {
            let font = self.mosaic.bound_font();
            let sw = font.advance(' ' as u32);
            (sw, sw * font.tab_space_multiplier as f32)
        };

        let mut curr_y = text_rect.y + scroll_offset;
        let max_y = text_rect.y + text_rect.height;
        let mut pos = 0;

        let fill_alpha = self.cur_state().fill_style.a;
        let transform = self.cur_state().transform;

        while pos < bytes.len() {
            let lb = find_linebreak_position(&self.mosaic, text_rect.width, &bytes[pos..]);
            let mut linebreak_position = pos + lb.position;
            let mut last_renderable_width = lb.last_renderable_width;
            let line_width = lb.line_width;

            // cull lines above the box; intersecting lines survive only
            // with overflow allowed
            let cull_limit = if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                text_rect.y - line_height
            } else {
                text_rect.y
            };
            if curr_y < cull_limit {
                curr_y += line_height;
                let start_of_line = pos;
                pos = linebreak_position.max(pos + 1);
                skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);
                continue;
            }

            let ellipses_height_threshold = curr_y
                + line_height
                + if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                    0.0
                } else {
                    line_height
                };
            let use_ellipses = byte_at(bytes, linebreak_position) != 0
                && ellipses_bytes.is_some()
                && (ellipses_height_threshold > max_y
                    || line_height_at_next_word(
                        &self.mosaic,
                        LineHeightArgs {
                            curr_height: curr_y + line_height,
                            line_height: line_height,
                            max_height: max_y,
                            max_line_width: text_rect.width,
                            space_width: space_width,
                            tab_width: tab_width,
                            ellipses_width: ellipses_width,
                            text: &bytes[linebreak_position..],
                        },
                    ) >= max_y);

            // rewind the cut-off when the ellipses cannot fit on the line
            if use_ellipses && last_renderable_width + ellipses_width > text_rect.width {
                let lb2 = find_linebreak_position(
                    &self.mosaic,
                    text_rect.width - ellipses_width,
                    &bytes[pos..],
                );
                linebreak_position = pos + lb2.position;
                last_renderable_width = lb2.last_renderable_width;
            }

            let line_offset = calculate_line_offset(
                text_rect.width,
                last_renderable_width + if use_ellipses { ellipses_width } else { 0.0 },
                options,
            );
            let mut curr_x = text_rect.x + line_offset;
            let start_of_line = pos;

            loop {
                let (status, new_pos, new_x) = draw_partial_text(
                    &mut self.mosaic,
                    cache_idx,
                    &mut mesh,
                    &transform,
                    vec2(curr_x, curr_y),
                    fill_alpha,
                    bytes,
                    pos,
                    linebreak_position,
                );
                pos = new_pos;
                curr_x = new_x;
                match status {
                    DrawTextStatus::CodepointNotInCache => {
                        self.mosaic
                            .try_rasterize_glyphs(cache_idx, &bytes[pos..linebreak_position]);
                    }
                    DrawTextStatus::GlyphNotInAtlas => {
                        let state = self.cur_state().clone_record();
                        flush_and_draw_mesh(
                            &mut self.mosaic,
                            &mut self.gl,
                            &state,
                            &mut mesh,
                            max_verts,
                        );
                        let (new_cache, _outcome) = self.mosaic.rebuild_font_atlas(
                            &mut self.gl,
                            font_index,
                            &bytes[pos..linebreak_position],
                        );
                        cache_idx = new_cache;
                    }
                    DrawTextStatus::NoMoreIndices => {
                        let state = self.cur_state().clone_record();
                        flush_and_draw_mesh(
                            &mut self.mosaic,
                            &mut self.gl,
                            &state,
                            &mut mesh,
                            max_verts,
                        );
                    }
                    DrawTextStatus::Complete => break,
                }
            }

            if use_ellipses {
                let e = ellipses_bytes.unwrap();
                let mut epos = 0;
                loop {
                    let (status, new_pos, new_x) = draw_partial_text(
                        &mut self.mosaic,
                        cache_idx,
                        &mut mesh,
                        &transform,
                        vec2(curr_x, curr_y),
                        fill_alpha,
                        e,
                        epos,
                        e.len(),
                    );
                    epos = new_pos;
                    curr_x = new_x;
                    match status {
                        DrawTextStatus::CodepointNotInCache => {
                            self.mosaic.try_rasterize_glyphs(cache_idx, &e[epos..]);
                        }
                        DrawTextStatus::GlyphNotInAtlas => {
                            let state = self.cur_state().clone_record();
                            flush_and_draw_mesh(
                                &mut self.mosaic,
                                &mut self.gl,
                                &state,
                                &mut mesh,
                                max_verts,
                            );
                            let (new_cache, _outcome) = self.mosaic.rebuild_font_atlas(
                                &mut self.gl,
                                font_index,
                                &e[epos..],
                            );
                            cache_idx = new_cache;
                        }
                        DrawTextStatus::NoMoreIndices => {
                            let state = self.cur_state().clone_record();
                            flush_and_draw_mesh(
                                &mut self.mosaic,
                                &mut self.gl,
                                &state,
                                &mut mesh,
                                max_verts,
                            );
                            let remaining = e.len() - epos;
                            mesh.reserved_verts =
                                (remaining * VERTS_PER_QUAD).min(max_verts).max(VERTS_PER_QUAD);
                            mesh.total_glyphs = remaining;
                            mesh.glyphs_drawn = 0;
                            mesh.verts.clear();
                            mesh.vert_index = 0;
                        }
                        DrawTextStatus::Complete => break,
                    }
                }
                curr_y += line_height;
                if bounding.width < line_width + ellipses_width {
                    bounding.width = line_width + ellipses_width;
                    bounding.x = text_rect.x + line_offset;
                }
                bounding.height = curr_y - text_rect.y;
                // nothing valid renders after the ellipses
                break;
            }

            curr_y += line_height;
            if bounding.width < line_width {
                bounding.width = line_width;
                bounding.x = text_rect.x + line_offset;
            }
            bounding.height = curr_y - text_rect.y;
            if pos == start_of_line {
                pos += 1; // defensive forward progress on degenerate input
            }
            skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);

            let y_limit = if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                curr_y
            } else {
                curr_y + line_height
            };
            if y_limit > max_y {
                break;
            }
        }

        if mesh.vert_index > 0 {
            let state = self.cur_state().clone_record();
            flush_and_draw_mesh(&mut self.mosaic, &mut self.gl, &state, &mut mesh, max_verts);
        }
        bounding
    }

    /// Draw one unwrapped line (no block logic, no ellipses).
    pub fn fill_text_line(&mut self, font_ctx: &CgFontContext, pos: Vec2, text: &str) {
        assert!(!text.contains('\n'), "text shall not contain new-lines");
        self.mosaic.font_bind(font_ctx.font_index);
        self.draw_text_block(
            rect(pos.x, pos.y, ::std::f32::INFINITY, ::std::f32::INFINITY),
            0.0,
            0.0,
            text,
            None,
            TextBlockOptions::empty(),
        );
    }

    fn draw_text_block_memoized(
        &mut self,
        font_ctx: &CgFontContext,
        text_rect: Rect,
        scroll_offset: f32,
        extra_line_spacing: f32,
        text: &str,
        optional_ellipses: Option<&str>,
        options: TextBlockOptions,
    ) -> Rect {
        let font_id = self
            .mosaic
            .bound_font()
            .font_file
            .id();
        let transform = self.cur_state().transform;
        let id_block = make_id_block(
            &transform,
            font_id,
            text_rect,
            scroll_offset,
            extra_line_spacing,
            text.as_bytes(),
            optional_ellipses.map(|e| e.as_bytes()),
            options,
        );

        // trivial case: reuse the cached mesh
        let hit = {
            let cache = self.mosaic.text_mesh_cache.as_mut().unwrap();
            cache.find(&id_block)
        };
        if let Some(slot) = hit {
            let (bounding, verts_retired) = {
                let cache = self.mosaic.text_mesh_cache.as_ref().unwrap();
                let node = &cache.active[slot];
                let retired = !node.mesh.verts.is_empty()
                    && self.gl.stream.check_fence(node.mesh.fence);
                (node.mesh.bounding_box, retired)
            };
            self.draw_cached_text_mesh(slot);
            if verts_retired {
                // staging copy is safe to free once the fence retired
                let cache = self.mosaic.text_mesh_cache.as_mut().unwrap();
                cache.active[slot].mesh.verts = Vec::new();
            }
            return bounding;
        }

        // miss: ensure glyph coverage, evicting and rebuilding the atlas
        // when the string cannot fit
        let font_index = font_ctx.font_index;
        let cache_idx = self.mosaic.find_cache(font_index);
        let text_ok = self
            .mosaic
            .try_rasterize_glyphs(cache_idx, text.as_bytes())
            == RasterizeOutcome::RenderableRasterized;
        let ellipses_ok = match optional_ellipses {
            Some(e) => {
                self.mosaic.try_rasterize_glyphs(cache_idx, e.as_bytes())
                    == RasterizeOutcome::RenderableRasterized
            }
            None => true,
        };
        if !(text_ok && ellipses_ok) {
            let CgContext {
                ref mut mosaic,
                ref mut gl,
                ..
            } = *self;
            if let Some(ref mut cache) = mosaic.text_mesh_cache {
                cache.evict_all(gl);
            }
            let (_idx, outcome) =
                self.mosaic
                    .rebuild_font_atlas(&mut self.gl, font_index, text.as_bytes());
            assert!(
                outcome == RasterizeOutcome::RenderableRasterized,
                "text cannot fit the glyph atlas even after a rebuild"
            );
        }

        let mesh = self.create_text_block_mesh(
            text_rect,
            scroll_offset,
            extra_line_spacing,
            text,
            optional_ellipses,
            options,
        );
        let bounding = mesh.bounding_box;
        let slot = {
            let CgContext {
                ref mut mosaic,
                ref mut gl,
                ..
            } = *self;
            let cache = mosaic.text_mesh_cache.as_mut().unwrap();
            cache.insert(gl, id_block, mesh)
        };
        self.mosaic.flush_atlas(&mut self.gl);
        self.draw_cached_text_mesh(slot);
        bounding
    }

    fn draw_cached_text_mesh(&mut self, slot: usize) {
        let (r_mesh, count) = {
            let cache = self.mosaic.text_mesh_cache.as_ref().unwrap();
            let node = &cache.active[slot];
            (node.mesh.r_mesh.clone(), node.mesh.vert_index)
        };
        if count == 0 {
            return;
        }
        if let Some(mesh) = r_mesh {
            let fill = self.cur_state().fill_style;
            let atlas = self.mosaic.atlas.texture.clone();
            {
                let state = self.cur_state().clone_record();
                select_blend_and_shader(&mut self.gl, &state, &fill, Some(&atlas), true);
            }
            self.gl.draw_mesh(&mesh, DrawMode::Triangles, count, 0);
            let fence = self.gl.stream.stream_fence();
            let cache = self.mosaic.text_mesh_cache.as_mut().unwrap();
            cache.active[slot].mesh.fence = fence;
            if let Some(ref m) = cache.active[slot].mesh.r_mesh {
                m.set_last_use_fence(fence);
            }
        }
    }

    // lay the block out into a dedicated GPU mesh (glyph coverage is
    // guaranteed by the caller, so the layout runs to completion)
    fn create_text_block_mesh(
        &mut self,
        text_rect: Rect,
        scroll_offset: f32,
        extra_line_spacing: f32,
        text: &str,
        optional_ellipses: Option<&str>,
        options: TextBlockOptions,
    ) -> TextMesh<R> {
        let bytes = text.as_bytes();
        let glyph_estimate = count_renderable_codepoints(bytes)
            + optional_ellipses.map_or(0, |e| count_renderable_codepoints(e.as_bytes()));
        let reserved = (glyph_estimate * VERTS_PER_QUAD).max(VERTS_PER_QUAD);

        let mut mesh: TextMesh<R> = TextMesh::with_reservation(reserved);
        mesh.total_glyphs = glyph_estimate;
        let layout = self.gl.mesh_layout().clone();
        mesh.r_mesh = Some(self.gl.stream.create_mesh(
            &[reserved * ::gl::VERTEX_STRIDE],
            &layout,
            "cg_text_mesh",
        ));
        mesh.fence = self.gl.stream.stream_fence();

        if bytes.is_empty() {
            return mesh;
        }

        let font_index = self.mosaic.font_index;
        let cache_idx = self.mosaic.find_cache(font_index);
        let line_height = line_height_for(&self.mosaic, extra_line_spacing, options);
        let mut bounding = rect(text_rect.x, text_rect.y, 0.0, 0.0);

        let ellipses_bytes = optional_ellipses.map(|e| e.as_bytes());
        let ellipses_width = match ellipses_bytes {
            Some(e) => {
                find_linebreak_position(&self.mosaic, ::std::f32::INFINITY, e).last_renderable_width
            }
            None => 0.0,
        };
        let (space_width, tab_width) = {
            let font = self.mosaic.bound_font();
            let sw = font.advance(' ' as u32);
            (sw, sw * font.tab_space_multiplier as f32)
        };

        let fill_alpha = self.cur_state().fill_style.a;
        let transform = self.cur_state().transform;
        let mut curr_y = text_rect.y + scroll_offset;
        let max_y = text_rect.y + text_rect.height;
        let mut pos = 0;

        while pos < bytes.len() {
            let lb = find_linebreak_position(&self.mosaic, text_rect.width, &bytes[pos..]);
            let mut linebreak_position = pos + lb.position;
            let mut last_renderable_width = lb.last_renderable_width;
            let line_width = lb.line_width;

            let cull_limit = if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                text_rect.y - line_height
            } else {
                text_rect.y
            };
            if curr_y < cull_limit {
                curr_y += line_height;
                let start_of_line = pos;
                pos = linebreak_position.max(pos + 1);
                skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);
                continue;
            }

            let ellipses_height_threshold = curr_y
                + line_height
                + if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                    0.0
                } else {
                    line_height
                };
            let use_ellipses = byte_at(bytes, linebreak_position) != 0
                && ellipses_bytes.is_some()
                && (ellipses_height_threshold > max_y
                    || line_height_at_next_word(
                        &self.mosaic,
                        LineHeightArgs {
                            curr_height: curr_y + line_height,
                            line_height: line_height,
                            max_height: max_y,
                            max_line_width: text_rect.width,
                            space_width: space_width,
                            tab_width: tab_width,
                            ellipses_width: ellipses_width,
                            text: &bytes[linebreak_position..],
                        },
                    ) >= max_y);

            if use_ellipses && last_renderable_width + ellipses_width > text_rect.width {
                let lb2 = find_linebreak_position(
                    &self.mosaic,
                    text_rect.width - ellipses_width,
                    &bytes[pos..],
                );
                linebreak_position = pos + lb2.position;
                last_renderable_width = lb2.last_renderable_width;
            }

            let line_offset = calculate_line_offset(
                text_rect.width,
                last_renderable_width + if use_ellipses { ellipses_width } else { 0.0 },
                options,
            );
            let mut curr_x = text_rect.x + line_offset;
            let start_of_line = pos;

            let (status, new_pos, new_x) = draw_partial_text(
                &mut self.mosaic,
                cache_idx,
                &mut mesh,
                &transform,
                vec2(curr_x, curr_y),
                fill_alpha,
                bytes,
                pos,
                linebreak_position,
            );
            assert!(
                status == DrawTextStatus::Complete,
                "incomplete draw-text-status: {:?}",
                status
            );
            pos = new_pos;
            curr_x = new_x;

            if use_ellipses {
                let e = ellipses_bytes.unwrap();
                let (status, _pos, _x) = draw_partial_text(
                    &mut self.mosaic,
                    cache_idx,
                    &mut mesh,
                    &transform,
                    vec2(curr_x, curr_y),
                    fill_alpha,
                    e,
                    0,
                    e.len(),
                );
                assert!(
                    status == DrawTextStatus::Complete,
                    "incomplete draw-text-status: {:?}",
                    status
                );
                curr_y += line_height;
                if bounding.width < line_width + ellipses_width {
                    bounding.width = line_width + ellipses_width;
                    bounding.x = text_rect.x + line_offset;
                }
                bounding.height = curr_y - text_rect.y;
                break;
            }

            curr_y += line_height;
            if bounding.width < line_width {
                bounding.width = line_width;
                bounding.x = text_rect.x + line_offset;
            }
            bounding.height = curr_y - text_rect.y;
            if pos == start_of_line {
                pos += 1;
            }
            skip_trailing_white_space_and_first_newline(bytes, start_of_line, &mut pos);

            let y_limit = if options.contains(TextBlockOptions::ALLOW_BLOCK_BOUNDS_OVERFLOW) {
                curr_y
            } else {
                curr_y + line_height
            };
            if y_limit > max_y {
                break;
            }
        }

        mesh.bounding_box = bounding;

        // indirect upload into the mesh's own channel buffer
        if mesh.vert_index > 0 {
            let bytes = verts_as_bytes(&mesh.verts[..mesh.vert_index]);
            let r_mesh = mesh.r_mesh.clone().unwrap();
            self.gl.stream.upload_mesh_channel_data(
                &r_mesh,
                0,
                0,
                mesh.vert_index,
                ::gl::VERTEX_STRIDE,
                &bytes,
            );
            mesh.fence = self.gl.stream.stream_fence();
        }
        mesh
    }
}

fn count_renderable_codepoints(text: &[u8]) -> usize {
    let mut pos = 0;
    let mut count = 0;
    while pos < text.len() {
        match utf8::decode(&text[pos..]) {
            Some((cp, len)) => {
                pos += len;
                if !(is_whitespace(cp) || is_newline(cp)) {
                    count += 1;
                }
            }
            None => break,
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_acceptance() {
        for code in &[200u32, 301, 302, 303, 307, 308] {
            assert!(is_accepted_http_status(*code));
        }
        for code in &[204u32, 400, 404, 500] {
            assert!(!is_accepted_http_status(*code));
        }
    }

    #[test]
    fn shelf_packer_packs_and_fails() {
        let mut packer = ShelfPacker::new(64, 32);
        let a = packer.pack(20, 10).unwrap();
        let b = packer.pack(20, 10).unwrap();
        assert!(a.1 == b.1 && b.0 > a.0);
        // row wrap
        let c = packer.pack(30, 10).unwrap();
        assert!(c.1 > a.1);
        // atlas exhausted
        assert!(packer.pack(64, 32).is_none());
        packer.reset();
        assert!(packer.pack(40, 20).is_some());
    }

    #[test]
    fn renderable_codepoint_count_skips_whitespace() {
        assert_eq!(count_renderable_codepoints(b"a b\tc\n"), 3);
        assert_eq!(count_renderable_codepoints("héllo".as_bytes()), 5);
    }

    #[test]
    fn glyph_cache_lookup_is_sorted() {
        let mut cache = FontGlyphCache::new(0);
        for &cp in &['z' as u32, 'a' as u32, 'm' as u32, 0x20ac] {
            assert!(cache.try_push(cp));
        }
        // duplicate insert is a no-op
        assert!(!cache.try_push('m' as u32));
        assert_eq!(cache.codepoints.len(), 4);
        let mut sorted = cache.codepoints.clone();
        sorted.sort();
        assert_eq!(cache.codepoints, sorted);

        for &cp in &['a' as u32, 'm' as u32, 'z' as u32, 0x20ac] {
            let idx = cache.find(cp).expect("inserted codepoint must be found");
            assert_eq!(cache.codepoints[idx], cp);
        }
        assert!(cache.find('q' as u32).is_none());
        assert_eq!(cache.num_unrasterized, 4);
    }

    #[test]
    fn id_block_distinguishes_inputs() {
        let m = Affine::identity();
        let r = rect(0.0, 0.0, 200.0, 60.0);
        let opts = TextBlockOptions::empty();
        let base = make_id_block(&m, 1, r, 0.0, 0.0, b"hello", Some(b"..."), opts);
        let same = make_id_block(&m, 1, r, 0.0, 0.0, b"hello", Some(b"..."), opts);
        assert_eq!(base, same);

        let scrolled = make_id_block(&m, 1, r, 5.0, 0.0, b"hello", Some(b"..."), opts);
        assert!(base != scrolled);
        let other_text = make_id_block(&m, 1, r, 0.0, 0.0, b"hullo", Some(b"..."), opts);
        assert!(base != other_text);
        let other_font = make_id_block(&m, 2, r, 0.0, 0.0, b"hello", Some(b"..."), opts);
        assert!(base != other_font);
        let no_ellipses = make_id_block(&m, 1, r, 0.0, 0.0, b"hello", None, opts);
        assert!(base != no_ellipses);

        // a translated transform moves the rect and misses too
        let mut moved = Affine::identity();
        moved.translate(10.0, 0.0);
        let translated = make_id_block(&moved, 1, r, 0.0, 0.0, b"hello", Some(b"..."), opts);
        assert!(base != translated);
    }
}
