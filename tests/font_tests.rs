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

//! Text fixture over the dummy backend.
//!
//! Layout tests need real font metrics, so they run against the first
//! TrueType file found on the host and no-op quietly on machines without
//! one.

extern crate adk;
extern crate adk_core;
extern crate adk_runtime;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use adk::{rect, vec2, CanvasConfig, CanvasDimensions, CgContext, CgFontContext, FontLoadStatus,
          TextBlockOptions};
use adk_core::{DummyRhi, DummyStats, RenderDevice, RenderDeviceConfig, WaitMode};
use adk_runtime::ThreadPool;

type Ctx = CgContext<adk_core::DummyResources>;

fn find_system_font() -> Option<PathBuf> {
    fn walk(dir: &Path, depth: u32) -> Option<PathBuf> {
        if depth > 4 {
            return None;
        }
        let entries = fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Some(found) = walk(&path, depth + 1) {
                    return Some(found);
                }
            } else if path
                .extension()
                .map_or(false, |e| e == "ttf" || e == "ttc")
            {
                return Some(path);
            }
        }
        None
    }
    for root in &["/usr/share/fonts", "/usr/local/share/fonts", "/Library/Fonts"] {
        if let Some(found) = walk(Path::new(root), 0) {
            return Some(found);
        }
    }
    None
}

fn make_canvas() -> (Ctx, Arc<DummyStats>) {
    let (rhi, stats) = DummyRhi::new();
    let device = RenderDevice::new(rhi, RenderDeviceConfig::default(), "font-test").unwrap();
    let pool = Arc::new(ThreadPool::new(1, "font-test-worker"));
    let ctx = CgContext::new(
        device,
        pool,
        CanvasDimensions {
            virtual_width: 1280,
            virtual_height: 720,
            display_width: 1280,
            display_height: 720,
        },
        CanvasConfig::default(),
    );
    (ctx, stats)
}

fn load_host_font(ctx: &mut Ctx, size: f32) -> Option<CgFontContext> {
    let path = find_system_font()?;
    let bytes = fs::read(&path).ok()?;
    let file = ctx.load_font_file_from_memory(bytes);
    if file.load_status() != FontLoadStatus::Complete {
        return None;
    }
    Some(ctx.create_font_context(&file, size, 4))
}

#[test]
fn text_measure_is_consistent_with_extents() {
    let (mut ctx, _stats) = make_canvas();
    ctx.begin(16);
    let font = match load_host_font(&mut ctx, 30.0) {
        Some(f) => f,
        None => return,
    };

    let metrics = ctx.text_measure(&font, "hello world");
    assert!(metrics.bounds.width > 0.0);
    assert!(metrics.bounds.height >= 30.0);
    assert!(metrics.baseline > 0.0 && metrics.baseline <= 30.0 * 1.5);

    // wrapping at a narrow width stacks lines
    let narrow = ctx.get_text_block_extents(
        &font,
        metrics.bounds.width / 2.0,
        0.0,
        "hello world",
        TextBlockOptions::empty(),
    );
    assert!(narrow.height > metrics.bounds.height);
}

#[test]
fn text_block_ellipsis_stays_inside_the_rect() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    let font = match load_host_font(&mut ctx, 30.0) {
        Some(f) => f,
        None => return,
    };

    let metrics = ctx.fill_text_block_with_options(
        &font,
        rect(0.0, 0.0, 200.0, 60.0),
        0.0,
        0.0,
        "hello world this is a long string",
        Some("..."),
        TextBlockOptions::empty(),
    );
    ctx.gl.stream.flush(WaitMode::Wait);

    // the block is cut to the rect: at most two 30px lines
    assert!(metrics.bounds.height <= 60.0 + 1.0e-3);
    assert!(metrics.bounds.height >= 30.0);
    // the widest line including the ellipses fits the rect
    assert!(metrics.bounds.width <= 200.0 + 1.0e-3);
    // glyphs actually rendered
    assert!(stats.total_verts_drawn() > 0);
}

#[test]
fn text_mesh_memoization_hits_and_misses() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    let font = match load_host_font(&mut ctx, 24.0) {
        Some(f) => f,
        None => return,
    };

    let text_rect = rect(0.0, 0.0, 400.0, 200.0);
    let draw = |ctx: &mut Ctx, text: &str, scroll: f32| {
        ctx.fill_text_block_with_options(
            &font,
            text_rect,
            scroll,
            0.0,
            text,
            None,
            TextBlockOptions::empty(),
        );
        ctx.gl.stream.flush(WaitMode::Wait);
    };

    draw(&mut ctx, "memoize me", 0.0);
    let after_first = stats.creates.load(::std::sync::atomic::Ordering::SeqCst);

    // identical draw: cache hit, no new GPU mesh
    draw(&mut ctx, "memoize me", 0.0);
    let after_second = stats.creates.load(::std::sync::atomic::Ordering::SeqCst);
    assert_eq!(after_first, after_second);

    // any id-block input change misses
    draw(&mut ctx, "memoize me", 5.0);
    let after_scroll = stats.creates.load(::std::sync::atomic::Ordering::SeqCst);
    assert!(after_scroll > after_second);

    draw(&mut ctx, "memoize me!", 0.0);
    let after_text = stats.creates.load(::std::sync::atomic::Ordering::SeqCst);
    assert!(after_text > after_scroll);
}

#[test]
fn missing_glyphs_fall_back_to_the_indicator() {
    let (mut ctx, stats) = make_canvas();
    ctx.begin(16);
    let font = match load_host_font(&mut ctx, 24.0) {
        Some(f) => f,
        None => return,
    };

    ctx.set_global_missing_glyph_indicator(Some("?"));
    // private-use codepoints have no backing glyph in any sane font
    ctx.fill_text(&font, vec2(10.0, 10.0), "a\u{e001}b");
    ctx.gl.stream.flush(WaitMode::Wait);
    assert!(stats.total_verts_drawn() > 0);
}

#[test]
fn precache_then_clear_glyph_cache() {
    let (mut ctx, _stats) = make_canvas();
    ctx.begin(16);
    let font = match load_host_font(&mut ctx, 24.0) {
        Some(f) => f,
        None => return,
    };

    ctx.font_precache_glyphs(&font, "abcdefghijklmnopqrstuvwxyz");
    ctx.fill_text(&font, vec2(0.0, 0.0), "abc");
    ctx.font_clear_glyph_cache();
    // draws again from a cold atlas without issue
    ctx.fill_text(&font, vec2(0.0, 0.0), "abc");
    ctx.gl.stream.flush(WaitMode::Wait);
}

#[test]
fn page_offsets_cover_the_scrolled_window() {
    let (mut ctx, _stats) = make_canvas();
    ctx.begin(16);
    let font = match load_host_font(&mut ctx, 20.0) {
        Some(f) => f,
        None => return,
    };

    let text = "one two three four five six seven eight nine ten";
    let offsets = ctx.get_text_block_page_offsets(
        &font,
        rect(0.0, 0.0, 80.0, 60.0),
        0.0,
        0.0,
        text,
        TextBlockOptions::empty(),
    );
    assert_eq!(offsets.begin_offset, 0);
    assert!(offsets.end_offset > 0);
    assert!((offsets.end_offset as usize) <= text.len());
}
