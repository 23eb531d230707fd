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

//! Path building and tessellation.
//!
//! Points are transformed into device space as they are pushed; arcs and
//! Béziers tessellate with a level of detail driven by the transform scale
//! and clamped by the configured maximum step count.

use math::{vec2, Affine, Rads, Rect, Vec2, CG_BIG_NUM, CG_SMALL_NUM, CG_TAU};

/// Rotation direction for arcs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rotation {
    /// Counter-clockwise sweep.
    CounterClockWise,
    /// Clockwise sweep.
    ClockWise,
}

/// Subpath winding, from the signed cross-product sum.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Winding {
    /// Clockwise.
    Cw,
    /// Counter-clockwise.
    Ccw,
    /// Degenerate (fewer than three points).
    None,
}

/// Index wrap behavior for neighbor lookups during stroking.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubpathWrap {
    /// Clamp to the endpoints.
    Clamp,
    /// Wrap around (closed subpaths).
    Normal,
    /// Extrapolate along the end tangent (open subpaths).
    Tangent,
}

/// An ordered run of device-space points.
#[derive(Clone, Debug, Default)]
pub struct Subpath {
    /// The points.
    pub points: Vec<Vec2>,
    /// Whether the run closes back on its first point.
    pub closed: bool,
    /// Set when fill normalization reversed the point order.
    pub reverse: bool,
}

impl Subpath {
    /// Point count.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Neighbor lookup with the given wrap behavior.
    pub fn at(&self, idx: i32, mode: SubpathWrap) -> Vec2 {
        let size = self.points.len() as i32;
        debug_assert!(size > 0);
        if idx >= 0 && idx < size {
            return self.points[idx as usize];
        }
        match mode {
            SubpathWrap::Clamp => {
                let i = idx.max(0).min(size - 1);
                self.points[i as usize]
            }
            SubpathWrap::Normal => {
                let mut i = idx;
                if i < 0 {
                    i += size;
                } else {
                    i -= size;
                }
                self.points[i as usize]
            }
            SubpathWrap::Tangent => {
                if idx < 0 {
                    let p0 = self.points[0];
                    let p1 = self.points[1.min(size as usize - 1)];
                    p0.scale(2.0).sub(p1)
                } else {
                    let p0 = self.points[size as usize - 1];
                    let p1 = self.points[(size - 2).max(0) as usize];
                    p0.scale(2.0).sub(p1)
                }
            }
        }
    }

    /// Winding as the sign of the cross-product sum about the first point.
    pub fn winding(&self) -> Winding {
        if self.points.len() < 3 {
            return Winding::None;
        }
        let a = self.points[0];
        let mut area = 0.0;
        for i in 2..self.points.len() {
            let b = self.points[i - 1];
            let c = self.points[i];
            area += b.sub(a).det(c.sub(a));
        }
        if area > 0.0 {
            Winding::Cw
        } else {
            Winding::Ccw
        }
    }

    /// Reverse the point order in place (CCW -> CW normalization).
    pub fn reverse_points(&mut self) {
        self.points.reverse();
        self.reverse = !self.reverse;
    }
}

/// Tessellation inputs carried by the owning canvas state.
#[derive(Clone, Copy, Debug)]
pub struct TessellationParams<'a> {
    /// The current canvas transform.
    pub transform: &'a Affine,
    /// Upper bound for arc/Bézier subdivision.
    pub max_tessellation_steps: u32,
}

/// A path under construction: finished subpaths plus the in-progress one.
#[derive(Clone, Debug)]
pub struct Path {
    /// Finished subpaths.
    pub subpaths: Vec<Subpath>,
    /// The subpath being appended to.
    pub cur: Subpath,
    /// Last pushed device-space point (dedup anchor).
    pub last_point: Vec2,
    /// Device-space bounds minimum.
    pub min_point: Vec2,
    /// Device-space bounds maximum.
    pub max_point: Vec2,
}

impl Path {
    /// A fresh, empty path.
    pub fn new() -> Path {
        Path {
            subpaths: Vec::new(),
            cur: Subpath::default(),
            last_point: vec2(CG_BIG_NUM, CG_BIG_NUM),
            min_point: vec2(CG_BIG_NUM, CG_BIG_NUM),
            max_point: vec2(-CG_BIG_NUM, -CG_BIG_NUM),
        }
    }

    /// Drop everything and return to the initial state.
    pub fn reset(&mut self) {
        if self.subpaths.is_empty() && self.cur.points.is_empty() {
            return;
        }
        *self = Path::new();
    }

    /// Finish the in-progress subpath; runs shorter than a line are
    /// dropped.
    pub fn end_subpath(&mut self) {
        if self.cur.len() > 1 {
            let finished = ::std::mem::replace(&mut self.cur, Subpath::default());
            self.subpaths.push(finished);
        } else {
            self.cur = Subpath::default();
        }
    }

    /// Close and finish the in-progress subpath.
    pub fn close_subpath(&mut self) {
        self.cur.closed = true;
        self.end_subpath();
    }

    /// Push a device-space point, deduping consecutive equals.
    pub fn push(&mut self, pos: Vec2) {
        if self.last_point == pos {
            self.last_point = pos;
            return;
        }
        self.last_point = pos;
        self.min_point = vec2(self.min_point.x.min(pos.x), self.min_point.y.min(pos.y));
        self.max_point = vec2(self.max_point.x.max(pos.x), self.max_point.y.max(pos.y));
        self.cur.points.push(pos);
    }

    fn xformed_push(&mut self, transform: &Affine, pos: Vec2) {
        self.push(transform.apply(pos));
    }

    /// Begin a new subpath at `pos`.
    pub fn move_to(&mut self, transform: &Affine, pos: Vec2) {
        self.end_subpath();
        self.xformed_push(transform, pos);
    }

    /// Line to `pos`.
    pub fn line_to(&mut self, transform: &Affine, pos: Vec2) {
        self.xformed_push(transform, pos);
    }

    /// Arc around `pos` from `start` to `end` angles in the given
    /// direction. The angular span is normalized per direction and clamped
    /// to one full turn; step count grows with the square root of the
    /// on-screen arc length.
    pub fn arc(
        &mut self,
        params: TessellationParams,
        pos: Vec2,
        radius: f32,
        start: Rads,
        end: Rads,
        rotation: Rotation,
    ) {
        // theta wrapping
        let mut span = end.rads - start.rads;
        match rotation {
            Rotation::ClockWise => {
                if span.abs() >= CG_TAU {
                    span = CG_TAU;
                } else {
                    while span < 0.0 {
                        span += CG_TAU;
                    }
                }
            }
            Rotation::CounterClockWise => {
                if span.abs() >= CG_TAU {
                    span = -CG_TAU;
                } else {
                    while span > 0.0 {
                        span -= CG_TAU;
                    }
                }
            }
        }

        // dynamic lod via geometric mean
        let scale = params.transform.get_scale();
        let size = span.abs() * radius * CG_TAU;
        let steps = (size * scale)
            .sqrt()
            .max(1.0)
            .min(params.max_tessellation_steps as f32) as usize;

        let mut theta = start.rads;
        let dtheta = span / steps as f32;
        for _ in 0..steps + 1 {
            self.xformed_push(
                params.transform,
                vec2(pos.x + theta.cos() * radius, pos.y + theta.sin() * radius),
            );
            theta += dtheta;
        }
    }

    /// Two-tangent arc through the corner at `pos1` toward `pos2`.
    /// Collinear inputs or a sub-pixel radius degenerate to a line.
    pub fn arc_to(&mut self, params: TessellationParams, pos1: Vec2, pos2: Vec2, radius: f32) {
        let cp = params.transform.inverse_apply(self.last_point);
        let a1 = cp.y - pos1.y;
        let b1 = cp.x - pos1.x;
        let a2 = pos2.y - pos1.y;
        let b2 = pos2.x - pos1.x;
        let mm = (a1 * b2 - b1 * a2).abs();
        if mm < CG_SMALL_NUM || radius < 1.0 {
            self.line_to(params.transform, pos1);
            return;
        }

        let dd = a1 * a1 + b1 * b1;
        let cc = a2 * a2 + b2 * b2;
        let tt = a1 * a2 + b1 * b2;
        let k1 = radius * dd.sqrt() / mm;
        let k2 = radius * cc.sqrt() / mm;
        let j1 = k1 * tt / dd;
        let j2 = k2 * tt / cc;
        let cx = k1 * b2 + k2 * b1;
        let cy = k1 * a2 + k2 * a1;
        let px = b1 * (k2 + j1);
        let py = a1 * (k2 + j1);
        let qx = b2 * (k1 + j2);
        let qy = a2 * (k1 + j2);
        let start = (py - cy).atan2(px - cx);
        let end = (qy - cy).atan2(qx - cx);

        let rotation = if b1 * a2 > b2 * a1 {
            Rotation::CounterClockWise
        } else {
            Rotation::ClockWise
        };
        self.arc(
            params,
            vec2(cx + pos1.x, cy + pos1.y),
            radius,
            Rads { rads: start },
            Rads { rads: end },
            rotation,
        );
    }

    /// Quadratic Bézier to `(x, y)` with control point `(cpx, cpy)`.
    /// Recursive midpoint subdivision with a flatness tolerance derived
    /// from the transform scale.
    pub fn quad_bezier_to(&mut self, params: TessellationParams, cpx: f32, cpy: f32, x: f32, y: f32) {
        let inv_scale = 1.0 / params.transform.get_scale();
        let tol = inv_scale * inv_scale * 0.25;
        let cp = params.transform.apply(vec2(cpx, cpy));
        let p = params.transform.apply(vec2(x, y));
        let last = self.last_point;
        self.quad_bezier_step(
            last.x,
            last.y,
            cp.x,
            cp.y,
            p.x,
            p.y,
            0,
            tol,
            params.max_tessellation_steps,
        );
        self.push(p);
    }

    fn quad_bezier_step(
        &mut self,
        x1: f32,
        y1: f32,
        x2: f32,
        y2: f32,
        x3: f32,
        y3: f32,
        step: u32,
        tol: f32,
        max_steps: u32,
    ) {
        let x12 = (x1 + x2) * 0.5;
        let y12 = (y1 + y2) * 0.5;
        let x23 = (x2 + x3) * 0.5;
        let y23 = (y2 + y3) * 0.5;
        let x123 = (x12 + x23) * 0.5;
        let y123 = (y12 + y23) * 0.5;

        let mut dx = x3 - x1;
        let mut dy = y3 - y1;
        let d = ((x2 - x3) * dy - (y2 - y3) * dx).abs();

        if d > CG_SMALL_NUM {
            if d * d <= tol * (dx * dx + dy * dy) {
                self.push(vec2(x123, y123));
                return;
            }
        } else {
            // near-zero determinant: fall back to a linearity test
            dx = x123 - (x1 + x3) * 0.5;
            dy = y123 - (y1 + y3) * 0.5;
            if dx * dx + dy * dy <= tol {
                self.push(vec2(x123, y123));
                return;
            }
        }

        if step < max_steps {
            self.quad_bezier_step(x1, y1, x12, y12, x123, y123, step + 1, tol, max_steps);
            self.quad_bezier_step(x123, y123, x23, y23, x3, y3, step + 1, tol, max_steps);
        }
    }

    /// Axis-aligned rectangle as a closed subpath.
    pub fn push_rect(&mut self, transform: &Affine, r: Rect) {
        self.move_to(transform, vec2(r.x, r.y));
        self.line_to(transform, vec2(r.x + r.width, r.y));
        self.line_to(transform, vec2(r.x + r.width, r.y + r.height));
        self.line_to(transform, vec2(r.x, r.y + r.height));
        self.close_subpath();
    }

    /// Rounded rectangle as a closed subpath of four corner arcs.
    pub fn push_rounded_rect(&mut self, params: TessellationParams, r: Rect, radius: f32) {
        let mut rad = radius;
        if r.width < 2.0 * rad {
            rad = r.width * 0.5;
        }
        if r.height < 2.0 * rad {
            rad = r.height * 0.5;
        }

        let (x, y, w, h) = (r.x, r.y, r.width, r.height);
        self.move_to(params.transform, vec2(x + rad, y));
        self.arc_to(params, vec2(x + w, y), vec2(x + w, y + h), rad);
        self.arc_to(params, vec2(x + w, y + h), vec2(x, y + h), rad);
        self.arc_to(params, vec2(x, y + h), vec2(x, y), rad);
        self.arc_to(params, vec2(x, y), vec2(x + w, y), rad);
        self.close_subpath();
    }

    /// Full circle as a closed subpath.
    pub fn push_circle(&mut self, params: TessellationParams, pos: Vec2, radius: f32) {
        self.arc(
            params,
            pos,
            radius,
            Rads { rads: 0.0 },
            Rads { rads: CG_TAU },
            Rotation::ClockWise,
        );
        self.close_subpath();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use math::Affine;

    fn params(m: &Affine) -> TessellationParams {
        TessellationParams {
            transform: m,
            max_tessellation_steps: 10,
        }
    }

    #[test]
    fn triangle_winding_normalizes() {
        let m = Affine::identity();
        let mut path = Path::new();
        path.move_to(&m, vec2(0.0, 0.0));
        path.line_to(&m, vec2(100.0, 0.0));
        path.line_to(&m, vec2(0.0, 100.0));
        path.close_subpath();

        assert_eq!(path.subpaths.len(), 1);
        let sp = &mut path.subpaths[0];
        assert_eq!(sp.len(), 3);
        assert!(sp.closed);
        // this input is CW under the canvas convention already
        assert_eq!(sp.winding(), Winding::Cw);
        sp.reverse_points();
        assert_eq!(sp.winding(), Winding::Ccw);
    }

    #[test]
    fn consecutive_duplicate_points_dedup() {
        let m = Affine::identity();
        let mut path = Path::new();
        path.move_to(&m, vec2(0.0, 0.0));
        path.line_to(&m, vec2(0.0, 0.0));
        path.line_to(&m, vec2(1.0, 0.0));
        path.end_subpath();
        assert_eq!(path.subpaths[0].len(), 2);
    }

    #[test]
    fn arc_point_count_is_bounded() {
        let m = Affine::identity();
        let mut path = Path::new();
        path.arc(
            params(&m),
            vec2(0.0, 0.0),
            10_000.0,
            Rads { rads: 0.0 },
            Rads { rads: CG_TAU },
            Rotation::ClockWise,
        );
        path.end_subpath();
        // emitted points <= max_tessellation_steps + 1
        assert!(path.subpaths[0].len() <= 11);
    }

    #[test]
    fn arc_to_degenerates_to_line() {
        let m = Affine::identity();
        let mut path = Path::new();
        path.move_to(&m, vec2(0.0, 0.0));
        // collinear corner
        path.arc_to(params(&m), vec2(1.0, 0.0), vec2(2.0, 0.0), 5.0);
        path.end_subpath();
        assert_eq!(path.subpaths[0].len(), 2);
        assert_eq!(path.subpaths[0].points[1], vec2(1.0, 0.0));
    }

    #[test]
    fn bezier_respects_recursion_bound() {
        let m = Affine::identity();
        let mut path = Path::new();
        path.move_to(&m, vec2(0.0, 0.0));
        path.quad_bezier_to(params(&m), 50.0, 100.0, 100.0, 0.0);
        path.end_subpath();
        let n = path.subpaths[0].len();
        assert!(n >= 3, "curve must subdivide, got {} points", n);
        // recursion depth 10 can at most produce 2^10 midpoints; sanity cap
        assert!(n <= 1025);
    }

    #[test]
    fn short_subpaths_are_dropped() {
        let m = Affine::identity();
        let mut path = Path::new();
        path.move_to(&m, vec2(5.0, 5.0));
        path.end_subpath();
        assert!(path.subpaths.is_empty());
    }
}
