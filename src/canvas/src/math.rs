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

//! Canvas math: 2D vectors, rects, colors, and the affine transform.

use std::f32;

/// Tau.
pub const CG_TAU: f32 = 2.0 * f32::consts::PI;
/// Epsilon used by the tessellation degeneracy tests.
pub const CG_SMALL_NUM: f32 = 1.0e-6;
/// Sentinel used for unbounded extents.
pub const CG_BIG_NUM: f32 = 1.0e18;

/// A 2D point or direction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec2 {
    /// X component.
    pub x: f32,
    /// Y component.
    pub y: f32,
}

/// Shorthand constructor.
pub fn vec2(x: f32, y: f32) -> Vec2 {
    Vec2 { x: x, y: y }
}

impl Vec2 {
    /// Component-wise sum.
    pub fn add(self, o: Vec2) -> Vec2 {
        vec2(self.x + o.x, self.y + o.y)
    }

    /// Component-wise difference.
    pub fn sub(self, o: Vec2) -> Vec2 {
        vec2(self.x - o.x, self.y - o.y)
    }

    /// Uniform scale.
    pub fn scale(self, s: f32) -> Vec2 {
        vec2(self.x * s, self.y * s)
    }

    /// Dot product.
    pub fn dot(self, o: Vec2) -> f32 {
        self.x * o.x + self.y * o.y
    }

    /// 2D cross product (determinant).
    pub fn det(self, o: Vec2) -> f32 {
        self.x * o.y - self.y * o.x
    }

    /// Euclidean length.
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector; zero stays zero.
    pub fn normalize(self) -> Vec2 {
        let len = self.length();
        if len > CG_SMALL_NUM {
            self.scale(1.0 / len)
        } else {
            self
        }
    }

    /// Rotate a quarter turn counter-clockwise.
    pub fn rot90(self) -> Vec2 {
        vec2(self.y, -self.x)
    }
}

/// An angle in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rads {
    /// Radians.
    pub rads: f32,
}

/// An axis-aligned rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub width: f32,
    /// Height.
    pub height: f32,
}

/// Shorthand constructor.
pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Rect {
    Rect {
        x: x,
        y: y,
        width: width,
        height: height,
    }
}

/// Nine-slice margins.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Margins {
    /// Left margin.
    pub left: f32,
    /// Right margin.
    pub right: f32,
    /// Top margin.
    pub top: f32,
    /// Bottom margin.
    pub bottom: f32,
}

/// An RGBA color; also doubles as UV + alpha in the canvas vertex.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Color {
    /// Red.
    pub r: f32,
    /// Green.
    pub g: f32,
    /// Blue.
    pub b: f32,
    /// Alpha.
    pub a: f32,
}

/// Shorthand constructor.
pub fn color(r: f32, g: f32, b: f32, a: f32) -> Color {
    Color {
        r: r,
        g: g,
        b: b,
        a: a,
    }
}

impl Color {
    /// Decode a packed 12-bit `0xRGB` style value, one nibble per channel.
    pub fn from_hex(packed: i32) -> Color {
        let r = (packed & 0xf00) as f32 * (1.0 / 0xf00 as f32);
        let g = (packed & 0x0f0) as f32 * (1.0 / 0x0f0 as f32);
        let b = (packed & 0x00f) as f32 * (1.0 / 0x00f as f32);
        color(r, g, b, 1.0)
    }
}

/// An SDF box: centerpoint and half dimensions in device space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Box2 {
    /// Center of the box.
    pub centerpoint: Vec2,
    /// Half extents.
    pub half_dim: Vec2,
}

/// A 2x3 affine transform (column-vector convention):
///
/// ```text
/// | a c e |
/// | b d f |
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine {
    /// X basis x.
    pub a: f32,
    /// X basis y.
    pub b: f32,
    /// Y basis x.
    pub c: f32,
    /// Y basis y.
    pub d: f32,
    /// Translation x.
    pub e: f32,
    /// Translation y.
    pub f: f32,
}

impl Default for Affine {
    fn default() -> Affine {
        Affine::identity()
    }
}

impl Affine {
    /// The identity transform.
    pub fn identity() -> Affine {
        Affine {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }
    }

    /// Post-multiply by a translation.
    pub fn translate(&mut self, tx: f32, ty: f32) {
        self.e += self.a * tx + self.c * ty;
        self.f += self.b * tx + self.d * ty;
    }

    /// Post-multiply by a rotation.
    pub fn rotate(&mut self, rads: f32) {
        let (sin, cos) = rads.sin_cos();
        let (a, b, c, d) = (self.a, self.b, self.c, self.d);
        self.a = a * cos + c * sin;
        self.b = b * cos + d * sin;
        self.c = c * cos - a * sin;
        self.d = d * cos - b * sin;
    }

    /// Post-multiply by a non-uniform scale.
    pub fn scale(&mut self, sx: f32, sy: f32) {
        self.a *= sx;
        self.b *= sx;
        self.c *= sy;
        self.d *= sy;
    }

    /// Transform a point.
    pub fn apply(&self, p: Vec2) -> Vec2 {
        vec2(
            self.a * p.x + self.c * p.y + self.e,
            self.b * p.x + self.d * p.y + self.f,
        )
    }

    /// Inverse-transform a point; identity fallback for a singular matrix.
    pub fn inverse_apply(&self, p: Vec2) -> Vec2 {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < CG_SMALL_NUM {
            return p;
        }
        let inv_det = 1.0 / det;
        let x = p.x - self.e;
        let y = p.y - self.f;
        vec2(
            (x * self.d - y * self.c) * inv_det,
            (y * self.a - x * self.b) * inv_det,
        )
    }

    /// Scalar scale estimate: geometric mean of the basis lengths. Drives
    /// tessellation level of detail.
    pub fn get_scale(&self) -> f32 {
        let sx = vec2(self.a, self.b).length();
        let sy = vec2(self.c, self.d).length();
        (sx * sy).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1.0e-4
    }

    #[test]
    fn affine_translate_rotate_scale() {
        let mut m = Affine::identity();
        m.translate(10.0, 20.0);
        let p = m.apply(vec2(1.0, 2.0));
        assert!(close(p.x, 11.0) && close(p.y, 22.0));

        let mut m = Affine::identity();
        m.scale(2.0, 3.0);
        let p = m.apply(vec2(1.0, 1.0));
        assert!(close(p.x, 2.0) && close(p.y, 3.0));
        assert!(close(m.get_scale(), (2.0f32 * 3.0).sqrt()));

        let mut m = Affine::identity();
        m.rotate(::std::f32::consts::FRAC_PI_2);
        let p = m.apply(vec2(1.0, 0.0));
        assert!(close(p.x, 0.0) && close(p.y, 1.0));
    }

    #[test]
    fn affine_round_trips_through_inverse() {
        let mut m = Affine::identity();
        m.translate(5.0, -3.0);
        m.rotate(0.7);
        m.scale(1.5, 0.5);
        let p = vec2(3.0, 4.0);
        let q = m.inverse_apply(m.apply(p));
        assert!(close(p.x, q.x) && close(p.y, q.y));
    }

    #[test]
    fn hex_colors() {
        let c = Color::from_hex(0xf00);
        assert_eq!(c, color(1.0, 0.0, 0.0, 1.0));
        let c = Color::from_hex(0x0f0);
        assert_eq!(c, color(0.0, 1.0, 0.0, 1.0));
    }
}
