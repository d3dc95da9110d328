/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use euclid::{Point2D, Rect, Size2D, Transform3D};
use num_traits::Zero;
use std::ops::Sub;
use std::sync::{LockResult, MutexGuard};

pub type FloatRect = Rect<f32>;
pub type IntRect = Rect<i32>;
pub type FloatPoint = Point2D<f32>;
pub type Matrix = Transform3D<f32>;

/// Locks a mutex, carrying on with the inner value if another thread panicked
/// while holding it. The protected state is always left consistent between
/// statements, so a poisoned lock is still usable.
pub fn lock<'a, T>(result: LockResult<MutexGuard<'a, T>>) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub trait MatrixHelpers {
    fn map_point(&self, point: &FloatPoint) -> FloatPoint;

    /// Bounding box of the four mapped corners.
    fn map_axis_aligned_rect(&self, rect: &FloatRect) -> FloatRect;

    /// Returns true if the matrix only translates and scales in x/y, so an
    /// axis-aligned rect stays axis-aligned and no perspective divide is needed.
    fn is_translations_and_scales(&self) -> bool;

    /// `self * translate(x, y, z)`: the translation applies to points first.
    fn translated(&self, x: f32, y: f32, z: f32) -> Self;
    fn scaled(&self, x: f32, y: f32, z: f32) -> Self;

    fn to_gl_array(&self) -> [f32; 16];
}

impl MatrixHelpers for Matrix {
    fn map_point(&self, point: &FloatPoint) -> FloatPoint {
        let x = point.x * self.m11 + point.y * self.m21 + self.m41;
        let y = point.x * self.m12 + point.y * self.m22 + self.m42;
        let w = point.x * self.m14 + point.y * self.m24 + self.m44;
        if w == 1.0 || w == 0.0 {
            Point2D::new(x, y)
        } else {
            Point2D::new(x / w, y / w)
        }
    }

    fn map_axis_aligned_rect(&self, rect: &FloatRect) -> FloatRect {
        let top_left = self.map_point(&rect.origin);
        let top_right = self.map_point(&rect.top_right());
        let bottom_left = self.map_point(&rect.bottom_left());
        let bottom_right = self.map_point(&rect.bottom_right());
        Rect::bounding_rect_of(&top_left, &top_right, &bottom_right, &bottom_left)
    }

    fn is_translations_and_scales(&self) -> bool {
        self.m12 == 0.0 && self.m13 == 0.0 && self.m14 == 0.0 &&
        self.m21 == 0.0 && self.m23 == 0.0 && self.m24 == 0.0 &&
        self.m31 == 0.0 && self.m32 == 0.0 && self.m34 == 0.0 &&
        self.m44 == 1.0
    }

    fn translated(&self, x: f32, y: f32, z: f32) -> Matrix {
        self.pre_mul(&Transform3D::create_translation(x, y, z))
    }

    fn scaled(&self, x: f32, y: f32, z: f32) -> Matrix {
        self.pre_mul(&Transform3D::create_scale(x, y, z))
    }

    fn to_gl_array(&self) -> [f32; 16] {
        [
            self.m11, self.m12, self.m13, self.m14,
            self.m21, self.m22, self.m23, self.m24,
            self.m31, self.m32, self.m33, self.m34,
            self.m41, self.m42, self.m43, self.m44,
        ]
    }
}

/// Orthographic projection mapping the box to the [-1, 1] cube. Degenerate
/// boxes give the identity.
pub fn orthographic_projection(left: f32, right: f32, bottom: f32, top: f32,
                               near: f32, far: f32) -> Matrix {
    let delta_x = right - left;
    let delta_y = top - bottom;
    let delta_z = far - near;
    if delta_x == 0.0 || delta_y == 0.0 || delta_z == 0.0 {
        return Transform3D::identity();
    }

    Transform3D::row_major(
        2.0 / delta_x, 0.0, 0.0, 0.0,
        0.0, 2.0 / delta_y, 0.0, 0.0,
        0.0, 0.0, -2.0 / delta_z, 0.0,
        -(right + left) / delta_x, -(top + bottom) / delta_y, -(near + far) / delta_z, 1.0,
    )
}

pub trait RectHelpers where Self: Sized {
    type N;
    fn bounding_rect_of(a: &Point2D<Self::N>,
                        b: &Point2D<Self::N>,
                        c: &Point2D<Self::N>,
                        d: &Point2D<Self::N>)
                        -> Self;
    fn from_edges(x0: Self::N, y0: Self::N, x1: Self::N, y1: Self::N) -> Self;
    fn is_well_formed_and_nonempty(&self) -> bool;
}

impl<T> RectHelpers for Rect<T> where T: Copy + PartialOrd + Sub<T, Output=T> + Zero {
    type N = T;

    fn bounding_rect_of(a: &Point2D<T>, b: &Point2D<T>, c: &Point2D<T>, d: &Point2D<T>) -> Rect<T> {
        let (mut min_x, mut min_y) = (a.x, a.y);
        let (mut max_x, mut max_y) = (min_x, min_y);
        for point in &[b, c, d] {
            if point.x < min_x {
                min_x = point.x
            }
            if point.x > max_x {
                max_x = point.x
            }
            if point.y < min_y {
                min_y = point.y
            }
            if point.y > max_y {
                max_y = point.y
            }
        }
        Rect::new(Point2D::new(min_x, min_y),
                  Size2D::new(max_x - min_x, max_y - min_y))
    }

    fn from_edges(x0: T, y0: T, x1: T, y1: T) -> Rect<T> {
        Rect::new(Point2D::new(x0, y0),
                  Size2D::new(x1 - x0, y1 - y0))
    }

    fn is_well_formed_and_nonempty(&self) -> bool {
        self.size.width > T::zero() && self.size.height > T::zero()
    }
}

// euclid's `is_empty` only reports empty when both extents are zero.
pub fn rect_is_empty<N: PartialOrd + Zero>(rect: &Rect<N>) -> bool {
    !(rect.size.width > Zero::zero()) || !(rect.size.height > Zero::zero())
}

/// Intersection that treats touching or empty results as no intersection.
pub fn intersect_rects<T>(a: &Rect<T>, b: &Rect<T>) -> Option<Rect<T>>
    where T: Copy + PartialOrd + Sub<T, Output=T> + Zero + std::ops::Add<T, Output=T>
{
    let x0 = if a.origin.x > b.origin.x { a.origin.x } else { b.origin.x };
    let y0 = if a.origin.y > b.origin.y { a.origin.y } else { b.origin.y };
    let x1 = if a.max_x() < b.max_x() { a.max_x() } else { b.max_x() };
    let y1 = if a.max_y() < b.max_y() { a.max_y() } else { b.max_y() };
    let rect = Rect::from_edges(x0, y0, x1, y1);
    if rect.is_well_formed_and_nonempty() {
        Some(rect)
    } else {
        None
    }
}

pub fn enclosing_int_rect(rect: &FloatRect) -> IntRect {
    let x0 = rect.min_x().floor() as i32;
    let y0 = rect.min_y().floor() as i32;
    let x1 = rect.max_x().ceil() as i32;
    let y1 = rect.max_y().ceil() as i32;
    Rect::from_edges(x0, y0, x1, y1)
}

pub fn to_float_rect(rect: &IntRect) -> FloatRect {
    Rect::new(Point2D::new(rect.origin.x as f32, rect.origin.y as f32),
              Size2D::new(rect.size.width as f32, rect.size.height as f32))
}

/// A union of integer rects. Rects are kept as added, and only coalesced when
/// one contains another.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntRegion {
    rects: Vec<IntRect>,
}

impl IntRegion {
    pub fn new() -> IntRegion {
        IntRegion { rects: Vec::new() }
    }

    pub fn from_rect(rect: IntRect) -> IntRegion {
        let mut region = IntRegion::new();
        region.union_rect(&rect);
        region
    }

    pub fn union_rect(&mut self, rect: &IntRect) {
        if rect_is_empty(rect) {
            return;
        }
        if self.rects.iter().any(|r| contains(r, rect)) {
            return;
        }
        self.rects.retain(|r| !contains(rect, r));
        self.rects.push(*rect);
    }

    pub fn union_region(&mut self, other: &IntRegion) {
        for rect in &other.rects {
            self.union_rect(rect);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    pub fn rects(&self) -> &[IntRect] {
        &self.rects
    }

    pub fn bounds(&self) -> IntRect {
        let mut rects = self.rects.iter();
        let first = match rects.next() {
            Some(rect) => *rect,
            None => return IntRect::zero(),
        };
        rects.fold(first, |bounds, rect| bounds.union(rect))
    }
}

fn contains(outer: &IntRect, inner: &IntRect) -> bool {
    outer.min_x() <= inner.min_x() && outer.min_y() <= inner.min_y() &&
    outer.max_x() >= inner.max_x() && outer.max_y() >= inner.max_y()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_multiplied_translation_applies_first() {
        let m = Transform3D::create_scale(2.0, 3.0, 1.0).translated(1.0, 1.0, 0.0);
        let p = m.map_point(&Point2D::new(0.0, 0.0));
        assert_eq!(p, Point2D::new(2.0, 3.0));
        assert!(m.is_translations_and_scales());
    }

    #[test]
    fn rotation_is_not_translation_and_scale() {
        let m: Matrix = Transform3D::row_major(
            0.0, 1.0, 0.0, 0.0,
            -1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        assert!(!m.is_translations_and_scales());
        let r = m.map_axis_aligned_rect(&Rect::from_edges(0.0, 0.0, 2.0, 1.0));
        assert_eq!(r, Rect::from_edges(-1.0, 0.0, 0.0, 2.0));
    }

    #[test]
    fn ortho_maps_box_to_clip_space() {
        let ortho = orthographic_projection(0.0, 100.0, 50.0, 0.0, -1000.0, 1000.0);
        assert_eq!(ortho.map_point(&Point2D::new(0.0, 0.0)), Point2D::new(-1.0, 1.0));
        assert_eq!(ortho.map_point(&Point2D::new(100.0, 50.0)), Point2D::new(1.0, -1.0));
        assert_eq!(orthographic_projection(0.0, 0.0, 1.0, 0.0, 0.0, 1.0), Transform3D::identity());
    }

    #[test]
    fn region_coalesces_contained_rects() {
        let mut region = IntRegion::new();
        region.union_rect(&Rect::from_edges(10, 10, 20, 20));
        region.union_rect(&Rect::from_edges(0, 0, 50, 50));
        region.union_rect(&Rect::from_edges(5, 5, 6, 6));
        region.union_rect(&Rect::from_edges(3, 3, 3, 9));
        assert_eq!(region.rects(), &[Rect::from_edges(0, 0, 50, 50)]);
        region.union_rect(&Rect::from_edges(60, 0, 70, 10));
        assert_eq!(region.bounds(), Rect::from_edges(0, 0, 70, 50));
    }

    #[test]
    fn touching_rects_do_not_intersect() {
        let a = Rect::from_edges(0.0, 0.0, 1.0, 1.0);
        let b = Rect::from_edges(1.0, 0.0, 2.0, 1.0);
        assert_eq!(intersect_rects(&a, &b), None);
        let c = Rect::from_edges(0.5, 0.5, 2.0, 2.0);
        assert_eq!(intersect_rects(&a, &c), Some(Rect::from_edges(0.5, 0.5, 1.0, 1.0)));
    }
}
