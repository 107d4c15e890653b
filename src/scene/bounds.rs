//! Bounding volumes and the view frustum

use glam::{Mat4, Vec3, Vec4};

/// Axis aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    /// Smallest box containing every point; `None` for an empty set
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let (min, max) = points.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (a, b) = (self.min, self.max);
        [
            Vec3::new(a.x, a.y, a.z),
            Vec3::new(b.x, a.y, a.z),
            Vec3::new(a.x, b.y, a.z),
            Vec3::new(b.x, b.y, a.z),
            Vec3::new(a.x, a.y, b.z),
            Vec3::new(b.x, a.y, b.z),
            Vec3::new(a.x, b.y, b.z),
            Vec3::new(b.x, b.y, b.z),
        ]
    }

    /// Box containing this box after `matrix` is applied
    pub fn transform(&self, matrix: &Mat4) -> Self {
        let corners = self.corners().map(|c| matrix.transform_point3(c));
        let mut min = corners[0];
        let mut max = corners[0];
        for corner in &corners[1..] {
            min = min.min(*corner);
            max = max.max(*corner);
        }
        Self { min, max }
    }

    pub fn merge(&self, other: &BoundingBox) -> Self {
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Bounding sphere
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingSphere {
    pub center: Vec3,
    pub radius: f32,
}

impl From<BoundingBox> for BoundingSphere {
    fn from(aabb: BoundingBox) -> Self {
        Self {
            center: aabb.center(),
            radius: aabb.extents().length(),
        }
    }
}

/// View frustum as six inward-facing planes (left, right, bottom, top, near, far)
///
/// Each plane is `(normal, d)` with `normal.dot(p) + d >= 0` inside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingFrustum {
    planes: [Vec4; 6],
}

impl BoundingFrustum {
    /// Extract planes from a view-projection matrix with a 0..1 depth range
    pub fn from_view_projection(view_projection: &Mat4) -> Self {
        let m = view_projection.transpose();
        let (r0, r1, r2, r3) = (m.x_axis, m.y_axis, m.z_axis, m.w_axis);
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2].map(|plane| {
            let length = plane.truncate().length();
            if length > f32::EPSILON {
                plane / length
            } else {
                plane
            }
        });
        Self { planes }
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(point) + plane.w >= 0.0)
    }

    /// Conservative box test: false only when the box lies fully outside one plane
    pub fn intersects_box(&self, aabb: &BoundingBox) -> bool {
        self.planes.iter().all(|plane| {
            let normal = plane.truncate();
            // Corner furthest along the plane normal.
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            normal.dot(positive) + plane.w >= 0.0
        })
    }

    pub fn intersects_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(sphere.center) + plane.w >= -sphere.radius)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frustum() -> BoundingFrustum {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(std::f32::consts::FRAC_PI_4, 1.0, 0.1, 100.0);
        BoundingFrustum::from_view_projection(&(projection * view))
    }

    #[test]
    fn box_in_front_of_camera_is_visible() {
        let aabb = BoundingBox::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert!(frustum().intersects_box(&aabb));
        assert!(frustum().contains_point(Vec3::ZERO));
    }

    #[test]
    fn box_behind_camera_is_culled() {
        let aabb = BoundingBox::new(Vec3::new(-1.0, -1.0, 10.0), Vec3::new(1.0, 1.0, 12.0));
        assert!(!frustum().intersects_box(&aabb));
        assert!(!frustum().intersects_sphere(&aabb.into()));
    }

    #[test]
    fn box_beyond_far_plane_is_culled() {
        let aabb = BoundingBox::new(Vec3::new(-1.0, -1.0, -200.0), Vec3::new(1.0, 1.0, -150.0));
        assert!(!frustum().intersects_box(&aabb));
    }

    #[test]
    fn transformed_box_contains_moved_corners() {
        let aabb = BoundingBox::new(Vec3::ZERO, Vec3::ONE);
        let moved = aabb.transform(&Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(moved.max, Vec3::new(6.0, 1.0, 1.0));
    }

    #[test]
    fn empty_point_set_has_no_bounds() {
        assert!(BoundingBox::from_points(Vec::new()).is_none());
    }
}
