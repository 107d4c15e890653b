//! Frustum classification of the opaque and transparent buckets

use crate::render::FrameBuckets;
use crate::scene::{BoundingFrustum, SceneNode};

/// Fill the in-frustum subsets of `buckets`, keeping bucket order
///
/// Every tested node stores its result. With testing disabled the subsets
/// are copies of the full buckets and every node counts as inside.
pub fn classify_frustum(buckets: &mut FrameBuckets<'_>, frustum: &BoundingFrustum, enabled: bool) {
    classify(&buckets.opaque, &mut buckets.opaque_in_frustum, frustum, enabled);
    classify(
        &buckets.transparent,
        &mut buckets.transparent_in_frustum,
        frustum,
        enabled,
    );
}

fn classify<'a>(
    nodes: &[&'a SceneNode],
    out: &mut Vec<&'a SceneNode>,
    frustum: &BoundingFrustum,
    enabled: bool,
) {
    out.clear();
    if !enabled {
        for node in nodes {
            node.set_in_frustum(true);
        }
        out.extend_from_slice(nodes);
        return;
    }
    out.extend(
        nodes
            .iter()
            .copied()
            .filter(|node| node.test_view_frustum(frustum)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{flatten_all, BoundingBox, Camera, RenderType};
    use glam::Vec3;

    fn node_at(name: &str, z: f32) -> SceneNode {
        let mut node = SceneNode::group(name)
            .with_bounds(BoundingBox::new(Vec3::new(-1.0, -1.0, z - 1.0), Vec3::new(1.0, 1.0, z + 1.0)));
        node.set_render_type(RenderType::Opaque);
        node.mark_attached();
        node.update(&glam::Mat4::IDENTITY, false);
        node
    }

    fn scene() -> Vec<SceneNode> {
        vec![node_at("front", 0.0), node_at("behind", 50.0), node_at("far front", -20.0)]
    }

    #[test]
    fn nodes_outside_are_dropped() {
        let roots = scene();
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, false);
        let frustum = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO).frustum();

        classify_frustum(&mut buckets, &frustum, true);
        let inside: Vec<_> = buckets.opaque_in_frustum.iter().map(|n| n.name()).collect();
        assert_eq!(inside, vec!["front", "far front"]);
        assert!(!roots[1].is_in_frustum());
    }

    #[test]
    fn disabled_test_passes_everything_through() {
        let roots = scene();
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, false);
        let frustum = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO).frustum();

        classify_frustum(&mut buckets, &frustum, false);
        let all: Vec<_> = buckets.opaque.iter().map(|n| n.id()).collect();
        let inside: Vec<_> = buckets.opaque_in_frustum.iter().map(|n| n.id()).collect();
        assert_eq!(all, inside);
        assert!(roots.iter().all(SceneNode::is_in_frustum));
    }
}
