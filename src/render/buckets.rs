//! Per-frame render buckets
//!
//! The flattened scene is split by render type. Non-renderable nodes drop
//! their whole subtree. A screen-spaced node swallows every deeper entry
//! that follows it, whatever their own render type, so overlays render as
//! one block after the main passes.

use crate::postprocess::PostEffectName;
use crate::scene::{skip_subtree, FlatEntry, RenderType, SceneNode};

/// Nodes to render this frame, grouped by pass
#[derive(Debug, Default)]
pub struct FrameBuckets<'a> {
    pub opaque: Vec<&'a SceneNode>,
    pub transparent: Vec<&'a SceneNode>,
    pub particle: Vec<&'a SceneNode>,
    pub light: Vec<&'a SceneNode>,
    pub pre_proc: Vec<&'a SceneNode>,
    pub post_effect: Vec<&'a SceneNode>,
    pub global_effect: Vec<&'a SceneNode>,
    pub screen_spaced: Vec<&'a SceneNode>,
    /// Renderable nodes outside overlays that declare a post effect
    pub nodes_with_post_effect: Vec<&'a SceneNode>,
    pub opaque_in_frustum: Vec<&'a SceneNode>,
    pub transparent_in_frustum: Vec<&'a SceneNode>,
}

impl<'a> FrameBuckets<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.opaque.clear();
        self.transparent.clear();
        self.particle.clear();
        self.light.clear();
        self.pre_proc.clear();
        self.post_effect.clear();
        self.global_effect.clear();
        self.screen_spaced.clear();
        self.nodes_with_post_effect.clear();
        self.opaque_in_frustum.clear();
        self.transparent_in_frustum.clear();
    }

    /// Rebuild every bucket from a flattened scene
    ///
    /// With `sort_by_render_order`, the opaque, particle and post-effect
    /// buckets are sorted by render order. Nodes with equal keys may end up
    /// in any relative order.
    pub fn bucketize(&mut self, entries: &[FlatEntry<'a>], sort_by_render_order: bool) {
        self.clear();
        let mut index = 0;
        while index < entries.len() {
            let entry = entries[index];
            let node = entry.node;
            if !node.is_renderable() {
                index = skip_subtree(entries, index);
                continue;
            }

            if node.render_type() == RenderType::ScreenSpaced {
                index = self.push_screen_spaced_group(entries, index);
                continue;
            }

            match node.render_type() {
                RenderType::Opaque => self.opaque.push(node),
                RenderType::Transparent => self.transparent.push(node),
                RenderType::Particle => self.particle.push(node),
                RenderType::Light => self.light.push(node),
                RenderType::PreProc => self.pre_proc.push(node),
                RenderType::PostEffect => self.post_effect.push(node),
                RenderType::GlobalEffect => self.global_effect.push(node),
                RenderType::None | RenderType::ScreenSpaced => {}
            }
            if node.has_any_post_effect() {
                self.nodes_with_post_effect.push(node);
            }
            index += 1;
        }

        if sort_by_render_order {
            self.opaque.sort_unstable_by_key(|node| node.render_order());
            self.particle.sort_unstable_by_key(|node| node.render_order());
            self.post_effect.sort_unstable_by_key(|node| node.render_order());
        }
    }

    /// Push the group rooted at `index`; returns the index after the group
    fn push_screen_spaced_group(&mut self, entries: &[FlatEntry<'a>], index: usize) -> usize {
        let end = skip_subtree(entries, index);
        self.screen_spaced.push(entries[index].node);
        let mut next = index + 1;
        while next < end {
            if entries[next].node.is_renderable() {
                self.screen_spaced.push(entries[next].node);
                next += 1;
            } else {
                next = skip_subtree(entries, next);
            }
        }
        end
    }

    /// Nodes in `nodes_with_post_effect` tagged with `name`
    pub fn nodes_with_effect(&self, name: PostEffectName) -> Vec<&'a SceneNode> {
        self.nodes_with_post_effect
            .iter()
            .copied()
            .filter(|node| node.post_effect(name).is_some())
            .collect()
    }

    /// Number of nodes across all draw buckets
    pub fn len(&self) -> usize {
        self.opaque.len()
            + self.transparent.len()
            + self.particle.len()
            + self.light.len()
            + self.pre_proc.len()
            + self.post_effect.len()
            + self.global_effect.len()
            + self.screen_spaced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postprocess::PostEffect;
    use crate::scene::flatten_all;
    use glam::Vec4;

    fn attached(name: &str, render_type: RenderType) -> SceneNode {
        let mut node = SceneNode::group(name);
        node.set_render_type(render_type);
        node.mark_attached();
        node
    }

    fn names(nodes: &[&SceneNode]) -> Vec<String> {
        nodes.iter().map(|node| node.name().to_string()).collect()
    }

    #[test]
    fn nodes_land_in_their_bucket() {
        let roots = vec![
            attached("opaque", RenderType::Opaque),
            attached("transparent", RenderType::Transparent),
            attached("light", RenderType::Light),
            attached("particle", RenderType::Particle),
            attached("pre", RenderType::PreProc),
            attached("global", RenderType::GlobalEffect),
        ];
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, false);
        assert_eq!(names(&buckets.opaque), vec!["opaque"]);
        assert_eq!(names(&buckets.transparent), vec!["transparent"]);
        assert_eq!(names(&buckets.light), vec!["light"]);
        assert_eq!(names(&buckets.particle), vec!["particle"]);
        assert_eq!(names(&buckets.pre_proc), vec!["pre"]);
        assert_eq!(names(&buckets.global_effect), vec!["global"]);
        assert_eq!(buckets.len(), 6);
    }

    #[test]
    fn invisible_subtree_is_skipped() {
        let mut hidden = attached("hidden", RenderType::Opaque)
            .with_child(attached("hidden child", RenderType::Opaque));
        hidden.set_visible(false);
        let roots = vec![hidden, attached("after", RenderType::Opaque)];
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, false);
        assert_eq!(names(&buckets.opaque), vec!["after"]);
    }

    #[test]
    fn screen_spaced_group_swallows_descendants() {
        let roots = vec![
            attached("overlay", RenderType::ScreenSpaced)
                .with_child(attached("cube", RenderType::Opaque))
                .with_child(attached("label", RenderType::Transparent)),
            attached("scene", RenderType::Opaque),
        ];
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, false);
        assert_eq!(names(&buckets.screen_spaced), vec!["overlay", "cube", "label"]);
        assert_eq!(names(&buckets.opaque), vec!["scene"]);
        assert!(buckets.transparent.is_empty());
    }

    #[test]
    fn render_order_sorts_supported_buckets() {
        let roots = vec![
            attached("late", RenderType::Opaque).with_render_order(5),
            attached("early", RenderType::Opaque).with_render_order(-1),
            attached("t2", RenderType::Transparent).with_render_order(5),
            attached("t1", RenderType::Transparent).with_render_order(-1),
        ];
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, true);
        assert_eq!(names(&buckets.opaque), vec!["early", "late"]);
        // Transparent keeps scene order.
        assert_eq!(names(&buckets.transparent), vec!["t2", "t1"]);
    }

    #[test]
    fn post_effect_tags_are_collected() {
        let roots = vec![
            attached("outlined", RenderType::Opaque)
                .with_post_effect(PostEffect::border_highlight(Vec4::X)),
            attached("plain", RenderType::Opaque),
            attached("xray", RenderType::Transparent).with_post_effect(PostEffect::x_ray(Vec4::Y)),
        ];
        let entries = flatten_all(&roots);
        let mut buckets = FrameBuckets::new();
        buckets.bucketize(&entries, false);
        assert_eq!(names(&buckets.nodes_with_post_effect), vec!["outlined", "xray"]);
        assert_eq!(
            names(&buckets.nodes_with_effect(PostEffectName::XRay)),
            vec!["xray"]
        );
    }
}
