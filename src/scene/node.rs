//! Scene graph nodes
//!
//! A [`SceneNode`] owns its children and optionally a [`RenderCore`] holding
//! its GPU-side state. Setters mark dirty bits; [`SceneNode::update`] runs
//! once per frame, propagates world transforms and hands changed state to
//! the core. Nothing is rendered until the node has been attached.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use glam::{Mat4, Vec4};

use crate::backend::DeviceContext;
use crate::error::RenderResult;
use crate::postprocess::{PostEffect, PostEffectName};
use crate::render::RenderContext;
use crate::scene::bounds::{BoundingBox, BoundingFrustum};
use crate::scene::cores::{AttachContext, NodeState, RenderCore};
use crate::scene::transform::Transform;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a scene node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Render bucket a node belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderType {
    /// Grouping node; draws nothing itself
    #[default]
    None,
    Opaque,
    Transparent,
    Particle,
    Light,
    /// Rendered before the opaque pass
    PreProc,
    /// Screen effect applied to nodes tagged with a [`PostEffect`]
    PostEffect,
    /// Screen effect applied to the whole frame
    GlobalEffect,
    /// Root of an overlay rendered in its own viewport
    ScreenSpaced,
}

bitflags! {
    /// Node state changed since the last sync
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeDirtyFlags: u32 {
        const TRANSFORM = 1 << 0;
        const VISIBILITY = 1 << 1;
        const MATERIAL = 1 << 2;
        const RENDER_ORDER = 1 << 3;
        const POST_EFFECT = 1 << 4;
        const CHILDREN = 1 << 5;
    }
}

/// A node of the retained scene graph
pub struct SceneNode {
    id: NodeId,
    name: String,
    transform: Transform,
    world: Mat4,
    visible: bool,
    render_type: RenderType,
    render_order: i32,
    color: Vec4,
    bounds: Option<BoundingBox>,
    world_bounds: Option<BoundingBox>,
    children: Vec<SceneNode>,
    core: Option<Box<dyn RenderCore>>,
    post_effects: Vec<PostEffect>,
    dirty: NodeDirtyFlags,
    generation: u64,
    attached: bool,
    in_frustum: AtomicBool,
}

impl SceneNode {
    /// Grouping node without a core
    pub fn group(name: impl Into<String>) -> Self {
        Self {
            id: NodeId::next(),
            name: name.into(),
            transform: Transform::IDENTITY,
            world: Mat4::IDENTITY,
            visible: true,
            render_type: RenderType::None,
            render_order: 0,
            color: Vec4::ONE,
            bounds: None,
            world_bounds: None,
            children: Vec::new(),
            core: None,
            post_effects: Vec::new(),
            dirty: NodeDirtyFlags::all(),
            generation: 0,
            attached: false,
            in_frustum: AtomicBool::new(true),
        }
    }

    /// Node rendered by `core`; local bounds are taken from the core when it has any
    pub fn new(name: impl Into<String>, render_type: RenderType, core: impl RenderCore + 'static) -> Self {
        let bounds = core.local_bounds();
        let mut node = Self::group(name);
        node.render_type = render_type;
        node.bounds = bounds;
        node.core = Some(Box::new(core));
        node
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.set_transform(transform);
        self
    }

    pub fn with_child(mut self, child: SceneNode) -> Self {
        self.add_child(child);
        self
    }

    pub fn with_render_order(mut self, order: i32) -> Self {
        self.set_render_order(order);
        self
    }

    pub fn with_post_effect(mut self, effect: PostEffect) -> Self {
        self.add_post_effect(effect);
        self
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.set_color(color);
        self
    }

    pub fn with_bounds(mut self, bounds: BoundingBox) -> Self {
        self.bounds = Some(bounds);
        self.mark_dirty(NodeDirtyFlags::TRANSFORM);
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn render_type(&self) -> RenderType {
        self.render_type
    }

    pub fn render_order(&self) -> i32 {
        self.render_order
    }

    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// World matrix as of the last [`SceneNode::update`]
    pub fn world_matrix(&self) -> &Mat4 {
        &self.world
    }

    pub fn color(&self) -> Vec4 {
        self.color
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Visible and attached to a live host
    pub fn is_renderable(&self) -> bool {
        self.visible && self.attached
    }

    pub fn dirty_flags(&self) -> NodeDirtyFlags {
        self.dirty
    }

    /// Incremented on every mutation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn children(&self) -> &[SceneNode] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut [SceneNode] {
        &mut self.children
    }

    pub fn core(&self) -> Option<&dyn RenderCore> {
        self.core.as_deref()
    }

    pub fn world_bounds(&self) -> Option<&BoundingBox> {
        self.world_bounds.as_ref()
    }

    fn mark_dirty(&mut self, flags: NodeDirtyFlags) {
        self.dirty |= flags;
        self.generation += 1;
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.mark_dirty(NodeDirtyFlags::TRANSFORM);
    }

    pub fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            self.mark_dirty(NodeDirtyFlags::VISIBILITY);
        }
    }

    pub fn set_color(&mut self, color: Vec4) {
        self.color = color;
        self.mark_dirty(NodeDirtyFlags::MATERIAL);
    }

    pub fn set_render_order(&mut self, order: i32) {
        self.render_order = order;
        self.mark_dirty(NodeDirtyFlags::RENDER_ORDER);
    }

    pub fn set_render_type(&mut self, render_type: RenderType) {
        self.render_type = render_type;
        self.mark_dirty(NodeDirtyFlags::RENDER_ORDER);
    }

    pub fn add_child(&mut self, child: SceneNode) {
        self.children.push(child);
        self.mark_dirty(NodeDirtyFlags::CHILDREN);
    }

    /// Detach and remove the child with `id`
    pub fn remove_child(&mut self, id: NodeId) -> Option<SceneNode> {
        let index = self.children.iter().position(|child| child.id == id)?;
        let mut child = self.children.remove(index);
        child.detach();
        self.mark_dirty(NodeDirtyFlags::CHILDREN);
        Some(child)
    }

    pub fn find(&self, id: NodeId) -> Option<&SceneNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|child| child.find_mut(id))
    }

    pub fn add_post_effect(&mut self, effect: PostEffect) {
        self.post_effects.retain(|existing| existing.name != effect.name);
        self.post_effects.push(effect);
        self.mark_dirty(NodeDirtyFlags::POST_EFFECT);
    }

    pub fn remove_post_effect(&mut self, name: PostEffectName) {
        let before = self.post_effects.len();
        self.post_effects.retain(|existing| existing.name != name);
        if self.post_effects.len() != before {
            self.mark_dirty(NodeDirtyFlags::POST_EFFECT);
        }
    }

    pub fn has_any_post_effect(&self) -> bool {
        !self.post_effects.is_empty()
    }

    pub fn post_effect(&self, name: PostEffectName) -> Option<&PostEffect> {
        self.post_effects.iter().find(|effect| effect.name == name)
    }

    #[cfg(test)]
    pub(crate) fn mark_attached(&mut self) {
        self.attached = true;
    }

    /// Last frustum test result
    pub fn is_in_frustum(&self) -> bool {
        self.in_frustum.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_frustum(&self, value: bool) {
        self.in_frustum.store(value, Ordering::Relaxed);
    }

    /// Test the world bounds against `frustum` and store the result
    ///
    /// Nodes without bounds always pass.
    pub fn test_view_frustum(&self, frustum: &BoundingFrustum) -> bool {
        let inside = self
            .world_bounds
            .as_ref()
            .map_or(true, |bounds| frustum.intersects_box(bounds));
        self.set_in_frustum(inside);
        inside
    }

    /// Attach this node and every unattached descendant
    pub fn attach(&mut self, ctx: &AttachContext<'_>) -> RenderResult<()> {
        if !self.attached {
            if let Some(core) = self.core.as_mut() {
                core.attach(ctx)?;
            }
            self.attached = true;
            // Force a full sync on the next update.
            self.mark_dirty(NodeDirtyFlags::all());
            log::trace!("Attached node '{}'", self.name);
        }
        for child in &mut self.children {
            child.attach(ctx)?;
        }
        Ok(())
    }

    /// Release GPU state of this node and its subtree
    pub fn detach(&mut self) {
        for child in &mut self.children {
            child.detach();
        }
        if self.attached {
            if let Some(core) = self.core.as_mut() {
                core.detach();
            }
            self.attached = false;
            log::trace!("Detached node '{}'", self.name);
        }
    }

    /// Propagate world transforms and sync dirty cores; returns the number of cores synced
    pub fn update(&mut self, parent_world: &Mat4, parent_moved: bool) -> usize {
        let moved = parent_moved || self.dirty.contains(NodeDirtyFlags::TRANSFORM);
        if moved {
            self.world = *parent_world * self.transform.matrix();
            self.world_bounds = self.bounds.map(|bounds| bounds.transform(&self.world));
            self.dirty |= NodeDirtyFlags::TRANSFORM;
        }

        let mut synced = 0;
        if !self.dirty.is_empty() {
            if let (true, Some(core)) = (self.attached, self.core.as_mut()) {
                core.sync(&NodeState {
                    world: self.world,
                    color: self.color,
                    render_order: self.render_order,
                    dirty: self.dirty,
                    generation: self.generation,
                });
                synced += 1;
            }
            if self.attached {
                self.dirty = NodeDirtyFlags::empty();
            }
        }

        let world = self.world;
        for child in &mut self.children {
            synced += child.update(&world, moved);
        }
        synced
    }

    /// Render through the core; false when there is nothing to draw
    pub fn render(&self, ctx: &RenderContext<'_>, dc: &mut dyn DeviceContext) -> RenderResult<bool> {
        match &self.core {
            Some(core) => {
                core.render(ctx, dc)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Draw geometry with the shader pass already bound by the caller
    pub fn render_custom(
        &self,
        ctx: &RenderContext<'_>,
        dc: &mut dyn DeviceContext,
        color: Option<Vec4>,
    ) -> RenderResult<bool> {
        match &self.core {
            Some(core) => {
                core.render_custom(ctx, dc, color)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of nodes in this subtree, this node included
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(SceneNode::subtree_len)
            .sum::<usize>()
    }
}

impl std::fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("render_type", &self.render_type)
            .field("visible", &self.visible)
            .field("attached", &self.attached)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn setters_mark_dirty_and_bump_generation() {
        let mut node = SceneNode::group("root");
        node.dirty = NodeDirtyFlags::empty();
        let generation = node.generation();

        node.set_color(Vec4::ONE);
        assert!(node.dirty_flags().contains(NodeDirtyFlags::MATERIAL));
        assert!(node.generation() > generation);

        node.set_visible(true);
        assert!(!node.dirty_flags().contains(NodeDirtyFlags::VISIBILITY));
    }

    #[test]
    fn world_transform_propagates_to_children() {
        let mut root = SceneNode::group("root")
            .with_transform(Transform::from_position(Vec3::new(1.0, 0.0, 0.0)))
            .with_child(
                SceneNode::group("child")
                    .with_transform(Transform::from_position(Vec3::new(0.0, 2.0, 0.0))),
            );
        root.update(&Mat4::IDENTITY, false);
        let child = &root.children()[0];
        assert_eq!(
            child.world_matrix().transform_point3(Vec3::ZERO),
            Vec3::new(1.0, 2.0, 0.0)
        );
    }

    #[test]
    fn unattached_nodes_are_not_renderable() {
        let mut node = SceneNode::group("root");
        assert!(!node.is_renderable());
        node.attached = true;
        assert!(node.is_renderable());
        node.set_visible(false);
        assert!(!node.is_renderable());
    }

    #[test]
    fn post_effects_replace_by_name() {
        let node = SceneNode::group("n")
            .with_post_effect(PostEffect::border_highlight(Vec4::X))
            .with_post_effect(PostEffect::border_highlight(Vec4::Y));
        assert!(node.has_any_post_effect());
        assert_eq!(
            node.post_effect(PostEffectName::BorderHighlight).map(|e| e.color),
            Some(Vec4::Y)
        );
        assert!(node.post_effect(PostEffectName::XRay).is_none());
    }

    #[test]
    fn subtree_len_counts_all_descendants() {
        let root = SceneNode::group("a")
            .with_child(SceneNode::group("b").with_child(SceneNode::group("c")))
            .with_child(SceneNode::group("d"));
        assert_eq!(root.subtree_len(), 4);
    }

    #[test]
    fn removing_a_child_returns_it() {
        let child = SceneNode::group("child");
        let id = child.id();
        let mut root = SceneNode::group("root").with_child(child);
        assert!(root.find(id).is_some());
        let removed = root.remove_child(id).unwrap();
        assert_eq!(removed.name(), "child");
        assert!(root.find(id).is_none());
    }
}
