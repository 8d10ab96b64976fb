//! Scene tree walker
//!
//! Collects the draw leaves below a renderer and orders them for
//! submission. Each visited node is classified by a [`Visit`]: a render
//! leaf, a pass-through whose children are still walked, or ignored
//! altogether.
//!
//! Leaves are sorted by widget depth when both sides have one, otherwise by
//! hierarchy order below the renderer. With stencil enabled every leaf gets
//! a matching [`WalkStep::Pop`] once the leaves nested below it are drawn.
//! A nested renderer in foreground mode presents its output at that same
//! point, in front of its own subtree.

use std::cmp::Ordering;

use composite_gpu::GpuDevice;
use smallvec::SmallVec;

use crate::compositor::Compositor;
use crate::renderer::RendererId;
use crate::scene::{NodeId, Scene};
use crate::source::SourceId;

/// One drawable node below a renderer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub node: NodeId,
    pub source: SourceId,
    /// Nested renderer hosted on the node; its output is drawn instead of a
    /// widget
    pub nested: Option<RendererId>,
    pub depth: Option<i32>,
    /// Drawn after the leaves below it
    pub front: bool,
}

/// Recorded step of a bake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkStep {
    Draw(Leaf),
    /// Stencil restore after the leaf and its nested leaves
    Pop(Leaf),
}

/// Classification of one node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Visit {
    pub render: bool,
    pub descend: bool,
}

/// Paint order of two leaves below `root`
pub fn draw_order(scene: &Scene, root: NodeId, a: &Leaf, b: &Leaf) -> Ordering {
    match (a.depth, b.depth) {
        (Some(da), Some(db)) if da != db => da.cmp(&db),
        _ => scene.compare_hierarchy(a.node, b.node, Some(root)),
    }
}

/// Stable in-place sort by [`draw_order`].
///
/// Depth ordering is not a total order once leaves without depth are mixed
/// in, so this avoids the std sorts, which may panic on inconsistent
/// comparators.
pub fn sort_leaves(scene: &Scene, root: NodeId, leaves: &mut [Leaf]) {
    for i in 1..leaves.len() {
        let mut j = i;
        while j > 0 && draw_order(scene, root, &leaves[j - 1], &leaves[j]) == Ordering::Greater {
            leaves.swap(j - 1, j);
            j -= 1;
        }
    }
}

/// Turn sorted leaves into draw steps, closing each leaf with a pop once
/// the following leaves leave its subtree.
pub fn nest_steps(scene: &Scene, leaves: &[Leaf], stencil: bool) -> Vec<WalkStep> {
    if !stencil && !leaves.iter().any(|l| l.front) {
        return leaves.iter().copied().map(WalkStep::Draw).collect();
    }

    let close = |steps: &mut Vec<WalkStep>, leaf: Leaf| {
        if leaf.front {
            steps.push(WalkStep::Draw(leaf));
        }
        if stencil {
            steps.push(WalkStep::Pop(leaf));
        }
    };

    let mut steps = Vec::with_capacity(leaves.len() * 2);
    let mut open: SmallVec<[Leaf; 8]> = SmallVec::new();
    for leaf in leaves {
        while let Some(top) = open.last().copied() {
            if scene.is_ancestor_of(top.node, leaf.node) {
                break;
            }
            close(&mut steps, top);
            open.pop();
        }
        if !leaf.front {
            steps.push(WalkStep::Draw(*leaf));
        }
        if stencil || leaf.front {
            open.push(*leaf);
        }
    }
    while let Some(top) = open.pop() {
        close(&mut steps, top);
    }
    steps
}

impl<D: GpuDevice> Compositor<D> {
    /// Ordered draw steps of one bake of `id`
    pub fn walk(&mut self, id: RendererId) -> Vec<WalkStep> {
        let Some(r) = self.renderers.get(id) else {
            return Vec::new();
        };
        let root = r.node;
        let stencil = r.settings.use_stencil;

        let mut leaves = Vec::new();
        self.collect_leaves(id, root, root, &mut leaves);
        sort_leaves(&self.scene, root, &mut leaves);
        tracing::trace!(renderer = ?id, leaves = leaves.len(), "tree walked");
        nest_steps(&self.scene, &leaves, stencil)
    }

    fn collect_leaves(&mut self, id: RendererId, root: NodeId, node: NodeId, out: &mut Vec<Leaf>) {
        if !self.scene.is_active_in_hierarchy(node) {
            return;
        }
        let visit = self.classify(id, root, node);
        if visit.render {
            if let Some(source) = self.node_source.get(node).copied() {
                let nested = self.active_renderer_on(node);
                let depth = match nested {
                    Some(_) => None,
                    None => self.scene.widget(node).and_then(|w| w.depth),
                };
                let front = nested
                    .and_then(|r| self.renderers.get(r))
                    .is_some_and(|r| r.settings.foreground);
                out.push(Leaf {
                    node,
                    source,
                    nested,
                    depth,
                    front,
                });
            }
        }
        if visit.descend {
            let children: SmallVec<[NodeId; 8]> = self.scene.children(node).iter().copied().collect();
            for child in children {
                self.collect_leaves(id, root, child, out);
            }
        }
    }

    fn active_renderer_on(&self, node: NodeId) -> Option<RendererId> {
        self.node_renderer
            .get(node)
            .copied()
            .filter(|r| self.renderers.get(*r).is_some_and(|r| r.active))
    }

    /// Classify `node` for the walk of renderer `id` rooted at `root`.
    pub fn classify(&mut self, id: RendererId, root: NodeId, node: NodeId) -> Visit {
        if node == root {
            return Visit {
                render: false,
                descend: true,
            };
        }
        let Some(sid) = self.node_source.get(node).copied() else {
            return Visit::default();
        };
        let Some(source) = self.sources.get(sid) else {
            return Visit::default();
        };
        if !source.enabled {
            return Visit::default();
        }
        let descend = !source.ignore_children;
        if source.ignore_self {
            return Visit { render: false, descend };
        }

        let drawable = self.active_renderer_on(node).is_some()
            || self.scene.widget(node).is_some_and(|w| w.active && !w.mesh.is_empty());
        // Content of a nested renderer that hides its sources only reaches
        // this bake through the nested output.
        let hidden = source
            .renderer
            .filter(|owner| *owner != id)
            .and_then(|owner| self.renderers.get(owner))
            .is_some_and(|owner| owner.active && !owner.settings.show_source_graphics);

        let render = drawable && !hidden && self.is_in_screen(sid);
        Visit { render, descend }
    }
}
