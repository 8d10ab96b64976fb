//! Culling
//!
//! Visibility tests that keep off-screen content out of bakes. Both tests
//! are memoized in the frame cache, so repeated queries within one frame
//! cost a lookup.

use composite_core::Vec3;
use composite_gpu::GpuDevice;

use crate::compositor::{CacheObject, Compositor};
use crate::renderer::RendererId;
use crate::source::SourceId;

/// A transform with a degenerate xy scale draws nothing.
pub(crate) fn is_visible_scale(scale: Vec3) -> bool {
    (scale.x * scale.y).abs() > 0.0
}

impl<D: GpuDevice> Compositor<D> {
    /// Project culling switch combined with the renderer's own
    pub fn culling_enabled(&self, id: RendererId) -> bool {
        self.settings.enable_culling() && self.renderers.get(id).is_some_and(|r| r.settings.culling)
    }

    /// Whether the renderer's padded rect overlaps its root canvas.
    pub fn is_in_canvas_viewport(&mut self, id: RendererId) -> bool {
        if !self.culling_enabled(id) {
            return true;
        }
        let object = CacheObject::Renderer(id);
        if let Some(visible) = self.cache.get::<bool>(object, "in_canvas_viewport") {
            return visible;
        }

        let visible = self.compute_in_canvas_viewport(id);
        self.cache.set(object, "in_canvas_viewport", visible);
        visible
    }

    fn compute_in_canvas_viewport(&self, id: RendererId) -> bool {
        let Some(r) = self.renderers.get(id) else {
            return false;
        };
        let Some((root, _)) = self.scene.root_canvas(r.node) else {
            return false;
        };
        if !is_visible_scale(self.scene.lossy_scale(r.node)) {
            return false;
        }
        let bounds = self.scene.relative_bounds(root, r.node).expanded(r.settings.extents);
        self.scene.rect(root).overlaps(&bounds, true)
    }

    /// Whether the source's subtree overlaps the padded rect of the
    /// renderer it is registered with.
    pub fn is_in_screen(&mut self, sid: SourceId) -> bool {
        let object = CacheObject::Source(sid);
        if let Some(visible) = self.cache.get::<bool>(object, "in_screen") {
            return visible;
        }

        let visible = self.compute_in_screen(sid);
        self.cache.set(object, "in_screen", visible);
        visible
    }

    fn compute_in_screen(&self, sid: SourceId) -> bool {
        let Some(source) = self.sources.get(sid) else {
            return false;
        };
        let Some((rid, r)) = source.renderer.and_then(|rid| self.renderers.get(rid).map(|r| (rid, r))) else {
            return false;
        };
        let hosts_renderer = self
            .node_renderer
            .get(source.node)
            .and_then(|n| self.renderers.get(*n))
            .is_some_and(|n| n.active);
        if !hosts_renderer && self.scene.widget(source.node).is_none() {
            return false;
        }
        if !is_visible_scale(self.scene.lossy_scale(source.node)) {
            return false;
        }
        if !self.culling_enabled(rid) {
            return true;
        }

        let area = self.scene.rect(r.node).expanded(r.settings.extents);
        let bounds = self.scene.relative_bounds(r.node, source.node);
        area.overlaps(&bounds, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_scale() {
        assert!(is_visible_scale(Vec3::ONE));
        assert!(is_visible_scale(Vec3::new(-1.0, 2.0, 0.0)));
        assert!(!is_visible_scale(Vec3::new(0.0, 1.0, 1.0)));
    }
}
