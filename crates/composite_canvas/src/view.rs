//! View and projection for bakes
//!
//! Orthographic bakes map the renderer's rendering rect onto the whole
//! target. Perspective bakes reuse the canvas camera, re-targeted so the
//! renderer's rect fills the target while depth is kept from the camera.

use composite_core::{Mat4, Quat, Vec2, Vec3};
use composite_gpu::GpuDevice;

use crate::compositor::{CacheObject, Compositor};
use crate::renderer::{RendererId, ViewType};
use crate::scene::{Camera, NodeId, RenderMode};

/// Depth range of orthographic bakes
const ORTHO_DEPTH: f32 = 10_000.0;

fn safe_recip(v: f32) -> f32 {
    if v == 0.0 {
        0.0
    } else {
        1.0 / v
    }
}

/// Projection mapping a rect of `size` with `pivot` (in `[-1, 1]`) onto
/// clip space.
pub fn orthographic_projection(size: Vec2, pivot: Vec2) -> Mat4 {
    Mat4::trs(
        Vec3::new(pivot.x, pivot.y, 0.0),
        Quat::IDENTITY,
        Vec3::new(2.0 * safe_recip(size.x), 2.0 * safe_recip(size.y), -2.0 / ORTHO_DEPTH),
    )
}

/// Re-target a camera projection onto one renderer.
///
/// `relative` maps the renderer's space into the root canvas space, `size`
/// is the rendering size and `root_size` the root canvas size. The depth
/// row of the camera projection is preserved.
pub fn perspective_projection(projection: Mat4, relative: Mat4, size: Vec2, root_size: Vec2, pivot: Vec2) -> Mat4 {
    let origin = relative.transform_point(Vec3::ZERO);
    let inv = Vec3::new(safe_recip(size.x), safe_recip(size.y), 1.0);
    let t = Vec3::new(
        -2.0 * origin.x * inv.x + pivot.x,
        -2.0 * origin.y * inv.y + pivot.y,
        -origin.z * inv.z,
    );
    let s = Vec3::new(root_size.x * inv.x, root_size.y * inv.y, 0.0);

    let mut m = Mat4::translation(t.x, t.y, t.z)
        .mul(&Mat4::scale(s.x, s.y, s.z))
        .mul(&projection);
    m.set(2, 2, projection.get(2, 2));
    m.set(2, 3, projection.get(2, 3));
    m
}

impl<D: GpuDevice> Compositor<D> {
    /// Rect pivot remapped from `[0, 1]` to `[-1, 1]`
    fn clip_pivot(&self, node: NodeId) -> Vec2 {
        let pivot = self.scene.node(node).map_or(Vec2::new(0.5, 0.5), |n| n.layout.pivot);
        pivot * 2.0 - Vec2::ONE
    }

    /// Camera of the root canvas, when the renderer's canvas is presented
    /// through a perspective camera
    fn perspective_camera(&self, id: RendererId) -> Option<Camera> {
        let node = self.renderers.get(id)?.node;
        let (_, canvas) = self.scene.canvas(node)?;
        if canvas.render_mode != RenderMode::ScreenSpaceCamera {
            return None;
        }
        let (_, root) = self.scene.root_canvas(node)?;
        let camera = root.camera.or(canvas.camera)?;
        (!camera.orthographic).then_some(camera)
    }

    /// Whether the renderer bakes through the canvas camera
    pub fn is_perspective(&mut self, id: RendererId) -> bool {
        let Some(view_type) = self.renderers.get(id).map(|r| r.settings.view_type) else {
            return false;
        };
        if view_type == ViewType::Orthographic || self.perspective_camera(id).is_none() {
            return false;
        }
        if view_type == ViewType::Perspective {
            return true;
        }

        let object = CacheObject::Renderer(id);
        if let Some(perspective) = self.cache.get::<bool>(object, "perspective") {
            return perspective;
        }
        let perspective = self.has_out_of_plane_source(id);
        self.cache.set(object, "perspective", perspective);
        perspective
    }

    /// Any source displaced in depth or tilted against the renderer plane
    fn has_out_of_plane_source(&self, id: RendererId) -> bool {
        let r = &self.renderers[id];
        let to_renderer = self.scene.world_to_local(r.node);
        let epsilon = self.settings.perspective_epsilon;
        r.sources.iter().filter_map(|sid| self.sources.get(*sid)).any(|s| {
            if self.scene.widget(s.node).is_none() {
                return false;
            }
            let relative = to_renderer.mul(&self.scene.local_to_world(s.node));
            epsilon < relative.translation_part().z.abs() || epsilon < tilt_degrees_sq(relative.forward_axis())
        })
    }

    /// (view, projection) for one bake
    pub fn view_projection(&self, id: RendererId, perspective: bool) -> (Mat4, Mat4) {
        let Some(r) = self.renderers.get(id) else {
            return (Mat4::IDENTITY, Mat4::IDENTITY);
        };
        let size = self.rendering_size(id);
        let pivot = self.clip_pivot(r.node);

        let camera = if perspective { self.perspective_camera(id) } else { None };
        match camera {
            Some(camera) => {
                let Some((root, _)) = self.scene.root_canvas(r.node) else {
                    return (Mat4::IDENTITY, orthographic_projection(size, pivot));
                };
                let root_rect = self.scene.rect(root);
                let relative = self.scene.world_to_local(root).mul(&self.scene.local_to_world(r.node));
                let projection = perspective_projection(
                    camera.projection,
                    relative,
                    size,
                    Vec2::new(root_rect.width(), root_rect.height()),
                    pivot,
                );
                (camera.view, projection)
            }
            None => (Mat4::IDENTITY, orthographic_projection(size, pivot)),
        }
    }
}

/// Squared tilt of a forward axis about X and Y, in degrees
fn tilt_degrees_sq(forward: Vec3) -> f32 {
    let about_x = (-forward.y).atan2(forward.z).to_degrees();
    let about_y = forward.x.atan2(forward.z).to_degrees();
    about_x * about_x + about_y * about_y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orthographic_maps_rect_to_clip_space() {
        let p = orthographic_projection(Vec2::new(100.0, 50.0), Vec2::ZERO);
        let corner = p.transform_point(Vec3::new(50.0, 25.0, 0.0));
        assert!((corner - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_orthographic_pivot_shifts_origin() {
        // Pivot (0, 0) in rect units is (-1, -1) here.
        let p = orthographic_projection(Vec2::new(10.0, 10.0), Vec2::new(-1.0, -1.0));
        let far = p.transform_point(Vec3::new(10.0, 10.0, 0.0));
        assert!((far - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_degenerate_size_does_not_divide_by_zero() {
        let p = orthographic_projection(Vec2::ZERO, Vec2::ZERO);
        assert!(p.transform_point(Vec3::new(3.0, 3.0, 0.0)).x.is_finite());
    }

    #[test]
    fn test_tilt_is_measured_in_degrees() {
        assert_eq!(tilt_degrees_sq(Vec3::new(0.0, 0.0, 1.0)), 0.0);
        let one = Mat4::rotation(Quat::from_euler_degrees(0.0, 1.0, 0.0)).forward_axis();
        assert!((tilt_degrees_sq(one) - 1.0).abs() < 1e-3);
        let roll = Mat4::rotation(Quat::from_euler_degrees(0.0, 0.0, 30.0)).forward_axis();
        assert!(tilt_degrees_sq(roll) < 1e-6);
    }

    #[test]
    fn test_perspective_keeps_depth_row() {
        let camera = Camera::perspective(60.0, 1.0, 0.3, 1000.0, Mat4::IDENTITY);
        let relative = Mat4::translation(10.0, 0.0, 0.0);
        let p = perspective_projection(
            camera.projection,
            relative,
            Vec2::new(100.0, 100.0),
            Vec2::new(400.0, 400.0),
            Vec2::ZERO,
        );
        assert_eq!(p.get(2, 2), camera.projection.get(2, 2));
        assert_eq!(p.get(2, 3), camera.projection.get(2, 3));
        // x scaled by root/size
        assert!((p.get(0, 0) - camera.projection.get(0, 0) * 4.0).abs() < 1e-4);
    }
}
