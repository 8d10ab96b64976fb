//! Renderer output geometry and materials
//!
//! Every renderer presents its bake through a quad covering the rendering
//! rect, drawn with a material derived from its color and blend settings.
//! Effects reshape the quad; perspective bakes flatten it back into the
//! root canvas plane.

use composite_core::{gamma_to_linear_rgba8, Mat4, Rect, Vec2, Vec3};
use composite_gpu::{GpuDevice, MaterialKey, Mesh, UiVertex};

use crate::compositor::Compositor;
use crate::error::Result;
use crate::renderer::RendererId;

/// Replace `mesh` with a quad over `rect`, tinted with `tint`.
pub fn build_quad(mesh: &mut Mesh, rect: Rect, tint: [u8; 4]) {
    mesh.clear();
    let (x0, x1, y0, y1) = (rect.x_min(), rect.x_max(), rect.y_min(), rect.y_max());
    mesh.add_vertex(UiVertex::new(Vec3::new(x0, y0, 0.0), tint, Vec2::new(0.0, 0.0)));
    mesh.add_vertex(UiVertex::new(Vec3::new(x0, y1, 0.0), tint, Vec2::new(0.0, 1.0)));
    mesh.add_vertex(UiVertex::new(Vec3::new(x1, y1, 0.0), tint, Vec2::new(1.0, 1.0)));
    mesh.add_vertex(UiVertex::new(Vec3::new(x1, y0, 0.0), tint, Vec2::new(1.0, 0.0)));
    mesh.add_triangle(0, 1, 2);
    mesh.add_triangle(2, 3, 0);
}

/// Undo the renderer's out-of-plane transform so the quad lies flat in
/// root canvas space at the renderer's position. `relative` maps renderer
/// space into root canvas space.
pub fn flatten_to_canvas(mesh: &mut Mesh, relative: &Mat4) {
    let Some(inverse) = relative.inverse() else {
        return;
    };
    let origin = relative.transform_point(Vec3::ZERO);
    let m = inverse.mul(&Mat4::translation(origin.x, origin.y, 0.0));
    for v in &mut mesh.vertices {
        let p = m.transform_point(v.position());
        v.position = [p.x, p.y, p.z];
    }
}

impl<D: GpuDevice> Compositor<D> {
    /// Refresh materials and output quads of every active renderer that
    /// asked for it.
    pub fn rebuild_geometry(&mut self) {
        let order: Vec<RendererId> = self.activation.iter().copied().collect();
        for id in order {
            if let Err(e) = self.update_materials(id) {
                tracing::warn!(renderer = ?id, error = %e, "material update failed");
            }
            self.rebuild_output(id);
        }
    }

    /// Re-resolve the presenting and blur materials through the registry.
    pub(crate) fn update_materials(&mut self, id: RendererId) -> Result<()> {
        let Some(r) = self.renderers.get_mut(id) else {
            return Ok(());
        };
        if !r.material_dirty {
            return Ok(());
        }
        r.material_dirty = false;

        let s = &r.settings;
        let key = MaterialKey::composite(s.color_mode, s.src_blend, s.dst_blend);
        self.materials.get(&mut self.device, key, &mut r.material)?;
        if r.active_effect().is_some() {
            self.materials.get(&mut self.device, MaterialKey::blur(), &mut r.blur_material)?;
        } else {
            self.materials.release(&mut self.device, &mut r.blur_material);
        }
        tracing::debug!(renderer = ?id, material = ?r.material, "materials updated");
        Ok(())
    }

    /// Rebuild the presenting quad.
    pub(crate) fn rebuild_output(&mut self, id: RendererId) {
        let Some(r) = self.renderers.get(id) else {
            return;
        };
        if !r.vertices_dirty {
            return;
        }
        let node = r.node;
        let rect = self.scene.rect(node).expanded(r.settings.extents);
        let mut tint = r.settings.color.to_rgba8();
        if self.scene.canvas(node).is_some_and(|(_, c)| c.linear_vertex_colors) {
            tint = gamma_to_linear_rgba8(tint);
        }

        let perspective = self.is_perspective(id);
        let relative = match self.scene.root_canvas(node) {
            Some((root, _)) if perspective => {
                Some(self.scene.world_to_local(root).mul(&self.scene.local_to_world(node)))
            }
            _ => None,
        };

        let r = &mut self.renderers[id];
        r.vertices_dirty = false;
        if rect.width() >= 0.0 && rect.height() >= 0.0 {
            build_quad(&mut r.output, rect, tint);
        } else {
            r.output.clear();
        }
        if let Some(slot) = r.effect.as_mut().filter(|s| s.enabled) {
            slot.effect.modify_mesh(&mut r.output, rect, tint);
        }
        if let Some(relative) = relative {
            flatten_to_canvas(&mut r.output, &relative);
        }
        tracing::trace!(renderer = ?id, vertices = r.output.vertex_count(), "output rebuilt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use composite_core::Quat;

    #[test]
    fn test_quad_layout() {
        let mut mesh = Mesh::new();
        build_quad(&mut mesh, Rect::new(-5.0, -5.0, 10.0, 20.0), [255; 4]);
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 2, 3, 0]);
        assert_eq!(mesh.vertices[1].position, [-5.0, 15.0, 0.0]);
        assert_eq!(mesh.vertices[3].uv, [1.0, 0.0]);
    }

    #[test]
    fn test_flatten_removes_tilt() {
        let mut mesh = Mesh::new();
        build_quad(&mut mesh, Rect::new(-1.0, -1.0, 2.0, 2.0), [255; 4]);
        let tilt = Quat::from_euler_degrees(0.0, 30.0, 0.0);
        let relative = Mat4::trs(Vec3::new(3.0, 4.0, 5.0), tilt, Vec3::ONE);
        flatten_to_canvas(&mut mesh, &relative);

        // Mapped back through the renderer transform, the quad lies in z=0
        // around the renderer position.
        for v in &mesh.vertices {
            let p = relative.transform_point(v.position());
            assert!(p.z.abs() < 1e-4);
        }
        let center = relative.transform_point(
            (mesh.vertices[0].position() + mesh.vertices[2].position()) * 0.5,
        );
        assert!((center - Vec3::new(3.0, 4.0, 0.0)).length() < 1e-4);
    }
}
