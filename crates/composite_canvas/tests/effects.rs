//! Effect integration tests
//!
//! Effects attached to renderers: post passes recorded into the bake, quad
//! modifications, and the dirty/geometry requests parameter edits make.

use composite_canvas::geometry::build_quad;
use composite_canvas::{
    Canvas, Compositor, Effect, EffectPreset, NodeId, OutlinePattern, RectLayout, RendererId, RendererSettings,
    ShadowParams, Widget,
};
use composite_core::{BakeSettings, Rect, Vec2};
use composite_gpu::{BlitPass, Command, HeadlessDevice, Mesh};

fn baked_panel() -> (Compositor<HeadlessDevice>, RendererId) {
    let mut c = Compositor::new(HeadlessDevice::default(), BakeSettings::default());
    let scene = c.scene_mut();
    let canvas = scene.add_node(None, "canvas").unwrap();
    scene.set_canvas(canvas, Some(Canvas::default())).unwrap();
    scene.set_layout(canvas, RectLayout::new(800.0, 600.0)).unwrap();
    let panel: NodeId = scene.add_node(Some(canvas), "panel").unwrap();
    let leaf = scene.add_node(Some(panel), "leaf").unwrap();
    let mut mesh = Mesh::new();
    build_quad(&mut mesh, Rect::new(-5.0, -5.0, 10.0, 10.0), [255; 4]);
    scene.set_widget(leaf, Some(Widget::new(mesh))).unwrap();

    let r = c.add_renderer(panel, RendererSettings::default()).unwrap();
    for _ in 0..3 {
        c.frame();
    }
    (c, r)
}

fn last_commands(c: &Compositor<HeadlessDevice>) -> Vec<Command> {
    c.device().last_submission().unwrap().commands.clone()
}

#[test]
fn test_glow_temporaries_are_balanced() {
    let (mut c, r) = baked_panel();
    c.apply_preset(r, EffectPreset::Glow).unwrap();
    assert_eq!(c.frame(), &[r]);

    let commands = last_commands(&c);
    let gets = commands.iter().filter(|cmd| matches!(cmd, Command::GetTemporary { .. })).count();
    let releases = commands.iter().filter(|cmd| matches!(cmd, Command::ReleaseTemporary(_))).count();
    assert_eq!(gets, 1);
    assert_eq!(gets, releases);

    let passes: Vec<BlitPass> = commands
        .iter()
        .filter_map(|cmd| match cmd {
            Command::Blit { pass, .. } => Some(*pass),
            _ => None,
        })
        .collect();
    // Ten iterations, cutoff fused into the last vertical pass.
    assert_eq!(passes.len(), 20);
    assert_eq!(passes.last(), Some(&BlitPass::BlurCutoff));
    assert!(c.device().live_materials() >= 3);
}

#[test]
fn test_removing_effect_releases_blur_material() {
    let (mut c, r) = baked_panel();
    c.set_effect(r, Some(Effect::Blur(Default::default()))).unwrap();
    c.frame();
    let with_blur = c.material_registry().active_count();

    c.set_effect(r, None).unwrap();
    assert_eq!(c.frame(), &[r]);
    assert_eq!(c.material_registry().active_count(), with_blur - 1);
    assert!(!last_commands(&c).iter().any(|cmd| matches!(cmd, Command::Blit { .. })));
}

#[test]
fn test_shadow_distance_is_geometry_only() {
    let (mut c, r) = baked_panel();
    c.set_effect(r, Some(Effect::Shadow(ShadowParams::default()))).unwrap();
    c.set_effect_enabled(r, true).unwrap();
    for _ in 0..3 {
        c.frame();
    }
    let before = c.baked_count();
    let quad_x = c.renderer(r).unwrap().output_mesh().vertices[0].position[0];

    c.update_effect(r, |e| {
        if let Effect::Shadow(s) = e {
            s.distance = Vec2::new(8.0, -8.0);
        }
    })
    .unwrap();
    assert!(!c.is_dirty(r));
    c.frame();
    assert_eq!(c.baked_count(), before);
    let moved = c.renderer(r).unwrap().output_mesh().vertices[0].position[0];
    assert!((moved - quad_x - 7.0).abs() < 1e-4);
}

#[test]
fn test_blur_change_forces_rebake() {
    let (mut c, r) = baked_panel();
    c.set_effect(r, Some(Effect::Blur(Default::default()))).unwrap();
    for _ in 0..3 {
        c.frame();
    }

    c.update_effect(r, |e| {
        if let Effect::Blur(b) = e {
            b.blur = 1.0;
        }
    })
    .unwrap();
    assert!(c.is_dirty(r));
    assert_eq!(c.frame(), &[r]);
}

#[test]
fn test_outline_pattern_changes_vertex_count() {
    let (mut c, r) = baked_panel();
    c.apply_preset(r, EffectPreset::Outline).unwrap();
    c.frame();
    let x4 = c.renderer(r).unwrap().output_mesh().vertex_count();

    c.update_effect(r, |e| {
        if let Effect::Outline(o) = e {
            o.pattern = OutlinePattern::X8;
        }
    })
    .unwrap();
    c.frame();
    let x8 = c.renderer(r).unwrap().output_mesh().vertex_count();
    assert_eq!(x4, 16);
    assert_eq!(x8, 32);
}

#[test]
fn test_disabled_effect_records_nothing() {
    let (mut c, r) = baked_panel();
    c.apply_preset(r, EffectPreset::Bloom).unwrap();
    c.set_effect_enabled(r, false).unwrap();
    assert_eq!(c.frame(), &[r]);
    assert!(!last_commands(&c).iter().any(|cmd| matches!(cmd, Command::Blit { .. })));
    assert_eq!(c.renderer(r).unwrap().output_mesh().vertex_count(), 4);
}
