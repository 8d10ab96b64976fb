//! Bake pipeline integration tests
//!
//! Drive whole frames through a compositor backed by the headless device and
//! check dirty handling, draw order, target sharing, culling and failure
//! isolation against the recorded submissions.

use composite_canvas::geometry::build_quad;
use composite_canvas::{
    BakeOutcome, BakingTrigger, Camera, Canvas, Compositor, DirtyRequest, LocalTransform, NodeId, RectLayout,
    RenderMode, RendererId, RendererSettings, Widget,
};
use composite_core::{BakeSettings, Color, Mat4, Quat, Rect, TransformSensitivity, Vec3};
use composite_gpu::{Command, HeadlessDevice, Mesh, TextureRef};

// ─────────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────────

struct Fixture {
    c: Compositor<HeadlessDevice>,
    canvas: NodeId,
    panel: NodeId,
}

fn quad_widget(color: Color) -> Widget {
    let mut mesh = Mesh::new();
    build_quad(&mut mesh, Rect::new(-10.0, -10.0, 20.0, 20.0), [255; 4]);
    Widget::new(mesh).with_color(color)
}

fn fixture(settings: BakeSettings) -> Fixture {
    let mut c = Compositor::new(HeadlessDevice::new(1920, 1080), settings);
    let scene = c.scene_mut();
    let canvas = scene.add_node(None, "canvas").unwrap();
    scene.set_canvas(canvas, Some(Canvas::default())).unwrap();
    scene.set_layout(canvas, RectLayout::new(800.0, 600.0)).unwrap();
    let panel = scene.add_node(Some(canvas), "panel").unwrap();
    Fixture { c, canvas, panel }
}

impl Fixture {
    fn leaf(&mut self, parent: NodeId, name: &str, color: Color) -> NodeId {
        let scene = self.c.scene_mut();
        let id = scene.add_node(Some(parent), name).unwrap();
        scene.set_widget(id, Some(quad_widget(color))).unwrap();
        id
    }

    fn renderer(&mut self, node: NodeId, settings: RendererSettings) -> RendererId {
        self.c.add_renderer(node, settings).unwrap()
    }

    /// Run frames until one bakes nothing.
    fn settle(&mut self) {
        for _ in 0..5 {
            if self.c.frame().is_empty() {
                return;
            }
        }
        panic!("compositor did not settle");
    }

    fn last_draws(&self) -> Vec<(Mat4, Option<Color>, Option<TextureRef>)> {
        let submission = self.c.device().last_submission().expect("no submission");
        submission
            .commands
            .iter()
            .filter_map(|cmd| match cmd {
                Command::DrawMesh {
                    matrix, properties, ..
                } => Some((*matrix, properties.color, properties.main_texture)),
                _ => None,
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dirty handling
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_first_frame_bakes_and_settles() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());

    assert!(f.c.is_dirty(r));
    assert_eq!(f.c.frame(), &[r]);
    assert!(!f.c.is_dirty(r));
    assert!(f.c.output_texture(r).is_some());

    f.settle();
    let before = f.c.baked_count();
    f.c.frame();
    f.c.frame();
    assert_eq!(f.c.baked_count(), before);
}

#[test]
fn test_repeated_dirty_requests_bake_once() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();

    let before = f.c.baked_count();
    assert_eq!(f.c.set_dirty(r, true).unwrap(), DirtyRequest::Accepted);
    for _ in 0..4 {
        assert_eq!(f.c.set_dirty(r, true).unwrap(), DirtyRequest::AlreadyDirty);
    }
    f.c.frame();
    assert_eq!(f.c.baked_count(), before + 1);
    assert!(!f.c.is_dirty(r));
}

#[test]
fn test_bake_is_guarded_per_frame() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());

    f.c.begin_frame();
    f.c.before_canvas_rebuild();
    f.c.rebuild_geometry();
    assert_eq!(f.c.bake(r), BakeOutcome::Baked);
    f.c.set_dirty(r, true).unwrap();
    assert_eq!(f.c.bake(r), BakeOutcome::AlreadyBaked);
    assert_eq!(f.c.baked_count(), 1);

    // The request survives into the next frame.
    assert_eq!(f.c.frame(), &[r]);
}

#[test]
fn test_failed_preconditions_do_not_count() {
    let mut f = fixture(BakeSettings::default());
    let (canvas, panel) = (f.canvas, f.panel);
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();
    let before = f.c.baked_count();

    // Nothing on screen.
    f.c.scene_mut().set_position(leaf, Vec3::new(5000.0, 0.0, 0.0)).unwrap();
    f.c.set_dirty(r, true).unwrap();
    f.c.begin_frame();
    f.c.before_canvas_rebuild();
    f.c.rebuild_geometry();
    assert_eq!(f.c.bake(r), BakeOutcome::NothingOnScreen);
    assert_eq!(f.c.baked_count(), before);

    // No canvas.
    f.c.scene_mut().set_position(leaf, Vec3::ZERO).unwrap();
    f.c.scene_mut().set_canvas(canvas, None).unwrap();
    f.c.set_dirty(r, true).unwrap();
    f.c.begin_frame();
    assert_eq!(f.c.bake(r), BakeOutcome::NoCanvas);
    assert_eq!(f.c.baked_count(), before);
}

#[test]
fn test_manual_trigger_only_bakes_on_forced_request() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default().with_trigger(BakingTrigger::Manually));

    assert!(!f.c.is_dirty(r));
    assert!(f.c.frame().is_empty());

    f.c.scene_mut().set_position(leaf, Vec3::new(20.0, 0.0, 0.0)).unwrap();
    assert!(f.c.frame().is_empty());

    assert_eq!(f.c.set_dirty(r, false).unwrap(), DirtyRequest::Cancelled);
    assert_eq!(f.c.set_dirty(r, true).unwrap(), DirtyRequest::Accepted);
    assert_eq!(f.c.frame(), &[r]);
}

#[test]
fn test_always_trigger_bakes_every_frame() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default().with_trigger(BakingTrigger::Always));
    for _ in 0..3 {
        assert_eq!(f.c.frame(), &[r]);
    }
}

#[test]
fn test_on_enable_trigger_bakes_once_per_enable() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default().with_trigger(BakingTrigger::OnEnable));

    assert_eq!(f.c.frame(), &[r]);
    assert!(f.c.frame().is_empty());
    assert!(f.c.frame().is_empty());

    // Transform watches are off.
    f.c.scene_mut().set_position(leaf, Vec3::new(20.0, 0.0, 0.0)).unwrap();
    assert!(f.c.frame().is_empty());

    f.c.set_renderer_enabled(r, false).unwrap();
    f.c.set_renderer_enabled(r, true).unwrap();
    assert_eq!(f.c.frame(), &[r]);
    assert_eq!(f.c.baked_count(), 2);
}

#[test]
fn test_widget_edit_dirties_owner() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();

    f.c.scene_mut()
        .update_widget(leaf, |w| w.color = Color::rgba(1.0, 0.0, 0.0, 1.0))
        .unwrap();
    assert_eq!(f.c.frame(), &[r]);
    let draws = f.last_draws();
    assert_eq!(draws[0].1, Some(Color::rgba(1.0, 0.0, 0.0, 1.0)));
}

#[test]
fn test_inactive_renderer_refuses_dirty() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();

    f.c.set_renderer_enabled(r, false).unwrap();
    assert_eq!(f.c.set_dirty(r, true).unwrap(), DirtyRequest::Inactive);
    assert!(f.c.output_texture(r).is_none());
    assert_eq!(f.c.target_registry().active_count(), 0);

    f.c.set_renderer_enabled(r, true).unwrap();
    assert!(f.c.is_dirty(r));
    assert_eq!(f.c.frame(), &[r]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Transform sensitivity and perspective
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_low_sensitivity_ignores_small_moves() {
    let settings = BakeSettings::default().with_transform_sensitivity(TransformSensitivity::Low);
    let mut f = fixture(settings);
    let panel = f.panel;
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();

    f.c.scene_mut().set_position(leaf, Vec3::new(0.1, 0.0, 0.0)).unwrap();
    assert!(f.c.frame().is_empty());

    f.c.scene_mut().set_position(leaf, Vec3::new(10.0, 0.0, 0.0)).unwrap();
    assert_eq!(f.c.frame(), &[r]);
}

#[test]
fn test_renderer_scale_change_rebuilds_output() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();

    let mut t = f.c.scene().node(panel).unwrap().transform;
    t.scale = Vec3::new(2.0, 2.0, 1.0);
    f.c.scene_mut().set_transform(panel, t).unwrap();
    assert_eq!(f.c.frame(), &[r]);
}

#[test]
fn test_out_of_plane_source_switches_to_perspective() {
    let mut f = fixture(BakeSettings::default());
    let (canvas, panel) = (f.canvas, f.panel);
    let camera = Camera::perspective(60.0, 800.0 / 600.0, 0.3, 1000.0, Mat4::translation(0.0, 0.0, -500.0));
    let mut settings = Canvas {
        render_mode: RenderMode::ScreenSpaceCamera,
        camera: Some(camera),
        ..Default::default()
    };
    f.c.scene_mut().set_canvas(canvas, Some(settings)).unwrap();
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());

    f.c.begin_frame();
    assert!(!f.c.is_perspective(r));

    f.c.scene_mut().set_position(leaf, Vec3::new(0.0, 0.0, 0.01)).unwrap();
    // Cached for the rest of the frame.
    assert!(!f.c.is_perspective(r));
    f.c.begin_frame();
    assert!(f.c.is_perspective(r));

    // Orthographic cameras never bake in perspective.
    settings.camera = Some(Camera {
        orthographic: true,
        ..camera
    });
    f.c.scene_mut().set_canvas(canvas, Some(settings)).unwrap();
    f.c.begin_frame();
    assert!(!f.c.is_perspective(r));
}

#[test]
fn test_slight_tilt_switches_to_perspective() {
    let mut f = fixture(BakeSettings::default());
    let (canvas, panel) = (f.canvas, f.panel);
    let camera = Camera::perspective(60.0, 800.0 / 600.0, 0.3, 1000.0, Mat4::translation(0.0, 0.0, -500.0));
    let settings = Canvas {
        render_mode: RenderMode::ScreenSpaceCamera,
        camera: Some(camera),
        ..Default::default()
    };
    f.c.scene_mut().set_canvas(canvas, Some(settings)).unwrap();
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());

    let tilted = LocalTransform {
        rotation: Quat::from_euler_degrees(0.0, 1.0, 0.0),
        ..Default::default()
    };
    f.c.scene_mut().set_transform(leaf, tilted).unwrap();
    f.c.begin_frame();
    assert!(f.c.is_perspective(r));

    // Rolling in plane keeps the orthographic bake.
    let rolled = LocalTransform {
        rotation: Quat::from_euler_degrees(0.0, 0.0, 45.0),
        ..Default::default()
    };
    f.c.scene_mut().set_transform(leaf, rolled).unwrap();
    f.c.begin_frame();
    assert!(!f.c.is_perspective(r));
}

#[test]
fn test_perspective_draws_use_world_matrices() {
    let mut f = fixture(BakeSettings::default());
    let (canvas, panel) = (f.canvas, f.panel);
    let camera = Camera::perspective(60.0, 800.0 / 600.0, 0.3, 1000.0, Mat4::IDENTITY);
    let canvas_settings = Canvas {
        render_mode: RenderMode::ScreenSpaceCamera,
        camera: Some(camera),
        ..Default::default()
    };
    f.c.scene_mut().set_canvas(canvas, Some(canvas_settings)).unwrap();
    f.c.scene_mut().set_position(panel, Vec3::new(30.0, 0.0, 0.0)).unwrap();
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    f.c.scene_mut().set_position(leaf, Vec3::new(0.0, 0.0, 5.0)).unwrap();
    f.renderer(panel, RendererSettings::default());
    f.c.frame();

    let world = f.c.scene().local_to_world(leaf);
    let draws = f.last_draws();
    assert!(draws[0].0.approx_eq(&world, 1e-4));
}

// ─────────────────────────────────────────────────────────────────────────────
// Draw order
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_draws_follow_depth_then_hierarchy() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let a = f.leaf(panel, "a", Color::rgba(0.2, 0.0, 0.0, 1.0));
    let b = f.leaf(panel, "b", Color::rgba(0.4, 0.0, 0.0, 1.0));
    let c = f.leaf(panel, "c", Color::rgba(0.6, 0.0, 0.0, 1.0));
    for (node, depth) in [(a, 2), (b, 0), (c, 1)] {
        f.c.scene_mut().update_widget(node, |w| w.depth = Some(depth)).unwrap();
    }
    f.renderer(panel, RendererSettings::default());
    f.c.frame();

    let reds: Vec<f32> = f.last_draws().iter().filter_map(|d| d.1).map(|c| c.r).collect();
    assert_eq!(reds, vec![0.4, 0.6, 0.2]);

    // Without depth, sibling order decides.
    for node in [a, b, c] {
        f.c.scene_mut().update_widget(node, |w| w.depth = None).unwrap();
    }
    f.c.frame();
    let reds: Vec<f32> = f.last_draws().iter().filter_map(|d| d.1).map(|c| c.r).collect();
    assert_eq!(reds, vec![0.2, 0.4, 0.6]);
}

#[test]
fn test_ignore_flags_exclude_nodes() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let group = f.leaf(panel, "group", Color::rgba(0.1, 0.0, 0.0, 1.0));
    f.leaf(group, "child", Color::rgba(0.2, 0.0, 0.0, 1.0));
    let solo = f.leaf(panel, "solo", Color::rgba(0.3, 0.0, 0.0, 1.0));
    let r = f.renderer(panel, RendererSettings::default());
    f.c.frame();
    assert_eq!(f.last_draws().len(), 3);

    f.c.set_ignore_children(group, true).unwrap();
    f.c.set_ignore_self(solo, true).unwrap();
    assert!(f.c.is_dirty(r));
    f.c.frame();
    let reds: Vec<f32> = f.last_draws().iter().filter_map(|d| d.1).map(|c| c.r).collect();
    assert_eq!(reds, vec![0.1]);
}

#[test]
fn test_ignored_only_source_does_not_bake() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let leaf = f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();
    let before = f.c.baked_count();

    f.c.set_ignore_self(leaf, true).unwrap();
    assert!(f.c.is_dirty(r));
    assert!(f.c.frame().is_empty());
    assert_eq!(f.c.baked_count(), before);

    f.c.begin_frame();
    assert_eq!(f.c.bake(r), BakeOutcome::NothingOnScreen);

    f.c.set_ignore_self(leaf, false).unwrap();
    assert_eq!(f.c.frame(), &[r]);
}

#[test]
fn test_alpha_textures_sample_additively() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    let leaf = f.leaf(panel, "text", Color::WHITE);
    f.c.scene_mut()
        .update_widget(leaf, |w| {
            *w = w
                .clone()
                .with_texture(composite_gpu::TextureId(9), composite_canvas::TextureFormat::Alpha8)
        })
        .unwrap();
    f.renderer(panel, RendererSettings::default());
    f.c.frame();

    let submission = f.c.device().last_submission().unwrap();
    let props = submission
        .commands
        .iter()
        .find_map(|cmd| match cmd {
            Command::DrawMesh { properties, .. } => Some(properties.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(props.main_texture, Some(TextureRef::External(composite_gpu::TextureId(9))));
    assert_eq!(props.texture_sample_add, Some([1.0, 1.0, 1.0, 0.0]));
}

#[test]
fn test_group_alpha_above_renderer_is_undone() {
    let mut f = fixture(BakeSettings::default());
    let (canvas, panel) = (f.canvas, f.panel);
    f.c.scene_mut().set_alpha(canvas, 0.5).unwrap();
    f.leaf(panel, "leaf", Color::WHITE);
    f.renderer(panel, RendererSettings::default());
    f.c.frame();

    // Captured alpha 0.5, scaled back by 1 / 0.5.
    let color = f.last_draws()[0].1.unwrap();
    assert!((color.a - 1.0).abs() < 1e-5);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sharing groups
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_sharing_group_aliases_one_target() {
    let mut f = fixture(BakeSettings::default());
    let canvas = f.canvas;
    let p1 = f.panel;
    let p2 = f.c.scene_mut().add_node(Some(canvas), "panel2").unwrap();
    f.leaf(p1, "l1", Color::WHITE);
    f.leaf(p2, "l2", Color::WHITE);
    let r1 = f.renderer(p1, RendererSettings::default().with_sharing_group(7));
    let r2 = f.renderer(p2, RendererSettings::default().with_sharing_group(7));

    let before = f.c.baked_count();
    assert_eq!(f.c.frame(), &[r1]);
    assert_eq!(f.c.baked_count(), before + 1);
    assert_eq!(f.c.output_texture(r1), f.c.output_texture(r2));
    assert_eq!(f.c.device().live_targets(), 1);

    f.settle();
    f.c.update_renderer(r2, |s| s.sharing_group = 0).unwrap();
    assert_eq!(f.c.frame(), &[r2]);
    assert_ne!(f.c.output_texture(r1), f.c.output_texture(r2));
    assert_eq!(f.c.device().live_targets(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Culling
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_culled_source_is_excluded_and_returns() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "stay", Color::WHITE);
    let roamer = f.leaf(panel, "roamer", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();

    // Off screen: not watched, not drawn.
    f.c.scene_mut().set_position(roamer, Vec3::new(5000.0, 0.0, 0.0)).unwrap();
    assert!(f.c.frame().is_empty());
    f.c.set_dirty(r, true).unwrap();
    f.c.frame();
    assert_eq!(f.last_draws().len(), 1);

    // Back in view at a new spot.
    f.c.scene_mut().set_position(roamer, Vec3::new(5.0, 0.0, 0.0)).unwrap();
    assert_eq!(f.c.frame(), &[r]);
    assert_eq!(f.last_draws().len(), 2);
}

#[test]
fn test_culling_disabled_draws_everything() {
    let mut f = fixture(BakeSettings::default().with_culling(false));
    let panel = f.panel;
    let far = f.leaf(panel, "far", Color::WHITE);
    f.c.scene_mut().set_position(far, Vec3::new(5000.0, 0.0, 0.0)).unwrap();
    f.renderer(panel, RendererSettings::default());
    f.c.frame();
    assert_eq!(f.last_draws().len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Failures
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_failed_submission_keeps_previous_output() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "leaf", Color::WHITE);
    let r = f.renderer(panel, RendererSettings::default());
    f.settle();
    let shown = f.c.output_texture(r);
    let before = f.c.baked_count();

    f.c.device_mut().fail_next_execute("device lost");
    f.c.set_dirty(r, true).unwrap();
    f.c.begin_frame();
    f.c.before_canvas_rebuild();
    f.c.rebuild_geometry();
    assert_eq!(f.c.bake(r), BakeOutcome::Failed);
    assert_eq!(f.c.output_texture(r), shown);
    assert_eq!(f.c.baked_count(), before);
    assert!(!f.c.is_dirty(r));
}

#[test]
fn test_missing_pop_material_skips_only_that_draw() {
    let mut f = fixture(BakeSettings::default());
    let panel = f.panel;
    f.leaf(panel, "a", Color::WHITE);
    f.leaf(panel, "b", Color::WHITE);
    f.renderer(panel, RendererSettings::default().with_stencil(true));
    f.c.frame();
    assert_eq!(f.last_draws().len(), 2);
}
