use composite_canvas::geometry::build_quad;
use composite_canvas::{
    sort_leaves, Canvas, Compositor, Leaf, NodeId, RectLayout, RendererId, RendererSettings, WalkStep, Widget,
};
use composite_core::{BakeSettings, Rect};
use composite_gpu::{HeadlessDevice, Mesh};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const WIDTHS: &[usize] = &[16, 64, 256];
const DEPTH: usize = 4;

struct WalkFixture {
    compositor: Compositor<HeadlessDevice>,
    panel: NodeId,
    renderer: RendererId,
}

impl WalkFixture {
    /// `width` columns below the renderer, each a chain of `DEPTH` widgets.
    fn new(width: usize, stencil: bool) -> Self {
        let mut compositor = Compositor::new(HeadlessDevice::default(), BakeSettings::default());
        let mut mesh = Mesh::new();
        build_quad(&mut mesh, Rect::new(-2.0, -2.0, 4.0, 4.0), [255; 4]);

        let scene = compositor.scene_mut();
        let canvas = scene.add_node(None, "canvas").expect("canvas");
        scene.set_canvas(canvas, Some(Canvas::default())).expect("canvas component");
        scene.set_layout(canvas, RectLayout::new(1920.0, 1080.0)).expect("canvas layout");
        let panel = scene.add_node(Some(canvas), "panel").expect("panel");
        scene.set_layout(panel, RectLayout::new(1600.0, 900.0)).expect("panel layout");

        for column in 0..width {
            let mut parent = panel;
            for level in 0..DEPTH {
                let node = scene
                    .add_node(Some(parent), format!("item-{column}-{level}"))
                    .expect("item");
                // Every other column carries an explicit depth to mix both orderings.
                let mut widget = Widget::new(mesh.clone());
                if column % 2 == 0 {
                    widget = widget.with_depth((width - column) as i32);
                }
                scene.set_widget(node, Some(widget)).expect("widget");
                parent = node;
            }
        }

        let settings = RendererSettings::default().with_stencil(stencil);
        let renderer = compositor.add_renderer(panel, settings).expect("renderer");
        compositor.frame();
        Self {
            compositor,
            panel,
            renderer,
        }
    }

    fn walk(&mut self) -> Vec<WalkStep> {
        self.compositor.begin_frame();
        self.compositor.walk(self.renderer)
    }

    fn leaves(&mut self) -> Vec<Leaf> {
        self.walk()
            .into_iter()
            .filter_map(|step| match step {
                WalkStep::Draw(leaf) => Some(leaf),
                WalkStep::Pop(_) => None,
            })
            .collect()
    }
}

fn bench_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("walk");
    for &width in WIDTHS {
        let mut fixture = WalkFixture::new(width, false);
        group.bench_with_input(BenchmarkId::new("flat", width), &width, |b, _| {
            b.iter(|| black_box(fixture.walk()))
        });

        let mut stencil = WalkFixture::new(width, true);
        group.bench_with_input(BenchmarkId::new("stencil", width), &width, |b, _| {
            b.iter(|| black_box(stencil.walk()))
        });
    }
    group.finish();
}

fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_leaves");
    for &width in WIDTHS {
        let mut fixture = WalkFixture::new(width, false);
        let mut leaves = fixture.leaves();
        leaves.reverse();
        let scene = fixture.compositor.scene();
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                let mut shuffled = leaves.clone();
                sort_leaves(scene, fixture.panel, &mut shuffled);
                black_box(shuffled)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_walk, bench_sort);
criterion_main!(benches);
