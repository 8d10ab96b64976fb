//! Compositor
//!
//! [`Compositor`] is the render context of the pipeline. It owns the mirrored
//! scene, every renderer and source, the shared material and render target
//! registries, the per-frame cache and the object pools, and drives the
//! frame lifecycle:
//!
//! 1. [`Compositor::begin_frame`]: new cache generation, hierarchy events
//! 2. [`Compositor::before_canvas_rebuild`]: content capture and dirty checks
//! 3. [`Compositor::rebuild_geometry`]: materials and output quads
//! 4. [`Compositor::after_canvas_rebuild`]: bakes, in activation order
//!
//! [`Compositor::frame`] runs all four.

use composite_core::{approximately, BakeSettings, Color, FrameCache, Mat4, ResourcePool, Vec2};
use composite_gpu::{
    prefer_size, CommandBuffer, GpuDevice, MaterialHandle, MaterialKey, MaterialRegistry, Mesh, PropertyBlock,
    RenderTargetHandle, RenderTargetKey, RenderTargetRegistry, TargetOwner, TextureRef,
};
use indexmap::IndexSet;
use slotmap::{Key, SecondaryMap, SlotMap};
use smallvec::SmallVec;

use crate::effect::{Effect, EffectPreset};
use crate::error::{CompositeError, Result};
use crate::renderer::{BakingTrigger, DirtyRequest, EffectSlot, Renderer, RendererId, RendererSettings};
use crate::scene::{HierarchyEvent, NodeId, Scene, TextureFormat};
use crate::source::{Source, SourceId};
use crate::walker::WalkStep;

/// Frame cache identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheObject {
    Node(NodeId),
    Renderer(RendererId),
    Source(SourceId),
}

/// Result of one [`Compositor::bake`] call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BakeOutcome {
    Baked,
    /// Non-first member of a sharing group; uses the group target
    Aliased,
    AlreadyBaked,
    /// Not dirty
    Clean,
    /// Unknown or inactive renderer
    Inactive,
    NoCanvas,
    NothingOnScreen,
    /// Caught failure; the previous output stays displayed
    Failed,
}

/// Per-bake values shared by every draw
struct DrawContext {
    perspective: bool,
    world_to_renderer: Mat4,
    alpha_scale: f32,
    linear_in_shader: bool,
}

/// Bake pipeline over a device `D`
pub struct Compositor<D: GpuDevice> {
    pub(crate) device: D,
    pub(crate) settings: BakeSettings,
    pub(crate) scene: Scene,
    pub(crate) renderers: SlotMap<RendererId, Renderer>,
    pub(crate) sources: SlotMap<SourceId, Source>,
    pub(crate) node_renderer: SecondaryMap<NodeId, RendererId>,
    pub(crate) node_source: SecondaryMap<NodeId, SourceId>,
    /// Active renderers, in activation order
    pub(crate) activation: IndexSet<RendererId>,
    pub(crate) materials: MaterialRegistry,
    pub(crate) targets: RenderTargetRegistry,
    pub(crate) cache: FrameCache<CacheObject>,
    command_buffers: ResourcePool<CommandBuffer>,
    meshes: ResourcePool<Mesh>,
    property_blocks: ResourcePool<PropertyBlock>,
    next_instance: u64,
    baked_count: u64,
    baked_this_frame: Vec<RendererId>,
    bake_stack: SmallVec<[RendererId; 4]>,
}

fn new_command_buffer() -> CommandBuffer {
    CommandBuffer::new("bake")
}

impl<D: GpuDevice> Compositor<D> {
    pub fn new(device: D, settings: BakeSettings) -> Self {
        Self {
            device,
            settings,
            scene: Scene::new(),
            renderers: SlotMap::with_key(),
            sources: SlotMap::with_key(),
            node_renderer: SecondaryMap::new(),
            node_source: SecondaryMap::new(),
            activation: IndexSet::new(),
            materials: MaterialRegistry::new(),
            targets: RenderTargetRegistry::new(),
            cache: FrameCache::new(),
            command_buffers: ResourcePool::new("command_buffers", new_command_buffer, CommandBuffer::clear),
            meshes: ResourcePool::new("meshes", Mesh::new, Mesh::clear),
            property_blocks: ResourcePool::new("property_blocks", PropertyBlock::default, PropertyBlock::clear),
            next_instance: 1,
            baked_count: 0,
            baked_this_frame: Vec::new(),
            bake_stack: SmallVec::new(),
        }
    }

    /// Start from an existing scene.
    pub fn with_scene(mut self, scene: Scene) -> Self {
        self.scene = scene;
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn settings(&self) -> &BakeSettings {
        &self.settings
    }

    /// Replace the project settings. Every active renderer re-bakes.
    pub fn set_settings(&mut self, settings: BakeSettings) {
        self.settings = settings;
        for id in self.activation.iter() {
            if let Some(r) = self.renderers.get_mut(*id) {
                r.request_dirty(true);
            }
        }
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Structural edits are picked up at the next [`Compositor::begin_frame`].
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn renderer(&self, id: RendererId) -> Option<&Renderer> {
        self.renderers.get(id)
    }

    pub fn renderer_for_node(&self, node: NodeId) -> Option<RendererId> {
        self.node_renderer.get(node).copied()
    }

    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn source_for_node(&self, node: NodeId) -> Option<SourceId> {
        self.node_source.get(node).copied()
    }

    /// Active renderers in activation order
    pub fn active_renderers(&self) -> impl Iterator<Item = RendererId> + '_ {
        self.activation.iter().copied()
    }

    pub fn is_dirty(&self, id: RendererId) -> bool {
        self.renderers.get(id).is_some_and(|r| r.is_dirty())
    }

    /// Target presenting the last successful bake of `id`
    pub fn output_texture(&self, id: RendererId) -> Option<RenderTargetHandle> {
        self.renderers.get(id).and_then(|r| r.displayed)
    }

    /// Successful bakes since creation, over all renderers
    pub fn baked_count(&self) -> u64 {
        self.baked_count
    }

    /// Renderers that baked during the current frame
    pub fn baked_this_frame(&self) -> &[RendererId] {
        &self.baked_this_frame
    }

    pub fn material_registry(&self) -> &MaterialRegistry {
        &self.materials
    }

    pub fn target_registry(&self) -> &RenderTargetRegistry {
        &self.targets
    }

    /// (hits, misses) of the frame cache
    pub fn frame_cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    fn renderer_mut(&mut self, id: RendererId) -> Result<&mut Renderer> {
        self.renderers.get_mut(id).ok_or(CompositeError::RendererNotFound(id))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Renderers
    // ─────────────────────────────────────────────────────────────────────────

    /// Host a renderer on `node`. It is enabled immediately and becomes
    /// active once the node is active in the hierarchy.
    pub fn add_renderer(&mut self, node: NodeId, settings: RendererSettings) -> Result<RendererId> {
        if !self.scene.contains(node) {
            return Err(CompositeError::NodeNotFound(node));
        }
        if self.node_renderer.contains_key(node) {
            return Err(CompositeError::RendererExists(node));
        }

        let mut settings = settings;
        settings.sync_blend_factors();
        let instance = self.next_instance;
        self.next_instance += 1;

        let id = self.renderers.insert(Renderer::new(node, instance, settings));
        self.node_renderer.insert(node, id);
        self.renderers[id].enabled = true;
        tracing::debug!(renderer = ?id, ?node, instance, "renderer added");
        self.refresh_activity(id);
        Ok(id)
    }

    pub fn remove_renderer(&mut self, id: RendererId) -> Result<()> {
        let node = self.renderer_mut(id)?.node;
        self.renderers[id].enabled = false;
        self.refresh_activity(id);
        self.renderers.remove(id);
        self.node_renderer.remove(node);
        // The node's own source may have been skipped while the renderer sat
        // on the same node.
        if let Some(sid) = self.node_source.get(node).copied() {
            self.update_source_owner(sid);
        }
        tracing::debug!(renderer = ?id, ?node, "renderer removed");
        Ok(())
    }

    pub fn set_renderer_enabled(&mut self, id: RendererId, enabled: bool) -> Result<()> {
        let r = self.renderer_mut(id)?;
        if r.enabled == enabled {
            return Ok(());
        }
        r.enabled = enabled;
        self.refresh_activity(id);
        Ok(())
    }

    /// Edit renderer settings; side effects follow from what changed.
    pub fn update_renderer(&mut self, id: RendererId, f: impl FnOnce(&mut RendererSettings)) -> Result<()> {
        let r = self.renderer_mut(id)?;
        let old = r.settings.clone();
        f(&mut r.settings);
        if r.settings.blend_type != old.blend_type {
            r.settings.sync_blend_factors();
        }

        let change = r.settings.change_from(&old);
        if change.material {
            r.material_dirty = true;
        }
        if change.vertices {
            r.vertices_dirty = true;
        }
        if change.rebake {
            r.request_dirty(true);
        }
        if change.source_visibility {
            tracing::debug!(renderer = ?id, show = r.settings.show_source_graphics, "source visibility changed");
        }
        Ok(())
    }

    /// Request a re-bake.
    pub fn set_dirty(&mut self, id: RendererId, force: bool) -> Result<DirtyRequest> {
        Ok(self.renderer_mut(id)?.request_dirty(force))
    }

    fn refresh_activity(&mut self, id: RendererId) {
        let Some(r) = self.renderers.get(id) else {
            return;
        };
        let active = r.enabled && self.scene.is_active_in_hierarchy(r.node);
        if active == r.active {
            return;
        }
        if active {
            self.activate(id);
        } else {
            self.deactivate(id);
        }
    }

    fn activate(&mut self, id: RendererId) {
        let r = &mut self.renderers[id];
        r.active = true;
        r.vertices_dirty = true;
        r.material_dirty = true;
        let node = r.node;

        for n in self.scene.descendants(node).into_iter().skip(1) {
            self.ensure_source(n);
        }
        self.activation.insert(id);
        self.reresolve_sources_under(node);

        let r = &mut self.renderers[id];
        if r.settings.trigger != BakingTrigger::Manually {
            r.request_dirty(true);
        }
        tracing::debug!(renderer = ?id, sources = r.sources.len(), "renderer activated");
    }

    fn deactivate(&mut self, id: RendererId) {
        let r = &mut self.renderers[id];
        r.active = false;
        r.tracker.clear();
        if let Some(cb) = r.command_buffer.take() {
            self.command_buffers.give_back(cb);
        }
        self.targets.release(&mut self.device, &mut r.bake_target);
        r.displayed = None;
        self.materials.release(&mut self.device, &mut r.material);
        self.materials.release(&mut self.device, &mut r.blur_material);
        r.material_dirty = true;
        r.vertices_dirty = true;
        let node = r.node;

        self.activation.shift_remove(&id);
        self.reresolve_sources_under(node);
        tracing::debug!(renderer = ?id, "renderer deactivated");
    }

    fn first_grouped_renderer(&self, group: u32) -> Option<RendererId> {
        self.activation
            .iter()
            .copied()
            .find(|id| self.renderers.get(*id).is_some_and(|r| r.settings.sharing_group == group))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach, replace or (with `None`) detach the renderer's effect.
    pub fn set_effect(&mut self, id: RendererId, effect: Option<Effect>) -> Result<()> {
        let r = self.renderer_mut(id)?;
        let had = r.active_effect().is_some();
        r.effect = effect.map(|e| EffectSlot {
            effect: e.sanitized(),
            enabled: true,
        });
        if had || r.effect.is_some() {
            r.vertices_dirty = true;
            r.material_dirty = true;
            r.request_dirty(true);
        }
        Ok(())
    }

    pub fn set_effect_enabled(&mut self, id: RendererId, enabled: bool) -> Result<()> {
        let r = self.renderer_mut(id)?;
        let Some(slot) = r.effect.as_mut() else {
            return Ok(());
        };
        if slot.enabled == enabled {
            return Ok(());
        }
        slot.enabled = enabled;
        r.vertices_dirty = true;
        r.material_dirty = true;
        r.request_dirty(true);
        Ok(())
    }

    /// Edit the attached effect's parameters. Pixel changes force a re-bake;
    /// geometry changes only rebuild the output quad.
    pub fn update_effect(&mut self, id: RendererId, f: impl FnOnce(&mut Effect)) -> Result<()> {
        let r = self.renderer_mut(id)?;
        let Some(slot) = r.effect.as_mut() else {
            return Ok(());
        };
        let mut effect = slot.effect.clone();
        f(&mut effect);
        let mut effect = effect.sanitized();
        let change = effect.change_from(&slot.effect);
        if change.geometry {
            effect.invalidate_geometry_cache();
        }
        slot.effect = effect;
        let enabled = slot.enabled;

        if !enabled {
            return Ok(());
        }
        if change.pixels {
            r.request_dirty(true);
        }
        if change.geometry {
            r.vertices_dirty = true;
        }
        if change.pixels != change.geometry {
            r.material_dirty = true;
        }
        Ok(())
    }

    /// Attach a preset effect and the renderer settings it expects.
    pub fn apply_preset(&mut self, id: RendererId, preset: EffectPreset) -> Result<()> {
        self.update_renderer(id, |s| preset.apply_to(s))?;
        self.set_effect(id, Some(preset.effect()))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sources
    // ─────────────────────────────────────────────────────────────────────────

    fn ensure_source(&mut self, node: NodeId) -> SourceId {
        if let Some(sid) = self.node_source.get(node) {
            return *sid;
        }
        let source = Source::new(node, self.meshes.rent(), self.property_blocks.rent());
        let sid = self.sources.insert(source);
        self.node_source.insert(node, sid);
        tracing::trace!(source = ?sid, ?node, "source attached");
        sid
    }

    fn source_for(&mut self, node: NodeId) -> Result<SourceId> {
        if !self.scene.contains(node) {
            return Err(CompositeError::NodeNotFound(node));
        }
        let sid = self.ensure_source(node);
        self.update_source_owner(sid);
        Ok(sid)
    }

    fn remove_source(&mut self, sid: SourceId) {
        let Some(owner) = self.sources.get(sid).map(|s| s.renderer) else {
            return;
        };
        if let Some(rid) = owner {
            self.unregister(rid, sid);
        }
        if let Some(mut source) = self.sources.remove(sid) {
            self.materials.release(&mut self.device, &mut source.default_material);
            self.node_source.remove(source.node);
            self.meshes.give_back(source.mesh);
            self.property_blocks.give_back(source.properties);
        }
    }

    /// Exclude the node itself from bakes.
    pub fn set_ignore_self(&mut self, node: NodeId, ignore: bool) -> Result<()> {
        let sid = self.source_for(node)?;
        let source = &mut self.sources[sid];
        if source.ignore_self != ignore {
            source.ignore_self = ignore;
            self.request_owner_dirty(sid);
        }
        Ok(())
    }

    /// Exclude the node's descendants from bakes.
    pub fn set_ignore_children(&mut self, node: NodeId, ignore: bool) -> Result<()> {
        let sid = self.source_for(node)?;
        let source = &mut self.sources[sid];
        if source.ignore_children != ignore {
            source.ignore_children = ignore;
            self.request_owner_dirty(sid);
        }
        Ok(())
    }

    pub fn set_source_enabled(&mut self, node: NodeId, enabled: bool) -> Result<()> {
        let sid = self.source_for(node)?;
        let source = &mut self.sources[sid];
        if source.enabled != enabled {
            source.enabled = enabled;
            self.request_owner_dirty(sid);
        }
        Ok(())
    }

    fn request_owner_dirty(&mut self, sid: SourceId) {
        let owner = self.sources.get(sid).and_then(|s| s.renderer);
        if let Some(r) = owner.and_then(|rid| self.renderers.get_mut(rid)) {
            r.request_dirty(false);
        }
    }

    /// Nearest active renderer strictly above `node`
    fn resolve_owner(&self, node: NodeId) -> Option<RendererId> {
        self.scene.ancestors(node).find_map(|a| {
            self.node_renderer
                .get(a)
                .copied()
                .filter(|rid| self.renderers.get(*rid).is_some_and(|r| r.active))
        })
    }

    fn update_source_owner(&mut self, sid: SourceId) {
        let Some(source) = self.sources.get(sid) else {
            return;
        };
        let node = source.node;
        let old = source.renderer;
        let new = if self.scene.contains(node) {
            self.resolve_owner(node)
        } else {
            None
        };
        if old == new {
            return;
        }

        if let Some(rid) = old {
            self.unregister(rid, sid);
        }
        if let Some(rid) = new {
            self.register(rid, sid);
        }
        let source = &mut self.sources[sid];
        source.renderer = new;
        source.captured_version = None;
        source.prev_transform = Mat4::ZERO;
    }

    fn reresolve_sources_under(&mut self, node: NodeId) {
        for n in self.scene.descendants(node) {
            if let Some(sid) = self.node_source.get(n).copied() {
                self.update_source_owner(sid);
            }
        }
    }

    fn register(&mut self, rid: RendererId, sid: SourceId) {
        let Some(r) = self.renderers.get_mut(rid) else {
            return;
        };
        if r.sources.contains(&sid) {
            return;
        }
        r.sources.push(sid);
        r.request_dirty(false);
        tracing::debug!(renderer = ?rid, source = ?sid, count = r.sources.len(), "source registered");
    }

    fn unregister(&mut self, rid: RendererId, sid: SourceId) {
        let Some(r) = self.renderers.get_mut(rid) else {
            return;
        };
        let before = r.sources.len();
        r.sources.retain(|s| *s != sid);
        if r.sources.len() == before {
            return;
        }
        r.request_dirty(false);
        tracing::debug!(renderer = ?rid, source = ?sid, count = r.sources.len(), "source unregistered");
    }

    /// Whether `source` is excluded from its renderer's bakes, by its own
    /// flag or an `ignore_children` ancestor below the renderer.
    pub fn is_source_ignored(&self, sid: SourceId) -> bool {
        let Some(source) = self.sources.get(sid) else {
            return true;
        };
        let Some(renderer_node) = source.renderer.and_then(|r| self.renderers.get(r)).map(|r| r.node) else {
            return true;
        };
        if source.ignore_self {
            return true;
        }
        self.scene
            .ancestors(source.node)
            .take_while(|a| *a != renderer_node)
            .filter_map(|a| self.node_source.get(a))
            .any(|s| self.sources.get(*s).is_some_and(|s| s.ignore_children))
    }

    /// Whether the host should hide the live widget on `node` because its
    /// renderer presents it through the bake.
    pub fn is_source_hidden(&self, node: NodeId) -> bool {
        let Some(sid) = self.node_source.get(node).copied() else {
            return false;
        };
        let Some(source) = self.sources.get(sid) else {
            return false;
        };
        let Some(r) = source.renderer.and_then(|r| self.renderers.get(r)) else {
            return false;
        };
        r.active
            && !r.settings.show_source_graphics
            && self.scene.widget(node).is_some_and(|w| w.active)
            && !self.is_source_ignored(sid)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Frame lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start a frame: frame cache entries expire and hierarchy changes are
    /// applied.
    pub fn begin_frame(&mut self) {
        self.cache.begin_frame();
        self.baked_this_frame.clear();
        self.process_hierarchy_events();
    }

    /// Run a whole frame. Returns the renderers that baked.
    pub fn frame(&mut self) -> &[RendererId] {
        self.begin_frame();
        self.before_canvas_rebuild();
        self.rebuild_geometry();
        self.after_canvas_rebuild();
        &self.baked_this_frame
    }

    fn process_hierarchy_events(&mut self) {
        let events = self.scene.drain_events();
        if events.is_empty() {
            return;
        }
        let mut removed = false;
        for event in events {
            match event {
                HierarchyEvent::Added(n) | HierarchyEvent::Reparented(n) => {
                    if !self.scene.contains(n) {
                        continue;
                    }
                    self.refresh_renderers_under(n);
                    let under_renderer = self.resolve_owner(n).is_some();
                    let subtree = self.scene.descendants(n);
                    for d in &subtree {
                        if under_renderer || self.node_source.contains_key(*d) {
                            self.ensure_source(*d);
                        }
                    }
                    // Renderers below `n` attach their own subtrees.
                    for d in subtree {
                        if let Some(sid) = self.node_source.get(d).copied() {
                            self.update_source_owner(sid);
                            self.request_owner_dirty(sid);
                        }
                    }
                }
                HierarchyEvent::ActiveChanged(n) => {
                    if !self.scene.contains(n) {
                        continue;
                    }
                    self.refresh_renderers_under(n);
                    self.reresolve_sources_under(n);
                    if let Some(sid) = self.node_source.get(n).copied() {
                        self.request_owner_dirty(sid);
                    }
                }
                HierarchyEvent::Removed(_) => removed = true,
            }
        }
        if removed {
            self.collect_removed();
        }
    }

    fn refresh_renderers_under(&mut self, node: NodeId) {
        let ids: Vec<RendererId> = self
            .scene
            .descendants(node)
            .into_iter()
            .filter_map(|n| self.node_renderer.get(n).copied())
            .collect();
        for id in ids {
            self.refresh_activity(id);
        }
    }

    fn collect_removed(&mut self) {
        let dead_renderers: Vec<RendererId> = self
            .renderers
            .iter()
            .filter(|(_, r)| !self.scene.contains(r.node))
            .map(|(id, _)| id)
            .collect();
        for id in dead_renderers {
            let _ = self.remove_renderer(id);
        }

        let dead_sources: Vec<SourceId> = self
            .sources
            .iter()
            .filter(|(_, s)| !self.scene.contains(s.node))
            .map(|(id, _)| id)
            .collect();
        for sid in dead_sources {
            self.remove_source(sid);
        }
    }

    /// Capture widget content and run the per-renderer dirty checks.
    pub fn before_canvas_rebuild(&mut self) {
        let sources: Vec<SourceId> = self.sources.keys().collect();
        for sid in sources {
            self.capture_source(sid);
        }
        let order: Vec<RendererId> = self.activation.iter().copied().collect();
        for id in order {
            self.check_transform_changed(id);
        }
    }

    /// Bake every active renderer, in activation order.
    pub fn after_canvas_rebuild(&mut self) {
        let order: Vec<RendererId> = self.activation.iter().copied().collect();
        for id in order {
            self.bake(id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Dirty checks
    // ─────────────────────────────────────────────────────────────────────────

    fn capture_source(&mut self, sid: SourceId) {
        let Some(source) = self.sources.get(sid) else {
            return;
        };
        let Some(rid) = source.renderer.filter(|r| self.renderers.get(*r).is_some_and(|r| r.active)) else {
            return;
        };
        let node = source.node;
        let Some(widget) = self.scene.widget(node) else {
            return;
        };

        let mut color = widget.color;
        color.a *= self.scene.inherited_alpha(node);
        let linear = self
            .scene
            .canvas(self.renderers[rid].node)
            .is_some_and(|(_, c)| c.linear_vertex_colors);
        let live = widget.active && self.scene.is_active_in_hierarchy(node);

        let source = &mut self.sources[sid];
        let mut changed = false;
        if live && source.enabled && source.captured_version != Some(widget.version()) {
            source.mesh.copy_from(&widget.mesh);
            if linear {
                source.mesh.convert_colors_to_linear();
            }
            source.captured_version = Some(widget.version());
            tracing::trace!(source = ?sid, version = widget.version(), "widget mesh captured");
            changed = true;
        }
        if source.color != color {
            source.color = color;
            changed = true;
        }
        if changed {
            self.renderers[rid].request_dirty(false);
        }
    }

    fn check_transform_changed(&mut self, id: RendererId) {
        let Some(r) = self.renderers.get(id) else {
            return;
        };
        if !r.active || r.is_dirty() {
            return;
        }
        match r.settings.trigger {
            BakingTrigger::Always => {
                self.renderers[id].request_dirty(true);
                return;
            }
            BakingTrigger::Manually | BakingTrigger::OnEnable => return,
            BakingTrigger::Automatic => {}
        }
        if !self.is_in_canvas_viewport(id) {
            return;
        }

        let perspective = self.is_perspective(id);
        let node = self.renderers[id].node;
        let base = if perspective { None } else { Some(node) };
        let sources = self.renderers[id].sources.clone();
        for sid in sources {
            if !self.is_in_screen(sid) {
                continue;
            }
            if self.source_transform_changed(sid, base) {
                self.renderers[id].request_dirty(true);
            }
        }

        if perspective {
            let amp = self.settings.transform_amplification;
            let current = self.scene.local_to_world(node).mul(&Mat4::scale(amp, amp, amp));
            let epsilon = self.settings.sensitivity();
            let r = &mut self.renderers[id];
            if !r.prev_world.approx_eq(&current, epsilon) {
                r.prev_world = current;
                r.request_dirty(false);
                r.vertices_dirty = true;
            }
        } else {
            let m = self
                .scene
                .node(node)
                .map_or(Mat4::IDENTITY, |n| n.transform.rotation_scale());
            let r = &mut self.renderers[id];
            if r.tracker.sample_rotation_scale(m) {
                r.request_dirty(false);
                r.vertices_dirty = true;
            }
        }
    }

    /// Transform delta of a source relative to `base` (world when `None`),
    /// sampled once per frame and base.
    fn source_transform_changed(&mut self, sid: SourceId, base: Option<NodeId>) -> bool {
        let Some(node) = self.sources.get(sid).map(|s| s.node) else {
            return false;
        };
        let sub_key = base.map_or(u64::MAX, |b| b.data().as_ffi());
        let object = CacheObject::Node(node);
        if let Some(changed) = self.cache.get_with::<bool>(object, "transform_changed", sub_key) {
            return changed;
        }

        let world = self.scene.local_to_world(node);
        let relative = match base {
            Some(b) => self.scene.world_to_local(b).mul(&world),
            None => world,
        };
        let amp = self.settings.transform_amplification;
        let current = relative.mul(&Mat4::scale(amp, amp, amp));
        let sensitivity = self.settings.sensitivity();
        let changed = self
            .sources
            .get_mut(sid)
            .is_some_and(|s| s.sample_transform(current, sensitivity));
        self.cache.set_with(object, "transform_changed", sub_key, changed);
        changed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bake
    // ─────────────────────────────────────────────────────────────────────────

    /// Bake one renderer if it is dirty. At most one attempt per renderer
    /// and frame; failures are logged and keep the previous output.
    pub fn bake(&mut self, id: RendererId) -> BakeOutcome {
        let Some(r) = self.renderers.get(id) else {
            return BakeOutcome::Inactive;
        };
        if !r.active {
            return BakeOutcome::Inactive;
        }
        let object = CacheObject::Renderer(id);
        if self.cache.contains(object, "bake") {
            return BakeOutcome::AlreadyBaked;
        }
        self.cache.set(object, "bake", true);

        if !r.is_dirty() {
            return BakeOutcome::Clean;
        }
        let node = r.node;
        let group = r.settings.sharing_group;
        if self.scene.canvas(node).is_none() {
            tracing::warn!(renderer = ?id, ?node, "bake skipped: not under a canvas");
            return BakeOutcome::NoCanvas;
        }
        let sources = r.sources.clone();
        let visible = sources.into_iter().any(|sid| {
            self.sources.get(sid).is_some_and(|s| s.enabled) && !self.is_source_ignored(sid) && self.is_in_screen(sid)
        });
        if !visible {
            tracing::debug!(renderer = ?id, "bake skipped: no source on screen");
            return BakeOutcome::NothingOnScreen;
        }

        self.renderers[id].tracker.clear();

        if group != 0 && self.first_grouped_renderer(group) != Some(id) {
            return match self.acquire_target(id) {
                Ok(handle) => {
                    self.renderers[id].displayed = Some(handle);
                    tracing::debug!(renderer = ?id, group, ?handle, "sharing group target aliased");
                    BakeOutcome::Aliased
                }
                Err(e) => {
                    tracing::error!(renderer = ?id, ?node, error = %e, "bake failed");
                    BakeOutcome::Failed
                }
            };
        }

        self.bake_stack.push(id);
        let result = self.bake_inner(id);
        self.bake_stack.pop();

        match result {
            Ok(()) => BakeOutcome::Baked,
            Err(e) => {
                tracing::error!(renderer = ?id, ?node, error = %e, "bake failed");
                BakeOutcome::Failed
            }
        }
    }

    /// Rect size plus extents, in the renderer's local units
    pub(crate) fn rendering_size(&self, id: RendererId) -> Vec2 {
        let Some(r) = self.renderers.get(id) else {
            return Vec2::ZERO;
        };
        let rect = self.scene.rect(r.node);
        Vec2::new(rect.width(), rect.height()) + r.settings.extents
    }

    fn target_key(&self, id: RendererId) -> RenderTargetKey {
        let r = &self.renderers[id];
        let mut size = self.rendering_size(id);
        if r.settings.use_canvas_scaler {
            if let Some((_, canvas)) = self.scene.canvas(r.node) {
                size = size * canvas.scale_factor;
            }
        }
        let (width, height) = prefer_size(
            (size.x, size.y),
            r.settings.down_sampling.rate(),
            self.device.screen_size(),
            self.settings.min_target_size,
        );
        let owner = match r.settings.sharing_group {
            0 => TargetOwner::Instance(r.instance),
            group => TargetOwner::Group(group),
        };
        RenderTargetKey {
            owner,
            width,
            height,
            stencil: r.settings.use_stencil,
        }
    }

    fn acquire_target(&mut self, id: RendererId) -> Result<RenderTargetHandle> {
        let key = self.target_key(id);
        let r = &mut self.renderers[id];
        let handle = self.targets.get(&mut self.device, key, &mut r.bake_target)?;
        // A resize may have destroyed the target still on display.
        if r.displayed.is_some_and(|d| self.targets.key_of(d).is_none()) {
            r.displayed = None;
        }
        Ok(handle)
    }

    fn bake_inner(&mut self, id: RendererId) -> Result<()> {
        let target = self.acquire_target(id)?;
        let perspective = self.is_perspective(id);
        let (view, projection) = self.view_projection(id, perspective);
        let steps = self.walk(id);

        // Nested renderers bake before their output is drawn here.
        for step in &steps {
            if let WalkStep::Draw(leaf) = step {
                if let Some(nested) = leaf.nested {
                    self.bake(nested);
                }
            }
        }
        self.prepare_source_materials(&steps)?;
        let blur_material = self.ensure_blur_material(id)?;

        let node = self.renderers[id].node;
        let ctx = self.draw_context(id, perspective);
        let mut cb = match self.renderers[id].command_buffer.take() {
            Some(cb) => cb,
            None => self.command_buffers.rent(),
        };
        cb.clear();
        cb.set_name(format!("bake {}", self.scene.node(node).map_or("", |n| n.name.as_str())));
        cb.set_render_target(TextureRef::Target(target));
        cb.clear_render_target(true, Some(Color::TRANSPARENT), 1.0);
        cb.set_view_projection(view, projection);

        for step in &steps {
            self.record_step(*step, &ctx, &mut cb);
        }

        if let (Some(effect), Some(material)) = (self.renderers[id].active_effect(), blur_material) {
            let size = self
                .targets
                .key_of(target)
                .map_or((0, 0), |k| (k.width, k.height));
            let rendering_width = self.rendering_size(id).x;
            effect.record_post_pass(&mut cb, TextureRef::Target(target), size, rendering_width, material);
        }

        let draws = cb.draw_count();
        let executed = self.device.execute(&cb);
        self.renderers[id].command_buffer = Some(cb);
        executed?;

        let r = &mut self.renderers[id];
        r.displayed = r.bake_target;
        r.bake_count += 1;
        self.baked_count += 1;
        self.baked_this_frame.push(id);
        tracing::debug!(renderer = ?id, draws, total = self.baked_count, "renderer baked");

        // The renderer presenting this node picks up the new output.
        let owner = self
            .node_source
            .get(node)
            .and_then(|sid| self.sources.get(*sid))
            .and_then(|s| s.renderer);
        if let Some(owner) = owner.filter(|o| !self.bake_stack.contains(o)) {
            if let Some(r) = self.renderers.get_mut(owner) {
                r.request_dirty(false);
            }
        }
        Ok(())
    }

    fn prepare_source_materials(&mut self, steps: &[WalkStep]) -> Result<()> {
        for step in steps {
            let WalkStep::Draw(leaf) = step else {
                continue;
            };
            if leaf.nested.is_some() {
                continue;
            }
            let custom = self.scene.widget(leaf.node).and_then(|w| w.material).is_some();
            let Some(source) = self.sources.get_mut(leaf.source) else {
                continue;
            };
            if custom || source.default_material.is_some() {
                continue;
            }
            self.materials
                .get(&mut self.device, MaterialKey::source_default(), &mut source.default_material)?;
        }
        Ok(())
    }

    fn ensure_blur_material(&mut self, id: RendererId) -> Result<Option<MaterialHandle>> {
        let r = &mut self.renderers[id];
        if r.active_effect().is_none() {
            self.materials.release(&mut self.device, &mut r.blur_material);
            return Ok(None);
        }
        let handle = self.materials.get(&mut self.device, MaterialKey::blur(), &mut r.blur_material)?;
        Ok(Some(handle))
    }

    /// Factor undoing the group alpha above the renderer, which the host
    /// applies again when presenting the bake
    fn alpha_scale(&self, node: NodeId) -> f32 {
        let own = self.scene.node(node).map_or(1.0, |n| n.alpha);
        let parent = if approximately(own, 0.0) {
            1.0
        } else {
            (self.scene.inherited_alpha(node) / own).clamp(0.0, 1.0)
        };
        if approximately(parent, 0.0) {
            0.0
        } else {
            1.0 / parent
        }
    }

    fn draw_context(&self, id: RendererId, perspective: bool) -> DrawContext {
        let node = self.renderers[id].node;
        DrawContext {
            perspective,
            world_to_renderer: self.scene.world_to_local(node),
            alpha_scale: self.alpha_scale(node),
            linear_in_shader: self.scene.canvas(node).is_some_and(|(_, c)| c.linear_in_shader),
        }
    }

    fn draw_matrix(&self, node: NodeId, ctx: &DrawContext) -> Mat4 {
        let world = self.scene.local_to_world(node);
        if ctx.perspective {
            world
        } else {
            ctx.world_to_renderer.mul(&world)
        }
    }

    fn record_step(&mut self, step: WalkStep, ctx: &DrawContext, cb: &mut CommandBuffer) {
        match step {
            WalkStep::Draw(leaf) => match leaf.nested {
                Some(nested) => self.record_nested_draw(leaf.node, nested, ctx, cb),
                None => self.record_source_draw(leaf.source, false, ctx, cb),
            },
            WalkStep::Pop(leaf) => self.record_source_draw(leaf.source, true, ctx, cb),
        }
    }

    fn record_nested_draw(&self, node: NodeId, nested: RendererId, ctx: &DrawContext, cb: &mut CommandBuffer) {
        let Some(r) = self.renderers.get(nested) else {
            return;
        };
        let (Some(texture), Some(material)) = (r.displayed, r.material) else {
            tracing::trace!(renderer = ?nested, "nested renderer has no output yet");
            return;
        };
        if r.output.is_empty() {
            return;
        }
        let properties = PropertyBlock {
            main_texture: Some(TextureRef::Target(texture)),
            gamma_to_linear: ctx.linear_in_shader,
            ..Default::default()
        };
        cb.draw_mesh(&r.output, self.draw_matrix(node, ctx), material, &properties);
        tracing::trace!(renderer = ?nested, "nested output drawn");
    }

    fn record_source_draw(&mut self, sid: SourceId, pop: bool, ctx: &DrawContext, cb: &mut CommandBuffer) {
        let Some(node) = self.sources.get(sid).map(|s| s.node) else {
            return;
        };
        let matrix = self.draw_matrix(node, ctx);
        let Some(widget) = self.scene.widget(node) else {
            return;
        };
        let source = &mut self.sources[sid];
        let material = if pop {
            widget.pop_material
        } else {
            widget.material.or(source.default_material)
        };
        let Some(material) = material else {
            tracing::trace!(source = ?sid, pop, "draw skipped: no material");
            return;
        };
        if source.mesh.is_empty() {
            return;
        }

        let properties = &mut source.properties;
        properties.clear();
        let mut color = source.color;
        color.a *= ctx.alpha_scale;
        properties.color = Some(color);
        if let Some(texture) = widget.texture {
            properties.main_texture = Some(TextureRef::External(texture.id));
            if texture.format == TextureFormat::Alpha8 {
                properties.texture_sample_add = Some([1.0, 1.0, 1.0, 0.0]);
            }
        }
        properties.gamma_to_linear = ctx.linear_in_shader;

        cb.draw_mesh(&source.mesh, matrix, material, &source.properties);
        tracing::trace!(source = ?sid, pop, "source drawn");
    }
}

impl<D: GpuDevice> Drop for Compositor<D> {
    fn drop(&mut self) {
        self.targets.clear(&mut self.device);
        self.materials.clear(&mut self.device);
    }
}
