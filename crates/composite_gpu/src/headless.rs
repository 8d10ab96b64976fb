//! Headless device
//!
//! A [`GpuDevice`] that allocates nothing on a GPU. It tracks live targets and
//! materials, validates every submitted command buffer (bound targets, live
//! handles, balanced temporaries) and keeps a history of submissions. Used by
//! the CLI and as the device in tests.

use crate::command::{Command, CommandBuffer, TempTargetId, TextureRef};
use crate::device::{DeviceError, GpuDevice, MaterialHandle, RenderTargetHandle, Result};
use crate::material::MaterialDesc;
use crate::render_target::RenderTargetDesc;
use rustc_hash::{FxHashMap, FxHashSet};

/// Counters accumulated over the device lifetime
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub targets_created: u64,
    pub targets_destroyed: u64,
    pub materials_created: u64,
    pub materials_destroyed: u64,
    pub submissions: u64,
    pub draws: u64,
    pub blits: u64,
    pub uploaded_bytes: u64,
}

/// A validated submission
#[derive(Clone, Debug)]
pub struct Submission {
    pub name: String,
    pub commands: Vec<Command>,
}

/// Recording device without a GPU
#[derive(Debug)]
pub struct HeadlessDevice {
    screen: (u32, u32),
    next_id: u64,
    targets: FxHashMap<RenderTargetHandle, RenderTargetDesc>,
    materials: FxHashMap<MaterialHandle, MaterialDesc>,
    history: Vec<Submission>,
    history_limit: usize,
    stats: DeviceStats,
    fail_next_execute: Option<String>,
    fail_target_creation: bool,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(1920, 1080)
    }
}

impl HeadlessDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            screen: (width, height),
            next_id: 1,
            targets: FxHashMap::default(),
            materials: FxHashMap::default(),
            history: Vec::new(),
            history_limit: 256,
            stats: DeviceStats::default(),
            fail_next_execute: None,
            fail_target_creation: false,
        }
    }

    pub fn set_screen_size(&mut self, width: u32, height: u32) {
        self.screen = (width, height);
    }

    /// Keep at most `limit` submissions in history
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Make the next `execute` fail with `reason`.
    pub fn fail_next_execute(&mut self, reason: impl Into<String>) {
        self.fail_next_execute = Some(reason.into());
    }

    /// Make target allocation fail until cleared.
    pub fn set_fail_target_creation(&mut self, fail: bool) {
        self.fail_target_creation = fail;
    }

    pub fn live_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn live_materials(&self) -> usize {
        self.materials.len()
    }

    pub fn target_desc(&self, handle: RenderTargetHandle) -> Option<&RenderTargetDesc> {
        self.targets.get(&handle)
    }

    pub fn material_desc(&self, handle: MaterialHandle) -> Option<&MaterialDesc> {
        self.materials.get(&handle)
    }

    pub fn history(&self) -> &[Submission] {
        &self.history
    }

    pub fn last_submission(&self) -> Option<&Submission> {
        self.history.last()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_texture(&self, buffer: &CommandBuffer, index: usize, t: TextureRef, temps: &FxHashSet<TempTargetId>) -> Result<()> {
        let ok = match t {
            TextureRef::Target(h) => self.targets.contains_key(&h),
            TextureRef::Temporary(id) => temps.contains(&id),
            TextureRef::External(_) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(DeviceError::MissingResource {
                buffer: buffer.name().to_string(),
                index,
                what: "texture",
            })
        }
    }

    fn check_material(&self, buffer: &CommandBuffer, index: usize, m: MaterialHandle) -> Result<()> {
        if self.materials.contains_key(&m) {
            Ok(())
        } else {
            Err(DeviceError::MissingResource {
                buffer: buffer.name().to_string(),
                index,
                what: "material",
            })
        }
    }

    fn validate(&self, buffer: &CommandBuffer) -> Result<(u64, u64, u64)> {
        let mut temps: FxHashSet<TempTargetId> = FxHashSet::default();
        let mut bound = false;
        let (mut draws, mut blits, mut bytes) = (0u64, 0u64, 0u64);

        for (index, command) in buffer.commands().iter().enumerate() {
            match command {
                Command::SetRenderTarget(t) => {
                    self.check_texture(buffer, index, *t, &temps)?;
                    bound = true;
                }
                Command::ClearRenderTarget { .. } | Command::SetViewProjection { .. } => {
                    if !bound {
                        return Err(DeviceError::NoRenderTarget {
                            buffer: buffer.name().to_string(),
                            index,
                        });
                    }
                }
                Command::DrawMesh {
                    mesh,
                    material,
                    properties,
                    ..
                } => {
                    if !bound {
                        return Err(DeviceError::NoRenderTarget {
                            buffer: buffer.name().to_string(),
                            index,
                        });
                    }
                    self.check_material(buffer, index, *material)?;
                    if let Some(t) = properties.main_texture {
                        self.check_texture(buffer, index, t, &temps)?;
                    }
                    draws += 1;
                    bytes += (mesh.vertex_bytes().len() + mesh.index_bytes().len()) as u64;
                }
                Command::GetTemporary { id, .. } => {
                    temps.insert(*id);
                }
                Command::ReleaseTemporary(id) => {
                    if !temps.remove(id) {
                        return Err(DeviceError::MissingResource {
                            buffer: buffer.name().to_string(),
                            index,
                            what: "temporary target",
                        });
                    }
                }
                Command::SetGlobalVector { .. } | Command::SetGlobalFloat { .. } => {}
                Command::Blit {
                    source,
                    dest,
                    material,
                    ..
                } => {
                    self.check_texture(buffer, index, *source, &temps)?;
                    self.check_texture(buffer, index, *dest, &temps)?;
                    self.check_material(buffer, index, *material)?;
                    blits += 1;
                }
                Command::CopyTexture { source, dest } => {
                    self.check_texture(buffer, index, *source, &temps)?;
                    self.check_texture(buffer, index, *dest, &temps)?;
                }
            }
        }

        if let Some(id) = temps.iter().next() {
            return Err(DeviceError::LeakedTemporary {
                buffer: buffer.name().to_string(),
                id: id.0,
            });
        }
        Ok((draws, blits, bytes))
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_render_target(&mut self, desc: &RenderTargetDesc) -> Result<RenderTargetHandle> {
        if self.fail_target_creation || desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::TargetAllocation {
                width: desc.width,
                height: desc.height,
                reason: "headless allocation refused".to_string(),
            });
        }
        let handle = RenderTargetHandle(self.alloc_id());
        self.targets.insert(handle, *desc);
        self.stats.targets_created += 1;
        Ok(handle)
    }

    fn destroy_render_target(&mut self, handle: RenderTargetHandle) {
        if self.targets.remove(&handle).is_some() {
            self.stats.targets_destroyed += 1;
        } else {
            tracing::warn!(?handle, "destroying unknown render target");
        }
    }

    fn create_material(&mut self, desc: &MaterialDesc) -> Result<MaterialHandle> {
        let handle = MaterialHandle(self.alloc_id());
        self.materials.insert(handle, desc.clone());
        self.stats.materials_created += 1;
        Ok(handle)
    }

    fn destroy_material(&mut self, handle: MaterialHandle) {
        if self.materials.remove(&handle).is_some() {
            self.stats.materials_destroyed += 1;
        } else {
            tracing::warn!(?handle, "destroying unknown material");
        }
    }

    fn execute(&mut self, commands: &CommandBuffer) -> Result<()> {
        if let Some(reason) = self.fail_next_execute.take() {
            return Err(DeviceError::Submit(reason));
        }
        let (draws, blits, bytes) = self.validate(commands)?;
        self.stats.submissions += 1;
        self.stats.draws += draws;
        self.stats.blits += blits;
        self.stats.uploaded_bytes += bytes;

        if self.history_limit > 0 {
            if self.history.len() >= self.history_limit {
                self.history.remove(0);
            }
            self.history.push(Submission {
                name: commands.name().to_string(),
                commands: commands.commands().to_vec(),
            });
        }
        tracing::trace!(buffer = commands.name(), draws, blits, "headless submission");
        Ok(())
    }

    fn screen_size(&self) -> (u32, u32) {
        self.screen
    }
}
