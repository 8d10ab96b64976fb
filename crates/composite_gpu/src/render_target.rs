//! Bake targets
//!
//! Off-screen color targets (with an optional stencil attachment) keyed by
//! owner, resolution and stencil flag. A renderer holding a target whose key
//! no longer matches (it was resized, or its stencil setting changed) gets
//! the old one released and a matching one acquired on its next `get`.
//! Renderers in the same sharing group use the same owner and therefore the
//! same target.

use crate::device::{GpuDevice, RenderTargetHandle, Result};
use crate::repository::{RepositoryStats, SharedRepository};
use composite_core::next_power_of_two;
use serde::{Deserialize, Serialize};

/// Resolution reduction for bake targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownSamplingRate {
    /// Native size, aspect-corrected
    None,
    #[default]
    X1,
    X2,
    X4,
    X8,
}

impl DownSamplingRate {
    pub fn rate(self) -> u32 {
        match self {
            DownSamplingRate::None => 0,
            DownSamplingRate::X1 => 1,
            DownSamplingRate::X2 => 2,
            DownSamplingRate::X4 => 4,
            DownSamplingRate::X8 => 8,
        }
    }
}

/// Who a target belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetOwner {
    /// A single renderer, by its instance id
    Instance(u64),
    /// Every renderer sharing this non-zero group id
    Group(u32),
}

/// Cache key for a bake target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetKey {
    pub owner: TargetOwner,
    pub width: u32,
    pub height: u32,
    pub stencil: bool,
}

impl RenderTargetKey {
    pub fn desc(&self) -> RenderTargetDesc {
        RenderTargetDesc {
            width: self.width,
            height: self.height,
            stencil: self.stencil,
        }
    }
}

/// What the device needs to allocate a target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    pub stencil: bool,
}

impl RenderTargetDesc {
    /// Estimated memory in bytes (RGBA8 color plus D24S8 when stenciled)
    pub fn memory_bytes(&self) -> u64 {
        let pixels = self.width as u64 * self.height as u64;
        if self.stencil {
            pixels * 8
        } else {
            pixels * 4
        }
    }
}

fn clamp_edge(v: i64, min: u32, max: u32) -> i64 {
    if v < min as i64 {
        min as i64
    } else if v > max as i64 {
        max as i64
    } else {
        v
    }
}

/// Pick the target resolution for a requested logical size.
///
/// Both edges are clamped to `[min_edge, screen]`. With rate 0 the smaller
/// edge is recomputed from the aspect ratio. Otherwise the larger edge
/// becomes `next_power_of_two(edge / 2) / rate` and the other edge follows
/// the aspect ratio.
pub fn prefer_size(requested: (f32, f32), rate: u32, screen: (u32, u32), min_edge: u32) -> (u32, u32) {
    let rx = (requested.0.round() as i64).max(min_edge.max(1) as i64);
    let ry = (requested.1.round() as i64).max(min_edge.max(1) as i64);
    let aspect = rx as f32 / ry as f32;

    let mut x = clamp_edge(rx, min_edge, screen.0);
    let mut y = clamp_edge(ry, min_edge, screen.1);

    if rate == 0 {
        if x < y {
            x = (y as f32 * aspect).ceil() as i64;
        } else {
            y = (x as f32 / aspect).ceil() as i64;
        }
    } else if x < y {
        y = (next_power_of_two((y / 2) as u32) / rate) as i64;
        x = (y as f32 * aspect).ceil() as i64;
    } else {
        x = (next_power_of_two((x / 2) as u32) / rate) as i64;
        y = (x as f32 / aspect).ceil() as i64;
    }

    (x.max(1) as u32, y.max(1) as u32)
}

/// Shared bake targets keyed by [`RenderTargetKey`]
#[derive(Debug)]
pub struct RenderTargetRegistry {
    repo: SharedRepository<RenderTargetKey, RenderTargetHandle>,
    live_bytes: u64,
}

impl Default for RenderTargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderTargetRegistry {
    pub fn new() -> Self {
        Self {
            repo: SharedRepository::new("render_targets"),
            live_bytes: 0,
        }
    }

    pub fn valid(&self, key: &RenderTargetKey, held: Option<RenderTargetHandle>) -> bool {
        self.repo.valid(key, held)
    }

    /// Resolve `held` to the target for `key`, resizing by release and
    /// re-acquire when the held target no longer matches.
    pub fn get<D: GpuDevice + ?Sized>(
        &mut self,
        device: &mut D,
        key: RenderTargetKey,
        held: &mut Option<RenderTargetHandle>,
    ) -> Result<RenderTargetHandle> {
        if self.repo.valid(&key, *held) {
            if let Some(h) = *held {
                return Ok(h);
            }
        }
        // Release first so a resize frees memory before allocating.
        self.release(device, held);

        let mut created = false;
        let handle = self.repo.get(
            key,
            held,
            |k| {
                created = true;
                device.create_render_target(&k.desc())
            },
            |_| {},
        )?;
        if created {
            self.live_bytes += key.desc().memory_bytes();
            tracing::debug!(?key, ?handle, "bake target allocated");
        }
        Ok(handle)
    }

    pub fn release<D: GpuDevice + ?Sized>(&mut self, device: &mut D, held: &mut Option<RenderTargetHandle>) {
        let Some(handle) = *held else {
            return;
        };
        let bytes = self.repo.key_of(handle).map(|k| k.desc().memory_bytes());
        let mut freed = false;
        self.repo.release(held, |h| {
            freed = true;
            device.destroy_render_target(h);
        });
        if freed {
            self.live_bytes = self.live_bytes.saturating_sub(bytes.unwrap_or(0));
        }
    }

    pub fn key_of(&self, handle: RenderTargetHandle) -> Option<&RenderTargetKey> {
        self.repo.key_of(handle)
    }

    pub fn ref_count(&self, key: &RenderTargetKey) -> usize {
        self.repo.ref_count(key)
    }

    /// Distinct targets alive
    pub fn active_count(&self) -> usize {
        self.repo.active_count()
    }

    /// Estimated memory held by live targets
    pub fn memory_bytes(&self) -> u64 {
        self.live_bytes
    }

    pub fn stats(&self) -> RepositoryStats {
        self.repo.stats()
    }

    pub fn clear<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        self.repo.clear(|h| device.destroy_render_target(h));
        self.live_bytes = 0;
    }
}
