//! Per-frame memoization
//!
//! Queries such as "is this source on screen" or "did this transform move"
//! are issued from several call sites within one frame (dirty checks, then
//! the bake itself). `FrameCache` answers them once per frame.
//!
//! Entries are stamped with the generation they were written in. The host
//! calls [`FrameCache::begin_frame`] exactly once per rendered frame; any entry
//! whose stamp differs from the current generation is treated as absent.

use rustc_hash::FxHashMap;
use std::hash::Hash;

/// Values that can be memoized
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FrameValue {
    Bool(bool),
    UInt(u64),
    Float(f32),
}

/// Conversion to and from [`FrameValue`]
pub trait FrameCached: Sized + Copy {
    fn into_value(self) -> FrameValue;
    fn from_value(value: FrameValue) -> Option<Self>;
}

impl FrameCached for bool {
    fn into_value(self) -> FrameValue {
        FrameValue::Bool(self)
    }

    fn from_value(value: FrameValue) -> Option<Self> {
        match value {
            FrameValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl FrameCached for u64 {
    fn into_value(self) -> FrameValue {
        FrameValue::UInt(self)
    }

    fn from_value(value: FrameValue) -> Option<Self> {
        match value {
            FrameValue::UInt(v) => Some(v),
            _ => None,
        }
    }
}

impl FrameCached for f32 {
    fn into_value(self) -> FrameValue {
        FrameValue::Float(self)
    }

    fn from_value(value: FrameValue) -> Option<Self> {
        match value {
            FrameValue::Float(v) => Some(v),
            _ => None,
        }
    }
}

/// Key: object identity, computation tag and an optional sub-key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey<K> {
    pub object: K,
    pub tag: &'static str,
    pub sub_key: u64,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    generation: u64,
    value: FrameValue,
}

/// Generation-stamped memo table
#[derive(Debug)]
pub struct FrameCache<K: Eq + Hash> {
    generation: u64,
    entries: FxHashMap<FrameKey<K>, Entry>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Copy> Default for FrameCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Copy> FrameCache<K> {
    pub fn new() -> Self {
        Self {
            generation: 0,
            entries: FxHashMap::default(),
            hits: 0,
            misses: 0,
        }
    }

    /// Current frame generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new frame. Every entry written before this call becomes stale.
    pub fn begin_frame(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.entries.clear();
    }

    pub fn get<T: FrameCached>(&mut self, object: K, tag: &'static str) -> Option<T> {
        self.get_with(object, tag, 0)
    }

    pub fn get_with<T: FrameCached>(&mut self, object: K, tag: &'static str, sub_key: u64) -> Option<T> {
        let key = FrameKey {
            object,
            tag,
            sub_key,
        };
        match self.entries.get(&key) {
            Some(entry) if entry.generation == self.generation => {
                self.hits += 1;
                T::from_value(entry.value)
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn set<T: FrameCached>(&mut self, object: K, tag: &'static str, value: T) {
        self.set_with(object, tag, 0, value);
    }

    pub fn set_with<T: FrameCached>(&mut self, object: K, tag: &'static str, sub_key: u64, value: T) {
        self.entries.insert(
            FrameKey {
                object,
                tag,
                sub_key,
            },
            Entry {
                generation: self.generation,
                value: value.into_value(),
            },
        );
    }

    /// Whether a value was recorded for the key this frame.
    pub fn contains(&self, object: K, tag: &'static str) -> bool {
        let key = FrameKey {
            object,
            tag,
            sub_key: 0,
        };
        self.entries
            .get(&key)
            .is_some_and(|e| e.generation == self.generation)
    }

    /// Return the memoized value or compute, store and return it.
    pub fn get_or_insert_with<T: FrameCached>(
        &mut self,
        object: K,
        tag: &'static str,
        sub_key: u64,
        compute: impl FnOnce() -> T,
    ) -> T {
        if let Some(v) = self.get_with(object, tag, sub_key) {
            return v;
        }
        let v = compute();
        self.set_with(object, tag, sub_key, v);
        v
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
