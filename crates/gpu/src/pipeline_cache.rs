//! Compiled pipeline objects keyed by fixed-function state.
//!
//! Each shader program owns one cache. Entries are kept sorted by the 64-bit
//! hash of the key so lookups are a binary search followed by a 128-bit
//! hash comparison.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use smallvec::SmallVec;
use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

use crate::types::{
    BlendDesc, DepthStencilDesc, PixelFormat, RasterizerDesc, StencilFaceDesc, TopologyType,
    MAX_RENDER_TARGETS,
};

/// Everything baked into a pipeline object besides the shaders.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PipelineStateKey {
    pub render_target_count: u32,
    pub render_target_formats: [PixelFormat; MAX_RENDER_TARGETS],
    pub depth_stencil_format: PixelFormat,
    pub rasterizer: RasterizerDesc,
    pub depth_stencil: DepthStencilDesc,
    pub blend: BlendDesc,
    pub topology_type: TopologyType,
}

type KeyBytes = SmallVec<[u8; 512]>;

struct KeyWriter(KeyBytes);

impl KeyWriter {
    fn u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.u32(value.to_bits());
    }

    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.0.push(u8::from(value));
    }

    fn stencil_face(&mut self, face: &StencilFaceDesc) {
        self.u32(face.fail_op as u32);
        self.u32(face.depth_fail_op as u32);
        self.u32(face.pass_op as u32);
        self.u32(face.func as u32);
    }
}

impl PipelineStateKey {
    /// The canonical byte encoding of the key. Two keys are the same key iff
    /// their encodings are equal.
    #[must_use]
    pub fn to_bytes(&self) -> KeyBytes {
        let mut w = KeyWriter(KeyBytes::new());

        w.u32(self.render_target_count);
        for format in &self.render_target_formats {
            w.u32(*format as u32);
        }
        w.u32(self.depth_stencil_format as u32);

        let r = &self.rasterizer;
        w.u32(r.fill_mode as u32);
        w.u32(r.cull_mode as u32);
        w.bool(r.front_counter_clockwise);
        w.i32(r.depth_bias);
        w.f32(r.depth_bias_clamp);
        w.f32(r.slope_scaled_depth_bias);
        w.bool(r.depth_clip_enable);
        w.bool(r.multisample_enable);
        w.bool(r.antialiased_line_enable);

        let d = &self.depth_stencil;
        w.bool(d.depth_enable);
        w.bool(d.depth_write);
        w.u32(d.depth_func as u32);
        w.bool(d.stencil_enable);
        w.u8(d.stencil_read_mask);
        w.u8(d.stencil_write_mask);
        w.stencil_face(&d.front_face);
        w.stencil_face(&d.back_face);

        let b = &self.blend;
        w.bool(b.alpha_to_coverage);
        w.bool(b.independent_blend);
        for target in &b.render_targets {
            w.bool(target.blend_enable);
            w.u32(target.src_blend as u32);
            w.u32(target.dest_blend as u32);
            w.u32(target.blend_op as u32);
            w.u32(target.src_blend_alpha as u32);
            w.u32(target.dest_blend_alpha as u32);
            w.u32(target.blend_op_alpha as u32);
            w.u8(target.write_mask);
        }

        w.u32(self.topology_type as u32);
        w.0
    }

    /// The `(key1, key2)` hash pair used for cache lookup.
    #[must_use]
    pub fn hashes(&self) -> (u64, u128) {
        let bytes = self.to_bytes();
        (xxh3_64(&bytes), xxh3_128(&bytes))
    }
}

struct Entry<T> {
    key1: u64,
    key2: u128,
    value: T,
}

pub struct PipelineCache<T> {
    entries: RwLock<Vec<Entry<T>>>,
    compiles: AtomicUsize,
}

impl<T> Default for PipelineCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PipelineCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            compiles: AtomicUsize::new(0),
        }
    }

    /// The number of successful compilations performed by this cache.
    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, returning the cached values.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.get_mut().drain(..).map(|e| e.value).collect()
    }
}

impl<T: Copy> PipelineCache<T> {
    /// Returns the value cached for `key`, compiling and inserting it on a
    /// miss. At most one compilation runs per key no matter how many threads
    /// race on it. Failed compilations are not cached.
    pub fn get_or_create<E>(
        &self,
        key: &PipelineStateKey,
        compile: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let (key1, key2) = key.hashes();

        if let Some(value) = find(&self.entries.read(), key1, key2) {
            return Ok(value);
        }

        // Only one upgradable guard exists at a time, so whoever holds it is
        // the only thread that can insert. Readers are not blocked while it
        // compiles.
        let entries = self.entries.upgradable_read();
        if let Some(value) = find(&entries, key1, key2) {
            return Ok(value);
        }

        let value = compile()?;
        self.compiles.fetch_add(1, Ordering::Relaxed);

        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let position = entries.partition_point(|e| e.key1 < key1);
        entries.insert(position, Entry { key1, key2, value });

        Ok(value)
    }
}

fn find<T: Copy>(entries: &[Entry<T>], key1: u64, key2: u128) -> Option<T> {
    let start = entries.partition_point(|e| e.key1 < key1);
    entries[start..]
        .iter()
        .take_while(|e| e.key1 == key1)
        .find(|e| e.key2 == key2)
        .map(|e| e.value)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::types::CullMode;

    #[test]
    fn key_bytes_distinguish_fields() {
        let a = PipelineStateKey::default();
        let mut b = a;
        b.rasterizer.cull_mode = CullMode::None;

        assert_eq!(a.to_bytes(), PipelineStateKey::default().to_bytes());
        assert_ne!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.hashes(), b.hashes());
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = PipelineCache::<u32>::new();
        let key = PipelineStateKey::default();

        assert_eq!(cache.get_or_create(&key, || Err("nope")), Err("nope"));
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_create(&key, || Ok::<_, ()>(7)), Ok(7));
        assert_eq!(cache.get_or_create(&key, || Ok::<_, ()>(8)), Ok(7));
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn entries_stay_sorted() {
        let cache = PipelineCache::<u32>::new();
        let mut key = PipelineStateKey::default();

        for i in 0..16 {
            key.rasterizer.depth_bias = i;
            cache.get_or_create(&key, || Ok::<_, ()>(i as u32)).unwrap();
        }

        let entries = cache.entries.read();
        assert!(entries.windows(2).all(|w| w[0].key1 <= w[1].key1));

        key.rasterizer.depth_bias = 5;
        drop(entries);
        assert_eq!(cache.get_or_create(&key, || Ok::<_, ()>(99)), Ok(5));
    }

    #[test]
    fn concurrent_requests_compile_once() {
        const THREADS: usize = 8;
        const REQUESTS: usize = 100;

        let cache = PipelineCache::<u64>::new();
        let key = PipelineStateKey::default();
        let compiled = AtomicUsize::new(0);
        let hits = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..REQUESTS {
                        let value = cache.get_or_create(&key, || {
                            compiled.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, ()>(42)
                        });
                        if value == Ok(42) {
                            hits.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(compiled.load(Ordering::SeqCst), 1);
        assert_eq!(cache.compile_count(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), THREADS * REQUESTS);
    }
}
