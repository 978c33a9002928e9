// String interning table.
//
// Every string value is interned, so string equality is handle equality.
// String ids carry their hash, so the table resizes without touching the
// strings themselves.

use ahash::RandomState;
use std::hash::BuildHasher;

use crate::gc::gc_id::StringId;
use crate::gc::object_pool::ObjectPool;
use crate::lua_vm::lua_limits::MINSTRTABSIZE;

pub struct StringInterner {
    buckets: Vec<Vec<StringId>>,
    count: usize,
    hashbuilder: RandomState,
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); MINSTRTABSIZE],
            count: 0,
            // Fixed seeds keep hashes (and therefore table layouts) reproducible.
            hashbuilder: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    #[inline]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u32 {
        let h = BuildHasher::hash_one(&self.hashbuilder, bytes);
        (h ^ (h >> 32)) as u32
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    /// Find an interned string with the given content.
    pub fn find(&self, pool: &ObjectPool, bytes: &[u8], hash: u32) -> Option<StringId> {
        self.buckets[self.bucket_of(hash)]
            .iter()
            .copied()
            .find(|id| id.hash == hash && pool.string(*id).as_bytes() == bytes)
    }

    /// Register a freshly allocated string. Grows when load exceeds 100%,
    /// unless the collector is walking the buckets (`can_resize` false).
    pub fn insert(&mut self, id: StringId, can_resize: bool) {
        let b = self.bucket_of(id.hash);
        self.buckets[b].push(id);
        self.count += 1;
        if can_resize && self.count > self.buckets.len() && self.buckets.len() <= (i32::MAX as usize) / 2 {
            self.resize(self.buckets.len() * 2);
        }
    }

    fn resize(&mut self, new_size: usize) {
        let mut buckets = vec![Vec::new(); new_size];
        for id in self.buckets.drain(..).flatten() {
            buckets[id.hash as usize & (new_size - 1)].push(id);
        }
        self.buckets = buckets;
    }

    /// Shrink after a collection when the table is mostly empty.
    pub fn check_size(&mut self) {
        let size = self.buckets.len();
        if self.count < size / 4 && size > MINSTRTABSIZE * 2 {
            self.resize(size / 2);
        }
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Remove every entry of one bucket for which `is_dead` holds, returning
    /// the removed ids so the caller can release them.
    pub fn sweep_bucket(
        &mut self,
        index: usize,
        mut is_dead: impl FnMut(StringId) -> bool,
    ) -> Vec<StringId> {
        let Some(bucket) = self.buckets.get_mut(index) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        bucket.retain(|id| {
            if is_dead(*id) {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        self.count -= removed.len();
        removed
    }
}
