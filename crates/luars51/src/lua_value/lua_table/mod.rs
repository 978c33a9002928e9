// Lua table: dense array part for keys 1..n plus a chained hash part.
mod hash_table;

use std::fmt;

use crate::gc::gc_id::{StringId, TableId};
use crate::LuaValue;
use hash_table::{LuaHashTable, Node};

/// Largest array part is 2^MAXBITS.
const MAXBITS: usize = 26;
pub(crate) const MAXASIZE: usize = 1 << MAXBITS;

/// `next` was handed a key that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidNextKey;

impl fmt::Display for InvalidNextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid key to 'next'")
    }
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    hash: LuaHashTable,
    pub(crate) metatable: Option<TableId>,
    /// Bit `e` set means metamethod event `e` is known to be absent.
    pub(crate) flags: u8,
}

/// 1-based array slot for an integral number key, when inside the array part.
#[inline(always)]
fn array_slot(n: f64, size: usize) -> Option<usize> {
    let k = n as i64;
    if k as f64 == n && k >= 1 && (k as u64) <= size as u64 {
        Some(k as usize - 1)
    } else {
        None
    }
}

/// ceil(log2(x)) for x >= 1.
#[inline]
fn ceil_log2(x: usize) -> usize {
    (usize::BITS - (x - 1).leading_zeros()) as usize
}

/// Count `key` into `nums` if it is a candidate array index.
fn count_int(key: &LuaValue, nums: &mut [usize; MAXBITS + 1]) -> usize {
    if let LuaValue::Number(n) = key {
        let k = *n as i64;
        if k as f64 == *n && k >= 1 && (k as usize) <= MAXASIZE {
            nums[ceil_log2(k as usize)] += 1;
            return 1;
        }
    }
    0
}

/// Largest `n` (a power of two) such that more than half of `1..=n` is in
/// use. Returns `(n, number of keys that will live in the array part)`.
fn compute_sizes(nums: &[usize; MAXBITS + 1], narray: usize) -> (usize, usize) {
    let mut a = 0;
    let mut na = 0;
    let mut n = 0;
    let mut twotoi = 1usize;
    for &count in nums.iter() {
        if twotoi / 2 >= narray {
            break;
        }
        if count > 0 {
            a += count;
            if a > twotoi / 2 {
                n = twotoi;
                na = a;
            }
        }
        if a == narray {
            break;
        }
        twotoi *= 2;
    }
    (n, na)
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl LuaTable {
    pub fn new(narray: usize, nhash: usize) -> Self {
        Self {
            array: vec![LuaValue::Nil; narray],
            hash: LuaHashTable::with_size(nhash),
            metatable: None,
            flags: 0,
        }
    }

    #[inline]
    pub fn metatable(&self) -> Option<TableId> {
        self.metatable
    }

    #[inline]
    pub fn set_metatable(&mut self, mt: Option<TableId>) {
        self.metatable = mt;
    }

    #[inline]
    pub fn array_size(&self) -> usize {
        self.array.len()
    }

    #[inline]
    pub fn hash_size(&self) -> usize {
        self.hash.len()
    }

    #[inline]
    pub fn array(&self) -> &[LuaValue] {
        &self.array
    }

    /// Estimated memory footprint, for collector accounting.
    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<LuaTable>()
            + self.array.len() * std::mem::size_of::<LuaValue>()
            + self.hash.len() * std::mem::size_of::<Node>()
    }

    // ============ Lookup ============

    pub fn get(&self, key: &LuaValue) -> LuaValue {
        match key {
            LuaValue::Nil => LuaValue::Nil,
            LuaValue::Number(n) => match array_slot(*n, self.array.len()) {
                Some(i) => self.array[i],
                None => self.hash.get(key),
            },
            _ => self.hash.get(key),
        }
    }

    #[inline]
    pub fn get_int(&self, key: i64) -> LuaValue {
        if key >= 1 && (key as u64) <= self.array.len() as u64 {
            self.array[key as usize - 1]
        } else {
            self.hash.get(&LuaValue::Number(key as f64))
        }
    }

    #[inline]
    pub fn get_str(&self, key: StringId) -> LuaValue {
        self.hash.get(&LuaValue::String(key))
    }

    // ============ Store ============

    /// Slot for `key`, inserting the key (with a nil value) when absent.
    /// `key` must be neither nil nor NaN; callers raise those errors.
    pub fn set(&mut self, key: LuaValue) -> &mut LuaValue {
        debug_assert!(!key.is_nil());
        self.flags = 0;
        if let LuaValue::Number(n) = key {
            debug_assert!(!n.is_nan());
            if let Some(i) = array_slot(n, self.array.len()) {
                return &mut self.array[i];
            }
        }
        if let Some(idx) = self.hash.find(&key) {
            return self.hash.value_mut(idx);
        }
        self.new_key(key)
    }

    #[inline]
    pub fn set_int(&mut self, key: i64) -> &mut LuaValue {
        self.set(LuaValue::Number(key as f64))
    }

    #[inline]
    pub fn raw_set(&mut self, key: LuaValue, value: LuaValue) {
        *self.set(key) = value;
    }

    #[inline]
    pub fn raw_set_int(&mut self, key: i64, value: LuaValue) {
        *self.set_int(key) = value;
    }

    fn new_key(&mut self, key: LuaValue) -> &mut LuaValue {
        match self.hash.insert_new_key(key) {
            Some(idx) => self.hash.value_mut(idx),
            None => {
                self.rehash();
                self.set(key)
            }
        }
    }

    // ============ Rehash ============

    fn num_use_array(&self, nums: &mut [usize; MAXBITS + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1usize;
        let mut ttlg = 1usize;
        for slot in nums.iter_mut() {
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break;
                }
            }
            let mut lc = 0;
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            *slot += lc;
            ause += lc;
            ttlg *= 2;
        }
        ause
    }

    /// Recompute the array/hash split from the keys currently stored.
    ///
    /// The key whose insertion triggered the rehash is sized into the hash
    /// part only; the array part absorbs it on a later rehash.
    fn rehash(&mut self) {
        let mut nums = [0usize; MAXBITS + 1];
        let mut nasize = self.num_use_array(&mut nums);
        let mut total = nasize;
        for node in self.hash.nodes() {
            if !node.value.is_nil() {
                nasize += count_int(&node.key, &mut nums);
                total += 1;
            }
        }
        total += 1;
        let (array_size, na) = compute_sizes(&nums, nasize);
        self.resize(array_size, total - na);
    }

    fn resize(&mut self, nasize: usize, nhsize: usize) {
        let old_hash = std::mem::replace(&mut self.hash, LuaHashTable::with_size(nhsize));
        let old_asize = self.array.len();
        if nasize > old_asize {
            self.array.resize(nasize, LuaValue::Nil);
        } else if nasize < old_asize {
            let vanishing: Vec<LuaValue> = self.array.drain(nasize..).collect();
            for (i, v) in vanishing.into_iter().enumerate() {
                if !v.is_nil() {
                    *self.set_int((nasize + i + 1) as i64) = v;
                }
            }
        }
        for node in old_hash.into_nodes() {
            if !node.value.is_nil() {
                *self.set(node.key) = node.value;
            }
        }
    }

    /// Grow (or shrink) the array part to exactly `nasize`, keeping the hash size.
    pub fn resize_array(&mut self, nasize: usize) {
        let nhsize = self.hash.len();
        self.resize(nasize, nhsize);
    }

    // ============ Traversal ============

    /// Position right after `key` in traversal order.
    fn find_index(&self, key: &LuaValue) -> Result<usize, InvalidNextKey> {
        if key.is_nil() {
            return Ok(0);
        }
        if let LuaValue::Number(n) = key {
            if let Some(i) = array_slot(*n, self.array.len()) {
                return Ok(i + 1);
            }
        }
        match self.hash.find(key) {
            Some(idx) => Ok(self.array.len() + idx + 1),
            None => Err(InvalidNextKey),
        }
    }

    /// Entry following `key` (array part ascending, then hash part
    /// ascending); `nil` starts the traversal.
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, InvalidNextKey> {
        let mut i = self.find_index(key)?;
        while i < self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((LuaValue::Number((i + 1) as f64), self.array[i])));
            }
            i += 1;
        }
        for node in &self.hash.nodes()[i - self.array.len()..] {
            if !node.value.is_nil() {
                return Ok(Some((node.key, node.value)));
            }
        }
        Ok(None)
    }

    /// Every live entry in traversal order.
    pub fn iter(&self) -> impl Iterator<Item = (LuaValue, LuaValue)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (LuaValue::Number((i + 1) as f64), *v));
        let hash = self
            .hash
            .nodes()
            .iter()
            .filter(|n| !n.value.is_nil())
            .map(|n| (n.key, n.value));
        array.chain(hash)
    }

    // ============ Length ============

    /// A border: `t[n] ~= nil and t[n+1] == nil`, or 0 when `t[1]` is nil.
    pub fn length(&self) -> usize {
        let mut j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            // binary search for a border in the array part
            let mut i = 0;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            i
        } else if self.hash.len() == 0 {
            j
        } else {
            self.unbound_search(j)
        }
    }

    fn unbound_search(&self, j: usize) -> usize {
        let mut i = j;
        let mut j = j + 1;
        while !self.get_int(j as i64).is_nil() {
            i = j;
            j *= 2;
            if j > i32::MAX as usize {
                // pathological table: fall back to a linear scan
                let mut i = 1;
                while !self.get_int(i as i64).is_nil() {
                    i += 1;
                }
                return i - 1;
            }
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    // ============ Collector support ============

    /// Live hash entries.
    pub(crate) fn hash_entries(&self) -> impl Iterator<Item = (LuaValue, LuaValue)> + '_ {
        self.hash
            .nodes()
            .iter()
            .filter(|n| !n.value.is_nil())
            .map(|n| (n.key, n.value))
    }

    /// Drop entries whose key or value the collector reports as cleared.
    /// `is_cleared(value, is_key)` is consulted for weak parts only.
    pub(crate) fn clear_weak(
        &mut self,
        weak_keys: bool,
        weak_values: bool,
        mut is_cleared: impl FnMut(&LuaValue, bool) -> bool,
    ) {
        if weak_values {
            for v in self.array.iter_mut() {
                if is_cleared(v, false) {
                    *v = LuaValue::Nil;
                }
            }
        }
        for node in self.hash.nodes_mut() {
            if node.value.is_nil() {
                continue;
            }
            if (weak_keys && is_cleared(&node.key, true)) || (weak_values && is_cleared(&node.value, false)) {
                node.value = LuaValue::Nil;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> LuaValue {
        LuaValue::Number(n)
    }

    #[test]
    fn test_sparse_key_stays_in_hash_part() {
        let mut t = LuaTable::default();
        t.raw_set(num(1.0), LuaValue::Boolean(true));
        t.raw_set(num(2.0), LuaValue::Boolean(true));
        t.raw_set(num(4.0), LuaValue::Boolean(true));
        assert_eq!(t.array_size(), 2);
        assert!(t.hash_size() >= 1);
        assert_eq!(t.length(), 2);
        assert_eq!(t.get_int(4), LuaValue::Boolean(true));
    }

    #[test]
    fn test_sequence_migrates_into_array_part() {
        let mut t = LuaTable::default();
        for i in 1..=100 {
            t.raw_set_int(i, num(i as f64 * 10.0));
        }
        assert_eq!(t.length(), 100);
        assert!(t.array_size() >= 64);
        for i in 1..=100 {
            assert_eq!(t.get_int(i), num(i as f64 * 10.0));
        }
    }

    #[test]
    fn test_float_keys_normalize_to_integers() {
        let mut t = LuaTable::new(4, 0);
        t.raw_set(num(2.0), LuaValue::Boolean(true));
        assert_eq!(t.get_int(2), LuaValue::Boolean(true));
        t.raw_set(num(2.5), LuaValue::Boolean(false));
        assert_eq!(t.get(&num(2.5)), LuaValue::Boolean(false));
        t.raw_set(num(-0.0), num(7.0));
        assert_eq!(t.get(&num(0.0)), num(7.0));
    }

    #[test]
    fn test_next_visits_every_entry_once() {
        let mut t = LuaTable::default();
        for i in 1..=10 {
            t.raw_set_int(i, num(i as f64));
        }
        for i in 0..10 {
            t.raw_set(LuaValue::Boolean(i % 2 == 0), num(0.0));
            t.raw_set(num(i as f64 + 0.5), num(i as f64));
        }
        let mut seen = 0;
        let mut key = LuaValue::Nil;
        while let Some((k, _)) = t.next(&key).unwrap() {
            seen += 1;
            key = k;
        }
        assert_eq!(seen, 10 + 2 + 10);
        assert_eq!(t.iter().count(), seen);
    }

    #[test]
    fn test_next_survives_clearing_current_key() {
        let mut t = LuaTable::default();
        for i in 0..8 {
            t.raw_set(num(i as f64 + 0.25), num(1.0));
        }
        let mut key = LuaValue::Nil;
        let mut visited = 0;
        while let Some((k, _)) = t.next(&key).unwrap() {
            t.raw_set(k, LuaValue::Nil);
            visited += 1;
            key = k;
        }
        assert_eq!(visited, 8);
        assert_eq!(t.next(&LuaValue::Nil).unwrap(), None);
    }

    #[test]
    fn test_next_rejects_unknown_key() {
        let t = LuaTable::default();
        assert_eq!(t.next(&num(3.5)), Err(InvalidNextKey));
    }

    #[test]
    fn test_length_with_holes_is_a_border() {
        let mut t = LuaTable::new(8, 0);
        for i in [1, 2, 3, 5, 6] {
            t.raw_set_int(i, LuaValue::Boolean(true));
        }
        let n = t.length() as i64;
        assert!(n == 0 || !t.get_int(n).is_nil());
        assert!(t.get_int(n + 1).is_nil());
    }

    #[test]
    fn test_compute_sizes() {
        let mut nums = [0usize; MAXBITS + 1];
        nums[0] = 1;
        nums[1] = 1;
        nums[2] = 1;
        assert_eq!(compute_sizes(&nums, 3), (4, 3));
        let mut sparse = [0usize; MAXBITS + 1];
        sparse[0] = 1;
        sparse[10] = 1;
        assert_eq!(compute_sizes(&sparse, 2), (1, 1));
    }
}
