use crate::LuaValue;

/// Hash part of a table - chained scatter table with Brent's variation.
///
/// Invariant: if a key is not in its main position, the key occupying that
/// main position is in its own main position. Colliding nodes link through
/// `next` into a chain that always starts at the main position.
pub(crate) struct LuaHashTable {
    nodes: Vec<Node>,
    /// Free slots are searched downwards from here.
    last_free: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Node {
    pub key: LuaValue,
    pub value: LuaValue,
    /// Absolute index of the next node in the collision chain.
    pub next: Option<u32>,
}

impl LuaHashTable {
    /// Table with room for at least `size` entries (rounded up to a power of two).
    pub fn with_size(size: usize) -> Self {
        let size = if size == 0 { 0 } else { size.next_power_of_two() };
        Self {
            nodes: vec![Node::default(); size],
            last_free: size,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline(always)]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline(always)]
    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }

    /// Slot a key would occupy without collisions.
    fn main_position(&self, key: &LuaValue) -> usize {
        let size = self.nodes.len();
        let pow2 = |h: u32| h as usize & (size - 1);
        let modp = |h: u32| h as usize % ((size - 1) | 1);
        match key {
            LuaValue::Number(n) => {
                if *n == 0.0 {
                    // +0 and -0 must land together
                    0
                } else {
                    let bits = n.to_bits();
                    modp((bits as u32).wrapping_add((bits >> 32) as u32))
                }
            }
            LuaValue::String(s) => pow2(s.hash()),
            LuaValue::Boolean(b) => pow2(*b as u32),
            LuaValue::LightUserdata(p) => {
                let p = *p as u64;
                modp((p as u32) ^ ((p >> 32) as u32))
            }
            LuaValue::Nil => 0,
            other => match other.gc_ref() {
                Some(r) => modp(r.index),
                None => 0,
            },
        }
    }

    /// Find the node holding `key` (its value may be nil).
    #[inline]
    pub fn find(&self, key: &LuaValue) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut idx = self.main_position(key);
        loop {
            let node = &self.nodes[idx];
            if node.key == *key {
                return Some(idx);
            }
            idx = node.next? as usize;
        }
    }

    #[inline]
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        match self.find(key) {
            Some(idx) => self.nodes[idx].value,
            None => LuaValue::Nil,
        }
    }

    #[inline(always)]
    pub fn value_mut(&mut self, idx: usize) -> &mut LuaValue {
        &mut self.nodes[idx].value
    }

    fn get_free_pos(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].key.is_nil() {
                return Some(self.last_free);
            }
        }
        None
    }

    /// Insert a key known to be absent, returning the node that now holds it
    /// (with a nil value). `None` means the table is full and must be rehashed.
    pub fn insert_new_key(&mut self, key: LuaValue) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut mp = self.main_position(&key);
        if !self.nodes[mp].value.is_nil() {
            let free = self.get_free_pos()?;
            let other = self.main_position(&self.nodes[mp].key);
            if other != mp {
                // Colliding node is out of its main position: move it to the
                // free slot and take its place.
                let mut prev = other;
                while let Some(next) = self.nodes[prev].next {
                    if next as usize == mp {
                        break;
                    }
                    prev = next as usize;
                }
                self.nodes[prev].next = Some(free as u32);
                self.nodes[free] = self.nodes[mp];
                self.nodes[mp].next = None;
                self.nodes[mp].value = LuaValue::Nil;
            } else {
                // Colliding node owns this main position: new key goes to the
                // free slot, chained right after it.
                self.nodes[free].next = self.nodes[mp].next;
                self.nodes[mp].next = Some(free as u32);
                mp = free;
            }
        }
        self.nodes[mp].key = key;
        Some(mp)
    }
}
