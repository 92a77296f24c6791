//! Open-addressing table keyed by [`CompilationKey`].
//!
//! The slot state lives in the key itself: `Empty` slots end a probe
//! sequence, `Deleted` slots are tombstones that probes skip and inserts
//! reuse. Linear probing over a power-of-two capacity.

use std::fmt;

use super::key::CompilationKey;

const MIN_CAPACITY: usize = 8;

/// Linear-probing hash table from compilation keys to `V`
#[derive(Clone)]
pub struct CompilationTable<V> {
    keys: Vec<CompilationKey>,
    values: Vec<Option<V>>,
    len: usize,
    tombstones: usize,
}

enum Probe {
    Found(usize),
    Vacant(usize),
}

impl<V> CompilationTable<V> {
    /// Empty table; allocates on first insert
    pub fn new() -> Self {
        CompilationTable {
            keys: Vec::new(),
            values: Vec::new(),
            len: 0,
            tombstones: 0,
        }
    }

    /// Live entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Slots holding a `Deleted` marker
    pub fn tombstones(&self) -> usize {
        self.tombstones
    }

    /// Insert or replace; returns the previous value.
    ///
    /// Panics on `Empty`/`Deleted` keys, which are slot states and not keys.
    pub fn insert(&mut self, key: CompilationKey, value: V) -> Option<V> {
        assert!(key.is_valid(), "cannot insert sentinel key {}", key);

        if (self.len + self.tombstones + 1) * 4 > self.capacity() * 3 {
            self.rehash();
        }

        match self.probe(&key) {
            Probe::Found(slot) => self.values[slot].replace(value),
            Probe::Vacant(slot) => {
                if self.keys[slot].is_deleted() {
                    self.tombstones -= 1;
                }
                self.keys[slot] = key;
                self.values[slot] = Some(value);
                self.len += 1;
                None
            }
        }
    }

    pub fn get(&self, key: &CompilationKey) -> Option<&V> {
        let slot = self.find(key)?;
        self.values[slot].as_ref()
    }

    pub fn get_mut(&mut self, key: &CompilationKey) -> Option<&mut V> {
        let slot = self.find(key)?;
        self.values[slot].as_mut()
    }

    pub fn contains_key(&self, key: &CompilationKey) -> bool {
        self.find(key).is_some()
    }

    /// Remove an entry, leaving a tombstone in its slot
    pub fn remove(&mut self, key: &CompilationKey) -> Option<V> {
        let slot = self.find(key)?;
        self.bury(slot)
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&CompilationKey, &mut V) -> bool) {
        for slot in 0..self.keys.len() {
            if !self.keys[slot].is_valid() {
                continue;
            }
            let keep_it = match self.values[slot].as_mut() {
                Some(value) => keep(&self.keys[slot], value),
                None => false,
            };
            if !keep_it {
                self.bury(slot);
            }
        }
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (&CompilationKey, &V)> {
        self.keys
            .iter()
            .zip(self.values.iter())
            .filter_map(|(key, value)| Some((key, value.as_ref()?)))
            .filter(|(key, _)| key.is_valid())
    }

    fn bury(&mut self, slot: usize) -> Option<V> {
        self.keys[slot] = CompilationKey::Deleted;
        self.tombstones += 1;
        self.len -= 1;
        self.values[slot].take()
    }

    fn find(&self, key: &CompilationKey) -> Option<usize> {
        if !key.is_valid() || self.capacity() == 0 {
            return None;
        }
        match self.probe(key) {
            Probe::Found(slot) => Some(slot),
            Probe::Vacant(_) => None,
        }
    }

    /// Walk the probe sequence of `key`. Requires at least one empty slot.
    fn probe(&self, key: &CompilationKey) -> Probe {
        let mask = self.capacity() - 1;
        let mut slot = key.hash_value() as usize & mask;
        let mut first_tombstone = None;
        loop {
            match &self.keys[slot] {
                CompilationKey::Empty => return Probe::Vacant(first_tombstone.unwrap_or(slot)),
                CompilationKey::Deleted => {
                    first_tombstone.get_or_insert(slot);
                }
                existing if existing == key => return Probe::Found(slot),
                _ => {}
            }
            slot = (slot + 1) & mask;
        }
    }

    /// Rebuild with room for growth, dropping every tombstone
    fn rehash(&mut self) {
        let capacity = ((self.len + 1) * 2).next_power_of_two().max(MIN_CAPACITY);
        let keys = std::mem::replace(&mut self.keys, vec![CompilationKey::Empty; capacity]);
        let values = std::mem::replace(
            &mut self.values,
            std::iter::repeat_with(|| None).take(capacity).collect(),
        );
        self.len = 0;
        self.tombstones = 0;

        for (key, value) in keys.into_iter().zip(values) {
            if let (true, Some(value)) = (key.is_valid(), value) {
                if let Probe::Vacant(slot) = self.probe(&key) {
                    self.keys[slot] = key;
                    self.values[slot] = Some(value);
                    self.len += 1;
                }
            }
        }
    }
}

impl<V> Default for CompilationTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for CompilationTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
