//! The lazily materializing string pool.
//!
//! Strings are kept as file positions until first use. Materialization is
//! at-most-once per slot: a lock-free read of the slot is tried first, the
//! pool mutex only guards the decode itself. Serialization deduplicates:
//! every distinct string is written once and addressed by its id; id 0 is
//! reserved for the null string.

use std::sync::{Arc, OnceLock};

use byteorder::{BigEndian, WriteBytesExt};
use indexmap::{IndexMap, IndexSet};
use memmap2::Mmap;
use parking_lot::Mutex;

use crate::error::SkillError;
use crate::streams::V64Write;

pub struct StringPool {
    input: Option<Arc<Mmap>>,
    /// Absolute offset and byte length per id; slot 0 is the null string.
    positions: Vec<(u64, u32)>,
    /// Materialized strings, parallel to `positions`. Write-once slots.
    id_map: Vec<OnceLock<Arc<str>>>,
    load: Mutex<()>,
    /// Every string ever materialized or added, in insertion order.
    known: Mutex<IndexSet<Arc<str>>>,
    /// The id assignment of the current serialization, empty otherwise.
    ids: Mutex<IndexMap<Arc<str>, u64>>,
}

impl StringPool {
    #[must_use]
    pub(crate) fn new(input: Option<Arc<Mmap>>) -> Self {
        Self {
            input,
            positions: vec![(0, 0)],
            id_map: vec![OnceLock::new()],
            load: Mutex::new(()),
            known: Mutex::new(IndexSet::new()),
            ids: Mutex::new(IndexMap::new()),
        }
    }

    /// Number of strings with assigned ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.id_map.len() - 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the file position of the next string id during parsing.
    pub(crate) fn add_position(&mut self, offset: u64, len: u32) {
        self.positions.push((offset, len));
        self.id_map.push(OnceLock::new());
    }

    /// The string behind `id`, materializing it on first access.
    ///
    /// Id 0 is the null string. Safe to call concurrently from parallel
    /// field decoders.
    pub fn get(&self, id: u64) -> Result<Option<Arc<str>>, SkillError> {
        if id == 0 {
            return Ok(None);
        }
        let slot = self
            .id_map
            .get(id as usize)
            .ok_or(SkillError::InvalidPoolIndex {
                index: id,
                size: self.id_map.len(),
            })?;
        if let Some(s) = slot.get() {
            return Ok(Some(s.clone()));
        }
        let _guard = self.load.lock();
        if let Some(s) = slot.get() {
            return Ok(Some(s.clone()));
        }
        let (offset, len) = self.positions[id as usize];
        let input = self
            .input
            .as_ref()
            .ok_or(SkillError::InvalidString { id })?;
        let bytes = input
            .get(offset as usize..offset as usize + len as usize)
            .ok_or(SkillError::InvalidString { id })?;
        let s: Arc<str> = std::str::from_utf8(bytes)
            .map_err(|_| SkillError::InvalidString { id })?
            .into();
        self.known.lock().insert(s.clone());
        let _ = slot.set(s.clone());
        Ok(Some(s))
    }

    /// Intern `s`, returning the shared representation.
    pub fn add(&self, s: &str) -> Arc<str> {
        let mut known = self.known.lock();
        if let Some(existing) = known.get(s) {
            return existing.clone();
        }
        let interned: Arc<str> = s.into();
        known.insert(interned.clone());
        interned
    }

    /// The id assigned to `s` by the current serialization, if any.
    #[must_use]
    pub fn id_of(&self, s: &str) -> Option<u64> {
        self.ids.lock().get(s).copied()
    }

    pub(crate) fn ids_snapshot(&self) -> IndexMap<Arc<str>, u64> {
        self.ids.lock().clone()
    }

    /// Drop the serialization id assignment.
    pub(crate) fn reset_ids(&self) {
        self.ids.lock().clear();
    }

    /// Serialize every known string for a full rewrite.
    ///
    /// Ids are reassigned from 1; strings that had an id keep their
    /// relative order, newly added ones follow in insertion order. Emits
    /// the count, the packed cumulative end offsets and the UTF-8 bytes.
    pub(crate) fn prepare_and_write(&mut self, w: &mut Vec<u8>) -> Result<(), SkillError> {
        let known = self.known.get_mut();
        let mut order: IndexSet<Arc<str>> = IndexSet::with_capacity(known.len());
        for slot in self.id_map.iter().skip(1) {
            if let Some(s) = slot.get() {
                order.insert(s.clone());
            }
        }
        for s in known.iter() {
            order.insert(s.clone());
        }

        w.write_v64(order.len() as i64)?;
        let mut end: i32 = 0;
        for s in &order {
            end += s.len() as i32;
            w.write_i32::<BigEndian>(end)?;
        }

        let ids = self.ids.get_mut();
        ids.clear();
        self.positions = vec![(0, 0)];
        self.id_map = vec![OnceLock::new()];
        for (i, s) in order.iter().enumerate() {
            w.extend_from_slice(s.as_bytes());
            ids.insert(s.clone(), (i + 1) as u64);
            self.positions.push((0, s.len() as u32));
            let slot = OnceLock::new();
            let _ = slot.set(s.clone());
            self.id_map.push(slot);
        }
        Ok(())
    }

    /// Serialize only the strings without an id, for an append. Returns the
    /// number of newly written strings.
    ///
    /// Prior ids are preserved; new strings get the next free ids and only
    /// their bytes are emitted.
    pub(crate) fn prepare_and_append(&mut self, w: &mut Vec<u8>) -> Result<usize, SkillError> {
        let ids = self.ids.get_mut();
        ids.clear();
        for (i, slot) in self.id_map.iter().enumerate().skip(1) {
            if let Some(s) = slot.get() {
                ids.insert(s.clone(), i as u64);
            }
        }

        let known = self.known.get_mut();
        let todo: Vec<Arc<str>> = known
            .iter()
            .filter(|s| !ids.contains_key(*s))
            .cloned()
            .collect();

        w.write_v64(todo.len() as i64)?;
        let mut end: i32 = 0;
        for s in &todo {
            end += s.len() as i32;
            w.write_i32::<BigEndian>(end)?;
        }
        let written = todo.len();
        for s in todo {
            w.extend_from_slice(s.as_bytes());
            let id = self.id_map.len() as u64;
            ids.insert(s.clone(), id);
            self.positions.push((0, s.len() as u32));
            let slot = OnceLock::new();
            let _ = slot.set(s.clone());
            self.id_map.push(slot);
        }
        Ok(written)
    }
}
