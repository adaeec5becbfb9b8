//! [`SkillFile`]: the user-facing state holding pools, strings and the
//! backing file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::SkillError;
use crate::fields::FieldDeclaration;
use crate::fieldtypes::{FieldType, FieldValue};
use crate::parse;
use crate::pools::{self, Obj, StoragePool};
use crate::restrictions::FieldRestriction;
use crate::strings::StringPool;
use crate::write;

/// How field data is decoded on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Decode all field data in parallel during open.
    #[default]
    Eager,
    /// Defer per-field decoding until first access.
    Lazy,
}

/// A live SKilL state: the object graph of one file.
pub struct SkillFile {
    pub(crate) pools: Vec<StoragePool>,
    pub(crate) pools_by_name: HashMap<Arc<str>, usize>,
    pub(crate) strings: StringPool,
    pub(crate) input: Option<Arc<Mmap>>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) mode: ReadMode,
}

impl SkillFile {
    /// Parse the file at `path`.
    pub fn open(path: impl AsRef<Path>, mode: ReadMode) -> Result<Self, SkillError> {
        parse::read_file(path.as_ref(), mode)
    }

    /// An empty state without a backing file.
    #[must_use]
    pub fn create() -> Self {
        Self {
            pools: Vec::new(),
            pools_by_name: HashMap::new(),
            strings: StringPool::new(None),
            input: None,
            path: None,
            mode: ReadMode::Eager,
        }
    }

    #[must_use]
    pub fn read_mode(&self) -> ReadMode {
        self.mode
    }

    /// All pools, ordered by type id.
    #[must_use]
    pub fn pools(&self) -> &[StoragePool] {
        &self.pools
    }

    /// Index of the pool called `name`.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<usize> {
        self.pools_by_name.get(name).copied()
    }

    #[must_use]
    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    /// Intern a string into the pool.
    pub fn add_string(&self, s: &str) -> Arc<str> {
        self.strings.add(s)
    }

    /// Declare a new type; `super_pool` links it below an existing one.
    pub fn create_pool(
        &mut self,
        name: &str,
        super_pool: Option<usize>,
    ) -> Result<usize, SkillError> {
        let interned = self.strings.add(name);
        if self.pools_by_name.contains_key(&interned) {
            return Err(SkillError::InvalidArgument(format!(
                "type {name} already exists"
            )));
        }
        let idx = self.pools.len();
        let (super_pool, base_pool, height) = match super_pool {
            None => (None, idx, 0),
            Some(s) => {
                if s >= self.pools.len() {
                    return Err(SkillError::InvalidPoolIndex {
                        index: s as u64,
                        size: self.pools.len(),
                    });
                }
                (
                    Some(s),
                    self.pools[s].base_pool,
                    self.pools[s].type_hierarchy_height + 1,
                )
            }
        };
        self.pools.push(StoragePool::new(
            idx,
            interned.clone(),
            super_pool,
            base_pool,
            height,
        ));
        self.pools_by_name.insert(interned, idx);
        pools::establish_next_pools(&mut self.pools);
        Ok(idx)
    }

    /// Declare a data field on `pool`; returns its signed field index
    /// (>= 1).
    pub fn add_field(
        &mut self,
        pool: usize,
        name: &str,
        fty: FieldType,
    ) -> Result<i64, SkillError> {
        self.check_pool(pool)?;
        let interned = self.strings.add(name);
        let p = &mut self.pools[pool];
        if p.field(name).is_some() {
            return Err(SkillError::InvalidArgument(format!(
                "field {name} already exists on {}",
                p.name
            )));
        }
        let index = p.data_fields.len() as i64 + 1;
        p.data_fields
            .push(FieldDeclaration::new(fty, interned, index, pool));
        Ok(index)
    }

    /// Declare a field that lives only in memory and is never serialized;
    /// returns its signed field index (<= 0).
    ///
    /// The name is not interned: auto fields never reach the file, so it
    /// must not end up in the string table.
    pub fn add_auto_field(
        &mut self,
        pool: usize,
        name: &str,
        fty: FieldType,
    ) -> Result<i64, SkillError> {
        self.check_pool(pool)?;
        let p = &mut self.pools[pool];
        if p.field(name).is_some() {
            return Err(SkillError::InvalidArgument(format!(
                "field {name} already exists on {}",
                p.name
            )));
        }
        let index = -(p.auto_fields.len() as i64);
        p.auto_fields
            .push(FieldDeclaration::new(fty, name.into(), index, pool));
        Ok(index)
    }

    /// Attach a restriction to a field.
    pub fn add_restriction(
        &mut self,
        pool: usize,
        field: i64,
        restriction: Box<dyn FieldRestriction>,
    ) -> Result<(), SkillError> {
        self.field_decl(pool, field)?;
        let p = &mut self.pools[pool];
        let decl = if field >= 1 {
            &mut p.data_fields[field as usize - 1]
        } else {
            &mut p.auto_fields[field.unsigned_abs() as usize]
        };
        decl.restrictions.push(restriction);
        Ok(())
    }

    /// Create a default-initialized instance in `pool`.
    pub fn make(&mut self, pool: usize) -> Result<Obj, SkillError> {
        self.check_pool(pool)?;
        pools::make(&mut self.pools, pool)
    }

    /// Reserve room for instances about to be created.
    pub fn hint_new_objects_size(&mut self, pool: usize, additional: usize) {
        if let Some(p) = self.pools.get_mut(pool) {
            p.reserve_new(additional);
        }
    }

    /// Mark `obj` deleted; its slot is reclaimed by the next full write.
    pub fn delete(&mut self, obj: &Obj) {
        pools::delete(&mut self.pools, obj);
    }

    /// O(1) lookup; `None` for ids that are out of range or belong to an
    /// unrelated type.
    #[must_use]
    pub fn get_by_id(&self, pool: usize, id: i64) -> Option<Obj> {
        pools::get_by_id(&self.pools, pool, id)
    }

    /// Number of non-deleted instances of `pool` and its subtypes.
    #[must_use]
    pub fn size(&self, pool: usize) -> usize {
        pools::size_of(&self.pools, pool)
    }

    /// Instances whose dynamic type is exactly `pool`, including unflushed
    /// ones.
    #[must_use]
    pub fn static_size(&self, pool: usize) -> usize {
        self.pools[pool].static_size()
    }

    /// Non-deleted instances of `pool` and its subtypes: existing ones
    /// block by block, then unflushed ones in weak type order.
    pub fn instances(&self, pool: usize) -> impl Iterator<Item = Obj> + '_ {
        pools::dynamic_instances(&self.pools, pool)
            .filter(|o| !o.is_deleted())
            .cloned()
    }

    /// Non-deleted instances grouped by dynamic type in weak type order.
    pub fn instances_in_type_order(&self, pool: usize) -> impl Iterator<Item = Obj> + '_ {
        pools::type_order_instances(&self.pools, pool)
            .filter(|o| !o.is_deleted())
            .cloned()
    }

    /// The value of a field on `obj`, decoding deferred chunks on demand.
    ///
    /// `field` is the signed index: >= 1 addresses data fields, <= 0 auto
    /// fields.
    pub fn get(&self, pool: usize, field: i64, obj: &Obj) -> Result<FieldValue, SkillError> {
        let f = self.field_decl(pool, field)?;
        if f.is_pending() {
            if let Some(input) = &self.input {
                f.ensure_loaded(&self.pools, &self.strings, &input[..])?;
            }
        }
        Ok(f.get_or_default(obj))
    }

    /// Store a field value on `obj`, addressed by signed field index.
    pub fn set(
        &self,
        pool: usize,
        field: i64,
        obj: &Obj,
        value: FieldValue,
    ) -> Result<(), SkillError> {
        self.field_decl(pool, field)?.set(obj, value);
        Ok(())
    }

    /// Run every field restriction over every non-deleted instance.
    pub fn check(&self) -> Result<(), SkillError> {
        for (pi, p) in self.pools.iter().enumerate() {
            for f in p.data_fields.iter().chain(p.auto_fields.iter()) {
                if f.restrictions.is_empty() {
                    continue;
                }
                if f.is_pending() {
                    if let Some(input) = &self.input {
                        f.ensure_loaded(&self.pools, &self.strings, &input[..])?;
                    }
                }
                for obj in pools::dynamic_instances(&self.pools, pi) {
                    if obj.is_deleted() {
                        continue;
                    }
                    let v = f.get_or_default(obj);
                    for r in &f.restrictions {
                        r.check(&v).map_err(|reason| SkillError::RestrictionViolation {
                            field: format!("{}.{}", p.name, f.name),
                            reason,
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Full rewrite to `path`: dense ids, deleted instances dropped.
    pub fn write(&mut self, path: impl AsRef<Path>) -> Result<(), SkillError> {
        write::compress(self, path.as_ref())
    }

    /// Append new strings, instances and fields to the backing file.
    pub fn append(&mut self) -> Result<(), SkillError> {
        write::append(self)
    }

    /// Copy the backing file to `path` and append there.
    pub fn append_to(&mut self, path: impl AsRef<Path>) -> Result<(), SkillError> {
        let src = self.path.clone().ok_or(SkillError::NoBackingFile)?;
        let dst = path.as_ref();
        if src != dst {
            std::fs::copy(&src, dst)?;
            self.path = Some(dst.to_path_buf());
        }
        write::append(self)
    }

    /// Release the state.
    pub fn close(self) {}

    /// Decode every chunk still deferred by a lazy open.
    pub(crate) fn ensure_all_loaded(&self) -> Result<(), SkillError> {
        let input = match &self.input {
            Some(m) => m.clone(),
            None => return Ok(()),
        };
        for p in &self.pools {
            for f in &p.data_fields {
                if f.is_pending() {
                    f.ensure_loaded(&self.pools, &self.strings, &input[..])?;
                }
            }
        }
        Ok(())
    }

    fn check_pool(&self, pool: usize) -> Result<(), SkillError> {
        if pool >= self.pools.len() {
            return Err(SkillError::InvalidPoolIndex {
                index: pool as u64,
                size: self.pools.len(),
            });
        }
        Ok(())
    }

    /// Resolve a signed field index against the two disjoint field
    /// vectors of `pool`.
    fn field_decl(&self, pool: usize, field: i64) -> Result<&FieldDeclaration, SkillError> {
        self.check_pool(pool)?;
        let p = &self.pools[pool];
        p.declaration(field).ok_or(SkillError::InvalidPoolIndex {
            index: field.unsigned_abs(),
            size: p.data_fields.len() + p.auto_fields.len(),
        })
    }
}
