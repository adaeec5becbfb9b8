//! Storage pools: the in-memory representation of the type hierarchy.
//!
//! Pools form a forest. Every hierarchy shares one contiguous backing array
//! owned by its base pool; sub-pools address it through block bookkeeping.
//! An object's `skill_id` is its index + 1 into that array, which makes id
//! lookup O(1). Pools reference each other by index into the state's pool
//! vector, never by pointer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::SkillError;
use crate::fields::{Chunk, FieldDeclaration};
use crate::fieldtypes::FIRST_POOL_TYPE_ID;

static NEXT_OID: AtomicU64 = AtomicU64::new(1);

/// A dynamic instance of a user type.
///
/// `oid` is a process-unique identity used to key distributed field
/// storage; it never changes. `skill_id` is the file identity: -1 for
/// objects not yet flushed, 0 for deleted objects, otherwise the index + 1
/// into the base pool's backing array.
pub struct SkillObject {
    oid: u64,
    skill_id: AtomicI64,
    pool: usize,
}

/// Shared handle to an object.
pub type Obj = Arc<SkillObject>;

impl SkillObject {
    pub(crate) fn new(pool: usize, skill_id: i64) -> Obj {
        Arc::new(Self {
            oid: NEXT_OID.fetch_add(1, Ordering::Relaxed),
            skill_id: AtomicI64::new(skill_id),
            pool,
        })
    }

    #[must_use]
    pub fn skill_id(&self) -> i64 {
        self.skill_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_skill_id(&self, id: i64) {
        self.skill_id.store(id, Ordering::Release);
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.skill_id() == 0
    }

    /// Index of the pool holding this object's dynamic type.
    #[must_use]
    pub fn pool(&self) -> usize {
        self.pool
    }

    pub(crate) fn oid(&self) -> u64 {
        self.oid
    }
}

impl PartialEq for SkillObject {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
    }
}

impl Eq for SkillObject {}

impl std::hash::Hash for SkillObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.oid.hash(state);
    }
}

impl std::fmt::Debug for SkillObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillObject")
            .field("skill_id", &self.skill_id())
            .field("pool", &self.pool)
            .finish()
    }
}

/// One pool's contribution to one file block.
///
/// `bpo` is the absolute index into the backing array where the block's
/// instances begin. `dynamic_count` includes subtype instances,
/// `static_count` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub bpo: usize,
    pub static_count: usize,
    pub dynamic_count: usize,
}

/// The container for all instances of one user type.
pub struct StoragePool {
    pub name: Arc<str>,
    /// Stable type id; the first pool gets 32.
    pub type_id: i64,
    pub super_pool: Option<usize>,
    pub base_pool: usize,
    pub type_hierarchy_height: u32,
    /// Next pool in depth-first pre-order within this hierarchy.
    pub next_pool: Option<usize>,
    /// Backing array of the whole hierarchy; populated on base pools only.
    pub(crate) data: Vec<Obj>,
    pub(crate) blocks: Vec<Block>,
    pub(crate) new_objects: Vec<Obj>,
    /// Non-new instances whose dynamic type is exactly this pool.
    pub(crate) static_data_instances: usize,
    pub(crate) deleted_count: usize,
    fixed: bool,
    cached_size: usize,
    pub(crate) data_fields: Vec<FieldDeclaration>,
    pub(crate) auto_fields: Vec<FieldDeclaration>,
}

impl StoragePool {
    pub(crate) fn new(
        index: usize,
        name: Arc<str>,
        super_pool: Option<usize>,
        base_pool: usize,
        type_hierarchy_height: u32,
    ) -> Self {
        Self {
            name,
            type_id: FIRST_POOL_TYPE_ID + index as i64,
            super_pool,
            base_pool,
            type_hierarchy_height,
            next_pool: None,
            data: Vec::new(),
            blocks: Vec::new(),
            new_objects: Vec::new(),
            static_data_instances: 0,
            deleted_count: 0,
            fixed: false,
            cached_size: 0,
            data_fields: Vec::new(),
            auto_fields: Vec::new(),
        }
    }

    /// Own index in the state's pool vector.
    #[must_use]
    pub fn index(&self) -> usize {
        (self.type_id - FIRST_POOL_TYPE_ID) as usize
    }

    /// Instances of exactly this type, including unflushed ones.
    #[must_use]
    pub fn static_size(&self) -> usize {
        self.static_data_instances + self.new_objects.len()
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    #[must_use]
    pub fn cached_size(&self) -> usize {
        self.cached_size
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDeclaration] {
        &self.data_fields
    }

    /// Fields that live only in memory and are never serialized.
    #[must_use]
    pub fn auto_fields(&self) -> &[FieldDeclaration] {
        &self.auto_fields
    }

    /// Signed index of the field called `name`: >= 1 for data fields,
    /// <= 0 for auto fields stored at position `-index`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<i64> {
        if let Some(i) = self.data_fields.iter().position(|f| &*f.name == name) {
            return Some(i as i64 + 1);
        }
        self.auto_fields
            .iter()
            .position(|f| &*f.name == name)
            .map(|i| -(i as i64))
    }

    /// Position of the data field called `name`, ignoring auto fields.
    pub(crate) fn data_field(&self, name: &str) -> Option<usize> {
        self.data_fields.iter().position(|f| &*f.name == name)
    }

    /// The declaration behind a signed field index.
    #[must_use]
    pub fn declaration(&self, index: i64) -> Option<&FieldDeclaration> {
        if index >= 1 {
            self.data_fields.get(index as usize - 1)
        } else {
            self.auto_fields.get(index.unsigned_abs() as usize)
        }
    }

    /// Register an unflushed instance.
    pub(crate) fn add(&mut self, obj: Obj) -> Result<(), SkillError> {
        if self.fixed {
            return Err(SkillError::PoolFixed {
                pool: self.name.to_string(),
            });
        }
        self.new_objects.push(obj);
        Ok(())
    }

    pub(crate) fn reserve_new(&mut self, additional: usize) {
        self.new_objects.reserve(additional);
    }
}

/// Create a default-initialized instance in `pool`.
pub(crate) fn make(pools: &mut [StoragePool], pool: usize) -> Result<Obj, SkillError> {
    let obj = SkillObject::new(pool, -1);
    pools[pool].add(obj.clone())?;
    Ok(obj)
}

/// Mark `obj` deleted. Idempotent; the backing-array slot is kept until the
/// next full rewrite reissues ids.
pub(crate) fn delete(pools: &mut [StoragePool], obj: &Obj) {
    if obj.is_deleted() {
        return;
    }
    obj.set_skill_id(0);
    pools[obj.pool()].deleted_count += 1;
}

/// True if `pool` is `ancestor` or transitively below it.
pub(crate) fn is_subtype(pools: &[StoragePool], mut pool: usize, ancestor: usize) -> bool {
    loop {
        if pool == ancestor {
            return true;
        }
        match pools[pool].super_pool {
            Some(s) => pool = s,
            None => return false,
        }
    }
}

/// O(1) id lookup. Out-of-range ids and ids of instances outside `pool`'s
/// subtree yield `None`.
pub(crate) fn get_by_id(pools: &[StoragePool], pool: usize, id: i64) -> Option<Obj> {
    let data = &pools[pools[pool].base_pool].data;
    if id < 1 || id as usize > data.len() {
        return None;
    }
    let obj = &data[id as usize - 1];
    if is_subtype(pools, obj.pool(), pool) {
        Some(obj.clone())
    } else {
        None
    }
}

/// Pools of `pool`'s subtree in weak type order, `pool` first.
///
/// Relies on the next-pool chain: the subtree is the consecutive run of
/// pools strictly below `pool`'s height.
pub(crate) fn subtree(pools: &[StoragePool], pool: usize) -> Vec<usize> {
    let mut out = vec![pool];
    let height = pools[pool].type_hierarchy_height;
    let mut cur = pools[pool].next_pool;
    while let Some(t) = cur {
        if pools[t].type_hierarchy_height <= height {
            break;
        }
        out.push(t);
        cur = pools[t].next_pool;
    }
    out
}

/// Number of non-deleted instances of `pool` and its subtypes.
pub(crate) fn size_of(pools: &[StoragePool], pool: usize) -> usize {
    if pools[pool].fixed {
        return pools[pool].cached_size;
    }
    subtree(pools, pool)
        .into_iter()
        .map(|q| pools[q].static_size().saturating_sub(pools[q].deleted_count))
        .sum()
}

/// Unflushed instances of `pool` and its subtypes.
pub(crate) fn new_dynamic_size(pools: &[StoragePool], pool: usize) -> usize {
    subtree(pools, pool)
        .into_iter()
        .map(|q| pools[q].new_objects.len())
        .sum()
}

/// Recompute the next-pool chains so that iteration yields depth-first
/// pre-order within each base hierarchy.
pub(crate) fn establish_next_pools(pools: &mut [StoragePool]) {
    let n = pools.len();
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        pools[i].next_pool = None;
        if let Some(s) = pools[i].super_pool {
            children[s].push(i);
        }
    }
    for root in 0..n {
        if pools[root].super_pool.is_some() {
            continue;
        }
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(t) = stack.pop() {
            order.push(t);
            for &c in children[t].iter().rev() {
                stack.push(c);
            }
        }
        for w in order.windows(2) {
            pools[w[0]].next_pool = Some(w[1]);
        }
    }
}

/// Cache every pool's dynamic size and forbid structural mutation.
///
/// Children are accumulated into their parents after all own sizes are in
/// place, so the pass is idempotent.
pub(crate) fn fix_pools(pools: &mut [StoragePool]) {
    for p in pools.iter_mut() {
        p.cached_size = p.static_size().saturating_sub(p.deleted_count);
        p.fixed = true;
    }
    for i in (0..pools.len()).rev() {
        if let Some(s) = pools[i].super_pool {
            let c = pools[i].cached_size;
            pools[s].cached_size += c;
        }
    }
}

pub(crate) fn unfix_pools(pools: &mut [StoragePool]) {
    for p in pools.iter_mut() {
        p.fixed = false;
    }
}

/// Post-rewrite bookkeeping: ids are dense again, deletions are gone, and
/// each pool is described by a single block.
pub(crate) fn update_after_compress(pools: &mut [StoragePool], lbpo_map: &[usize]) {
    for (i, p) in pools.iter_mut().enumerate() {
        let statics =
            p.static_data_instances as i64 + p.new_objects.len() as i64 - p.deleted_count as i64;
        p.static_data_instances = statics.max(0) as usize;
        p.deleted_count = 0;
        p.new_objects.clear();
        p.blocks = vec![Block {
            bpo: lbpo_map[i],
            static_count: p.static_data_instances,
            dynamic_count: p.cached_size,
        }];
    }
}

/// Pre-append bookkeeping for one pool: record the new block and produce
/// the chunk every data field contributes to it.
///
/// A field that was never written and whose pool already has blocks on
/// file gets a bulk chunk over all blocks; otherwise a simple chunk over
/// the new instances, or nothing if there are none. Produced chunks are
/// collected into `chunk_map` for the offset and write phases.
pub(crate) fn update_after_prepare_append(
    pools: &mut [StoragePool],
    pool: usize,
    bpo: usize,
    new_dynamic: usize,
    chunk_map: &mut HashMap<(usize, usize), Chunk>,
) {
    let block = Block {
        bpo,
        static_count: pools[pool].new_objects.len(),
        dynamic_count: new_dynamic,
    };
    pools[pool].blocks.push(block);
    let total: usize = pools[pool].blocks.iter().map(|b| b.dynamic_count).sum();
    let block_count = pools[pool].blocks.len();
    for (fi, f) in pools[pool].data_fields.iter().enumerate() {
        let chunk = if f.chunks.is_empty() && block_count > 1 {
            Some(Chunk::Bulk {
                begin: 0,
                end: 0,
                total_count: total,
                block_count,
            })
        } else if f.chunks.is_empty() || new_dynamic > 0 {
            Some(Chunk::Simple {
                begin: 0,
                end: 0,
                bpo,
                count: new_dynamic,
            })
        } else {
            None
        };
        if let Some(c) = chunk {
            chunk_map.insert((pool, fi), c);
        }
    }
    let added = pools[pool].new_objects.len();
    pools[pool].static_data_instances += added;
    pools[pool].new_objects.clear();
}

/// Existing instances block by block, then every unflushed object of the
/// hierarchy, in weak type order. Deleted instances are not filtered.
pub(crate) fn dynamic_instances<'a>(
    pools: &'a [StoragePool],
    pool: usize,
) -> impl Iterator<Item = &'a Obj> + 'a {
    let data = &pools[pools[pool].base_pool].data;
    let block_slices: Vec<&'a [Obj]> = pools[pool]
        .blocks
        .iter()
        .map(|b| &data[b.bpo..b.bpo + b.dynamic_count])
        .collect();
    let new_slices: Vec<&'a [Obj]> = subtree(pools, pool)
        .into_iter()
        .map(|q| pools[q].new_objects.as_slice())
        .collect();
    block_slices
        .into_iter()
        .chain(new_slices)
        .flat_map(|s| s.iter())
}

/// Per pool of the subtree: existing static instances, then unflushed
/// objects. This is the order a full rewrite lays instances out in.
pub(crate) fn type_order_instances<'a>(
    pools: &'a [StoragePool],
    pool: usize,
) -> impl Iterator<Item = &'a Obj> + 'a {
    let mut slices: Vec<&'a [Obj]> = Vec::new();
    for q in subtree(pools, pool) {
        let data = &pools[pools[q].base_pool].data;
        for b in &pools[q].blocks {
            slices.push(&data[b.bpo..b.bpo + b.static_count]);
        }
        slices.push(pools[q].new_objects.as_slice());
    }
    slices.into_iter().flat_map(|s| s.iter())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forest() -> Vec<StoragePool> {
        // a; b: a; c: b; d: a; e (second hierarchy)
        let mut pools = vec![
            StoragePool::new(0, "a".into(), None, 0, 0),
            StoragePool::new(1, "b".into(), Some(0), 0, 1),
            StoragePool::new(2, "c".into(), Some(1), 0, 2),
            StoragePool::new(3, "d".into(), Some(0), 0, 1),
            StoragePool::new(4, "e".into(), None, 4, 0),
        ];
        establish_next_pools(&mut pools);
        pools
    }

    #[test]
    fn next_pools_form_preorder() {
        let pools = forest();
        assert_eq!(pools[0].next_pool, Some(1));
        assert_eq!(pools[1].next_pool, Some(2));
        assert_eq!(pools[2].next_pool, Some(3));
        assert_eq!(pools[3].next_pool, None);
        assert_eq!(pools[4].next_pool, None);
        assert_eq!(subtree(&pools, 0), vec![0, 1, 2, 3]);
        assert_eq!(subtree(&pools, 1), vec![1, 2]);
        assert_eq!(subtree(&pools, 4), vec![4]);
    }

    #[test]
    fn fix_is_idempotent() {
        let mut pools = forest();
        for _ in 0..2 {
            make(&mut pools, 1).unwrap();
        }
        make(&mut pools, 2).unwrap();

        fix_pools(&mut pools);
        assert_eq!(pools[0].cached_size(), 3);
        assert_eq!(pools[1].cached_size(), 3);
        assert_eq!(pools[2].cached_size(), 1);
        fix_pools(&mut pools);
        assert_eq!(pools[0].cached_size(), 3);

        unfix_pools(&mut pools);
        fix_pools(&mut pools);
        assert_eq!(pools[0].cached_size(), 3);
        assert_eq!(pools[4].cached_size(), 0);
    }

    #[test]
    fn fixed_pools_reject_additions() {
        let mut pools = forest();
        fix_pools(&mut pools);
        assert!(matches!(
            make(&mut pools, 0),
            Err(SkillError::PoolFixed { .. })
        ));
        unfix_pools(&mut pools);
        assert!(make(&mut pools, 0).is_ok());
    }

    #[test]
    fn delete_is_idempotent_and_size_aware() {
        let mut pools = forest();
        let o = make(&mut pools, 0).unwrap();
        make(&mut pools, 0).unwrap();
        assert_eq!(size_of(&pools, 0), 2);
        delete(&mut pools, &o);
        delete(&mut pools, &o);
        assert_eq!(pools[0].deleted_count, 1);
        assert_eq!(size_of(&pools, 0), 1);
        assert!(o.is_deleted());
    }

    #[test]
    fn id_lookup_checks_range_and_type() {
        let mut pools = forest();
        let o = SkillObject::new(1, 1);
        pools[0].data.push(o.clone());
        assert_eq!(get_by_id(&pools, 0, 1).as_deref(), Some(&*o));
        assert_eq!(get_by_id(&pools, 1, 1).as_deref(), Some(&*o));
        // `d` is not an ancestor of the instance's type `b`
        assert!(get_by_id(&pools, 3, 1).is_none());
        assert!(get_by_id(&pools, 0, 0).is_none());
        assert!(get_by_id(&pools, 0, 2).is_none());
    }
}
