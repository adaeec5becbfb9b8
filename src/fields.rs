//! Field declarations and their chunk-wise decode, offset and encode
//! dispatch.
//!
//! Values are stored distributed: one map per field, keyed by object
//! identity, split into flushed and unflushed entries. Parallel decoders
//! therefore touch disjoint per-field maps, each behind its own mutex.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SkillError;
use crate::fieldtypes::{FieldType, FieldValue, ReadCtx, WriteCtx};
use crate::pools::{Obj, StoragePool};
use crate::restrictions::FieldRestriction;
use crate::streams::{MappedInStream, StreamError};
use crate::strings::StringPool;

/// The file-level span holding one field's payload.
///
/// A simple chunk covers `count` instances at base indices
/// `[bpo, bpo + count)`. A bulk chunk covers the owning pool's first
/// `block_count` blocks; it is produced when a field is added to a pool
/// that already has blocks on file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Simple {
        begin: u64,
        end: u64,
        bpo: usize,
        count: usize,
    },
    Bulk {
        begin: u64,
        end: u64,
        total_count: usize,
        block_count: usize,
    },
}

impl Chunk {
    #[must_use]
    pub fn begin(&self) -> u64 {
        match self {
            Chunk::Simple { begin, .. } | Chunk::Bulk { begin, .. } => *begin,
        }
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        match self {
            Chunk::Simple { end, .. } | Chunk::Bulk { end, .. } => *end,
        }
    }

    pub(crate) fn set_span(&mut self, new_begin: u64, new_end: u64) {
        match self {
            Chunk::Simple { begin, end, .. } | Chunk::Bulk { begin, end, .. } => {
                *begin = new_begin;
                *end = new_end;
            }
        }
    }
}

/// Distributed storage of one field's values.
#[derive(Debug, Default)]
pub(crate) struct FieldData {
    /// Values of flushed objects.
    pub data: HashMap<u64, FieldValue>,
    /// Values of objects that have not been written yet.
    pub new_data: HashMap<u64, FieldValue>,
}

impl FieldData {
    fn get(&self, oid: u64) -> Option<&FieldValue> {
        self.data.get(&oid).or_else(|| self.new_data.get(&oid))
    }
}

/// One field of a pool.
pub struct FieldDeclaration {
    pub fty: FieldType,
    pub name: Arc<str>,
    /// Positive for data fields, zero or negative for auto fields.
    pub index: i64,
    /// Index of the owning pool.
    pub owner: usize,
    pub restrictions: Vec<Box<dyn FieldRestriction>>,
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) storage: Mutex<FieldData>,
    /// Chunk indices that still await decoding (lazy reads).
    pub(crate) pending: Mutex<Vec<usize>>,
}

impl FieldDeclaration {
    pub(crate) fn new(fty: FieldType, name: Arc<str>, index: i64, owner: usize) -> Self {
        Self {
            fty,
            name,
            index,
            owner,
            restrictions: Vec::new(),
            chunks: Vec::new(),
            storage: Mutex::new(FieldData::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// The stored value of `obj`, if any.
    #[must_use]
    pub fn get(&self, obj: &Obj) -> Option<FieldValue> {
        self.storage.lock().get(obj.oid()).cloned()
    }

    /// The stored value of `obj`, or the type's default.
    #[must_use]
    pub fn get_or_default(&self, obj: &Obj) -> FieldValue {
        self.get(obj).unwrap_or_else(|| self.fty.default_value())
    }

    /// Store a value, routed by whether `obj` has been flushed.
    pub fn set(&self, obj: &Obj, value: FieldValue) {
        let mut st = self.storage.lock();
        if obj.skill_id() == -1 {
            st.data.remove(&obj.oid());
            st.new_data.insert(obj.oid(), value);
        } else {
            st.new_data.remove(&obj.oid());
            st.data.insert(obj.oid(), value);
        }
    }

    /// Merge unflushed values into the flushed map before a write.
    pub(crate) fn compress_storage(&self) {
        let mut st = self.storage.lock();
        let moved: Vec<(u64, FieldValue)> = st.new_data.drain().collect();
        st.data.extend(moved);
    }

    /// True if some chunks are still undecoded.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Decode any chunks deferred by a lazy read.
    pub(crate) fn ensure_loaded(
        &self,
        pools: &[StoragePool],
        strings: &StringPool,
        input: &[u8],
    ) -> Result<(), SkillError> {
        let pending: Vec<usize> = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let cx = ReadCtx { pools, strings };
        let whole = MappedInStream::new(input);
        for ci in pending {
            let chunk = &self.chunks[ci];
            let mut view = whole.view(chunk.begin() as usize, chunk.end() as usize)?;
            self.read_chunk(pools, chunk, &mut view, &cx)?;
        }
        Ok(())
    }

    /// Decode one chunk from its bounded view, verifying that the view is
    /// consumed exactly.
    pub(crate) fn read_chunk(
        &self,
        pools: &[StoragePool],
        chunk: &Chunk,
        s: &mut MappedInStream<'_>,
        cx: &ReadCtx<'_>,
    ) -> Result<(), SkillError> {
        let expected = s.len() as u64;
        match self.decode_chunk(pools, chunk, s, cx) {
            Ok(()) => {
                if !s.eof() {
                    return Err(self.size_mismatch(expected, s.position() as u64));
                }
                Ok(())
            }
            Err(SkillError::Stream(StreamError::BufferOverflow { .. })) => {
                Err(self.size_mismatch(expected, s.position() as u64))
            }
            Err(e) => Err(e),
        }
    }

    fn size_mismatch(&self, expected: u64, consumed: u64) -> SkillError {
        SkillError::PoolSizeMismatch {
            field: self.name.to_string(),
            expected,
            consumed,
        }
    }

    fn decode_chunk(
        &self,
        pools: &[StoragePool],
        chunk: &Chunk,
        s: &mut MappedInStream<'_>,
        cx: &ReadCtx<'_>,
    ) -> Result<(), SkillError> {
        match chunk {
            Chunk::Simple { bpo, count, .. } => self.decode_range(pools, *bpo, *count, s, cx),
            Chunk::Bulk { block_count, .. } => {
                let blocks: Vec<_> = pools[self.owner].blocks[..*block_count].to_vec();
                for b in blocks {
                    self.decode_range(pools, b.bpo, b.dynamic_count, s, cx)?;
                }
                Ok(())
            }
        }
    }

    fn decode_range(
        &self,
        pools: &[StoragePool],
        bpo: usize,
        count: usize,
        s: &mut MappedInStream<'_>,
        cx: &ReadCtx<'_>,
    ) -> Result<(), SkillError> {
        let data = &pools[pools[self.owner].base_pool].data;
        let objs = data
            .get(bpo..bpo + count)
            .ok_or(SkillError::MalformedData("chunk outside the backing array"))?;
        let mut st = self.storage.lock();
        for obj in objs {
            let v = self.fty.read_value(s, cx)?;
            st.data.insert(obj.oid(), v);
        }
        Ok(())
    }

    /// Number of payload bytes this chunk will occupy.
    pub(crate) fn offset_chunk(
        &self,
        pools: &[StoragePool],
        chunk: &Chunk,
        cx: &WriteCtx<'_>,
    ) -> Result<u64, SkillError> {
        match chunk {
            Chunk::Simple { bpo, count, .. } => self.offset_range(pools, *bpo, *count, cx),
            Chunk::Bulk { block_count, .. } => {
                let blocks: Vec<_> = pools[self.owner].blocks[..*block_count].to_vec();
                let mut sum = 0;
                for b in blocks {
                    sum += self.offset_range(pools, b.bpo, b.dynamic_count, cx)?;
                }
                Ok(sum)
            }
        }
    }

    fn offset_range(
        &self,
        pools: &[StoragePool],
        bpo: usize,
        count: usize,
        cx: &WriteCtx<'_>,
    ) -> Result<u64, SkillError> {
        let data = &pools[pools[self.owner].base_pool].data;
        let st = self.storage.lock();
        let mut sum = 0;
        for obj in &data[bpo..bpo + count] {
            match st.get(obj.oid()) {
                Some(v) => sum += self.fty.offset(v, cx)?,
                None => sum += self.fty.offset(&self.fty.default_value(), cx)?,
            }
        }
        Ok(sum)
    }

    /// Encode one chunk; emits exactly the bytes [`Self::offset_chunk`]
    /// predicted.
    pub(crate) fn write_chunk<W: Write>(
        &self,
        pools: &[StoragePool],
        chunk: &Chunk,
        w: &mut W,
        cx: &WriteCtx<'_>,
    ) -> Result<(), SkillError> {
        match chunk {
            Chunk::Simple { bpo, count, .. } => self.write_range(pools, *bpo, *count, w, cx),
            Chunk::Bulk { block_count, .. } => {
                let blocks: Vec<_> = pools[self.owner].blocks[..*block_count].to_vec();
                for b in blocks {
                    self.write_range(pools, b.bpo, b.dynamic_count, w, cx)?;
                }
                Ok(())
            }
        }
    }

    fn write_range<W: Write>(
        &self,
        pools: &[StoragePool],
        bpo: usize,
        count: usize,
        w: &mut W,
        cx: &WriteCtx<'_>,
    ) -> Result<(), SkillError> {
        let data = &pools[pools[self.owner].base_pool].data;
        let st = self.storage.lock();
        for obj in &data[bpo..bpo + count] {
            match st.get(obj.oid()) {
                Some(v) => self.fty.write_value(v, w, cx)?,
                None => self.fty.write_value(&self.fty.default_value(), w, cx)?,
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FieldDeclaration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDeclaration")
            .field("name", &self.name)
            .field("fty", &self.fty)
            .field("index", &self.index)
            .field("owner", &self.owner)
            .field("chunks", &self.chunks)
            .finish()
    }
}
