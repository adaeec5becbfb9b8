//! The file parse driver.
//!
//! A file is a sequence of blocks; each block carries a string-pool delta,
//! a type section, a field section and the concatenated field payloads.
//! Parsing builds pools and field declarations single-threaded, then fans
//! the per-chunk payload decoding out onto the shared worker pool.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SkillError;
use crate::fields::{Chunk, FieldDeclaration};
use crate::fieldtypes::{FieldType, ReadCtx};
use crate::pools::{self, Block, SkillObject, StoragePool};
use crate::state::{ReadMode, SkillFile};
use crate::streams::MappedInStream;
use crate::strings::StringPool;

/// One payload decode unit: a single chunk of a single field.
pub(crate) struct ReadJob {
    pub pool: usize,
    pub field: usize,
    pub chunk: usize,
}

pub(crate) fn read_file(path: &Path, mode: ReadMode) -> Result<SkillFile, SkillError> {
    let file = File::open(path)?;
    let map = Arc::new(unsafe { Mmap::map(&file)? });
    let mut strings = StringPool::new(Some(map.clone()));
    let mut pools: Vec<StoragePool> = Vec::new();
    let mut by_name: HashMap<Arc<str>, usize> = HashMap::new();
    let mut jobs: Vec<ReadJob> = Vec::new();

    {
        let mut s = MappedInStream::new(&map[..]);
        let mut blocks = 0usize;
        while !s.eof() {
            read_block(&mut s, &mut strings, &mut pools, &mut by_name, &mut jobs)?;
            blocks += 1;
        }
        debug!(
            blocks,
            pools = pools.len(),
            strings = strings.len(),
            jobs = jobs.len(),
            "parsed file structure"
        );
    }
    pools::establish_next_pools(&mut pools);

    if matches!(mode, ReadMode::Lazy) {
        for j in &jobs {
            pools[j.pool].data_fields[j.field]
                .pending
                .get_mut()
                .push(j.chunk);
        }
    }

    let state = SkillFile {
        pools,
        pools_by_name: by_name,
        strings,
        input: Some(map),
        path: Some(path.to_path_buf()),
        mode,
    };
    if matches!(mode, ReadMode::Eager) {
        run_read_jobs(&state, &jobs)?;
        state.check()?;
    }
    Ok(state)
}

struct TypeEntry {
    pool: usize,
    count: usize,
    total_fields: usize,
    prev_fields: usize,
    first_seen: bool,
    block: usize,
}

fn read_block(
    s: &mut MappedInStream<'_>,
    strings: &mut StringPool,
    pools: &mut Vec<StoragePool>,
    by_name: &mut HashMap<Arc<str>, usize>,
    jobs: &mut Vec<ReadJob>,
) -> Result<(), SkillError> {
    // string pool delta: count, cumulative end offsets, UTF-8 runs
    let count = non_negative(s.read_v64()?)?;
    let mut ends = Vec::with_capacity(count);
    for _ in 0..count {
        ends.push(s.read_i32()?);
    }
    let string_data = s.position() as u64;
    let mut prev = 0i32;
    for end in ends {
        if end < prev {
            return Err(SkillError::MalformedData("string offsets not monotonic"));
        }
        strings.add_position(string_data + prev as u64, (end - prev) as u32);
        prev = end;
    }
    s.read_bytes(prev as usize)?;

    // type section
    let tcount = non_negative(s.read_v64()?)?;
    let mut entries: Vec<TypeEntry> = Vec::with_capacity(tcount);
    let mut region_start: HashMap<usize, usize> = HashMap::new();
    for _ in 0..tcount {
        let name_id = s.read_v64()? as u64;
        let name = strings
            .get(name_id)?
            .ok_or(SkillError::MalformedData("type name id is null"))?;
        let count = non_negative(s.read_v64()?)?;
        let (idx, first_seen) = match by_name.get(&name) {
            Some(&idx) => (idx, false),
            None => {
                let restrictions = s.read_u8()?;
                if restrictions != 0 {
                    return Err(SkillError::InvalidTypeSection(format!(
                        "unsupported type restrictions on {name}"
                    )));
                }
                let super_id = non_negative(s.read_v64()?)?;
                let (super_pool, base_pool, height) = if super_id == 0 {
                    (None, pools.len(), 0)
                } else {
                    let sp = super_id - 1;
                    if sp >= pools.len() {
                        return Err(SkillError::InvalidTypeSection(format!(
                            "unknown super type {super_id} of {name}"
                        )));
                    }
                    (
                        Some(sp),
                        pools[sp].base_pool,
                        pools[sp].type_hierarchy_height + 1,
                    )
                };
                let idx = pools.len();
                pools.push(StoragePool::new(
                    idx,
                    name.clone(),
                    super_pool,
                    base_pool,
                    height,
                ));
                by_name.insert(name, idx);
                (idx, true)
            }
        };
        let lbpo = if pools[idx].super_pool.is_some() && count > 0 {
            Some(non_negative(s.read_v64()?)?)
        } else {
            None
        };
        let total_fields = non_negative(s.read_v64()?)?;
        let prev_fields = pools[idx].data_fields.len();
        if total_fields < prev_fields {
            return Err(SkillError::InvalidTypeSection(format!(
                "field count of {} shrank",
                pools[idx].name
            )));
        }
        let base = pools[idx].base_pool;
        let rs = *region_start
            .entry(base)
            .or_insert_with(|| pools[base].data.len());

        let bpo = rs + lbpo.unwrap_or(0);
        pools[idx].blocks.push(Block {
            bpo,
            static_count: 0, // derived below once subtype counts are known
            dynamic_count: count,
        });
        entries.push(TypeEntry {
            pool: idx,
            count,
            total_fields,
            prev_fields,
            first_seen,
            block: pools[idx].blocks.len() - 1,
        });
    }

    // derive static counts and allocate instances
    let mut child_counts: HashMap<usize, usize> = HashMap::new();
    for e in &entries {
        if e.count > 0 && !entries.iter().any(|x| x.pool == pools[e.pool].base_pool) {
            return Err(SkillError::InvalidTypeSection(format!(
                "base pool of {} is missing from the block",
                pools[e.pool].name
            )));
        }
        if let Some(sup) = pools[e.pool].super_pool {
            *child_counts.entry(sup).or_default() += e.count;
        }
    }
    struct Seg {
        bpo: usize,
        static_count: usize,
        pool: usize,
    }
    let mut segs: Vec<Seg> = Vec::new();
    for e in &entries {
        let sub = child_counts.get(&e.pool).copied().unwrap_or(0);
        let statics = e
            .count
            .checked_sub(sub)
            .ok_or_else(|| SkillError::InvalidTypeSection(format!(
                "subtype counts of {} exceed its own count",
                pools[e.pool].name
            )))?;
        let block = &mut pools[e.pool].blocks[e.block];
        block.static_count = statics;
        let bpo = block.bpo;
        pools[e.pool].static_data_instances += statics;
        if statics > 0 {
            segs.push(Seg {
                bpo,
                static_count: statics,
                pool: e.pool,
            });
        }
    }
    segs.sort_by_key(|sg| (pools[sg.pool].base_pool, sg.bpo));
    let mut expected = region_start.clone();
    for sg in &segs {
        let base = pools[sg.pool].base_pool;
        let at = expected
            .get_mut(&base)
            .ok_or(SkillError::MalformedData("segment outside any region"))?;
        if sg.bpo != *at {
            return Err(SkillError::InvalidTypeSection(
                "block offsets do not partition the new region".to_string(),
            ));
        }
        for _ in 0..sg.static_count {
            let id = pools[base].data.len() as i64 + 1;
            let obj = SkillObject::new(sg.pool, id);
            pools[base].data.push(obj);
        }
        *at += sg.static_count;
    }
    for e in &entries {
        if pools[e.pool].super_pool.is_none()
            && pools[e.pool].data.len() != region_start[&e.pool] + e.count
        {
            return Err(SkillError::InvalidTypeSection(
                "instance counts do not partition the new region".to_string(),
            ));
        }
    }

    // field section
    struct NewChunk {
        pool: usize,
        field: usize,
        chunk: usize,
    }
    let mut last_end: u64 = 0;
    let mut new_chunks: Vec<NewChunk> = Vec::new();
    for e in &entries {
        let n_fields = if e.first_seen || e.count > 0 {
            e.total_fields
        } else {
            e.total_fields - e.prev_fields
        };
        let block = pools[e.pool].blocks[e.block];
        for _ in 0..n_fields {
            let name_id = s.read_v64()? as u64;
            let fname = strings
                .get(name_id)?
                .ok_or(SkillError::MalformedData("field name id is null"))?;
            match pools[e.pool].data_field(&fname) {
                Some(fi) => {
                    let end = end_offset(s, last_end)?;
                    let field = &mut pools[e.pool].data_fields[fi];
                    field.chunks.push(Chunk::Simple {
                        begin: last_end,
                        end,
                        bpo: block.bpo,
                        count: block.dynamic_count,
                    });
                    new_chunks.push(NewChunk {
                        pool: e.pool,
                        field: fi,
                        chunk: field.chunks.len() - 1,
                    });
                    last_end = end;
                }
                None => {
                    let fty = FieldType::parse(s, pools.len())?;
                    if s.read_u8()? != 0 {
                        return Err(SkillError::InvalidTypeSection(format!(
                            "unsupported field restrictions on {fname}"
                        )));
                    }
                    let end = end_offset(s, last_end)?;
                    let fi = pools[e.pool].data_fields.len();
                    let mut field =
                        FieldDeclaration::new(fty, fname, (fi + 1) as i64, e.pool);
                    let chunk = if pools[e.pool].blocks.len() > 1 {
                        Chunk::Bulk {
                            begin: last_end,
                            end,
                            total_count: pools[e.pool]
                                .blocks
                                .iter()
                                .map(|b| b.dynamic_count)
                                .sum(),
                            block_count: pools[e.pool].blocks.len(),
                        }
                    } else {
                        Chunk::Simple {
                            begin: last_end,
                            end,
                            bpo: block.bpo,
                            count: block.dynamic_count,
                        }
                    };
                    field.chunks.push(chunk);
                    pools[e.pool].data_fields.push(field);
                    new_chunks.push(NewChunk {
                        pool: e.pool,
                        field: fi,
                        chunk: 0,
                    });
                    last_end = end;
                }
            }
        }
        if pools[e.pool].data_fields.len() != e.total_fields {
            return Err(SkillError::InvalidTypeSection(format!(
                "field count of {} does not match its declarations",
                pools[e.pool].name
            )));
        }
    }

    // block-relative spans become absolute once the payload start is known
    let data_start = s.position() as u64;
    for nc in new_chunks {
        let chunk = &mut pools[nc.pool].data_fields[nc.field].chunks[nc.chunk];
        chunk.set_span(data_start + chunk.begin(), data_start + chunk.end());
        jobs.push(ReadJob {
            pool: nc.pool,
            field: nc.field,
            chunk: nc.chunk,
        });
    }
    s.read_bytes(last_end as usize)?;
    Ok(())
}

fn end_offset(s: &mut MappedInStream<'_>, last_end: u64) -> Result<u64, SkillError> {
    let end = s.read_v64()?;
    let end = u64::try_from(end).map_err(|_| SkillError::MalformedData("negative end offset"))?;
    if end < last_end {
        return Err(SkillError::MalformedData("field end offsets not monotonic"));
    }
    Ok(end)
}

fn non_negative(v: i64) -> Result<usize, SkillError> {
    usize::try_from(v).map_err(|_| SkillError::MalformedData("negative count"))
}

/// Fan the given chunk decodes out onto the worker pool and await them.
///
/// Workers never unwind across the scope; errors are collected, the first
/// one is raised after every job has finished, the rest are logged.
pub(crate) fn run_read_jobs(state: &SkillFile, jobs: &[ReadJob]) -> Result<(), SkillError> {
    if jobs.is_empty() {
        return Ok(());
    }
    let input = state.input.as_ref().ok_or(SkillError::NoBackingFile)?;
    let bytes: &[u8] = &input[..];
    let errors: Mutex<Vec<SkillError>> = Mutex::new(Vec::new());
    rayon::scope(|sc| {
        for job in jobs {
            let errors = &errors;
            sc.spawn(move |_| {
                if let Err(e) = run_read_job(state, bytes, job) {
                    errors.lock().push(e);
                }
            });
        }
    });
    raise_first(errors.into_inner())
}

fn run_read_job(state: &SkillFile, input: &[u8], job: &ReadJob) -> Result<(), SkillError> {
    let field = &state.pools[job.pool].data_fields[job.field];
    let chunk = &field.chunks[job.chunk];
    let mut view =
        MappedInStream::new(input).view(chunk.begin() as usize, chunk.end() as usize)?;
    let cx = ReadCtx {
        pools: &state.pools,
        strings: &state.strings,
    };
    field.read_chunk(&state.pools, chunk, &mut view, &cx)
}

pub(crate) fn raise_first(mut errors: Vec<SkillError>) -> Result<(), SkillError> {
    if errors.is_empty() {
        return Ok(());
    }
    for extra in errors.iter().skip(1) {
        warn!(error = %extra, "additional worker error");
    }
    Err(errors.remove(0))
}
