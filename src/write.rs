//! The serializer.
//!
//! Two modes: *compress* rewrites the whole file, reissuing dense ids and
//! dropping deleted instances; *append* adds one block with only the new
//! strings, instances and fields. Both plan the layout single-threaded,
//! then fan the per-field payload writes out over disjoint sub-slices of
//! the output mapping.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use byteorder::WriteBytesExt;
use indexmap::IndexMap;
use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::SkillError;
use crate::fields::Chunk;
use crate::fieldtypes::WriteCtx;
use crate::parse::raise_first;
use crate::pools::{self, Obj};
use crate::state::SkillFile;
use crate::streams::V64Write;

/// One payload write unit: a single chunk of a single field, with its span
/// relative to the start of the block's field-data region.
struct Task {
    pool: usize,
    field: usize,
    chunk: Chunk,
}

impl Task {
    fn len(&self) -> usize {
        (self.chunk.end() - self.chunk.begin()) as usize
    }
}

/// Full rewrite.
pub(crate) fn compress(state: &mut SkillFile, path: &Path) -> Result<(), SkillError> {
    state.ensure_all_loaded()?;
    for p in &state.pools {
        for f in &p.data_fields {
            f.compress_storage();
        }
    }
    collect_strings(state);
    state.check()?;
    state.strings.reset_ids();
    pools::fix_pools(&mut state.pools);

    // reissue dense ids in weak type order, dropping deleted instances
    let n = state.pools.len();
    let mut lbpo_map = vec![0usize; n];
    let bases: Vec<usize> = (0..n)
        .filter(|&i| state.pools[i].super_pool.is_none())
        .collect();
    for b in bases {
        let mut fresh: Vec<Obj> = Vec::with_capacity(state.pools[b].cached_size());
        for q in pools::subtree(&state.pools, b) {
            lbpo_map[q] = fresh.len();
            let mut gather: Vec<Obj> = Vec::new();
            {
                let qp = &state.pools[q];
                let data = &state.pools[qp.base_pool].data;
                for blk in &qp.blocks {
                    gather.extend(data[blk.bpo..blk.bpo + blk.static_count].iter().cloned());
                }
                gather.extend(qp.new_objects.iter().cloned());
            }
            for o in gather {
                if o.is_deleted() {
                    continue;
                }
                o.set_skill_id(fresh.len() as i64 + 1);
                fresh.push(o);
            }
        }
        state.pools[b].data = fresh;
    }

    // headers: string pool, type section, field section
    let mut buf: Vec<u8> = Vec::new();
    state.strings.prepare_and_write(&mut buf)?;
    let ids = state.strings.ids_snapshot();
    buf.write_v64(n as i64)?;
    for i in 0..n {
        let p = &state.pools[i];
        buf.write_v64(name_id(&ids, &p.name)?)?;
        buf.write_v64(p.cached_size() as i64)?;
        buf.write_u8(0)?;
        buf.write_v64(p.super_pool.map_or(0, |s| s as i64 + 1))?;
        if p.super_pool.is_some() && p.cached_size() > 0 {
            buf.write_v64(lbpo_map[i] as i64)?;
        }
        buf.write_v64(p.data_fields.len() as i64)?;
    }

    let mut tasks: Vec<Task> = Vec::new();
    let mut data_bytes: u64 = 0;
    {
        let cx = WriteCtx {
            pools: &state.pools,
            string_ids: &ids,
        };
        for i in 0..n {
            let count = state.pools[i].cached_size();
            for (fi, f) in state.pools[i].data_fields.iter().enumerate() {
                let mut chunk = Chunk::Simple {
                    begin: data_bytes,
                    end: data_bytes,
                    bpo: lbpo_map[i],
                    count,
                };
                let size = f.offset_chunk(&state.pools, &chunk, &cx)?;
                data_bytes += size;
                chunk.set_span(data_bytes - size, data_bytes);
                buf.write_v64(name_id(&ids, &f.name)?)?;
                f.fty.write_decl(&mut buf)?;
                buf.write_u8(0)?;
                buf.write_v64(data_bytes as i64)?;
                tasks.push(Task {
                    pool: i,
                    field: fi,
                    chunk,
                });
            }
        }
    }

    let data_start = buf.len() as u64;
    debug!(
        pools = n,
        tasks = tasks.len(),
        bytes = data_start + data_bytes,
        "rewriting file"
    );
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(data_start + data_bytes)?;
    {
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[..data_start as usize].copy_from_slice(&buf);
        write_field_data(state, &ids, &tasks, &mut map[data_start as usize..])?;
        map.flush()?;
    }

    pools::unfix_pools(&mut state.pools);
    for t in &tasks {
        let mut chunk = t.chunk.clone();
        chunk.set_span(data_start + t.chunk.begin(), data_start + t.chunk.end());
        let f = &mut state.pools[t.pool].data_fields[t.field];
        f.chunks = vec![chunk];
        f.pending.get_mut().clear();
    }
    pools::update_after_compress(&mut state.pools, &lbpo_map);
    state.strings.reset_ids();
    state.path = Some(path.to_path_buf());
    Ok(())
}

/// Incremental write of one new block to the backing file.
pub(crate) fn append(state: &mut SkillFile) -> Result<(), SkillError> {
    let path = state.path.clone().ok_or(SkillError::NoBackingFile)?;
    state.ensure_all_loaded()?;
    for p in &state.pools {
        for f in &p.data_fields {
            f.compress_storage();
        }
    }
    collect_strings(state);
    state.check()?;

    // unflushed deletions are dropped rather than written
    for p in state.pools.iter_mut() {
        let before = p.new_objects.len();
        p.new_objects.retain(|o| !o.is_deleted());
        p.deleted_count -= before - p.new_objects.len();
    }
    pools::fix_pools(&mut state.pools);

    let n = state.pools.len();
    let new_dyn: Vec<usize> = (0..n)
        .map(|i| pools::new_dynamic_size(&state.pools, i))
        .collect();
    let first_write: Vec<bool> = state.pools.iter().map(|p| p.blocks.is_empty()).collect();
    let emit: Vec<bool> = (0..n)
        .map(|i| {
            new_dyn[i] > 0
                || state.pools[i]
                    .data_fields
                    .iter()
                    .any(|f| f.chunks.is_empty())
        })
        .collect();

    // layout of the appended instances, per hierarchy in weak type order
    let mut lbpo_rel = vec![0usize; n];
    let mut region_start = vec![0usize; n];
    let base_pools: Vec<usize> = (0..n).filter(|&i| state.pools[i].super_pool.is_none()).collect();
    for b in base_pools {
        let rs = state.pools[b].data.len();
        let mut cursor = 0usize;
        for q in pools::subtree(&state.pools, b) {
            region_start[q] = rs;
            lbpo_rel[q] = cursor;
            cursor += state.pools[q].new_objects.len();
        }
        for q in pools::subtree(&state.pools, b) {
            let news: Vec<Obj> = state.pools[q].new_objects.clone();
            for o in news {
                o.set_skill_id(state.pools[b].data.len() as i64 + 1);
                state.pools[b].data.push(o);
            }
        }
    }

    let mut chunk_map: HashMap<(usize, usize), Chunk> = HashMap::new();
    let mut new_field: Vec<Vec<bool>> = Vec::with_capacity(n);
    for i in 0..n {
        new_field.push(
            state.pools[i]
                .data_fields
                .iter()
                .map(|f| f.chunks.is_empty())
                .collect(),
        );
        if emit[i] {
            pools::update_after_prepare_append(
                &mut state.pools,
                i,
                region_start[i] + lbpo_rel[i],
                new_dyn[i],
                &mut chunk_map,
            );
        }
    }

    let mut buf: Vec<u8> = Vec::new();
    let new_strings = state.strings.prepare_and_append(&mut buf)?;
    let emitted: Vec<usize> = (0..n).filter(|&i| emit[i]).collect();
    if emitted.is_empty() && new_strings == 0 {
        pools::unfix_pools(&mut state.pools);
        state.strings.reset_ids();
        return Ok(());
    }
    let ids = state.strings.ids_snapshot();

    buf.write_v64(emitted.len() as i64)?;
    for &i in &emitted {
        let p = &state.pools[i];
        buf.write_v64(name_id(&ids, &p.name)?)?;
        buf.write_v64(new_dyn[i] as i64)?;
        if first_write[i] {
            buf.write_u8(0)?;
            buf.write_v64(p.super_pool.map_or(0, |s| s as i64 + 1))?;
        }
        if p.super_pool.is_some() && new_dyn[i] > 0 {
            buf.write_v64(lbpo_rel[i] as i64)?;
        }
        buf.write_v64(p.data_fields.len() as i64)?;
    }

    let mut tasks: Vec<Task> = Vec::new();
    let mut data_bytes: u64 = 0;
    {
        let cx = WriteCtx {
            pools: &state.pools,
            string_ids: &ids,
        };
        for &i in &emitted {
            for (fi, f) in state.pools[i].data_fields.iter().enumerate() {
                let Some(chunk) = chunk_map.get(&(i, fi)) else {
                    continue;
                };
                let size = f.offset_chunk(&state.pools, chunk, &cx)?;
                let mut chunk = chunk.clone();
                chunk.set_span(data_bytes, data_bytes + size);
                data_bytes += size;
                buf.write_v64(name_id(&ids, &f.name)?)?;
                if new_field[i][fi] {
                    f.fty.write_decl(&mut buf)?;
                    buf.write_u8(0)?;
                }
                buf.write_v64(data_bytes as i64)?;
                tasks.push(Task {
                    pool: i,
                    field: fi,
                    chunk,
                });
            }
        }
    }

    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    let old_len = file.metadata()?.len();
    let data_start = old_len + buf.len() as u64;
    debug!(
        blocks = emitted.len(),
        tasks = tasks.len(),
        bytes = buf.len() as u64 + data_bytes,
        "appending block"
    );
    file.set_len(data_start + data_bytes)?;
    {
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[old_len as usize..data_start as usize].copy_from_slice(&buf);
        write_field_data(state, &ids, &tasks, &mut map[data_start as usize..])?;
        map.flush()?;
    }

    for t in &tasks {
        let mut chunk = t.chunk.clone();
        chunk.set_span(data_start + t.chunk.begin(), data_start + t.chunk.end());
        state.pools[t.pool].data_fields[t.field].chunks.push(chunk);
    }
    pools::unfix_pools(&mut state.pools);
    state.strings.reset_ids();
    Ok(())
}

/// Split the output region into one sub-slice per task and write them in
/// parallel. The scope is the barrier; the first collected error is raised
/// once all workers have finished.
fn write_field_data(
    state: &SkillFile,
    ids: &IndexMap<Arc<str>, u64>,
    tasks: &[Task],
    region: &mut [u8],
) -> Result<(), SkillError> {
    let mut slices: Vec<&mut [u8]> = Vec::with_capacity(tasks.len());
    let mut rest = region;
    for t in tasks {
        let tail = std::mem::take(&mut rest);
        let (head, tail) = tail.split_at_mut(t.len());
        slices.push(head);
        rest = tail;
    }
    let errors: Mutex<Vec<SkillError>> = Mutex::new(Vec::new());
    let cx = WriteCtx {
        pools: &state.pools,
        string_ids: ids,
    };
    rayon::scope(|sc| {
        for (t, slice) in tasks.iter().zip(slices) {
            let errors = &errors;
            let cx = &cx;
            sc.spawn(move |_| {
                let field = &state.pools[t.pool].data_fields[t.field];
                let mut w: &mut [u8] = slice;
                match field.write_chunk(&state.pools, &t.chunk, &mut w, cx) {
                    Ok(()) if !w.is_empty() => {
                        errors.lock().push(SkillError::PoolSizeMismatch {
                            field: field.name.to_string(),
                            expected: t.len() as u64,
                            consumed: (t.len() - w.len()) as u64,
                        });
                    }
                    Ok(()) => {}
                    Err(e) => errors.lock().push(e),
                }
            });
        }
    });
    raise_first(errors.into_inner())
}

fn collect_strings(state: &SkillFile) {
    for p in &state.pools {
        state.strings.add(&p.name);
        for f in &p.data_fields {
            state.strings.add(&f.name);
            if f.fty.contains_strings() {
                let st = f.storage.lock();
                for v in st.data.values().chain(st.new_data.values()) {
                    f.fty.collect_strings(v, &mut |s| {
                        state.strings.add(s);
                    });
                }
            }
        }
    }
}

fn name_id(ids: &IndexMap<Arc<str>, u64>, name: &Arc<str>) -> Result<i64, SkillError> {
    ids.get(name)
        .map(|&id| id as i64)
        .ok_or(SkillError::MalformedData("name missing from the string table"))
}
