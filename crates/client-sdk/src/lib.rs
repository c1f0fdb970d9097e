use anyhow::{anyhow, Context, Result};
use cellsync_protocol::ChunkRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Chunk assignment for one upload: port -> records it should receive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Distribution {
    pub assignments: BTreeMap<u16, Vec<ChunkRecord>>,
}

impl Distribution {
    pub fn for_port(&self, port: u16) -> &[ChunkRecord] {
        self.assignments
            .get(&port)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn holders_of(&self, chunk_id: &str) -> Vec<u16> {
        self.assignments
            .iter()
            .filter(|(_, chunks)| chunks.iter().any(|c| c.id == chunk_id))
            .map(|(port, _)| *port)
            .collect()
    }
}

pub fn chunk_bytes(filename: &str, input: &[u8], chunk_size: usize) -> Result<Vec<ChunkRecord>> {
    if chunk_size == 0 {
        return Err(anyhow!("chunk_size must be > 0"));
    }
    let total = input.len().div_ceil(chunk_size) as u64;
    Ok(input
        .chunks(chunk_size)
        .enumerate()
        .map(|(idx, slice)| ChunkRecord::new(filename, idx as u64, total, slice.to_vec()))
        .collect())
}

/// Chunks are named after the file's base name, not the full path.
pub fn chunk_file(path: &Path, chunk_size: usize) -> Result<Vec<ChunkRecord>> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", path.display()))?;
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    chunk_bytes(filename, &raw, chunk_size)
}

/// Round-robin placement: chunk `i` lands on `ports[i % n]` and the next
/// `redundancy - 1` ports after it.
pub fn distribute(chunks: &[ChunkRecord], ports: &[u16], redundancy: usize) -> Result<Distribution> {
    if ports.is_empty() {
        return Err(anyhow!("no cells to distribute to"));
    }
    if redundancy == 0 {
        return Err(anyhow!("redundancy must be >= 1"));
    }
    let copies = redundancy.min(ports.len());

    let mut assignments: BTreeMap<u16, Vec<ChunkRecord>> =
        ports.iter().map(|port| (*port, Vec::new())).collect();
    for (i, chunk) in chunks.iter().enumerate() {
        let primary = i % ports.len();
        for offset in 0..copies {
            let port = ports[(primary + offset) % ports.len()];
            assignments.entry(port).or_default().push(chunk.clone());
        }
    }
    Ok(Distribution { assignments })
}

pub fn reconstruct_bytes(chunks: &[ChunkRecord]) -> Result<Vec<u8>> {
    let Some(first) = chunks.first() else {
        return Ok(Vec::new());
    };
    let total = first.total_chunks;

    let mut ordered: BTreeMap<u64, &ChunkRecord> = BTreeMap::new();
    for chunk in chunks {
        if chunk.filename != first.filename {
            return Err(anyhow!(
                "chunk {} belongs to {}, expected {}",
                chunk.id,
                chunk.filename,
                first.filename
            ));
        }
        if !chunk.is_intact() {
            return Err(anyhow!("chunk {} failed its integrity check", chunk.id));
        }
        ordered.entry(chunk.index).or_insert(chunk);
    }

    if let Some(missing) = (0..total).find(|idx| !ordered.contains_key(idx)) {
        return Err(anyhow!(
            "missing chunk {} of {}",
            ChunkRecord::chunk_id(&first.filename, missing),
            total
        ));
    }

    let mut out = Vec::new();
    for chunk in ordered.values() {
        out.extend_from_slice(&chunk.data);
    }
    Ok(out)
}

pub fn reconstruct_file(chunks: &[ChunkRecord], output: &Path) -> Result<()> {
    let bytes = reconstruct_bytes(chunks)?;
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(output, bytes).with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}
