//! # Sector Store
//!
//! The target file split into fixed-size sectors, together with the mutable
//! match state: which sectors are still outstanding and where on the device
//! each one has been seen. The store performs no I/O after loading and no
//! locking of its own; the job wraps it in a single mutex.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::constants::{MEANINGLESS_SECTORS, RECONSTRUCTED_MARKER, SECTOR_SIZE};

pub type Sector = [u8; SECTOR_SIZE];

#[derive(Debug, Error)]
pub enum SectorStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source file is empty: {0}")]
    Empty(String),
    #[error("source file {path} is {size} bytes, limit is {limit}")]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
}

/// Where the content for one file sector comes from at reconstruction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "offset", rename_all = "snake_case")]
pub enum SectorLocation {
    /// Byte offset on the device where the sector content was found.
    Device(u64),
    /// Auto-filled meaningless sector; no device read is needed.
    Placeholder,
}

/// True for the all-zero and all-0xFF sector patterns.
pub fn is_meaningless(sector: &[u8]) -> bool {
    MEANINGLESS_SECTORS
        .iter()
        .any(|pattern| pattern.as_slice() == sector)
}

fn fingerprint(sector: &Sector) -> u64 {
    let mut hasher = DefaultHasher::new();
    sector.hash(&mut hasher);
    hasher.finish()
}

pub struct SectorStore {
    name: String,
    original_len: u64,
    sha256: String,
    sectors: Vec<Sector>,
    // remaining[i] holds sectors[i] while pending[i] is set.
    pending: Vec<bool>,
    address_table: Vec<Vec<SectorLocation>>,
    // fingerprint -> indices in file order
    by_content: HashMap<u64, Vec<usize>>,
    // pending sectors that are not meaningless
    outstanding: usize,
}

impl std::fmt::Debug for SectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorStore")
            .field("name", &self.name)
            .field("original_len", &self.original_len)
            .field("sectors", &self.sectors.len())
            .field("outstanding", &self.outstanding)
            .finish()
    }
}

impl SectorStore {
    /// Load a source file, refusing anything larger than `max_bytes`.
    pub fn load(path: &Path, max_bytes: u64) -> Result<Self, SectorStoreError> {
        let size = std::fs::metadata(path)?.len();
        if size > max_bytes {
            return Err(SectorStoreError::TooLarge {
                path: path.to_path_buf(),
                size,
                limit: max_bytes,
            });
        }
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        Self::from_bytes(&name, &bytes)
    }

    /// Split `bytes` into sectors in file order; the final sector is
    /// zero-padded and the padding takes part in matching.
    pub fn from_bytes(name: &str, bytes: &[u8]) -> Result<Self, SectorStoreError> {
        if bytes.is_empty() {
            return Err(SectorStoreError::Empty(name.to_string()));
        }

        let sectors: Vec<Sector> = bytes
            .chunks(SECTOR_SIZE)
            .map(|chunk| {
                let mut sector = [0u8; SECTOR_SIZE];
                sector[..chunk.len()].copy_from_slice(chunk);
                sector
            })
            .collect();

        let mut by_content: HashMap<u64, Vec<usize>> = HashMap::new();
        let mut outstanding = 0usize;
        for (index, sector) in sectors.iter().enumerate() {
            by_content.entry(fingerprint(sector)).or_default().push(index);
            if !is_meaningless(sector) {
                outstanding += 1;
            }
        }

        let count = sectors.len();
        Ok(Self {
            name: name.to_string(),
            original_len: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
            sectors,
            pending: vec![true; count],
            address_table: vec![Vec::new(); count],
            by_content,
            outstanding,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Byte length of the source before padding.
    pub fn original_len(&self) -> u64 {
        self.original_len
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }

    pub fn sector(&self, index: usize) -> &Sector {
        &self.sectors[index]
    }

    /// Content still waiting for a match, or `None` once the index is cleared.
    pub fn remaining(&self, index: usize) -> Option<&Sector> {
        if self.pending[index] {
            Some(&self.sectors[index])
        } else {
            None
        }
    }

    pub fn locations(&self, index: usize) -> &[SectorLocation] {
        &self.address_table[index]
    }

    /// The authoritative location for `index`: the first one recorded.
    pub fn first_location(&self, index: usize) -> Option<SectorLocation> {
        self.address_table[index].first().copied()
    }

    /// Indices with at least one device offset.
    pub fn resolved(&self) -> usize {
        self.address_table
            .iter()
            .filter(|locations| {
                locations
                    .iter()
                    .any(|loc| matches!(loc, SectorLocation::Device(_)))
            })
            .count()
    }

    /// Sectors that must still be found on the device for completion.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// First still-remaining index whose content equals `content`.
    pub fn try_match(&self, content: &Sector) -> Option<usize> {
        let bucket = self.by_content.get(&fingerprint(content))?;
        bucket
            .iter()
            .copied()
            .find(|&index| self.pending[index] && self.sectors[index] == *content)
    }

    /// Append `offset` to the address list of `index`. Returns true when this
    /// cleared the index, i.e. it was the first recorded match.
    pub fn record_match(&mut self, index: usize, offset: u64) -> bool {
        self.address_table[index].push(SectorLocation::Device(offset));
        if !self.pending[index] {
            return false;
        }
        self.pending[index] = false;
        if !is_meaningless(&self.sectors[index]) {
            self.outstanding -= 1;
        }
        true
    }

    /// Every remaining entry is either cleared or a meaningless pattern.
    pub fn is_complete(&self) -> bool {
        self.outstanding == 0
    }

    /// Mark every still-pending meaningless sector as satisfied by a
    /// placeholder. Returns the number of sectors filled.
    pub fn auto_fill_meaningless(&mut self) -> u64 {
        let mut filled = 0u64;
        for index in 0..self.sectors.len() {
            if self.pending[index] && is_meaningless(&self.sectors[index]) {
                self.address_table[index].push(SectorLocation::Placeholder);
                self.pending[index] = false;
                filled += 1;
            }
        }
        filled
    }

    /// File name of the rebuilt copy: the source stem, the reconstruction
    /// marker, then the original extension.
    pub fn reconstructed_file_name(&self) -> String {
        let path = Path::new(&self.name);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone());
        match path.extension() {
            Some(ext) => format!("{stem}{RECONSTRUCTED_MARKER}.{}", ext.to_string_lossy()),
            None => format!("{stem}{RECONSTRUCTED_MARKER}"),
        }
    }
}
