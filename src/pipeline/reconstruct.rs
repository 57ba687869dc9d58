//! # Reconstruction
//!
//! Rebuilds the source file from the device once every sector has a
//! location. Meaningless sectors that were never seen on the device are
//! written from their canonical pattern.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::constants::{ERASED_SECTOR, SECTOR_BYTES, SECTOR_SIZE, ZERO_SECTOR};
use crate::device::{DeviceSource, SectorReader};
use crate::sectors::{SectorLocation, SectorStore};

use super::{FinishReason, JobContext, JobOutcome, lock};

/// Where the bytes of one file sector come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Device(u64),
    Pattern(&'static [u8; SECTOR_SIZE]),
}

struct Plan {
    steps: Vec<Source>,
    auto_filled: u64,
    original_len: u64,
    source_sha256: String,
}

fn plan(store: &mut SectorStore) -> Plan {
    let auto_filled = store.auto_fill_meaningless();
    let steps = (0..store.len())
        .map(|index| match store.first_location(index) {
            Some(SectorLocation::Device(offset)) => Source::Device(offset),
            Some(SectorLocation::Placeholder) => Source::Pattern(pattern_for(store.sector(index))),
            None => {
                warn!("sector {index} has no location; writing zeros");
                Source::Pattern(&ZERO_SECTOR)
            }
        })
        .collect();
    Plan {
        steps,
        auto_filled,
        original_len: store.original_len(),
        source_sha256: store.sha256().to_string(),
    }
}

fn pattern_for(sector: &[u8; SECTOR_SIZE]) -> &'static [u8; SECTOR_SIZE] {
    if sector == &ERASED_SECTOR {
        &ERASED_SECTOR
    } else {
        &ZERO_SECTOR
    }
}

/// Buffered output that hashes everything it writes.
struct ReconstructionStream {
    writer: BufWriter<File>,
    sha256: Sha256,
    written: u64,
    limit: u64,
}

impl ReconstructionStream {
    fn create(path: &Path, limit: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            sha256: Sha256::new(),
            written: 0,
            limit,
        })
    }

    /// Writes at most up to the limit; the tail of the last sector is dropped.
    fn write_sector(&mut self, sector: &[u8]) -> std::io::Result<()> {
        let room = self.limit.saturating_sub(self.written);
        let len = (sector.len() as u64).min(room) as usize;
        self.writer.write_all(&sector[..len])?;
        self.sha256.update(&sector[..len]);
        self.written += len as u64;
        Ok(())
    }

    fn finish(mut self) -> std::io::Result<(u64, String)> {
        self.writer.flush()?;
        Ok((self.written, hex::encode(self.sha256.finalize())))
    }
}

fn write_file(
    device: Arc<dyn DeviceSource>,
    steps: &[Source],
    original_len: u64,
    path: &Path,
) -> std::io::Result<(u64, String)> {
    let mut stream = ReconstructionStream::create(path, original_len)?;
    let mut reader = SectorReader::new(device);
    for step in steps {
        match *step {
            Source::Device(offset) => {
                reader.seek(offset);
                let sector = reader.read_sector().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("device sector at {offset:#x} could not be re-read"),
                    )
                })?;
                stream.write_sector(&sector)?;
            }
            Source::Pattern(pattern) => stream.write_sector(pattern)?,
        }
    }
    stream.finish()
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed partial output {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove partial output {}: {err}", path.display()),
    }
}

pub(crate) fn reconstruct(ctx: &JobContext) -> Result<JobOutcome, super::JobError> {
    let plan = {
        let mut store = lock(&ctx.store);
        plan(&mut store)
    };
    debug!(
        "reconstructing {} sectors ({} auto-filled) into {}",
        plan.steps.len(),
        plan.auto_filled,
        ctx.output_path.display()
    );

    let (written, sha256) = match write_file(
        Arc::clone(&ctx.device),
        &plan.steps,
        plan.original_len,
        &ctx.output_path,
    ) {
        Ok(written) => written,
        Err(err) => {
            remove_partial(&ctx.output_path);
            return Err(err.into());
        }
    };
    let expected = plan.steps.len() as u64 * SECTOR_BYTES;
    if written < plan.original_len.min(expected) {
        warn!("reconstruction wrote {written} of {} bytes", plan.original_len);
    }

    Ok(JobOutcome {
        success: true,
        reason: FinishReason::Complete,
        auto_filled: plan.auto_filled,
        resolved: ctx.resolved(),
        total_sectors: ctx.total_sectors,
        output_path: Some(ctx.output_path.clone()),
        verified: sha256 == plan.source_sha256,
        output_sha256: Some(sha256),
    })
}
