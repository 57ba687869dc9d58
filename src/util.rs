//! # Utility Module
//!
//! Pre-flight checks the binary runs before the job starts, and CLI overrides
//! applied on top of the loaded configuration.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, warn};

use crate::cli::CliOptions;
use crate::config::ScanSettings;

/// Ensure output directory exists and is writable, warning on unsafe permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "output path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)?;
    }

    let probe_path = path.join(".recoverability_write_probe");
    if let Err(err) = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe_path)
    {
        return Err(anyhow!(
            "output directory is not writable: {} ({})",
            path.display(),
            err
        ));
    }
    let _ = std::fs::remove_file(&probe_path);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("output directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}

/// The skim may start anywhere from offset zero up to the device end.
pub fn validate_start_offset(start_offset: u64, device_len: u64) -> Result<()> {
    if start_offset > device_len {
        bail!(
            "start offset {start_offset:#x} is beyond the end of the device ({device_len:#x} bytes)"
        );
    }
    Ok(())
}

/// The deepest part of `path` that already exists. Output paths are checked
/// through it before anything is created.
fn nearest_existing(path: &Path) -> &Path {
    path.ancestors()
        .find(|ancestor| !ancestor.as_os_str().is_empty() && ancestor.exists())
        .unwrap_or_else(|| Path::new("."))
}

/// Refuse to read the source from, or write output to, the device being
/// scanned. `other` need not exist yet; it is judged by its nearest existing
/// ancestor, and nothing is created.
pub fn check_distinct_volume(device: &Path, other: &Path, what: &str) -> Result<()> {
    let existing = nearest_existing(other);
    if let (Ok(a), Ok(b)) = (device.canonicalize(), existing.canonicalize()) {
        if a == b {
            bail!("{what} {} is the scanned device itself", other.display());
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        let device_meta = std::fs::metadata(device)?;
        if !device_meta.file_type().is_block_device() {
            debug!("{} is not a block device; skipping volume check", device.display());
            return Ok(());
        }
        let other_meta = std::fs::metadata(existing)?;
        if other_meta.dev() == device_meta.rdev() {
            bail!(
                "{what} {} lives on the device being scanned ({})",
                other.display(),
                device.display()
            );
        }
    }
    Ok(())
}

/// Apply command-line overrides to the configured scan settings.
pub fn apply_cli_overrides(settings: &mut ScanSettings, opts: &CliOptions) {
    if let Some(span) = opts.inspection_span {
        settings.inspection_span = span.into();
    }
    if opts.no_wrap_around {
        settings.wrap_around = false;
    }
    if opts.chain_inspections {
        settings.chain_inspections = true;
    }
}
