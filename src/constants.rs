//! Shared constants for the recovery engine.

/// Unit of comparison, matching the addressable block size of the device.
pub const SECTOR_SIZE: usize = 512;

/// `SECTOR_SIZE` as a device offset delta.
pub const SECTOR_BYTES: u64 = SECTOR_SIZE as u64;

pub const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0x00; SECTOR_SIZE];
pub const ERASED_SECTOR: [u8; SECTOR_SIZE] = [0xFF; SECTOR_SIZE];

/// Sector patterns that carry no signal and may be auto-filled at reconstruction.
pub const MEANINGLESS_SECTORS: [&[u8; SECTOR_SIZE]; 2] = [&ZERO_SECTOR, &ERASED_SECTOR];

/// Match-task queue slots per worker thread.
pub const CHANNEL_CAPACITY_MULTIPLIER: usize = 64;
pub const MIN_CHANNEL_CAPACITY: usize = 256;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Inserted between the source file stem and its extension in the rebuilt file name.
pub const RECONSTRUCTED_MARKER: &str = "_RECONSTRUCTED";
