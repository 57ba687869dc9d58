//! Recover a known file from a damaged or unmounted block device.
//!
//! The device is swept sparsely by a skim scanner; every sector it reads is
//! checked against the file's sectors by a pool of match workers. A hit
//! starts a dense close inspection around it. Once every meaningful sector
//! has a device location the file is rebuilt from the device.

pub mod cli;
pub mod config;
pub mod constants;
pub mod device;
pub mod logging;
pub mod metadata;
pub mod perf;
pub mod pipeline;
pub mod scanner;
pub mod sectors;
pub mod util;
