use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use crossbeam_channel::bounded;
use tracing::{info, warn};

use recoverability::constants::EVENT_CHANNEL_CAPACITY;
use recoverability::metadata::{self, RunContext};
use recoverability::pipeline::events::{ChannelObserver, FanoutObserver, JobObserver, LogObserver};
use recoverability::pipeline::{Job, JobOptions, workers};
use recoverability::sectors::SectorStore;
use recoverability::{cli, config, device, logging, util};

fn main() -> Result<()> {
    logging::init_logging();

    let cli_opts = cli::parse();
    let loaded = config::load_config(cli_opts.config_path.as_deref())?;
    let mut cfg = loaded.config;
    util::apply_cli_overrides(&mut cfg.scan, &cli_opts);

    let run_output_dir = cli_opts.output.join(&cfg.run_id);
    // Nothing may be written until the output is known to be off the device.
    util::check_distinct_volume(&cli_opts.device, &cli_opts.source, "source file")?;
    util::check_distinct_volume(&cli_opts.device, &run_output_dir, "output directory")?;
    if let Some(event_log) = &cli_opts.event_log {
        util::check_distinct_volume(&cli_opts.device, event_log, "event log")?;
    }
    util::ensure_output_dir(&run_output_dir)?;

    let device = device::open_device(&cli_opts.device)
        .with_context(|| format!("opening device {}", cli_opts.device.display()))?;
    util::validate_start_offset(cli_opts.start_offset, device.len())?;

    let store = SectorStore::load(&cli_opts.source, cfg.max_source_bytes)
        .with_context(|| format!("loading source {}", cli_opts.source.display()))?;
    let output_path = run_output_dir.join(store.reconstructed_file_name());

    info!(
        "starting run_id={} device={} source={} sectors={} output={} workers={}",
        cfg.run_id,
        cli_opts.device.display(),
        cli_opts.source.display(),
        store.len(),
        output_path.display(),
        cli_opts.workers
    );

    let sink = match &cli_opts.event_log {
        Some(path) => metadata::build_sink(
            path,
            RunContext {
                run_id: cfg.run_id.clone(),
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                config_hash: loaded.config_hash.clone(),
                device_path: cli_opts.device.to_string_lossy().to_string(),
                source_sha256: store.sha256().to_string(),
            },
        )?,
        None => metadata::build_dry_run_sink(),
    };
    let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
    let log_errors = Arc::new(AtomicU64::new(0));
    let log_handle = workers::spawn_event_log_thread(sink, event_rx, log_errors.clone());

    let observer: Arc<dyn JobObserver> = Arc::new(FanoutObserver::new(vec![
        Arc::new(LogObserver),
        Arc::new(ChannelObserver::new(event_tx)),
    ]));

    let mut options = JobOptions::new(output_path);
    options.start_offset = cli_opts.start_offset;
    options.workers = cli_opts.workers;
    options.settings = cfg.scan.clone();

    let running = Job::new(store, device, options, observer).start()?;
    let abandon = running.abandon_handle();
    ctrlc::set_handler(move || {
        if abandon.abandon() {
            warn!("interrupt received; abandoning run");
        }
    })
    .context("installing Ctrl+C handler")?;

    let outcome = running.wait()?;

    // The observer (and with it the event sender) is dropped with the job.
    if log_handle.join().is_err() {
        warn!("event log thread panicked");
    }
    let errors = log_errors.load(Ordering::Relaxed);
    if errors > 0 {
        warn!("{errors} event log records could not be written");
    }

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        bail!("recovery failed: {:?}", outcome.reason);
    }
    if !outcome.verified {
        warn!("reconstructed file does not hash the same as the source");
    }
    info!("recoverability run finished");
    Ok(())
}
