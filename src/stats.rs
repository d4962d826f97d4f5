//! Optional periodic process-metrics sampler.
//!
//! When enabled, samples this process's CPU and memory every configured
//! interval, logs one structured line, and appends CSV rows when an
//! output file is configured.

use std::{
    fs::File,
    path::PathBuf,
    time::{Duration, Instant},
};

use sysinfo::{Pid, System};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tokio_util::sync::CancellationToken;

use crate::config::StatsConfiguration;

const CSV_HEADER: [&str; 5] = [
    "timestamp",
    "uptime_secs",
    "cpu_percent",
    "rss_mb",
    "virtual_mb",
];

/// Start the sampler if it is enabled in the configuration. The task runs
/// until the token is cancelled.
pub fn spawn(config: &StatsConfiguration, cancel: CancellationToken) -> Option<JoinHandle<()>> {
    if !config.enabled {
        info!("stats_collection_disabled");
        return None;
    }

    let interval = config.interval();
    let output_file =
        (!config.output_file.is_empty()).then(|| PathBuf::from(&config.output_file));

    info!(
        interval_secs = interval.as_secs(),
        output = %config.output_file,
        "stats_collector_started"
    );

    Some(tokio::spawn(collect_loop(interval, output_file, cancel)))
}

async fn collect_loop(interval: Duration, output_file: Option<PathBuf>, cancel: CancellationToken) {
    let mut writer = output_file.and_then(|path| match csv::Writer::from_path(&path) {
        Ok(mut writer) => match writer.write_record(CSV_HEADER) {
            Ok(()) => Some(writer),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stats_csv_header_failed");
                None
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "stats_csv_open_failed");
            None
        }
    });

    let pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(e) => {
            warn!(error = e, "stats_pid_unavailable");
            return;
        }
    };

    let mut system = System::new();
    let started = Instant::now();
    // The first tick fires immediately, so stats are reported once on
    // startup.
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => sample(&mut system, pid, started, &mut writer),
        }
    }

    if let Some(writer) = writer.as_mut() {
        let _ = writer.flush();
    }
    info!("stats_collector_stopped");
}

fn sample(
    system: &mut System,
    pid: Pid,
    started: Instant,
    writer: &mut Option<csv::Writer<File>>,
) {
    if !system.refresh_process(pid) {
        return;
    }
    let Some(process) = system.process(pid) else {
        return;
    };

    let cpu_percent = process.cpu_usage();
    let rss_mb = process.memory() as f64 / (1024.0 * 1024.0);
    let virtual_mb = process.virtual_memory() as f64 / (1024.0 * 1024.0);

    info!(
        cpu_percent = format!("{cpu_percent:.1}"),
        rss_mb = format!("{rss_mb:.1}"),
        virtual_mb = format!("{virtual_mb:.1}"),
        "process_stats"
    );

    if let Some(csv_writer) = writer.as_mut() {
        let row = [
            chrono::Utc::now().to_rfc3339(),
            format!("{:.2}", started.elapsed().as_secs_f64()),
            format!("{cpu_percent:.2}"),
            format!("{rss_mb:.2}"),
            format!("{virtual_mb:.2}"),
        ];
        let result = csv_writer
            .write_record(row)
            .and_then(|()| csv_writer.flush().map_err(Into::into));
        if let Err(e) = result {
            warn!(error = %e, "stats_csv_write_failed");
            *writer = None;
        }
    }
}
