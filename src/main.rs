use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use tls_h2_scan_rs::config::{Cli, ScanConfig};
use tls_h2_scan_rs::geo::{GeoDatabase, GeoLookup, NoGeo};
use tls_h2_scan_rs::output::ResultSink;
use tls_h2_scan_rs::probe::TlsProber;
use tls_h2_scan_rs::scanner::{run_batch, run_scan, ScanSession};
use tls_h2_scan_rs::targets::{SourceDescriptor, TargetSource};
use tls_h2_scan_rs::types::ScanSummary;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = ScanConfig::from_cli(cli)?;

    info!("tls-h2-scan-rs configuration:");
    info!("  source   : {}", describe_source(&config.source));
    info!("  workers  : {}", config.thread_count);
    info!("  port     : {}", config.port);
    info!("  timeout  : {}s", config.timeout.as_secs());
    info!("  ipv6     : {}", config.enable_ipv6);
    info!("  output   : {}", config.output_path.display());
    info!("  mode     : {}", if config.batch { "batch" } else { "workers" });

    let geo: Arc<dyn GeoLookup> = match config.geoip_path.as_deref() {
        Some(path) => {
            let db = GeoDatabase::load(path)?;
            info!("loaded {} GeoIP ranges from {}", db.len(), path.display());
            Arc::new(db)
        }
        None => Arc::new(NoGeo),
    };

    let prober = Arc::new(
        TlsProber::new(config.port, config.timeout, geo)
            .context("failed to build TLS client")?
            .with_ipv6(config.enable_ipv6),
    );
    let source = TargetSource::open(&config.source, config.enable_ipv6).await?;
    let sink = Arc::new(ResultSink::create(&config.output_path).await?);
    let session = Arc::new(ScanSession::new());

    // Ctrl-C stops the scan gracefully.
    let on_signal = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.request_shutdown();
        }
    });

    let summary = if config.batch {
        run_batch(source, prober, sink, session.clone(), &config.batch_options()).await
    } else {
        run_scan(source, prober, sink, session.clone(), &config.scan_options()).await
    };

    info!(
        "{} after {:.1}s (started {}): scanned {}, feasible {}",
        if summary.completed { "finished" } else { "stopped" },
        summary.elapsed.as_secs_f64(),
        session.started_at(),
        summary.scanned,
        summary.feasible
    );

    if let Some(path) = config.summary_path.as_deref() {
        write_summary_json(path, &summary)?;
        info!("wrote run summary to {}", path.display());
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(format!("warn,tls_h2_scan_rs={level}")),
    )
    .init();
}

fn describe_source(source: &SourceDescriptor) -> String {
    match source {
        SourceDescriptor::Address(addr) => format!("{addr} (walk until Ctrl+C)"),
        SourceDescriptor::Cidr(cidr) => format!("{cidr} (CIDR)"),
        SourceDescriptor::Lines(path) => format!("{} (target file)", path.display()),
    }
}

fn write_summary_json(path: &Path, summary: &ScanSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create summary file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, summary)?;
    Ok(())
}
