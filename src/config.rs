use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::scanner::{BatchOptions, ScanOptions};
use crate::targets::SourceDescriptor;

/// tls-h2-scan-rs: walk address space looking for TLS 1.3 + HTTP/2 endpoints.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tls-h2-scan-rs",
    version,
    about = "Walk address space looking for TLS 1.3 + HTTP/2 endpoints.",
    long_about = None
)]
pub struct Cli {
    /// IP, domain or IPv4 CIDR. A bare IP or domain is walked outwards until interrupted.
    #[arg(long)]
    pub addr: Option<String>,

    /// File with one IP, CIDR or domain per line.
    #[arg(long = "in")]
    pub input: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = 10)]
    pub thread: usize,

    /// TLS port to probe.
    #[arg(long, default_value_t = 443)]
    pub port: u16,

    /// Connect and handshake timeout in seconds.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    /// Accept IPv6 targets.
    #[arg(long = "ipv6", default_value_t = false)]
    pub ipv6: bool,

    /// CSV file for feasible results.
    #[arg(long = "out", default_value = "out.csv")]
    pub output: PathBuf,

    /// CSV of `start_ip,end_ip,country` ranges for country lookup.
    #[arg(long)]
    pub geoip: Option<PathBuf>,

    /// Probe in fixed chunks instead of with long-lived workers (finite sources only).
    #[arg(long, default_value_t = false)]
    pub batch: bool,

    /// Seconds to wait for in-flight probes after Ctrl+C.
    #[arg(long, default_value_t = 30)]
    pub grace: u64,

    /// Also write the run summary as JSON to this path.
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// Log every probe outcome.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("give exactly one of --addr or --in")]
    Source,
    #[error("--thread must be at least 1")]
    Threads,
    #[error("--port must not be 0")]
    Port,
    #[error("--timeout must be at least 1 second")]
    Timeout,
    #[error("target file {0} does not exist")]
    MissingInput(PathBuf),
    #[error("--batch needs a finite source (a CIDR or an --in file)")]
    BatchUnbounded,
}

/// Validated run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub source: SourceDescriptor,
    pub thread_count: usize,
    pub port: u16,
    pub timeout: Duration,
    pub enable_ipv6: bool,
    pub output_path: PathBuf,
    pub geoip_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    pub batch: bool,
    pub shutdown_grace: Duration,
}

impl ScanConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let source = match (cli.addr.as_deref().map(str::trim), cli.input) {
            (Some(addr), None) if !addr.is_empty() => SourceDescriptor::from_address(addr),
            (None, Some(path)) => {
                if !path.is_file() {
                    return Err(ConfigError::MissingInput(path));
                }
                SourceDescriptor::from_file(path)
            }
            _ => return Err(ConfigError::Source),
        };
        if cli.thread == 0 {
            return Err(ConfigError::Threads);
        }
        if cli.port == 0 {
            return Err(ConfigError::Port);
        }
        if cli.timeout == 0 {
            return Err(ConfigError::Timeout);
        }
        if cli.batch && source.is_unbounded() {
            return Err(ConfigError::BatchUnbounded);
        }
        Ok(Self {
            source,
            thread_count: cli.thread,
            port: cli.port,
            timeout: Duration::from_secs(cli.timeout),
            enable_ipv6: cli.ipv6,
            output_path: cli.output,
            geoip_path: cli.geoip,
            summary_path: cli.summary,
            batch: cli.batch,
            shutdown_grace: Duration::from_secs(cli.grace),
        })
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            workers: self.thread_count,
            shutdown_grace: self.shutdown_grace,
            ..ScanOptions::default()
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            chunk_size: self.thread_count,
            ..BatchOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ScanConfig, ConfigError> {
        let mut argv = vec!["tls-h2-scan-rs"];
        argv.extend_from_slice(args);
        ScanConfig::from_cli(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn defaults() {
        let cfg = parse(&["--addr", "1.2.3.4"]).unwrap();
        assert_eq!(cfg.source, SourceDescriptor::Address("1.2.3.4".into()));
        assert_eq!(cfg.thread_count, 10);
        assert_eq!(cfg.port, 443);
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.output_path, PathBuf::from("out.csv"));
        assert!(!cfg.enable_ipv6);
        assert_eq!(cfg.scan_options().workers, 10);
        assert_eq!(cfg.scan_options().shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn cidr_address_becomes_cidr_source() {
        let cfg = parse(&["--addr", "10.0.0.0/24", "--batch", "--thread", "4"]).unwrap();
        assert_eq!(cfg.source, SourceDescriptor::Cidr("10.0.0.0/24".into()));
        assert_eq!(cfg.batch_options().chunk_size, 4);
    }

    #[test]
    fn rejects_bad_combinations() {
        assert_eq!(parse(&[]).unwrap_err(), ConfigError::Source);
        assert_eq!(
            parse(&["--addr", "1.1.1.1", "--in", "Cargo.toml"]).unwrap_err(),
            ConfigError::Source
        );
        assert_eq!(parse(&["--addr", "1.1.1.1", "--thread", "0"]).unwrap_err(), ConfigError::Threads);
        assert_eq!(parse(&["--addr", "1.1.1.1", "--port", "0"]).unwrap_err(), ConfigError::Port);
        assert_eq!(parse(&["--addr", "1.1.1.1", "--timeout", "0"]).unwrap_err(), ConfigError::Timeout);
        assert_eq!(parse(&["--addr", "1.1.1.1", "--batch"]).unwrap_err(), ConfigError::BatchUnbounded);
        assert!(matches!(
            parse(&["--in", "does/not/exist.txt"]).unwrap_err(),
            ConfigError::MissingInput(_)
        ));
    }
}
