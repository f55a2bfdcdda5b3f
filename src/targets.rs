//! Target enumeration: the bidirectional address walk, CIDR expansion and
//! line-oriented target files.
//!
//! Every source is pulled lazily through [`TargetSource::next`], so an
//! unbounded walk never materialises more than the watermarks it is standing on.
use anyhow::{Context, Result};
use ipnet::{Ipv4AddrRange, Ipv4Net};
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

use crate::ipstep::{step, Direction};
use crate::types::Target;

/// What the user asked to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// A single IP literal or domain; walked outwards without end.
    Address(String),
    /// An IPv4 `base/mask` block.
    Cidr(String),
    /// A file with one IP, CIDR or domain per line.
    Lines(PathBuf),
}

impl SourceDescriptor {
    pub fn from_address(addr: &str) -> Self {
        let addr = addr.trim();
        if addr.contains('/') {
            SourceDescriptor::Cidr(addr.to_string())
        } else {
            SourceDescriptor::Address(addr.to_string())
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        SourceDescriptor::Lines(path.into())
    }

    /// Only the address walk has no natural end.
    pub fn is_unbounded(&self) -> bool {
        matches!(self, SourceDescriptor::Address(_))
    }
}

/// Resolve a host name to a single address, preferring IPv4.
///
/// IPv6 answers are only considered when `enable_ipv6` is set.
pub async fn resolve(host: &str, enable_ipv6: bool) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = match tokio::net::lookup_host((host, 0)).await {
        Ok(it) => it.map(|sa| sa.ip()).collect(),
        Err(e) => {
            debug!("DNS lookup for {host} failed: {e}");
            return None;
        }
    };
    addrs
        .iter()
        .copied()
        .find(IpAddr::is_ipv4)
        .or_else(|| {
            enable_ipv6
                .then(|| addrs.iter().copied().find(IpAddr::is_ipv6))
                .flatten()
        })
}

/// Walks outwards from a seed: seed, seed-1, seed+1, seed-2, seed+2, ...
///
/// A side that hits the edge of the address space is dropped and the walk
/// continues on the other side only. It ends once both sides are exhausted.
#[derive(Debug, Clone)]
pub struct AddressWalk {
    seed: Option<Target>,
    low: Option<IpAddr>,
    high: Option<IpAddr>,
    next_dir: Direction,
}

impl AddressWalk {
    pub fn new(seed: IpAddr) -> Self {
        Self::from_target(Target::ip(seed))
    }

    /// Starts from an already resolved target. A target without an address gives an empty walk.
    pub fn from_target(seed: Target) -> Self {
        let start = seed.address;
        Self {
            seed: start.map(|_| seed),
            low: start,
            high: start,
            next_dir: Direction::Down,
        }
    }

    pub fn empty() -> Self {
        Self {
            seed: None,
            low: None,
            high: None,
            next_dir: Direction::Down,
        }
    }
}

impl Iterator for AddressWalk {
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        if let Some(seed) = self.seed.take() {
            return Some(seed);
        }
        for _ in 0..2 {
            let dir = self.next_dir;
            self.next_dir = dir.flip();
            let mark = match dir {
                Direction::Down => &mut self.low,
                Direction::Up => &mut self.high,
            };
            let Some(current) = *mark else { continue };
            match step(current, dir) {
                Some(ip) => {
                    *mark = Some(ip);
                    return Some(Target::ip(ip));
                }
                None => {
                    debug!("address walk reached the {dir:?} edge at {current}");
                    *mark = None;
                }
            }
        }
        None
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CidrError {
    #[error("not in base/mask form: {0}")]
    Shape(String),
    #[error("invalid IPv4 base address: {0}")]
    Base(String),
    #[error("mask /{0} is outside 0..=32")]
    Mask(u32),
}

/// Every address of an IPv4 block, ascending from its network address.
#[derive(Debug, Clone)]
pub struct CidrExpansion {
    origin: String,
    range: Ipv4AddrRange,
}

impl CidrExpansion {
    pub fn parse(literal: &str) -> Result<Self, CidrError> {
        let literal = literal.trim();
        let (base, mask) = literal
            .split_once('/')
            .ok_or_else(|| CidrError::Shape(literal.to_string()))?;
        let base: Ipv4Addr = base
            .parse()
            .map_err(|_| CidrError::Base(base.to_string()))?;
        let mask: u32 = mask
            .parse()
            .map_err(|_| CidrError::Shape(literal.to_string()))?;
        if mask > 32 {
            return Err(CidrError::Mask(mask));
        }
        let net = Ipv4Net::new(base, mask as u8).map_err(|_| CidrError::Mask(mask))?;
        Ok(Self {
            origin: literal.to_string(),
            range: Ipv4AddrRange::new(net.network(), net.broadcast()),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl Iterator for CidrExpansion {
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        let ip = self.range.next()?;
        Some(Target::cidr_member(IpAddr::V4(ip), &self.origin))
    }
}

/// How a single line of a target file was understood.
#[derive(Debug)]
pub enum LineEntry {
    Blank,
    Ip(IpAddr),
    Cidr(CidrExpansion),
    Domain(String),
    Ipv6Disabled(IpAddr),
    BadCidr(CidrError),
    Invalid(String),
}

/// Classify one raw line of a target file.
pub fn classify_line(raw: &str, enable_ipv6: bool) -> LineEntry {
    let line = raw.trim();
    if line.is_empty() {
        return LineEntry::Blank;
    }
    if let Ok(ip) = line.parse::<IpAddr>() {
        return match ip {
            IpAddr::V6(_) if !enable_ipv6 => LineEntry::Ipv6Disabled(ip),
            _ => LineEntry::Ip(ip),
        };
    }
    if looks_like_cidr(line) {
        return match CidrExpansion::parse(line) {
            Ok(c) => LineEntry::Cidr(c),
            Err(e) => LineEntry::BadCidr(e),
        };
    }
    if is_domain_token(line) {
        return LineEntry::Domain(line.to_string());
    }
    LineEntry::Invalid(line.to_string())
}

/// `d+.d+.d+.d+/d{1,2}`
fn looks_like_cidr(s: &str) -> bool {
    let Some((base, mask)) = s.split_once('/') else {
        return false;
    };
    let all_digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    let parts: Vec<&str> = base.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| all_digits(p)) && all_digits(mask) && mask.len() <= 2
}

fn is_domain_token(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
        && s.bytes().any(|b| b.is_ascii_alphanumeric())
}

/// Targets read line by line from any async reader.
pub struct LineTargets {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
    pending: Option<CidrExpansion>,
    enable_ipv6: bool,
    line_no: usize,
}

impl LineTargets {
    pub fn new<R>(reader: R, enable_ipv6: bool) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: BufReader::new(reader).lines(),
            pending: None,
            enable_ipv6,
            line_no: 0,
        }
    }

    pub async fn next(&mut self) -> Option<Target> {
        loop {
            if let Some(block) = self.pending.as_mut() {
                if let Some(t) = block.next() {
                    return Some(t);
                }
                self.pending = None;
            }

            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("stopped reading targets after line {}: {e}", self.line_no);
                    return None;
                }
            };
            self.line_no += 1;

            match classify_line(&line, self.enable_ipv6) {
                LineEntry::Blank => {}
                LineEntry::Ip(ip) => return Some(Target::ip(ip)),
                LineEntry::Domain(name) => return Some(Target::domain(&name)),
                LineEntry::Cidr(block) => self.pending = Some(block),
                LineEntry::Ipv6Disabled(ip) => {
                    debug!("line {}: skipping {ip}, IPv6 is disabled", self.line_no);
                }
                LineEntry::BadCidr(e) => warn!("line {}: skipping CIDR: {e}", self.line_no),
                LineEntry::Invalid(token) => {
                    warn!("line {}: skipping unrecognised target {token:?}", self.line_no);
                }
            }
        }
    }
}

/// A single lazily pulled stream of targets.
pub enum TargetSource {
    Walk(AddressWalk),
    Cidr(CidrExpansion),
    Lines(LineTargets),
}

impl TargetSource {
    /// Open a source. Re-opening is the only way to restart it.
    ///
    /// A domain seed that cannot be resolved, or an IPv6 seed while IPv6 is
    /// disabled, gives an empty walk, not an error.
    pub async fn open(desc: &SourceDescriptor, enable_ipv6: bool) -> Result<Self> {
        match desc {
            SourceDescriptor::Address(addr) => Ok(TargetSource::Walk(open_walk(addr, enable_ipv6).await)),
            SourceDescriptor::Cidr(cidr) => {
                let block = CidrExpansion::parse(cidr)
                    .with_context(|| format!("invalid CIDR target: {cidr}"))?;
                Ok(TargetSource::Cidr(block))
            }
            SourceDescriptor::Lines(path) => {
                let file = File::open(path)
                    .await
                    .with_context(|| format!("failed to open target file: {}", path.display()))?;
                Ok(TargetSource::Lines(LineTargets::new(file, enable_ipv6)))
            }
        }
    }

    pub async fn next(&mut self) -> Option<Target> {
        match self {
            TargetSource::Walk(walk) => walk.next(),
            TargetSource::Cidr(block) => block.next(),
            TargetSource::Lines(lines) => lines.next().await,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, TargetSource::Walk(_))
    }
}

async fn open_walk(seed: &str, enable_ipv6: bool) -> AddressWalk {
    if let Ok(ip) = seed.parse::<IpAddr>() {
        if ip.is_ipv6() && !enable_ipv6 {
            warn!("walk seed {seed} is IPv6 but --ipv6 is off; nothing to scan");
            return AddressWalk::empty();
        }
        return AddressWalk::new(ip);
    }
    match resolve(seed, enable_ipv6).await {
        Some(ip) => {
            debug!("walk seed {seed} resolved to {ip}");
            AddressWalk::from_target(Target::resolved_domain(seed, ip))
        }
        None => {
            warn!("could not resolve {seed}; nothing to scan");
            AddressWalk::empty()
        }
    }
}
