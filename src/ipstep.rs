//! Overflow-checked stepping over the IPv4 and IPv6 address spaces.
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Move one address up or down. Returns `None` at the edge of the space instead of wrapping.
pub fn step(ip: IpAddr, dir: Direction) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let n = u32::from(v4);
            let next = match dir {
                Direction::Up => n.checked_add(1)?,
                Direction::Down => n.checked_sub(1)?,
            };
            Some(IpAddr::V4(Ipv4Addr::from(next)))
        }
        IpAddr::V6(v6) => {
            let n = u128::from(v6);
            let next = match dir {
                Direction::Up => n.checked_add(1)?,
                Direction::Down => n.checked_sub(1)?,
            };
            Some(IpAddr::V6(Ipv6Addr::from(next)))
        }
    }
}

/// Literal form of [`step`]. Malformed input yields `None`.
pub fn step_literal(literal: &str, dir: Direction) -> Option<String> {
    let ip: IpAddr = literal.trim().parse().ok()?;
    step(ip, dir).map(|next| next.to_string())
}

/// Fully expanded IPv6 form: eight groups, each zero-padded to four hex digits.
pub fn expand_ipv6(literal: &str) -> Option<String> {
    let ip: Ipv6Addr = literal.trim().parse().ok()?;
    let groups: Vec<String> = ip.segments().iter().map(|g| format!("{g:04x}")).collect();
    Some(groups.join(":"))
}

/// Canonical compressed IPv6 form (longest zero run collapsed, first one on ties).
///
/// Follows RFC 5952, so IPv4-mapped addresses keep a dotted-quad tail
/// (`::ffff:1.2.3.4`) instead of two hex groups.
pub fn compress_ipv6(literal: &str) -> Option<String> {
    let ip: Ipv6Addr = literal.trim().parse().ok()?;
    Some(ip.to_string())
}
