use anyhow::{bail, Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::Path;

pub const UNKNOWN_COUNTRY: &str = "N/A";

/// Country lookup for probed addresses. Never fails; unknown addresses map to `"N/A"`.
pub trait GeoLookup: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> String;
}

/// Used when no database was loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeo;

impl GeoLookup for NoGeo {
    fn country_code(&self, _ip: IpAddr) -> String {
        UNKNOWN_COUNTRY.to_string()
    }
}

/// Range table mapping address intervals to ISO country codes.
///
/// IPv4 and IPv6 are kept apart; IPv4 ranges are stored widened to `u128`.
#[derive(Debug, Clone, Default)]
pub struct GeoDatabase {
    v4: Vec<(u128, u128, String)>,
    v6: Vec<(u128, u128, String)>,
}

impl GeoDatabase {
    /// Parse CSV content with lines of `start_ip,end_ip,CC`.
    ///
    /// Everything after `#` is a comment; blank lines are ignored.
    pub fn parse_str(s: &str) -> Result<Self> {
        let mut db = GeoDatabase::default();
        for (idx, raw_line) in s.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let [start, end, code] = fields.as_slice() else {
                bail!("line {line_no}: expected start,end,country but got {line:?}");
            };
            let start: IpAddr = start
                .parse()
                .with_context(|| format!("line {line_no}: invalid start address {start}"))?;
            let end: IpAddr = end
                .parse()
                .with_context(|| format!("line {line_no}: invalid end address {end}"))?;
            if code.is_empty() {
                bail!("line {line_no}: empty country code");
            }
            let entry = (as_u128(start), as_u128(end), code.to_ascii_uppercase());
            if entry.0 > entry.1 {
                bail!("line {line_no}: range start {start} is after end {end}");
            }
            match (start, end) {
                (IpAddr::V4(_), IpAddr::V4(_)) => db.v4.push(entry),
                (IpAddr::V6(_), IpAddr::V6(_)) => db.v6.push(entry),
                _ => bail!("line {line_no}: mixed address families in {line:?}"),
            }
        }
        db.v4.sort_by_key(|e| e.0);
        db.v6.sort_by_key(|e| e.0);
        Ok(db)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read GeoIP file: {}", path.as_ref().display()))?;
        Self::parse_str(&content)
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GeoLookup for GeoDatabase {
    fn country_code(&self, ip: IpAddr) -> String {
        let table = match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        let n = as_u128(ip);
        // Last range starting at or below `n`.
        let idx = table.partition_point(|e| e.0 <= n);
        match idx.checked_sub(1).map(|i| &table[i]) {
            Some((_, end, code)) if n <= *end => code.clone(),
            _ => UNKNOWN_COUNTRY.to_string(),
        }
    }
}

fn as_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        # start,end,country
        1.0.0.0,1.0.0.255,au
        8.8.8.0, 8.8.8.255, US   # google
        2001:db8::,2001:db8::ffff,NL
    "#;

    #[test]
    fn lookup_hits_and_misses() {
        let db = GeoDatabase::parse_str(SAMPLE).unwrap();
        assert_eq!(db.len(), 3);
        assert_eq!(db.country_code("8.8.8.8".parse().unwrap()), "US");
        assert_eq!(db.country_code("1.0.0.0".parse().unwrap()), "AU");
        assert_eq!(db.country_code("1.0.1.0".parse().unwrap()), "N/A");
        assert_eq!(db.country_code("0.0.0.1".parse().unwrap()), "N/A");
        assert_eq!(db.country_code("2001:db8::1".parse().unwrap()), "NL");
        assert_eq!(db.country_code("2001:db9::1".parse().unwrap()), "N/A");
    }

    #[test]
    fn ipv4_ranges_do_not_answer_for_ipv6() {
        let db = GeoDatabase::parse_str("0.0.0.0,255.255.255.255,ZZ").unwrap();
        assert_eq!(db.country_code("::1".parse().unwrap()), "N/A");
    }

    #[test]
    fn malformed_lines_error() {
        assert!(GeoDatabase::parse_str("1.0.0.0,1.0.0.255").is_err());
        assert!(GeoDatabase::parse_str("1.0.0.9,1.0.0.1,US").is_err());
        assert!(GeoDatabase::parse_str("1.0.0.0,::1,US").is_err());
        assert!(GeoDatabase::parse_str("x,1.0.0.1,US").is_err());
    }

    #[test]
    fn no_geo_is_always_unknown() {
        assert_eq!(NoGeo.country_code("8.8.8.8".parse().unwrap()), UNKNOWN_COUNTRY);
    }
}
