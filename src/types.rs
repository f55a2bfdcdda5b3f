use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Where a target came from. Only `Domain` targets send SNI during the handshake.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Ip,
    CidrMember,
    Domain,
}

/// One endpoint to probe.
///
/// `address` is `None` only for domains that have not been resolved yet; the
/// prober fills it in once before connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: Option<IpAddr>,
    pub origin: String,
    pub kind: TargetKind,
}

impl Target {
    pub fn ip(ip: IpAddr) -> Self {
        Self {
            address: Some(ip),
            origin: ip.to_string(),
            kind: TargetKind::Ip,
        }
    }

    pub fn cidr_member(ip: IpAddr, cidr: &str) -> Self {
        Self {
            address: Some(ip),
            origin: cidr.to_string(),
            kind: TargetKind::CidrMember,
        }
    }

    pub fn domain(name: &str) -> Self {
        Self {
            address: None,
            origin: name.to_string(),
            kind: TargetKind::Domain,
        }
    }

    /// A domain whose address is already known (resolved walk seeds).
    pub fn resolved_domain(name: &str, ip: IpAddr) -> Self {
        Self {
            address: Some(ip),
            origin: name.to_string(),
            kind: TargetKind::Domain,
        }
    }
}

/// Outcome of one completed handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub address: String,
    pub origin: String,
    pub certificate_domain: String,
    pub certificate_issuer: String,
    pub country_code: String,
    pub negotiated_protocol: String,
    pub negotiated_alpn: String,
    pub feasible: bool,
}

impl ProbeResult {
    pub fn new(
        address: String,
        origin: String,
        certificate_domain: String,
        certificate_issuer: String,
        country_code: String,
        negotiated_protocol: String,
        negotiated_alpn: String,
    ) -> Self {
        let feasible = is_feasible(
            &negotiated_protocol,
            &negotiated_alpn,
            &certificate_domain,
            &certificate_issuer,
        );
        Self {
            address,
            origin,
            certificate_domain,
            certificate_issuer,
            country_code,
            negotiated_protocol,
            negotiated_alpn,
            feasible,
        }
    }

    /// Render as one CSV row (no trailing newline). The issuer is always quoted.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},\"{}\",{}",
            self.address,
            self.origin,
            self.certificate_domain,
            self.certificate_issuer.replace('"', "\"\""),
            self.country_code
        )
    }
}

/// TLS 1.3, h2 negotiated, and a certificate carrying both a CN and an issuer organization.
pub fn is_feasible(protocol: &str, alpn: &str, domain: &str, issuer: &str) -> bool {
    protocol == "TLSv1.3" && alpn == "h2" && !domain.is_empty() && !issuer.is_empty()
}

/// Final counters of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanSummary {
    pub scanned: u64,
    pub feasible: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    /// `false` when the run ended through shutdown rather than source exhaustion.
    pub completed: bool,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
