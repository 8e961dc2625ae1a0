//! Force-bypass evaluation: explicit override or a trusted source network.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::models::context::ConnectionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustedSource {
    Network(IpNet),
    /// Legacy textual prefix such as `192.168.1.`, matched against the raw
    /// remote host string.
    Prefix(String),
}

impl TrustedSource {
    pub fn matches(&self, remote_host: &str) -> bool {
        let remote_host = remote_host.trim();
        match self {
            TrustedSource::Network(net) => remote_host
                .parse::<IpAddr>()
                .map(|addr| net.contains(&addr))
                .unwrap_or(false),
            TrustedSource::Prefix(prefix) => remote_host.starts_with(prefix.as_str()),
        }
    }
}

impl FromStr for TrustedSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty trusted source".to_string());
        }
        if let Ok(net) = s.parse::<IpNet>() {
            return Ok(TrustedSource::Network(net));
        }
        if let Ok(addr) = s.parse::<IpAddr>() {
            let host_len = if addr.is_ipv4() { 32 } else { 128 };
            return IpNet::new(addr, host_len)
                .map(TrustedSource::Network)
                .map_err(|e| format!("invalid address {s}: {e}"));
        }
        if s.contains('/') {
            return Err(format!("invalid network: {s}"));
        }
        Ok(TrustedSource::Prefix(s.to_string()))
    }
}

impl fmt::Display for TrustedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustedSource::Network(net) => write!(f, "{net}"),
            TrustedSource::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Forced,
    TrustedSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassPolicy {
    pub force: bool,
    pub trusted: Vec<TrustedSource>,
}

impl BypassPolicy {
    /// A context without a remote host never matches a trusted source.
    pub fn evaluate(&self, ctx: &ConnectionContext) -> Option<BypassReason> {
        if self.force {
            return Some(BypassReason::Forced);
        }
        let remote_host = ctx.remote_host.as_deref()?;
        self.trusted
            .iter()
            .any(|source| source.matches(remote_host))
            .then_some(BypassReason::TrustedSource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(rhost: Option<&str>) -> ConnectionContext {
        ConnectionContext {
            remote_host: rhost.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_sources() {
        assert!(matches!("10.0.0.0/8".parse::<TrustedSource>(), Ok(TrustedSource::Network(_))));
        assert!(matches!("fd00::/8".parse::<TrustedSource>(), Ok(TrustedSource::Network(_))));
        assert!(matches!("203.0.113.7".parse::<TrustedSource>(), Ok(TrustedSource::Network(_))));
        assert_eq!(
            "192.168.1.".parse::<TrustedSource>(),
            Ok(TrustedSource::Prefix("192.168.1.".into()))
        );
        assert!("10.0.0.0/99".parse::<TrustedSource>().is_err());
        assert!("".parse::<TrustedSource>().is_err());
    }

    #[test]
    fn test_cidr_match() {
        let source: TrustedSource = "192.168.1.0/24".parse().unwrap();
        assert!(source.matches("192.168.1.20"));
        assert!(!source.matches("192.168.10.20"));
        assert!(!source.matches("not-an-ip"));
    }

    #[test]
    fn test_prefix_match_is_anchored() {
        let source: TrustedSource = "192.168.1.".parse().unwrap();
        assert!(source.matches("192.168.1.20"));
        assert!(!source.matches("10.192.168.1.5"));
    }

    #[test]
    fn test_policy() {
        let policy = BypassPolicy {
            force: false,
            trusted: vec!["10.0.0.0/8".parse().unwrap()],
        };
        assert_eq!(policy.evaluate(&ctx(Some("10.1.2.3"))), Some(BypassReason::TrustedSource));
        assert_eq!(policy.evaluate(&ctx(Some("8.8.8.8"))), None);
        assert_eq!(policy.evaluate(&ctx(None)), None);

        let forced = BypassPolicy {
            force: true,
            ..Default::default()
        };
        assert_eq!(forced.evaluate(&ctx(None)), Some(BypassReason::Forced));
    }
}
