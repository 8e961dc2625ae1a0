//! Connection metadata supplied by the host authentication framework.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Snapshot of one login attempt. Every field is independently optional;
/// an unreadable attribute is simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    pub user: Option<String>,
    pub remote_user: Option<String>,
    pub remote_host: Option<String>,
    pub service: Option<String>,
    pub tty: Option<String>,
    pub auth_type: Option<String>,
}

impl ConnectionContext {
    /// Read the variables a PAM exec-style adapter exports.
    pub fn from_pam_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let field = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            user: field("PAM_USER"),
            remote_user: field("PAM_RUSER"),
            remote_host: field("PAM_RHOST"),
            service: field("PAM_SERVICE"),
            tty: field("PAM_TTY"),
            auth_type: field("PAM_TYPE"),
        }
    }
}

fn or_unknown(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("unknown")
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host: {}, user: {}, service: {}, tty: {}, remote user: {}, type: {}",
            or_unknown(&self.remote_host),
            or_unknown(&self.user),
            or_unknown(&self.service),
            or_unknown(&self.tty),
            or_unknown(&self.remote_user),
            or_unknown(&self.auth_type),
        )
    }
}

/// Informational metadata about the machine being logged into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub addresses: Vec<IpAddr>,
}

impl HostInfo {
    /// Best effort: lookup failures leave fields empty.
    pub fn discover() -> Self {
        let hostname = gethostname::gethostname()
            .into_string()
            .ok()
            .filter(|h| !h.is_empty());

        let addresses = match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                let mut addrs: Vec<IpAddr> = interfaces
                    .iter()
                    .filter(|iface| !iface.is_loopback())
                    .map(|iface| iface.ip())
                    .collect();
                addrs.sort();
                addrs.dedup();
                addrs
            }
            Err(e) => {
                tracing::debug!(error = %e, "could not enumerate network interfaces");
                Vec::new()
            }
        };

        Self { hostname, addresses }
    }
}

/// Body of the message sent to the operator.
pub fn challenge_text(ctx: &ConnectionContext, host: &HostInfo, at: DateTime<Local>) -> String {
    let addresses = if host.addresses.is_empty() {
        "unknown".to_string()
    } else {
        host.addresses
            .iter()
            .map(IpAddr::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "Login approval requested\n\
         {ctx}\n\
         server: {}\n\
         addresses: {addresses}\n\
         time: {}\n\
         Allow this login?",
        host.hostname.as_deref().unwrap_or("unknown"),
        at.format("%Y-%m-%d %H:%M:%S"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    #[test]
    fn test_from_lookup_treats_fields_independently() {
        let env: HashMap<&str, &str> = [
            ("PAM_USER", "alice"),
            ("PAM_RHOST", "203.0.113.9"),
            ("PAM_SERVICE", "sshd"),
            ("PAM_TTY", "   "),
        ]
        .into_iter()
        .collect();

        let ctx = ConnectionContext::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(ctx.user.as_deref(), Some("alice"));
        assert_eq!(ctx.remote_host.as_deref(), Some("203.0.113.9"));
        assert_eq!(ctx.tty, None);
        assert_eq!(ctx.remote_user, None);
    }

    #[test]
    fn test_display_marks_missing_fields() {
        let ctx = ConnectionContext {
            user: Some("root".into()),
            ..Default::default()
        };
        let line = ctx.to_string();
        assert!(line.starts_with("host: unknown, user: root, service: unknown"));
    }

    #[test]
    fn test_challenge_text_contents() {
        let ctx = ConnectionContext {
            user: Some("alice".into()),
            remote_host: Some("203.0.113.9".into()),
            service: Some("sshd".into()),
            ..Default::default()
        };
        let host = HostInfo {
            hostname: Some("bastion".into()),
            addresses: vec!["10.0.0.5".parse().unwrap(), "fd00::5".parse().unwrap()],
        };
        let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

        let text = challenge_text(&ctx, &host, at);
        assert!(text.contains("user: alice"));
        assert!(text.contains("host: 203.0.113.9"));
        assert!(text.contains("server: bastion"));
        assert!(text.contains("addresses: 10.0.0.5, fd00::5"));
        assert!(text.contains("time: 2024-05-01 12:30:00"));
    }

    #[test]
    fn test_challenge_text_without_host_info() {
        let text = challenge_text(&ConnectionContext::default(), &HostInfo::default(), Local::now());
        assert!(text.contains("server: unknown"));
        assert!(text.contains("addresses: unknown"));
    }

    #[test]
    fn test_discover_excludes_loopback() {
        let host = HostInfo::discover();
        assert!(host.addresses.iter().all(|a| !a.is_loopback()));
    }
}
