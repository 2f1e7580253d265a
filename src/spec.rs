use std::fmt;

use serde::Serialize;

use crate::error::{HarborError, Result};

/// Identity of an SSH endpoint: one spec maps to at most one pooled session.
///
/// Field order matters for the derived `Ord`: specs sort by host, then user,
/// then port, which gives stable listings in logs and ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionSpec {
    host: String,
    user: String,
    port: u16,
}

impl ConnectionSpec {
    pub fn new(host: impl Into<String>, user: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let user = user.into();
        if host.trim().is_empty() {
            return Err(HarborError::InvalidSpec {
                reason: "host must not be empty".to_string(),
            });
        }
        if user.trim().is_empty() {
            return Err(HarborError::InvalidSpec {
                reason: "user must not be empty".to_string(),
            });
        }
        Ok(Self { host, user, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form suitable for `tokio::net::lookup_host`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_valid() {
        let spec = ConnectionSpec::new("bastion.example.com", "deploy", 22).unwrap();
        assert_eq!(spec.host(), "bastion.example.com");
        assert_eq!(spec.user(), "deploy");
        assert_eq!(spec.port(), 22);
        assert_eq!(spec.to_string(), "deploy@bastion.example.com:22");
    }

    #[test]
    fn test_rejects_empty_fields() {
        assert!(matches!(
            ConnectionSpec::new("", "deploy", 22),
            Err(HarborError::InvalidSpec { .. })
        ));
        assert!(matches!(
            ConnectionSpec::new("host", "   ", 22),
            Err(HarborError::InvalidSpec { .. })
        ));
    }

    #[test]
    fn test_ordering_host_then_user_then_port() {
        let a = ConnectionSpec::new("alpha", "zed", 22).unwrap();
        let b = ConnectionSpec::new("beta", "ann", 22).unwrap();
        let c = ConnectionSpec::new("beta", "ann", 23).unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_equal_specs_hash_identically() {
        use std::collections::HashSet;
        let a = ConnectionSpec::new("h", "u", 22).unwrap();
        let b = ConnectionSpec::new("h", "u", 22).unwrap();
        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }
}
