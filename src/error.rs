use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarborError {
    // Connection spec validation
    #[error("Invalid connection spec: {reason}")]
    InvalidSpec { reason: String },

    // Transport errors
    #[error("Network error connecting to {host}: {reason}")]
    Network { host: String, reason: String },

    #[error("SSH protocol error with {host}: {reason}")]
    Protocol { host: String, reason: String },

    // Trust decisions
    #[error("Host key for {host} declined by user")]
    TrustDecisionCancelled { host: String },

    // Authentication outcomes
    #[error("Authentication cancelled by user for {user}@{host}")]
    AuthCancelled { user: String, host: String },

    #[error("No authentication method succeeded for {user}@{host}")]
    AuthExhausted { user: String, host: String },

    // Trust store errors
    #[error("Trust store I/O error: {0}")]
    TrustStoreIo(#[from] std::io::Error),

    #[error("Trust store parse error at line {line}: {reason}")]
    TrustStoreParse { line: usize, reason: String },

    // SFTP subsystem errors
    #[error("SFTP error: {reason}")]
    Sftp { reason: String },
}

impl HarborError {
    /// Whether this outcome is a deliberate user cancellation.
    ///
    /// Callers use this to suppress error dialogs for choices the user just
    /// made, while still surfacing genuine failures.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::TrustDecisionCancelled { .. } | Self::AuthCancelled { .. }
        )
    }
}

impl From<russh::Error> for HarborError {
    fn from(e: russh::Error) -> Self {
        Self::Protocol {
            host: String::new(),
            reason: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarborError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_display() {
        let err = HarborError::Network {
            host: "example.com".to_string(),
            reason: "connection refused".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("example.com"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_protocol_display() {
        let err = HarborError::Protocol {
            host: "example.com".to_string(),
            reason: "banner exchange failed".to_string(),
        };
        assert!(format!("{err}").contains("banner exchange failed"));
    }

    #[test]
    fn test_cancelled_variants_are_cancelled() {
        let trust = HarborError::TrustDecisionCancelled {
            host: "example.com".to_string(),
        };
        let auth = HarborError::AuthCancelled {
            user: "alice".to_string(),
            host: "example.com".to_string(),
        };
        assert!(trust.is_cancelled());
        assert!(auth.is_cancelled());
    }

    #[test]
    fn test_failures_are_not_cancelled() {
        let exhausted = HarborError::AuthExhausted {
            user: "alice".to_string(),
            host: "example.com".to_string(),
        };
        let network = HarborError::Network {
            host: "example.com".to_string(),
            reason: "timeout".to_string(),
        };
        assert!(!exhausted.is_cancelled());
        assert!(!network.is_cancelled());
    }

    #[test]
    fn test_trust_store_parse_display() {
        let err = HarborError::TrustStoreParse {
            line: 7,
            reason: "expected at least 3 fields".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains('7'));
        assert!(msg.contains("3 fields"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: HarborError = io.into();
        assert!(matches!(err, HarborError::TrustStoreIo(_)));
    }
}
