//! Transport establishment, host-key verification, and the authenticated
//! session wrapper.
//!
//! Host-key verification runs inside the SSH handshake: the engine calls back
//! into [`TrustHandler`] with the server's key before key exchange completes,
//! and an `Abort` trust decision fails the whole connection attempt with
//! [`HarborError::TrustDecisionCancelled`].

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use russh::client::{self, Config, Handle};
use russh::keys::{HashAlg, PublicKey, PublicKeyBase64};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::credentials::{CredentialProvider, TrustDecision};
use crate::error::{HarborError, Result};
use crate::known_hosts::{fingerprint_from_blob, FindResult, KnownHostsStore};
use crate::retry::{self, RetryConfig};
use crate::spec::ConnectionSpec;

/// Sanitize SSH error messages before they reach logs or callers.
/// Masks authentication method names that could aid reconnaissance and
/// truncates messages that might contain data dumps.
pub(crate) fn sanitize_ssh_error(error: &impl std::fmt::Display) -> String {
    let mut msg = error.to_string();
    for method in &["publickey", "keyboard-interactive", "gssapi-with-mic"] {
        msg = msg.replace(method, "***");
    }
    if msg.len() > 500 {
        // Peer-supplied text may be non-ASCII; back off to a char boundary.
        let mut cut = 500;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... (truncated)", &msg[..cut])
    } else {
        msg
    }
}

/// SHA256 fingerprint of a public key, in the OpenSSH presentation form.
#[must_use]
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Handshake callback: checks the server's key against the trust store and,
/// when the store cannot confirm it, defers to the credential collaborator.
pub(crate) struct TrustHandler {
    host: String,
    store: Arc<KnownHostsStore>,
    credentials: Arc<dyn CredentialProvider>,
}

impl TrustHandler {
    /// Persist the store after a trust change. A write failure is reported in
    /// the log only; the in-memory decision stands for the rest of the
    /// process.
    fn persist(&self) {
        if let Err(e) = self.store.save() {
            warn!(
                host = %self.host,
                error = %e,
                "Failed to persist trust store; keeping the decision in memory"
            );
        }
    }
}

impl client::Handler for TrustHandler {
    type Error = HarborError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let algorithm = server_public_key.algorithm().to_string();
        let key_b64 = BASE64.encode(server_public_key.public_key_bytes());
        let print = fingerprint(server_public_key);

        match self.store.find(&self.host, &algorithm, &key_b64) {
            FindResult::Match => {
                debug!(host = %self.host, algorithm = %algorithm, "Host key verified");
                Ok(true)
            }
            FindResult::Mismatch => {
                let expected = self
                    .store
                    .stored_key(&self.host, &algorithm)
                    .map_or_else(|| "unknown".to_string(), |b| fingerprint_from_blob(&b));
                warn!(
                    host = %self.host,
                    expected = %expected,
                    presented = %print,
                    "Host key mismatch"
                );
                match self
                    .credentials
                    .on_host_key_mismatch(&self.host, &print, &algorithm)
                    .await
                {
                    TrustDecision::AcceptAndPersist => {
                        self.store.update(&self.host, &algorithm, &key_b64);
                        self.persist();
                        Ok(true)
                    }
                    TrustDecision::AcceptOnce => Ok(true),
                    TrustDecision::Abort => Err(HarborError::TrustDecisionCancelled {
                        host: self.host.clone(),
                    }),
                }
            }
            FindResult::NotFound => {
                debug!(host = %self.host, fingerprint = %print, "Unknown host key");
                match self
                    .credentials
                    .on_host_key_unknown(&self.host, &print, &algorithm)
                    .await
                {
                    TrustDecision::AcceptAndPersist => {
                        self.store.add(&self.host, &algorithm, &key_b64, None);
                        self.persist();
                        Ok(true)
                    }
                    TrustDecision::AcceptOnce => Ok(true),
                    TrustDecision::Abort => Err(HarborError::TrustDecisionCancelled {
                        host: self.host.clone(),
                    }),
                }
            }
        }
    }
}

/// A handshaked but not yet authenticated SSH transport.
pub struct RunningSession {
    handle: Handle<TrustHandler>,
    spec: ConnectionSpec,
}

impl RunningSession {
    /// Resolve, connect, and handshake.
    ///
    /// Every resolved address is tried in order until one accepts a TCP
    /// connection. Resolution and connect failures are network errors; a
    /// rejected handshake is a protocol error carrying the peer's text.
    pub async fn establish(
        spec: &ConnectionSpec,
        store: Arc<KnownHostsStore>,
        credentials: Arc<dyn CredentialProvider>,
        limits: &LimitsConfig,
    ) -> Result<Self> {
        let candidates: Vec<std::net::SocketAddr> = tokio::net::lookup_host(spec.addr())
            .await
            .map_err(|e| HarborError::Network {
                host: spec.host().to_string(),
                reason: format!("name resolution failed: {e}"),
            })?
            .collect();
        if candidates.is_empty() {
            return Err(HarborError::Network {
                host: spec.host().to_string(),
                reason: "name resolved to no addresses".to_string(),
            });
        }

        let connect_timeout = Duration::from_secs(limits.connect_timeout_seconds);
        let mut stream = None;
        let mut last_error = String::new();
        for candidate in &candidates {
            match timeout(connect_timeout, TcpStream::connect(candidate)).await {
                Ok(Ok(s)) => {
                    debug!(spec = %spec, addr = %candidate, "TCP connected");
                    stream = Some(s);
                    break;
                }
                Ok(Err(e)) => {
                    debug!(spec = %spec, addr = %candidate, error = %e, "TCP connect failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    debug!(spec = %spec, addr = %candidate, "TCP connect timed out");
                    last_error =
                        format!("connect timeout after {}s", limits.connect_timeout_seconds);
                }
            }
        }
        let Some(stream) = stream else {
            return Err(HarborError::Network {
                host: spec.host().to_string(),
                reason: format!(
                    "no address accepted a connection ({} tried): {last_error}",
                    candidates.len()
                ),
            });
        };

        let config = Arc::new(Config {
            keepalive_interval: Some(Duration::from_secs(limits.keepalive_interval_seconds)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = TrustHandler {
            host: spec.host().to_string(),
            store,
            credentials,
        };

        let handshake_timeout = Duration::from_secs(limits.handshake_timeout_seconds);
        let handle = timeout(
            handshake_timeout,
            client::connect_stream(config, stream, handler),
        )
        .await
        .map_err(|_| HarborError::Protocol {
            host: spec.host().to_string(),
            reason: format!(
                "handshake timeout after {}s",
                limits.handshake_timeout_seconds
            ),
        })?
        .map_err(|e| match e {
            // Engine errors arrive host-less; trust decisions pass through.
            HarborError::Protocol { reason, .. } => HarborError::Protocol {
                host: spec.host().to_string(),
                reason: sanitize_ssh_error(&reason),
            },
            other => other,
        })?;

        info!(spec = %spec, "SSH transport established");
        Ok(Self {
            handle,
            spec: spec.clone(),
        })
    }

    /// Liveness probe: whether the engine has torn the connection down.
    /// Heuristic only; a session may still die between this check and use.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.handle.is_closed()
    }

    #[must_use]
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    pub(crate) fn handle_mut(&mut self) -> &mut Handle<TrustHandler> {
        &mut self.handle
    }

    pub(crate) fn into_parts(self) -> (Handle<TrustHandler>, ConnectionSpec) {
        (self.handle, self.spec)
    }
}

/// A fully authenticated session with the SFTP subsystem open.
///
/// Constructed only by the cascade, so holding one implies authentication
/// already succeeded.
pub struct AuthenticatedSession {
    handle: Handle<TrustHandler>,
    sftp: SftpSession,
    spec: ConnectionSpec,
    close_timeout: Duration,
}

impl AuthenticatedSession {
    /// Open the SFTP subsystem on an already-authenticated transport.
    pub(crate) async fn open(running: RunningSession, limits: &LimitsConfig) -> Result<Self> {
        let (handle, spec) = running.into_parts();
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| HarborError::Sftp {
                reason: format!("Failed to open channel: {e}"),
            })?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| HarborError::Sftp {
                reason: format!("Failed to request SFTP subsystem: {e}"),
            })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| HarborError::Sftp {
                reason: format!("Failed to initialize SFTP session: {e}"),
            })?;

        Ok(Self {
            handle,
            sftp,
            spec,
            close_timeout: Duration::from_secs(limits.close_timeout_seconds),
        })
    }

    #[must_use]
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.handle.is_closed()
    }

    #[must_use]
    pub fn sftp(&self) -> &SftpSession {
        &self.sftp
    }

    /// Stat a remote path, retrying transient channel trouble.
    pub async fn stat(&self, path: &str) -> Result<FileAttributes> {
        retry::with_retry_if(
            &RetryConfig::default(),
            "sftp stat",
            || async {
                self.sftp
                    .metadata(path)
                    .await
                    .map_err(|e| HarborError::Sftp {
                        reason: e.to_string(),
                    })
            },
            retry::is_retryable_error,
        )
        .await
    }

    /// List the names in a remote directory, retrying transient channel
    /// trouble.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<String>> {
        retry::with_retry_if(
            &RetryConfig::default(),
            "sftp read_dir",
            || async {
                let entries = self
                    .sftp
                    .read_dir(path)
                    .await
                    .map_err(|e| HarborError::Sftp {
                        reason: e.to_string(),
                    })?;
                Ok(entries.map(|entry| entry.file_name()).collect())
            },
            retry::is_retryable_error,
        )
        .await
    }

    /// Send the disconnect message, bounded by the close timeout. A timeout
    /// is not an error; the connection was likely dead already.
    pub async fn close(&self) -> Result<()> {
        match timeout(
            self.close_timeout,
            self.handle
                .disconnect(russh::Disconnect::ByApplication, "", "en"),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HarborError::Protocol {
                host: self.spec.host().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(spec = %self.spec, "Timeout closing SSH connection, forcing drop");
                Ok(())
            }
        }
    }
}
