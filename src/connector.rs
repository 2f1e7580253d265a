//! Seam between the pool/broker machinery and the SSH engine.
//!
//! The pool is generic over a [`SessionConnector`] so its concurrency
//! behavior is testable without a live server; [`RusshConnector`] is the
//! production implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::auth;
use crate::config::LimitsConfig;
use crate::credentials::CredentialProvider;
use crate::error::Result;
use crate::known_hosts::KnownHostsStore;
use crate::retry::{self, RetryConfig};
use crate::session::{AuthenticatedSession, RunningSession};
use crate::spec::ConnectionSpec;

/// A pooled session's lifecycle surface.
#[async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    /// Liveness heuristic; a dead session is replaced on next lookup.
    fn is_dead(&self) -> bool;

    /// Best-effort teardown.
    async fn close(&self);
}

/// Builds an authenticated session for a spec.
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    type Session: ManagedSession;

    async fn connect(
        &self,
        spec: &ConnectionSpec,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self::Session>;
}

#[async_trait]
impl ManagedSession for AuthenticatedSession {
    fn is_dead(&self) -> bool {
        Self::is_dead(self)
    }

    async fn close(&self) {
        if let Err(e) = Self::close(self).await {
            warn!(spec = %self.spec(), error = %e, "Error closing session");
        }
    }
}

/// Production connector: resolve/connect/handshake with transient-failure
/// retry, then the authentication cascade. Authentication itself is never
/// retried; a retry would re-prompt the user.
pub struct RusshConnector {
    store: Arc<KnownHostsStore>,
    limits: LimitsConfig,
    retry: RetryConfig,
}

impl RusshConnector {
    #[must_use]
    pub fn new(store: Arc<KnownHostsStore>, limits: LimitsConfig, retry: RetryConfig) -> Self {
        Self {
            store,
            limits,
            retry,
        }
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    type Session = AuthenticatedSession;

    async fn connect(
        &self,
        spec: &ConnectionSpec,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<AuthenticatedSession> {
        let running = retry::with_retry_if(
            &self.retry,
            "establish",
            || {
                RunningSession::establish(
                    spec,
                    self.store.clone(),
                    credentials.clone(),
                    &self.limits,
                )
            },
            retry::is_retryable_error,
        )
        .await?;

        auth::authenticate(running, credentials, &self.limits).await
    }
}
