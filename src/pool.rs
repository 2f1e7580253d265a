//! Keyed cache of live sessions, one per connection spec.
//!
//! The whole lookup-or-create sequence runs under one lock, so two
//! concurrent callers asking for the same spec see exactly one
//! authentication attempt and share the resulting instance.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connector::{ManagedSession, SessionConnector};
use crate::credentials::CredentialProvider;
use crate::error::Result;
use crate::spec::ConnectionSpec;

pub struct SessionPool<C: SessionConnector> {
    connector: C,
    sessions: Mutex<HashMap<ConnectionSpec, Arc<C::Session>>>,
}

impl<C: SessionConnector> SessionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live session for `spec`, connecting if absent and
    /// replacing wholesale if the pooled one has died.
    pub async fn pooled_session(
        &self,
        spec: &ConnectionSpec,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<C::Session>> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(spec) {
            if existing.is_dead() {
                debug!(spec = %spec, "Pooled session is dead, replacing");
            } else {
                return Ok(Arc::clone(existing));
            }
        }

        let fresh = Arc::new(self.connector.connect(spec, credentials).await?);
        sessions.insert(spec.clone(), Arc::clone(&fresh));
        info!(spec = %spec, "Session pooled");
        Ok(fresh)
    }

    pub async fn has_session(&self, spec: &ConnectionSpec) -> bool {
        self.sessions.lock().await.contains_key(spec)
    }

    /// Drop the entry for `spec`, returning it so the caller can close it.
    pub async fn remove_session(&self, spec: &ConnectionSpec) -> Option<Arc<C::Session>> {
        self.sessions.lock().await.remove(spec)
    }

    #[cfg(test)]
    pub(crate) fn connector(&self) -> &C {
        &self.connector
    }

    /// Close and drop every pooled session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (spec, session) in sessions {
            debug!(spec = %spec, "Closing pooled session");
            session.close().await;
        }
    }
}
