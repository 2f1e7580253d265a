//! Reservation-gated session access and the blocking disconnect protocol.
//!
//! The broker tracks, per spec, which tasks are actively using the pooled
//! session. `disconnect_session` blocks until every reservation drains,
//! reporting the outstanding task names through a callback that can also
//! abandon the wait.
//!
//! Wakeup discipline: the `Notify` future is armed while the ledger lock is
//! still held, so a release landing between "read the task list" and "start
//! waiting" cannot be lost. The bounded sleep alongside it is a defense
//! against missed wakeups, not the primary signal path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::connector::{ManagedSession, SessionConnector};
use crate::credentials::CredentialProvider;
use crate::error::Result;
use crate::pool::SessionPool;
use crate::spec::ConnectionSpec;

/// One task's claim on a pooled session. Removed by tag, not by name, since
/// several tasks may share a name.
#[derive(Debug)]
struct TaskRegistration {
    tag: Uuid,
    task_name: String,
}

/// How a disconnect attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// All reservations drained; the session was removed and closed.
    Disconnected,
    /// The progress callback gave up; the session stays pooled.
    Abandoned,
}

pub struct SessionBroker<C: SessionConnector> {
    pool: SessionPool<C>,
    ledger: Mutex<HashMap<ConnectionSpec, Vec<TaskRegistration>>>,
    released: Notify,
    limits: LimitsConfig,
}

impl<C: SessionConnector> SessionBroker<C> {
    pub fn new(connector: C, limits: LimitsConfig) -> Self {
        Self {
            pool: SessionPool::new(connector),
            ledger: Mutex::new(HashMap::new()),
            released: Notify::new(),
            limits,
        }
    }

    /// Fetch-or-create the pooled session for `spec` and register `task_name`
    /// against it. The returned ticket keeps the session reserved until it is
    /// released or dropped.
    pub async fn reserve_session(
        self: &Arc<Self>,
        spec: &ConnectionSpec,
        credentials: Arc<dyn CredentialProvider>,
        task_name: &str,
    ) -> Result<SessionTicket<C>> {
        let mut ledger = self.ledger.lock().await;
        let session = self.pool.pooled_session(spec, credentials).await?;

        let tag = Uuid::new_v4();
        ledger.entry(spec.clone()).or_default().push(TaskRegistration {
            tag,
            task_name: task_name.to_string(),
        });
        drop(ledger);
        // Wake any disconnect wait so it re-reads the task list.
        self.released.notify_waiters();

        debug!(spec = %spec, task = %task_name, %tag, "Session reserved");
        Ok(SessionTicket {
            broker: Arc::clone(self),
            session,
            spec: spec.clone(),
            task_name: task_name.to_string(),
            tag: Some(tag),
        })
    }

    pub async fn has_session(&self, spec: &ConnectionSpec) -> bool {
        self.pool.has_session(spec).await
    }

    /// Block until every reservation for `spec` is released, then remove and
    /// close the pooled session.
    ///
    /// While reservations remain, `progress` receives the current task names
    /// each time the list changes (and at least every poll interval); a
    /// `false` return abandons the disconnect. Once the list is empty,
    /// `progress` is called exactly once more with an empty list and the
    /// session is torn down.
    pub async fn disconnect_session(
        &self,
        spec: &ConnectionSpec,
        mut progress: impl FnMut(&[String]) -> bool,
    ) -> DisconnectOutcome {
        loop {
            let ledger = self.ledger.lock().await;
            let names: Vec<String> = ledger
                .get(spec)
                .map(|regs| regs.iter().map(|r| r.task_name.clone()).collect())
                .unwrap_or_default();

            if names.is_empty() {
                progress(&names);
                // Removing under the ledger lock keeps a racing reserve from
                // grabbing the session we are about to close.
                let removed = self.pool.remove_session(spec).await;
                drop(ledger);
                if let Some(session) = removed {
                    session.close().await;
                    info!(spec = %spec, "Session disconnected");
                } else {
                    debug!(spec = %spec, "Disconnect found no pooled session");
                }
                return DisconnectOutcome::Disconnected;
            }

            if !progress(&names) {
                info!(spec = %spec, outstanding = names.len(), "Disconnect abandoned");
                return DisconnectOutcome::Abandoned;
            }

            let notified = self.released.notified();
            tokio::pin!(notified);
            // Arm before dropping the lock: a release in the gap still wakes us.
            notified.as_mut().enable();
            drop(ledger);

            tokio::select! {
                () = &mut notified => {}
                () = sleep(Duration::from_secs(self.limits.disconnect_poll_seconds)) => {
                    debug!(spec = %spec, "Disconnect wait poll interval elapsed");
                }
            }
        }
    }

    /// Drop every reservation and close every pooled session. For orderly
    /// teardown; outstanding tickets become no-ops on release.
    pub async fn shutdown(&self) {
        let mut ledger = self.ledger.lock().await;
        let dropped: usize = ledger.values().map(Vec::len).sum();
        if dropped > 0 {
            warn!(reservations = dropped, "Shutting down with outstanding reservations");
        }
        ledger.clear();
        self.pool.shutdown().await;
        drop(ledger);
        self.released.notify_waiters();
    }

    async fn release_tag(&self, spec: &ConnectionSpec, tag: Uuid) {
        let mut ledger = self.ledger.lock().await;
        if let Some(regs) = ledger.get_mut(spec) {
            regs.retain(|r| r.tag != tag);
            if regs.is_empty() {
                ledger.remove(spec);
            }
        }
        drop(ledger);
        self.released.notify_waiters();
        debug!(spec = %spec, %tag, "Reservation released");
    }
}

/// A live reservation. Release it explicitly with [`SessionTicket::release`];
/// dropping it without releasing spawns the release in the background so the
/// reservation is never leaked.
pub struct SessionTicket<C: SessionConnector> {
    broker: Arc<SessionBroker<C>>,
    session: Arc<C::Session>,
    spec: ConnectionSpec,
    task_name: String,
    tag: Option<Uuid>,
}

impl<C: SessionConnector> SessionTicket<C> {
    #[must_use]
    pub fn session(&self) -> &C::Session {
        &self.session
    }

    #[must_use]
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    #[must_use]
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Remove this reservation from the ledger.
    pub async fn release(mut self) {
        if let Some(tag) = self.tag.take() {
            self.broker.release_tag(&self.spec, tag).await;
        }
    }
}

impl<C: SessionConnector> Drop for SessionTicket<C> {
    fn drop(&mut self) {
        if let Some(tag) = self.tag.take() {
            let broker = Arc::clone(&self.broker);
            let spec = self.spec.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    broker.release_tag(&spec, tag).await;
                });
            } else {
                warn!(spec = %spec, %tag, "Ticket dropped outside a runtime; reservation leaked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    use super::*;
    use crate::credentials::{ChallengePrompt, TrustDecision};

    struct NullCredentials;

    #[async_trait]
    impl CredentialProvider for NullCredentials {
        async fn prompt_for_password(&self, _: &str, _: &str) -> Option<String> {
            None
        }
        async fn challenge_response(
            &self,
            _: &str,
            _: &str,
            _: &[ChallengePrompt],
        ) -> Option<Vec<String>> {
            None
        }
        async fn on_host_key_mismatch(&self, _: &str, _: &str, _: &str) -> TrustDecision {
            TrustDecision::Abort
        }
        async fn on_host_key_unknown(&self, _: &str, _: &str, _: &str) -> TrustDecision {
            TrustDecision::Abort
        }
    }

    struct FakeSession {
        closed: AtomicBool,
    }

    #[async_trait]
    impl ManagedSession for FakeSession {
        fn is_dead(&self) -> bool {
            false
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        type Session = FakeSession;

        async fn connect(
            &self,
            _spec: &ConnectionSpec,
            _credentials: Arc<dyn CredentialProvider>,
        ) -> Result<FakeSession> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession {
                closed: AtomicBool::new(false),
            })
        }
    }

    fn broker() -> Arc<SessionBroker<FakeConnector>> {
        let limits = LimitsConfig {
            disconnect_poll_seconds: 1,
            ..Default::default()
        };
        Arc::new(SessionBroker::new(
            FakeConnector {
                connects: AtomicUsize::new(0),
            },
            limits,
        ))
    }

    fn creds() -> Arc<dyn CredentialProvider> {
        Arc::new(NullCredentials)
    }

    fn spec(host: &str) -> ConnectionSpec {
        ConnectionSpec::new(host, "tester", 22).unwrap()
    }

    #[tokio::test]
    async fn test_disconnect_without_reservations_calls_back_once_empty() {
        let broker = broker();
        let spec = spec("alpha");
        let ticket = broker
            .reserve_session(&spec, creds(), "warmup")
            .await
            .unwrap();
        ticket.release().await;

        let calls = SyncMutex::new(Vec::<Vec<String>>::new());
        let outcome = broker
            .disconnect_session(&spec, |names| {
                calls.lock().push(names.to_vec());
                true
            })
            .await;

        assert_eq!(outcome, DisconnectOutcome::Disconnected);
        let calls = calls.into_inner();
        assert_eq!(calls, vec![Vec::<String>::new()]);
        assert!(!broker.has_session(&spec).await);
    }

    #[tokio::test]
    async fn test_disconnect_blocks_until_reservations_drain() {
        let broker = broker();
        let spec = spec("alpha");
        let ticket = broker
            .reserve_session(&spec, creds(), "transfer")
            .await
            .unwrap();

        let b = Arc::clone(&broker);
        let s = spec.clone();
        let disconnect = tokio::spawn(async move {
            b.disconnect_session(&s, |_| true).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!disconnect.is_finished());
        assert!(broker.has_session(&spec).await);

        ticket.release().await;
        let outcome = disconnect.await.unwrap();
        assert_eq!(outcome, DisconnectOutcome::Disconnected);
        assert!(!broker.has_session(&spec).await);
    }

    #[tokio::test]
    async fn test_disconnect_reports_shrinking_task_lists() {
        let broker = broker();
        let spec = spec("alpha");
        let t1 = broker.reserve_session(&spec, creds(), "copy").await.unwrap();
        let t2 = broker.reserve_session(&spec, creds(), "list").await.unwrap();

        let calls = Arc::new(SyncMutex::new(Vec::<Vec<String>>::new()));
        let b = Arc::clone(&broker);
        let s = spec.clone();
        let c = Arc::clone(&calls);
        let disconnect = tokio::spawn(async move {
            b.disconnect_session(&s, move |names| {
                c.lock().push(names.to_vec());
                true
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        t1.release().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        t2.release().await;

        let outcome = disconnect.await.unwrap();
        assert_eq!(outcome, DisconnectOutcome::Disconnected);

        let calls = calls.lock();
        assert!(calls.len() >= 3);
        assert_eq!(calls[0], vec!["copy".to_string(), "list".to_string()]);
        // Lists only ever shrink, and the last call is the empty "done" one.
        for pair in calls.windows(2) {
            assert!(pair[1].len() <= pair[0].len());
        }
        assert!(calls.last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_abandoned_keeps_session_pooled() {
        let broker = broker();
        let spec = spec("alpha");
        let ticket = broker.reserve_session(&spec, creds(), "edit").await.unwrap();

        let outcome = broker.disconnect_session(&spec, |_| false).await;
        assert_eq!(outcome, DisconnectOutcome::Abandoned);
        assert!(broker.has_session(&spec).await);

        ticket.release().await;
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_in_background() {
        let broker = broker();
        let spec = spec("alpha");
        let ticket = broker.reserve_session(&spec, creds(), "drag").await.unwrap();
        drop(ticket);

        // Drop spawns the release; give it a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = broker.disconnect_session(&spec, |names| names.is_empty()).await;
        assert_eq!(outcome, DisconnectOutcome::Disconnected);
    }

    #[tokio::test]
    async fn test_release_by_tag_with_duplicate_names() {
        let broker = broker();
        let spec = spec("alpha");
        let t1 = broker.reserve_session(&spec, creds(), "copy").await.unwrap();
        let t2 = broker.reserve_session(&spec, creds(), "copy").await.unwrap();

        t1.release().await;

        // The other "copy" registration must survive.
        let outcome = broker.disconnect_session(&spec, |_| false).await;
        assert_eq!(outcome, DisconnectOutcome::Abandoned);

        t2.release().await;
        let outcome = broker.disconnect_session(&spec, |_| true).await;
        assert_eq!(outcome, DisconnectOutcome::Disconnected);
    }

    #[tokio::test]
    async fn test_reservations_share_one_session() {
        let broker = broker();
        let spec = spec("alpha");
        let t1 = broker.reserve_session(&spec, creds(), "a").await.unwrap();
        let t2 = broker.reserve_session(&spec, creds(), "b").await.unwrap();

        assert!(Arc::ptr_eq(&t1.session, &t2.session));
        assert_eq!(broker.pool.connector().connects.load(Ordering::SeqCst), 1);

        t1.release().await;
        t2.release().await;
    }

    #[tokio::test]
    async fn test_shutdown_clears_ledger_and_pool() {
        let broker = broker();
        let spec_a = spec("alpha");
        let ticket = broker.reserve_session(&spec_a, creds(), "a").await.unwrap();

        broker.shutdown().await;
        assert!(!broker.has_session(&spec_a).await);

        // Releasing after shutdown is a harmless no-op.
        ticket.release().await;
    }
}
