//! Client-side SSH/SFTP connection layer: authenticated sessions, an
//! OpenSSH-compatible host-key trust store, a keyed session pool, and
//! reservation-gated disconnection.
//!
//! The crate is organised leaf-first: [`ConnectionSpec`] identifies a server,
//! [`KnownHostsStore`] holds trusted host keys, [`RunningSession`] is a
//! handshaked-but-unauthenticated transport, the cascade in [`auth`] turns it
//! into an [`AuthenticatedSession`], [`SessionPool`] caches one live session
//! per spec, and [`SessionBroker`] layers task reservations and the blocking
//! disconnect protocol on top.

pub mod auth;
pub mod broker;
pub mod config;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod known_hosts;
pub mod pool;
pub mod retry;
pub mod session;
pub mod spec;

pub use broker::{DisconnectOutcome, SessionBroker, SessionTicket};
pub use config::LimitsConfig;
pub use connector::{ManagedSession, RusshConnector, SessionConnector};
pub use credentials::{ChallengePrompt, CredentialProvider, TrustDecision};
pub use error::{HarborError, Result};
pub use known_hosts::{FindResult, HostKeyEntry, KnownHostsStore, NameKind};
pub use pool::SessionPool;
pub use retry::RetryConfig;
pub use session::{AuthenticatedSession, RunningSession};
pub use spec::ConnectionSpec;
