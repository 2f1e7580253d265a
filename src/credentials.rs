//! Credential collaborator boundary.
//!
//! This layer never renders prompts itself; everything user-facing goes
//! through a [`CredentialProvider`] implementation supplied by the caller,
//! which receives only structured data (host, fingerprint, prompt text).

use std::path::PathBuf;

use async_trait::async_trait;

/// One keyboard-interactive prompt from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePrompt {
    pub text: String,
    /// Whether the user's answer may be echoed while typing.
    pub echo: bool,
}

/// Caller's verdict on a host key the trust store could not confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Trust the key and write it to the store.
    AcceptAndPersist,
    /// Trust the key for this process only.
    AcceptOnce,
    /// Abort the connection attempt.
    Abort,
}

/// Supplies credentials and trust decisions during connection establishment.
///
/// Every method may block on a human. `None` returns mean the user declined
/// to answer, which the cascade reports as a cancelled outcome rather than a
/// failure.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Ask for the account password. `None` cancels password authentication.
    async fn prompt_for_password(&self, user: &str, host: &str) -> Option<String>;

    /// Fixed key pair to try before the agent, as (private, public) paths.
    fn key_files(&self) -> Option<(PathBuf, PathBuf)> {
        None
    }

    /// Answer one keyboard-interactive round. Must return exactly one answer
    /// per prompt, in order. `None` cancels the whole cascade.
    async fn challenge_response(
        &self,
        title: &str,
        instructions: &str,
        prompts: &[ChallengePrompt],
    ) -> Option<Vec<String>>;

    /// The stored key for `host` differs from the one the server presented.
    async fn on_host_key_mismatch(
        &self,
        host: &str,
        fingerprint: &str,
        algorithm: &str,
    ) -> TrustDecision;

    /// No stored key exists for `host`.
    async fn on_host_key_unknown(
        &self,
        host: &str,
        fingerprint: &str,
        algorithm: &str,
    ) -> TrustDecision;
}
