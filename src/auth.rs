//! The authentication cascade: turns a [`RunningSession`] into an
//! [`AuthenticatedSession`].
//!
//! Methods are attempted in fixed priority order: key files, agent
//! identities, keyboard-interactive, password. Only methods the server
//! advertised for the user are attempted at all. The cascade distinguishes a
//! deliberate user cancellation ([`HarborError::AuthCancelled`]) from every
//! advertised method failing ([`HarborError::AuthExhausted`]).

use std::sync::Arc;

use russh::client::{AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::load_secret_key;
use russh::{MethodKind, MethodSet};
use tracing::{debug, info, warn};

use crate::config::LimitsConfig;
use crate::credentials::{ChallengePrompt, CredentialProvider};
use crate::error::{HarborError, Result};
use crate::session::{sanitize_ssh_error, AuthenticatedSession, RunningSession};
use crate::spec::ConnectionSpec;

/// Methods the server advertised, collapsed to the ones this cascade knows.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct AdvertisedMethods {
    public_key: bool,
    keyboard_interactive: bool,
    password: bool,
}

impl AdvertisedMethods {
    fn none(self) -> bool {
        !self.public_key && !self.keyboard_interactive && !self.password
    }
}

/// The single place the engine's method-set type is inspected.
fn advertised_methods(methods: &MethodSet) -> AdvertisedMethods {
    let mut out = AdvertisedMethods::default();
    for kind in methods.iter() {
        match kind {
            MethodKind::PublicKey => out.public_key = true,
            MethodKind::KeyboardInteractive => out.keyboard_interactive = true,
            MethodKind::Password => out.password = true,
            _ => {}
        }
    }
    out
}

fn protocol_err(spec: &ConnectionSpec, e: &russh::Error) -> HarborError {
    HarborError::Protocol {
        host: spec.host().to_string(),
        reason: sanitize_ssh_error(e),
    }
}

/// Run the cascade and open the SFTP subsystem on success.
pub async fn authenticate(
    mut running: RunningSession,
    credentials: Arc<dyn CredentialProvider>,
    limits: &LimitsConfig,
) -> Result<AuthenticatedSession> {
    let spec = running.spec().clone();
    let user = spec.user().to_string();

    // Probe with none-auth to learn the advertised methods. Some servers
    // accept it outright.
    let probe = running
        .handle_mut()
        .authenticate_none(&user)
        .await
        .map_err(|e| protocol_err(&spec, &e))?;

    let advertised = match probe {
        AuthResult::Success => {
            info!(spec = %spec, "Server accepted none authentication");
            return AuthenticatedSession::open(running, limits).await;
        }
        AuthResult::Failure {
            remaining_methods, ..
        } => advertised_methods(&remaining_methods),
    };

    if advertised.none() {
        warn!(spec = %spec, "Server advertised no supported authentication methods");
        return Err(HarborError::AuthExhausted {
            user,
            host: spec.host().to_string(),
        });
    }
    debug!(spec = %spec, ?advertised, "Starting authentication cascade");

    if advertised.public_key {
        if try_key_files(&mut running, &spec, &user, credentials.as_ref()).await? {
            return AuthenticatedSession::open(running, limits).await;
        }
        if try_agent(&mut running, &spec, &user).await? {
            return AuthenticatedSession::open(running, limits).await;
        }
    }

    if advertised.keyboard_interactive
        && try_keyboard_interactive(&mut running, &spec, &user, credentials.as_ref()).await?
    {
        return AuthenticatedSession::open(running, limits).await;
    }

    if advertised.password
        && try_password(&mut running, &spec, &user, credentials.as_ref()).await?
    {
        return AuthenticatedSession::open(running, limits).await;
    }

    warn!(spec = %spec, "Every advertised authentication method failed");
    Err(HarborError::AuthExhausted {
        user,
        host: spec.host().to_string(),
    })
}

/// Public-key auth with the collaborator's fixed key pair, if it offers one.
async fn try_key_files(
    running: &mut RunningSession,
    spec: &ConnectionSpec,
    user: &str,
    credentials: &dyn CredentialProvider,
) -> Result<bool> {
    let Some((private_path, _public_path)) = credentials.key_files() else {
        return Ok(false);
    };

    let expanded = shellexpand::tilde(&private_path.to_string_lossy().into_owned()).into_owned();
    let key_pair = match load_secret_key(&expanded, None) {
        Ok(k) => k,
        Err(e) => {
            warn!(spec = %spec, path = %expanded, error = %sanitize_ssh_error(&e), "Failed to load key file");
            return Ok(false);
        }
    };

    let handle = running.handle_mut();
    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

    match handle.authenticate_publickey(user, key_with_hash).await {
        Ok(result) if result.success() => {
            info!(spec = %spec, method = "key-file", "Authenticated");
            Ok(true)
        }
        Ok(_) => {
            debug!(spec = %spec, "Key file rejected by server");
            Ok(false)
        }
        Err(e) => Err(protocol_err(spec, &e)),
    }
}

/// Public-key auth via the running agent, one identity at a time.
#[cfg(unix)]
async fn try_agent(
    running: &mut RunningSession,
    spec: &ConnectionSpec,
    user: &str,
) -> Result<bool> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(e) => {
            debug!(spec = %spec, error = %e, "No SSH agent available");
            return Ok(false);
        }
    };

    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(e) => {
            warn!(spec = %spec, error = %sanitize_ssh_error(&e), "Failed to list agent identities");
            return Ok(false);
        }
    };
    debug!(spec = %spec, count = identities.len(), "Trying agent identities");

    let handle = running.handle_mut();
    for public_key in &identities {
        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        match handle
            .authenticate_publickey_with(user, public_key.clone(), hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => {
                info!(spec = %spec, method = "agent", "Authenticated");
                return Ok(true);
            }
            Ok(_) => {
                debug!(spec = %spec, "Agent identity rejected, trying next");
            }
            Err(e) => {
                debug!(spec = %spec, error = %sanitize_ssh_error(&e), "Agent identity errored, trying next");
            }
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn try_agent(
    _running: &mut RunningSession,
    spec: &ConnectionSpec,
    _user: &str,
) -> Result<bool> {
    debug!(spec = %spec, "SSH agent authentication not supported on this platform");
    Ok(false)
}

/// Keyboard-interactive rounds. The server has no notion of a user cancel,
/// so a `None` from the collaborator is synthesised into
/// [`HarborError::AuthCancelled`] here. A server-side rejection restarts the
/// exchange as long as the method stays advertised, re-prompting the user.
async fn try_keyboard_interactive(
    running: &mut RunningSession,
    spec: &ConnectionSpec,
    user: &str,
    credentials: &dyn CredentialProvider,
) -> Result<bool> {
    let handle = running.handle_mut();
    'restart: loop {
        let mut response = handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map_err(|e| protocol_err(spec, &e))?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    info!(spec = %spec, method = "keyboard-interactive", "Authenticated");
                    return Ok(true);
                }
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods, ..
                } => {
                    if advertised_methods(&remaining_methods).keyboard_interactive {
                        debug!(spec = %spec, "Keyboard-interactive rejected, restarting");
                        continue 'restart;
                    }
                    debug!(spec = %spec, "Keyboard-interactive no longer advertised");
                    return Ok(false);
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let challenge: Vec<ChallengePrompt> = prompts
                        .iter()
                        .map(|p| ChallengePrompt {
                            text: p.prompt.clone(),
                            echo: p.echo,
                        })
                        .collect();
                    let Some(answers) = credentials
                        .challenge_response(&name, &instructions, &challenge)
                        .await
                    else {
                        info!(spec = %spec, "Keyboard-interactive cancelled by user");
                        return Err(HarborError::AuthCancelled {
                            user: user.to_string(),
                            host: spec.host().to_string(),
                        });
                    };
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| protocol_err(spec, &e))?;
                }
            }
        }
    }
}

/// Password rounds: re-prompt on each rejection until the collaborator
/// declines to answer.
async fn try_password(
    running: &mut RunningSession,
    spec: &ConnectionSpec,
    user: &str,
    credentials: &dyn CredentialProvider,
) -> Result<bool> {
    loop {
        let Some(password) = credentials.prompt_for_password(user, spec.host()).await else {
            info!(spec = %spec, "Password prompt cancelled by user");
            return Err(HarborError::AuthCancelled {
                user: user.to_string(),
                host: spec.host().to_string(),
            });
        };

        match running
            .handle_mut()
            .authenticate_password(user, &password)
            .await
        {
            Ok(result) if result.success() => {
                info!(spec = %spec, method = "password", "Authenticated");
                return Ok(true);
            }
            Ok(_) => {
                debug!(spec = %spec, "Password rejected, re-prompting");
            }
            Err(e) => return Err(protocol_err(spec, &e)),
        }
    }
}
