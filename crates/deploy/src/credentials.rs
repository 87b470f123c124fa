//! Scoped credential acquisition.

use chrono::Utc;

use crate::{
    DeployError, IdentityBroker, ProviderError,
    types::{ScopedCredentials, StackState},
};

/// Lifetime of credentials handed to the post-provisioning steps.
pub const DEFAULT_CREDENTIAL_DURATION_SECS: u32 = 3600;

/// Longest session name the identity broker accepts.
const MAX_SESSION_NAME_LEN: usize = 64;

/// Exchanges the caller's identity for credentials scoped to one target.
pub struct CredentialBroker<'a, I> {
    broker: &'a I,
    duration_secs: u32,
}

impl<'a, I: IdentityBroker> CredentialBroker<'a, I> {
    pub fn new(broker: &'a I, duration_secs: u32) -> Self {
        Self {
            broker,
            duration_secs,
        }
    }

    /// Assume `role_ref` for a session identified by `session_context`.
    ///
    /// The context doubles as session name and external id so the role's
    /// trust policy can pin it.
    pub async fn assume(
        &self,
        role_ref: &str,
        session_context: &str,
    ) -> Result<ScopedCredentials, DeployError> {
        let session_name = session_name(session_context);

        tracing::info!(role = %role_ref, session = %session_name, "Assuming deployment role...");

        let credentials = self
            .broker
            .assume_role(role_ref, &session_name, session_context, self.duration_secs)
            .await
            .map_err(|e| match e {
                ProviderError::AccessDenied(msg) => DeployError::Authorization(format!(
                    "role {role_ref} does not trust this identity: {msg}"
                )),
                other => DeployError::Remote(other),
            })?;

        if credentials.is_expired_at(Utc::now()) {
            return Err(DeployError::Authorization(format!(
                "identity broker returned already expired credentials for {role_ref}"
            )));
        }

        tracing::debug!(expires_at = %credentials.expires_at, "Scoped credentials acquired");
        Ok(credentials)
    }

    /// Assume the role a stack published under `role_output`.
    ///
    /// Only a live `Complete` state is accepted, and a missing output is a
    /// hard stop: there is no fallback to the caller's own credentials.
    pub async fn assume_from_stack(
        &self,
        state: &StackState,
        role_output: &str,
        session_context: &str,
    ) -> Result<ScopedCredentials, DeployError> {
        if !state.is_complete() {
            return Err(DeployError::Configuration(format!(
                "stack {} is {}, refusing to assume its role",
                state.name, state.status
            )));
        }

        let role = state.outputs.require(role_output).map_err(|_| {
            DeployError::Configuration(format!(
                "stack {} did not publish a deployment role under `{role_output}`; \
                 redeploy it with a template that defines the scoped role",
                state.name
            ))
        })?;

        self.assume(role, session_context).await
    }
}

/// Reduce a context string to the identity broker's session name alphabet.
fn session_name(context: &str) -> String {
    let mut name: String = context
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || "+=,.@-_".contains(c) {
                c
            } else {
                '-'
            }
        })
        .take(MAX_SESSION_NAME_LEN)
        .collect();

    if name.len() < 2 {
        name.push_str("-session");
    }
    name
}
