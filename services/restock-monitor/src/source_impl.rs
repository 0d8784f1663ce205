//! Credential source backed by the token service and the site's challenge endpoint.
//!
//! Implements `CredentialSource` for the credential pool: each issue runs the
//! full challenge flow and returns the resulting `Cookie` header value.

use common::Secret;
use credential_pool::{CredentialSource, Error as PoolError};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Challenge flow configuration shared by every slot.
pub struct ChallengeSource {
    client: reqwest::Client,
    token_endpoint: String,
    challenge_url: String,
    api_key: Option<Secret<String>>,
}

impl ChallengeSource {
    pub fn new(
        client: reqwest::Client,
        token_endpoint: String,
        challenge_url: String,
        api_key: Option<Secret<String>>,
    ) -> Self {
        Self {
            client,
            token_endpoint,
            challenge_url,
            api_key,
        }
    }
}

impl CredentialSource for ChallengeSource {
    fn issue<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = credential_pool::Result<String>> + Send + 'a>> {
        Box::pin(async move {
            debug!(key, "solving challenge for credential slot");
            bypass::solve_challenge(
                &self.client,
                &self.token_endpoint,
                self.api_key.as_ref(),
                &self.challenge_url,
            )
            .await
            .map_err(|e| PoolError::RefreshFailed(e.to_string()))
        })
    }
}
