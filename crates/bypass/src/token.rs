//! Token-issuing service and challenge submission
//!
//! A fresh credential takes two round trips:
//! 1. GET the token-issuing service, which answers `{success, payload}`
//! 2. POST the payload form-encoded to the site's challenge endpoint; its
//!    `Set-Cookie` headers are the credential
//!
//! Neither call retries. The credential pool decides when to try again.

use common::Secret;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT as USER_AGENT_HEADER};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{API_KEY_HEADER, SOLUTION_FIELD, USER_AGENT};
use crate::cookies::{cookie_header, response_cookies};
use crate::error::{Error, Result};

/// Token-issuing service response body.
#[derive(Debug, Deserialize, Serialize)]
pub struct PayloadResponse {
    pub success: bool,
    #[serde(default)]
    pub payload: String,
}

/// Ask the token-issuing service for a challenge solution payload.
pub async fn fetch_payload(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: Option<&Secret<String>>,
) -> Result<String> {
    let mut request = client.get(endpoint);
    if let Some(key) = api_key {
        request = request.header(API_KEY_HEADER, key.expose().as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| Error::Http(format!("token service request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenService(format!(
            "token service returned {status}: {body}"
        )));
    }

    let parsed = response
        .json::<PayloadResponse>()
        .await
        .map_err(|e| Error::TokenService(format!("invalid token service response: {e}")))?;

    if !parsed.success || parsed.payload.is_empty() {
        return Err(Error::TokenService(
            "token service reported no solution".into(),
        ));
    }
    Ok(parsed.payload)
}

/// Submit a solution payload to the challenge endpoint.
///
/// Returns the cookie pairs set by the endpoint. A non-200 response or a
/// response without cookies is a rejection.
pub async fn submit_solution(
    client: &reqwest::Client,
    challenge_url: &str,
    payload: &str,
) -> Result<Vec<(String, String)>> {
    let response = client
        .post(challenge_url)
        .header(ACCEPT, "*/*")
        .header(ACCEPT_LANGUAGE, "en-GB,en;q=0.5")
        .header(USER_AGENT_HEADER, USER_AGENT)
        .form(&[(SOLUTION_FIELD, payload)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("challenge request failed: {e}")))?;

    let status = response.status();
    if status.as_u16() != 200 {
        return Err(Error::ChallengeRejected(format!(
            "challenge endpoint returned {status}"
        )));
    }

    let cookies = response_cookies(response.headers());
    if cookies.is_empty() {
        return Err(Error::ChallengeRejected(
            "challenge endpoint set no cookies".into(),
        ));
    }
    debug!(cookies = cookies.len(), "challenge accepted");
    Ok(cookies)
}

/// Run the full challenge flow and return a `Cookie` header value.
pub async fn solve_challenge(
    client: &reqwest::Client,
    token_endpoint: &str,
    api_key: Option<&Secret<String>>,
    challenge_url: &str,
) -> Result<String> {
    let payload = fetch_payload(client, token_endpoint, api_key).await?;
    let cookies = submit_solution(client, challenge_url, &payload).await?;
    Ok(cookie_header(
        cookies.iter().map(|(n, v)| (n.as_str(), v.as_str())),
    ))
}
