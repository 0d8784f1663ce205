//! Set-Cookie parsing and Cookie header assembly
//!
//! The monitor never uses a cookie jar: credentials are opaque `Cookie`
//! header values handed out by the pool, so only the `name=value` pair of
//! each `Set-Cookie` header matters. Attributes (Path, Expires, ...) are dropped.

use reqwest::header::{HeaderMap, SET_COOKIE};

/// Extract the `name=value` pair from a single `Set-Cookie` header value.
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// All cookie pairs set by a response, in header order.
pub fn response_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

/// Join cookie pairs into a `Cookie` request header value.
pub fn cookie_header<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}
