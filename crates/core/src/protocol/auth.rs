//! RTSP authentication (RFC 2326 §14, RFC 2617).
//!
//! Server side: a session answers unauthenticated requests with a
//! `401 Unauthorized` carrying both a Digest and a Basic challenge, and
//! checks the retried request's `Authorization` header against an
//! [`Authenticator`]. Client side: a [`Challenge`] picked from the server's
//! `WWW-Authenticate` headers produces the `Authorization` value.
//!
//! Digest uses MD5 without `qop`:
//!
//! ```text
//! HA1      = MD5(username ":" realm ":" password)
//! HA2      = MD5(method ":" uri)
//! response = MD5(HA1 ":" nonce ":" HA2)
//! ```

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};
use rand::RngExt;

/// Credentials presented in an `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic {
        username: String,
        password: String,
    },
    Digest {
        username: String,
        realm: String,
        nonce: String,
        uri: String,
        response: String,
    },
}

impl Credentials {
    /// Parse an `Authorization` header value. Returns `None` for unknown
    /// schemes and malformed values.
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, rest) = header.trim().split_once(' ')?;
        if scheme.eq_ignore_ascii_case("basic") {
            let decoded = STANDARD.decode(rest.trim()).ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(Self::Basic {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        if scheme.eq_ignore_ascii_case("digest") {
            let params = parse_params(rest);
            let get = |name: &str| {
                params
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.clone())
            };
            return Some(Self::Digest {
                username: get("username")?,
                realm: get("realm")?,
                nonce: get("nonce")?,
                uri: get("uri")?,
                response: get("response")?,
            });
        }
        None
    }

    pub fn username(&self) -> &str {
        match self {
            Self::Basic { username, .. } | Self::Digest { username, .. } => username,
        }
    }
}

/// Decides whether presented credentials grant access.
///
/// `method` is the RTSP method of the request being authorized; Digest
/// responses are bound to it.
pub trait Authenticator: Send + Sync {
    fn verify(&self, method: &str, credentials: &Credentials) -> bool;
}

/// Fixed username → password table.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.insert(username.to_string(), password.to_string());
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn verify(&self, method: &str, credentials: &Credentials) -> bool {
        let Some(password) = self.users.get(credentials.username()) else {
            return false;
        };
        match credentials {
            Credentials::Basic { password: given, .. } => given == password,
            Credentials::Digest {
                username,
                realm,
                nonce,
                uri,
                response,
            } => {
                let expected = digest_response(username, realm, password, method, uri, nonce);
                expected.eq_ignore_ascii_case(response)
            }
        }
    }
}

/// Fresh random nonce: 128 bits as lowercase hex.
pub fn new_nonce() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// RFC 2617 Digest `response` value (MD5, no `qop`).
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

/// `WWW-Authenticate` values for a 401 response, Digest first.
pub fn challenge_headers(realm: &str, nonce: &str) -> [String; 2] {
    [
        format!("Digest realm=\"{realm}\", nonce=\"{nonce}\""),
        format!("Basic realm=\"{realm}\""),
    ]
}

/// A server's authentication challenge, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Digest { realm: String, nonce: String },
    Basic { realm: String },
}

impl Challenge {
    /// Pick a challenge from the `WWW-Authenticate` values of a 401,
    /// preferring Digest.
    pub fn select<'a>(headers: impl Iterator<Item = &'a str>) -> Option<Self> {
        let mut basic = None;
        for value in headers {
            let Some((scheme, rest)) = value.trim().split_once(' ') else {
                continue;
            };
            let params = parse_params(rest);
            let realm = params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("realm"))
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            if scheme.eq_ignore_ascii_case("digest") {
                if let Some((_, nonce)) = params
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("nonce"))
                {
                    return Some(Self::Digest {
                        realm,
                        nonce: nonce.clone(),
                    });
                }
            } else if scheme.eq_ignore_ascii_case("basic") && basic.is_none() {
                basic = Some(Self::Basic { realm });
            }
        }
        basic
    }

    /// `Authorization` header value answering this challenge.
    pub fn authorization(&self, username: &str, password: &str, method: &str, uri: &str) -> String {
        match self {
            Self::Basic { .. } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
            Self::Digest { realm, nonce } => {
                let response = digest_response(username, realm, password, method, uri, nonce);
                format!(
                    "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
                )
            }
        }
    }
}

/// Split `a="x, y", b=z` into name/value pairs, honoring quotes.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    let mut flush = |part: &str| {
        if let Some((k, v)) = part.split_once('=') {
            let v = v.trim().trim_matches('"');
            params.push((k.trim().to_string(), v.to_string()));
        }
    };

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                flush(&current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    flush(&current);
    params
}
