use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Basic,
    Digest,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("no Authorization header")]
    Missing,

    #[error("malformed {0} credentials")]
    Malformed(&'static str),

    #[error("scheme does not match the configured {0:?} mode")]
    WrongScheme(AuthMode),

    #[error("unknown user {0:?}")]
    UnknownUser(String),

    #[error("wrong credentials for {0:?}")]
    BadCredentials(String),

    #[error("nonce was not issued on this connection")]
    StaleNonce,
}

/// Credential check for RTSP requests. OPTIONS is always exempt; the
/// handler never asks for it.
#[derive(Clone, Debug)]
pub struct Authenticator {
    mode: AuthMode,
    realm: String,
    users: HashMap<String, String>,
}

impl Authenticator {
    pub fn new<I, U, P>(mode: AuthMode, realm: impl Into<String>, users: I) -> Self
    where
        I: IntoIterator<Item = (U, P)>,
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            mode,
            realm: realm.into(),
            users: users
                .into_iter()
                .map(|(user, pass)| (user.into(), pass.into()))
                .collect(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(AuthMode::None, "", Vec::<(String, String)>::new())
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.mode,
            config.realm.clone(),
            config
                .users
                .iter()
                .map(|u| (u.username.clone(), u.password.clone())),
        )
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn enabled(&self) -> bool {
        self.mode != AuthMode::None
    }

    /// Fresh random nonce, 32 hex characters.
    pub fn new_nonce() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// `WWW-Authenticate` value for a 401. `nonce` is ignored in basic mode.
    pub fn challenge(&self, nonce: &str) -> String {
        match self.mode {
            AuthMode::Digest => format!(
                "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
                self.realm, nonce
            ),
            _ => format!("Basic realm=\"{}\"", self.realm),
        }
    }

    /// Check an `Authorization` header. Returns the user name on success.
    ///
    /// `nonce` is the last nonce handed to this connection; digest answers
    /// built on any other nonce are refused.
    pub fn verify(
        &self,
        header: Option<&str>,
        method: &str,
        nonce: Option<&str>,
    ) -> Result<String, AuthFailure> {
        let header = header.ok_or(AuthFailure::Missing)?.trim();
        let (scheme, credentials) = header.split_once(' ').unwrap_or((header, ""));
        match self.mode {
            AuthMode::None => Ok(String::new()),
            AuthMode::Basic if scheme.eq_ignore_ascii_case("Basic") => self.verify_basic(credentials),
            AuthMode::Digest if scheme.eq_ignore_ascii_case("Digest") => {
                self.verify_digest(credentials, method, nonce)
            }
            mode => Err(AuthFailure::WrongScheme(mode)),
        }
    }

    fn verify_basic(&self, credentials: &str) -> Result<String, AuthFailure> {
        let decoded = STANDARD
            .decode(credentials.trim())
            .map_err(|_| AuthFailure::Malformed("basic"))?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::Malformed("basic"))?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or(AuthFailure::Malformed("basic"))?;
        match self.users.get(user) {
            Some(expected) if expected == pass => Ok(user.to_string()),
            Some(_) => Err(AuthFailure::BadCredentials(user.to_string())),
            None => Err(AuthFailure::UnknownUser(user.to_string())),
        }
    }

    fn verify_digest(
        &self,
        credentials: &str,
        method: &str,
        nonce: Option<&str>,
    ) -> Result<String, AuthFailure> {
        let params = digest_params(credentials);
        let get = |key: &str| params.get(key).map(String::as_str);

        let (Some(user), Some(uri), Some(response), Some(their_nonce)) =
            (get("username"), get("uri"), get("response"), get("nonce"))
        else {
            return Err(AuthFailure::Malformed("digest"));
        };
        if get("realm") != Some(self.realm.as_str()) {
            return Err(AuthFailure::BadCredentials(user.to_string()));
        }
        if get("algorithm").is_some_and(|a| !a.eq_ignore_ascii_case("MD5")) {
            return Err(AuthFailure::Malformed("digest"));
        }
        if nonce != Some(their_nonce) {
            return Err(AuthFailure::StaleNonce);
        }
        let password = self
            .users
            .get(user)
            .ok_or_else(|| AuthFailure::UnknownUser(user.to_string()))?;

        let qop = match (get("qop"), get("nc"), get("cnonce")) {
            (Some(qop), Some(nc), Some(cnonce)) => Some((qop, nc, cnonce)),
            (None, _, _) => None,
            _ => return Err(AuthFailure::Malformed("digest")),
        };
        let expected = digest_response(user, &self.realm, password, method, uri, their_nonce, qop);
        if expected.eq_ignore_ascii_case(response) {
            Ok(user.to_string())
        } else {
            Err(AuthFailure::BadCredentials(user.to_string()))
        }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// RFC 2617 response digest. `qop` carries `(qop, nc, cnonce)` when the
/// client used one.
pub fn digest_response(
    user: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", user, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some((qop, nc, cnonce)) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// `key=value` pairs of a digest header. Quoted values may contain commas.
fn digest_params(text: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            },
        };
        params.insert(key, value.to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
    }

    #[test]
    fn test_rfc2617_vector() {
        let response = digest_response(
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "GET",
            "/dir/index.html",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(("auth", "00000001", "0a4f113b")),
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_basic() {
        let auth = Authenticator::new(AuthMode::Basic, "cam", [("admin", "secret")]);
        assert_eq!(auth.verify(None, "DESCRIBE", None), Err(AuthFailure::Missing));
        assert_eq!(
            auth.verify(Some(&basic("admin", "secret")), "DESCRIBE", None),
            Ok("admin".to_string())
        );
        assert_eq!(
            auth.verify(Some(&basic("admin", "nope")), "DESCRIBE", None),
            Err(AuthFailure::BadCredentials("admin".into()))
        );
        assert_eq!(
            auth.verify(Some(&basic("guest", "secret")), "DESCRIBE", None),
            Err(AuthFailure::UnknownUser("guest".into()))
        );
        assert_eq!(
            auth.verify(Some("Basic !!!"), "DESCRIBE", None),
            Err(AuthFailure::Malformed("basic"))
        );
        assert_eq!(auth.challenge("ignored"), "Basic realm=\"cam\"");
    }

    #[test]
    fn test_digest() {
        let auth = Authenticator::new(AuthMode::Digest, "cam", [("admin", "secret")]);
        let nonce = Authenticator::new_nonce();
        assert_eq!(nonce.len(), 32);
        assert!(auth.challenge(&nonce).contains(&format!("nonce=\"{}\"", nonce)));

        let uri = "rtsp://10.0.0.2/vs0";
        let response = digest_response("admin", "cam", "secret", "DESCRIBE", uri, &nonce, None);
        let header = format!(
            "Digest username=\"admin\", realm=\"cam\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            nonce, uri, response
        );
        assert_eq!(
            auth.verify(Some(&header), "DESCRIBE", Some(&nonce)),
            Ok("admin".to_string())
        );
        // same answer, other verb
        assert_eq!(
            auth.verify(Some(&header), "SETUP", Some(&nonce)),
            Err(AuthFailure::BadCredentials("admin".into()))
        );
        // nonce from somewhere else
        assert_eq!(
            auth.verify(Some(&header), "DESCRIBE", Some("0000")),
            Err(AuthFailure::StaleNonce)
        );
        assert_eq!(
            auth.verify(Some(&basic("admin", "secret")), "DESCRIBE", Some(&nonce)),
            Err(AuthFailure::WrongScheme(AuthMode::Digest))
        );
    }

    #[test]
    fn test_digest_with_qop() {
        let auth = Authenticator::new(AuthMode::Digest, "cam", [("admin", "secret")]);
        let uri = "rtsp://cam/vs1";
        let response = digest_response(
            "admin",
            "cam",
            "secret",
            "PLAY",
            uri,
            "abc",
            Some(("auth", "00000001", "xyz")),
        );
        let header = format!(
            "Digest username=\"admin\", realm=\"cam\", nonce=\"abc\", uri=\"{}\", qop=auth, nc=00000001, cnonce=\"xyz\", response=\"{}\", algorithm=MD5",
            uri, response
        );
        assert_eq!(auth.verify(Some(&header), "PLAY", Some("abc")), Ok("admin".into()));
    }

    #[test]
    fn test_digest_params_quoted_commas() {
        let params = digest_params(r#"username="a,b", uri="rtsp://x/y?p=1,2",nc=01"#);
        assert_eq!(params["username"], "a,b");
        assert_eq!(params["uri"], "rtsp://x/y?p=1,2");
        assert_eq!(params["nc"], "01");
    }
}
