//! Credential providers invoked when a server answers STARTUP with
//! AUTHENTICATE.

use crate::driver::protocol::codec::StringMultimap;
use crate::error::DriverResult;

/// Supplies credentials during the startup exchange.
///
/// Protocol v1 sends `credentials()` in a CREDENTIALS frame. Later versions
/// run a SASL exchange: `initial_response` first, then one
/// `evaluate_challenge` per AUTH_CHALLENGE until the server sends
/// AUTH_SUCCESS.
pub trait Authenticator: Send + Sync {
    fn initial_response(&self, authenticator_class: &str) -> DriverResult<Vec<u8>>;

    fn evaluate_challenge(&self, challenge: Option<&[u8]>) -> DriverResult<Vec<u8>>;

    fn credentials(&self) -> StringMultimap;
}

/// SASL PLAIN username/password authentication.
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn token(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(2 + self.username.len() + self.password.len());
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }
}

impl std::fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&self, _authenticator_class: &str) -> DriverResult<Vec<u8>> {
        Ok(self.token())
    }

    fn evaluate_challenge(&self, _challenge: Option<&[u8]>) -> DriverResult<Vec<u8>> {
        Ok(self.token())
    }

    fn credentials(&self) -> StringMultimap {
        let mut map = StringMultimap::new();
        map.add_pair("username", self.username.as_str());
        map.add_pair("password", self.password.as_str());
        map
    }
}
