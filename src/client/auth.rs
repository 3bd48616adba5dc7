
use stun::attributes::*;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::*;

use crate::error::*;

/// `AuthState` caches the long-term credential material shared by every
/// authenticated request on a client: the configured username and
/// password, the realm and nonce minted by the server, and the derived
/// integrity key (`MD5(username ":" realm ":" password)`).
///
/// The first request of a session goes out unauthenticated; the server's
/// 401/438 challenge is absorbed here, after which [`AuthState::sign`]
/// attaches USERNAME, REALM, NONCE and MESSAGE-INTEGRITY to retries and
/// follow-up requests.
pub struct AuthState {
    username: Username,
    password: String,
    realm: Option<Realm>,
    nonce: Option<Nonce>,
    integrity: Option<MessageIntegrity>,
}

impl AuthState {
    /// Creates a new [`AuthState`] from configured credentials. `realm`
    /// may pre-seed the server realm; the integrity key is still only
    /// derived once a challenge supplies a nonce.
    pub fn new(username: String, password: String, realm: String) -> Self {
        AuthState {
            username: Username::new(ATTR_USERNAME, username),
            password,
            realm: if realm.is_empty() {
                None
            } else {
                Some(Realm::new(ATTR_REALM, realm))
            },
            nonce: None,
            integrity: None,
        }
    }

    /// Returns the configured username attribute.
    pub fn username(&self) -> Username {
        self.username.clone()
    }

    /// `true` once a challenge has been absorbed and requests can be
    /// signed.
    pub fn is_ready(&self) -> bool {
        self.integrity.is_some() && self.nonce.is_some()
    }

    /// Absorbs REALM and NONCE from a 401 Unauthorized or 438 Stale
    /// Nonce challenge and derives the long-term integrity key.
    pub fn absorb_challenge(&mut self, msg: &Message) -> Result<()> {
        let nonce =
            Nonce::get_from_as(msg, ATTR_NONCE).map_err(|_| Error::ErrMalformedResponse)?;
        let realm =
            Realm::get_from_as(msg, ATTR_REALM).map_err(|_| Error::ErrMalformedResponse)?;

        self.integrity = Some(MessageIntegrity::new_long_term_integrity(
            self.username.text.clone(),
            realm.text.clone(),
            self.password.clone(),
        ));
        self.realm = Some(realm);
        self.nonce = Some(nonce);

        Ok(())
    }

    /// Replaces the cached nonce from a 438 Stale Nonce response. The
    /// realm and integrity key are left untouched.
    pub fn update_nonce(&mut self, msg: &Message) {
        match Nonce::get_from_as(msg, ATTR_NONCE) {
            Ok(nonce) => {
                log::debug!("stale nonce, got a new one");
                self.nonce = Some(nonce);
            }
            Err(_) => log::warn!("stale nonce response carried no NONCE"),
        }
    }

    /// Appends USERNAME, REALM, NONCE and MESSAGE-INTEGRITY to a request
    /// under construction. A no-op until a challenge has been absorbed,
    /// so anonymous sessions keep sending unauthenticated requests.
    pub fn sign(&self, setters: &mut Vec<Box<dyn Setter>>) {
        let (realm, nonce, integrity) = match (&self.realm, &self.nonce, &self.integrity) {
            (Some(r), Some(n), Some(i)) => (r, n, i),
            _ => return,
        };

        setters.push(Box::new(self.username.clone()));
        setters.push(Box::new(realm.clone()));
        setters.push(Box::new(nonce.clone()));
        setters.push(Box::new(integrity.clone()));
    }

    /// Verifies MESSAGE-INTEGRITY on a response. A no-op for anonymous
    /// sessions; with credentials in play a mismatch or a missing
    /// attribute fails with `ErrIntegrityFailed`.
    pub fn verify(&self, msg: &mut Message) -> Result<()> {
        if let Some(integrity) = &self.integrity {
            integrity
                .check(msg)
                .map_err(|_| Error::ErrIntegrityFailed)?;
        }
        Ok(())
    }
}
