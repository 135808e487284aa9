use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims bound into a token. Join invites identify the server alone,
/// session tokens additionally carry the peer identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Public websocket url of the issuing server.
    pub u: String,
    /// Name of the issuing server.
    pub n: String,
    /// Peer id, present on session tokens only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token is malformed or badly signed")]
    BadToken,
    #[error("token was issued for a different server")]
    WrongServer,
}

/// Mints and verifies the short opaque tokens that bind a peer identity
/// to this server instance.
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ws_url: String,
    server_name: String,
}

impl Authenticator {
    pub fn new(secret: &str, ws_url: &str, server_name: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ws_url: ws_url.to_string(),
            server_name: server_name.to_string(),
        }
    }

    /// Mints a join-invite token, handed to clients out-of-band.
    pub fn sign_invite(&self) -> String {
        self.sign(Claims {
            u: self.ws_url.clone(),
            n: self.server_name.clone(),
            i: None,
        })
    }

    /// Mints a session token binding `peer_id` to this server.
    pub fn sign_session(&self, peer_id: &str) -> String {
        self.sign(Claims {
            u: self.ws_url.clone(),
            n: self.server_name.clone(),
            i: Some(peer_id.to_string()),
        })
    }

    fn sign(&self, claims: Claims) -> String {
        encode(&Header::default(), &claims, &self.encoding).expect("claims are serializable")
    }

    /// Verifies a token, rejecting anything not issued by this server.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        // Tokens carry no expiry. Session enforcement is the auth timer.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data =
            decode::<Claims>(token, &self.decoding, &validation).map_err(|_| AuthError::BadToken)?;

        let claims = data.claims;

        if claims.u != self.ws_url || claims.n != self.server_name {
            return Err(AuthError::WrongServer);
        }

        Ok(claims)
    }
}
