use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Signer;
use crate::Error;

/// Permissions requested for a JWT.
/// See https://developers.google.com/identity/protocols/OAuth2ServiceAccount#authorizingrequests.
#[derive(Serialize, Debug)]
pub(crate) struct Claims<'a> {
    iss: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
    scope: String,
}

impl<'a> Claims<'a> {
    pub(crate) fn new(client_email: &'a str, token_uri: &'a str, scopes: &[&str]) -> Self {
        let iat = Utc::now().timestamp();
        Claims {
            iss: client_email,
            aud: token_uri,
            exp: iat + 3600 - 5, // Max validity is 1h
            iat,
            scope: scopes.join(" "),
        }
    }

    pub(crate) fn to_jwt(&self, signer: &Signer) -> Result<String, Error> {
        let claims = serde_json::to_string(self)
            .map_err(|err| Error::Json("failed to serialize JWT claims", err))?;

        let mut jwt = String::new();
        URL_SAFE_NO_PAD.encode_string(GOOGLE_RS256_HEAD, &mut jwt);
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(claims, &mut jwt);

        let signature = signer.sign(jwt.as_bytes())?;
        jwt.push('.');
        URL_SAFE_NO_PAD.encode_string(&signature, &mut jwt);
        Ok(jwt)
    }
}

/// The subset of registered claims read back from tokens issued to us
#[derive(Deserialize, Debug)]
pub(crate) struct Payload {
    pub(crate) sub: Option<String>,
    pub(crate) exp: Option<i64>,
}

/// Decode the payload segment of a compact JWT without verifying its signature
///
/// Returns `None` for anything that does not look like a JWT, which includes the opaque
/// access tokens most Google token endpoints hand out.
pub(crate) fn decode_payload(token: &str) -> Option<Payload> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let bytes = match URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(%err, "token payload is not base64url");
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(payload) => Some(payload),
        Err(err) => {
            debug!(%err, "token payload is not a JSON claims set");
            None
        }
    }
}

const GOOGLE_RS256_HEAD: &str = r#"{"alg":"RS256","typ":"JWT"}"#;

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Assemble a compact JWT with a dummy signature around `claims`
    pub(crate) fn unsigned_jwt(claims: &serde_json::Value) -> String {
        format!(
            "{}.{}.c2lnbmF0dXJl",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#),
            URL_SAFE_NO_PAD.encode(claims.to_string()),
        )
    }

    #[test]
    fn test_decode_payload() {
        let token = unsigned_jwt(&serde_json::json!({
            "sub": "runner@project.iam.gserviceaccount.com",
            "exp": 42,
            "aud": "ignored",
        }));

        let payload = decode_payload(&token).expect("payload to decode");
        assert_eq!(
            payload.sub.as_deref(),
            Some("runner@project.iam.gserviceaccount.com")
        );
        assert_eq!(payload.exp, Some(42));
    }

    #[test]
    fn test_opaque_tokens_have_no_payload() {
        assert!(decode_payload("ya29.a0AfH6SMB").is_none());
        assert!(decode_payload("a.b.c.d").is_none());
        assert!(decode_payload("a.!!!.c").is_none());
        assert!(decode_payload(&format!("a.{}.c", URL_SAFE_NO_PAD.encode("[1]"))).is_none());
    }

    #[test]
    fn test_claims_scope_is_space_separated() {
        let claims = Claims::new(
            "sa@project.iam.gserviceaccount.com",
            "https://oauth2.googleapis.com/token",
            &["a", "b"],
        );
        assert_eq!(claims.scope, "a b");
        assert_eq!(claims.exp - claims.iat, 3595);
    }
}
