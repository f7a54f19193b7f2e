use std::time::Duration;
use std::{fmt, iter};

use bytes::Buf;
use chrono::{DateTime, TimeZone, Utc};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::{jwt, Error};

#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    inner: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub(crate) fn new() -> Result<Self, Error> {
        #[cfg(feature = "webpki-roots")]
        let https = HttpsConnectorBuilder::new().with_webpki_roots();
        #[cfg(not(feature = "webpki-roots"))]
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                Error::Io("failed to load native TLS root certificates for HTTPS", err)
            })?;

        Ok(Self {
            inner: Client::builder(TokioExecutor::new())
                .build(https.https_or_http().enable_http2().build()),
        })
    }

    /// Send the request and deserialize a successful JSON response body
    pub(crate) async fn json<T: DeserializeOwned>(
        &self,
        request: &impl Fn() -> Result<Request<Full<Bytes>>, Error>,
        context: &'static str,
    ) -> Result<T, Error> {
        let body = self.send(request, context).await?;
        serde_json::from_slice(&body).map_err(|err| Error::Json(context, err))
    }

    /// Send the request, replaying it on transient failures
    ///
    /// Only methods in [`RETRY_METHODS`] are replayed; anything else gets a single attempt.
    pub(crate) async fn send(
        &self,
        request: &impl Fn() -> Result<Request<Full<Bytes>>, Error>,
        context: &'static str,
    ) -> Result<Bytes, Error> {
        let mut retries = 0;
        loop {
            let req = request()?;
            let replayable = RETRY_METHODS.contains(req.method());
            let err = match self.request(req, context).await {
                // Early return when the request succeeds
                Ok(body) => return Ok(body),
                Err(err) => err,
            };

            retries += 1;
            if !replayable || !err.is_transient() || retries >= RETRY_COUNT {
                return Err(err);
            }

            warn!(?err, context, retries, "request failed, trying again...");
            tokio::time::sleep(RETRY_DELAY * retries).await;
        }
    }

    async fn request(
        &self,
        req: Request<Full<Bytes>>,
        context: &'static str,
    ) -> Result<Bytes, Error> {
        debug!(method = %req.method(), url = ?req.uri(), context, "sending request");
        let (parts, body) = self
            .inner
            .request(req)
            .await
            .map_err(|err| Error::Transport(context, err))?
            .into_parts();

        let mut body = body
            .collect()
            .await
            .map_err(|err| Error::Http("failed to read HTTP response body", err))?
            .aggregate();

        let body = body.copy_to_bytes(body.remaining());
        if !parts.status.is_success() {
            let body = String::from_utf8_lossy(body.as_ref());
            warn!(%body, status = ?parts.status, context, "request failed");
            return Err(Error::Status(context, parts.status));
        }

        Ok(body)
    }
}

/// Build a request with an empty body
pub(crate) fn empty_request(
    method: Method,
    uri: &str,
    headers: impl IntoIterator<Item = (&'static str, String)>,
) -> Result<Request<Full<Bytes>>, Error> {
    build_request(method, uri, headers, Bytes::new())
}

/// Build a request carrying a JSON body
pub(crate) fn json_request(
    method: Method,
    uri: &str,
    headers: impl IntoIterator<Item = (&'static str, String)>,
    body: &impl Serialize,
) -> Result<Request<Full<Bytes>>, Error> {
    let body = serde_json::to_vec(body)
        .map_err(|err| Error::Json("failed to serialize request body", err))?;
    build_request(
        method,
        uri,
        headers
            .into_iter()
            .chain(iter::once(("content-type", "application/json".to_owned()))),
        Bytes::from(body),
    )
}

pub(crate) fn build_request(
    method: Method,
    uri: &str,
    headers: impl IntoIterator<Item = (&'static str, String)>,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, Error> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }

    builder
        .body(Full::from(body))
        .map_err(|err| Error::Other("failed to build HTTP request", Box::new(err)))
}

/// `Authorization` header for a bearer token
pub(crate) fn bearer(token: &Token) -> (&'static str, String) {
    ("authorization", format!("Bearer {}", token.as_str()))
}

/// Represents an access token that can be used as a bearer token in HTTP requests
///
/// The token does not implement [`Display`] to avoid accidentally printing the token in log
/// files, likewise [`Debug`] does not expose the token value itself which is only available
/// using the [Token::`as_str`] method.
///
/// [`Display`]: fmt::Display
///
/// https://developers.google.com/identity/protocols/oauth2/service-account#httprest
#[derive(Clone, Deserialize)]
pub struct Token {
    access_token: String,
    #[serde(
        deserialize_with = "deserialize_time",
        rename(deserialize = "expires_in")
    )]
    expires_at: DateTime<Utc>,
}

impl Token {
    #[cfg(test)]
    pub(crate) fn from_string(access_token: String, expires_in: Duration) -> Self {
        Token {
            access_token,
            expires_at: Utc::now() + expires_in,
        }
    }

    /// Get str representation of the token.
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    /// Get expiry of token
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"****")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A signed OpenID Connect identity token
///
/// Serializes as `{"token": "<jwt>"}`, the same shape the IAM Credentials `generateIdToken`
/// method returns. [`Debug`] output is redacted.
#[derive(Clone, Deserialize, Serialize)]
pub struct IdToken {
    token: String,
}

impl IdToken {
    /// Get str representation of the token.
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Expiry taken from the token's `exp` claim, if it can be decoded
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let exp = jwt::decode_payload(&self.token)?.exp?;
        Utc.timestamp_opt(exp, 0).single()
    }
}

impl fmt::Debug for IdToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdToken")
            .field("token", &"****")
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

/// An RSA PKCS1 SHA256 signer
pub(crate) struct Signer {
    key: RsaKeyPair,
    rng: SystemRandom,
}

impl Signer {
    pub(crate) fn new(pem_pkcs8: &str) -> Result<Self, Error> {
        let key = PrivateKeyDer::from_pem_slice(pem_pkcs8.as_bytes()).map_err(|err| {
            Error::Other("failed to read credentials private key data", Box::new(err))
        })?;

        Ok(Signer {
            key: RsaKeyPair::from_pkcs8(key.secret_der())
                .map_err(|_| Error::Str("invalid private key in credentials"))?,
            rng: SystemRandom::new(),
        })
    }

    /// Sign the input message and return the signature
    pub(crate) fn sign(&self, input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(&RSA_PKCS1_SHA256, &self.rng, input, &mut signature)
            .map_err(|_| Error::Str("failed to sign with credentials key"))?;
        Ok(signature)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish()
    }
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds_from_now: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Utc::now() + Duration::from_secs(seconds_from_now))
}

#[derive(Deserialize)]
pub(crate) struct ServiceAccountKey {
    /// private_key
    pub(crate) private_key: String,
    /// client_email
    pub(crate) client_email: String,
    /// token_uri
    pub(crate) token_uri: Option<String>,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
pub(crate) struct AuthorizedUserRefreshToken {
    /// Client id
    pub(crate) client_id: String,
    /// Client secret
    pub(crate) client_secret: String,
    /// Refresh Token
    pub(crate) refresh_token: String,
    /// Token endpoint, if the file overrides it
    pub(crate) token_uri: Option<String>,
}

impl fmt::Debug for AuthorizedUserRefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedUserRefreshToken")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Methods that are safe to replay after a transient failure.
const RETRY_METHODS: [Method; 6] = [
    Method::GET,
    Method::HEAD,
    Method::OPTIONS,
    Method::PUT,
    Method::DELETE,
    Method::TRACE,
];

/// Statuses worth another attempt.
pub(crate) const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// How many times to attempt a replayable request.
const RETRY_COUNT: u32 = 5;

const RETRY_DELAY: Duration = Duration::from_millis(50);
