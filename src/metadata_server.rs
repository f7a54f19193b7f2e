use std::sync::Arc;

use async_trait::async_trait;
use http::{Method, StatusCode};
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::types::{empty_request, HttpClient, Token};
use crate::{Error, TokenProvider};

/// Source credentials served by the GCP instance metadata server
///
/// This is the ambient identity of App Engine, Cloud Run, Cloud Functions and Compute Engine.
/// Nothing is contacted until the first token or email is requested.
///
/// See https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys for details.
#[derive(Debug)]
pub(crate) struct MetadataServer {
    client: HttpClient,
    token_uri: String,
    email_uri: String,
}

impl MetadataServer {
    pub(crate) fn new(client: HttpClient, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            client,
            token_uri: format!("{base}{TOKEN_PATH}"),
            email_uri: format!("{base}{EMAIL_PATH}"),
        }
    }

    fn token_uri(&self, scopes: &[&str]) -> String {
        if scopes.is_empty() {
            return self.token_uri.clone();
        }

        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("scopes", &scopes.join(","))
            .finish();
        format!("{}?{query}", self.token_uri)
    }
}

#[async_trait]
impl TokenProvider for MetadataServer {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, scopes: &[&str]) -> Result<Arc<Token>, Error> {
        debug!("fetching token from GCP instance metadata server");
        let uri = self.token_uri(scopes);
        let token = self
            .client
            .json::<Token>(
                &|| empty_request(Method::GET, &uri, [metadata_flavor()]),
                "metadata server token",
            )
            .await?;

        Ok(Arc::new(token))
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    async fn email(&self) -> Result<Option<String>, Error> {
        let response = self
            .client
            .send(
                &|| empty_request(Method::GET, &self.email_uri, [metadata_flavor()]),
                "metadata server email",
            )
            .await;

        let body = match response {
            Ok(body) => body,
            Err(Error::Status(_, StatusCode::NOT_FOUND)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let email = String::from_utf8(body.to_vec())
            .map_err(|err| Error::Other("invalid metadata server email", Box::new(err)))?;
        let email = email.trim();
        Ok((!email.is_empty()).then(|| email.to_owned()))
    }
}

fn metadata_flavor() -> (&'static str, String) {
    ("metadata-flavor", "Google".to_owned())
}

// https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const EMAIL_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/email";
