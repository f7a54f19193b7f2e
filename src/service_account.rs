use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::jwt::Claims;
use crate::types::{build_request, HttpClient, ServiceAccountKey, Signer, Token};
use crate::{Error, TokenProvider};

/// Source credentials backed by a service account key file
///
/// Exchanges a self-signed JWT assertion for an access token at the key's `token_uri`.
#[derive(Debug)]
pub(crate) struct ServiceAccount {
    client: HttpClient,
    key: ServiceAccountKey,
    signer: Signer,
    token_uri: String,
}

impl ServiceAccount {
    pub(crate) fn new(
        key: ServiceAccountKey,
        client: HttpClient,
        default_token_uri: &str,
    ) -> Result<Self, Error> {
        debug!(email = %key.client_email, "found service account key");
        let token_uri = key
            .token_uri
            .clone()
            .unwrap_or_else(|| default_token_uri.to_owned());

        Ok(Self {
            client,
            signer: Signer::new(&key.private_key)?,
            key,
            token_uri,
        })
    }
}

#[async_trait]
impl TokenProvider for ServiceAccount {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, scopes: &[&str]) -> Result<Arc<Token>, Error> {
        let jwt =
            Claims::new(&self.key.client_email, &self.token_uri, scopes).to_jwt(&self.signer)?;
        let body = Bytes::from(
            form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&[("grant_type", GRANT_TYPE), ("assertion", jwt.as_str())])
                .finish()
                .into_bytes(),
        );

        let token = self
            .client
            .json::<Token>(
                &|| {
                    build_request(
                        Method::POST,
                        &self.token_uri,
                        [(
                            "content-type",
                            "application/x-www-form-urlencoded".to_owned(),
                        )],
                        body.clone(),
                    )
                },
                "service account token exchange",
            )
            .await?;

        Ok(Arc::new(token))
    }

    async fn email(&self) -> Result<Option<String>, Error> {
        Ok(Some(self.key.client_email.clone()))
    }
}

pub(crate) const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
