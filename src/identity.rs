use std::fmt;
use std::sync::Arc;

use http::Method;
use serde::Deserialize;
use tracing::{debug, instrument, Level};

use crate::config::Config;
use crate::iam_credentials::generate_id_token;
use crate::types::{bearer, empty_request, HttpClient, IdToken, Token};
use crate::{jwt, Error, TokenProvider};

/// Where the ID token's identity comes from
///
/// Chosen once, from the configuration, before any request is made.
#[derive(Debug)]
pub(crate) enum IdentityProvider {
    /// Sign as the configured target principal
    Impersonated(Impersonated),
    /// Sign as the ambient identity of a managed runtime
    Managed(Managed),
}

impl IdentityProvider {
    pub(crate) fn new(
        config: &Config,
        client: HttpClient,
        credentials: Arc<dyn TokenProvider>,
    ) -> Result<Self, Error> {
        if let Some(target_principal) = &config.target_principal {
            debug!(%target_principal, "impersonating target principal");
            return Ok(Self::Impersonated(Impersonated {
                client,
                iam_credentials: config.endpoints.iam_credentials.clone(),
                target_principal: target_principal.clone(),
            }));
        }

        if !config.environment.is_managed_runtime() {
            return Err(Error::IllegalAccess(
                "no managed runtime detected, pass --target-principal to impersonate a service account",
            ));
        }

        debug!("using the managed runtime identity");
        Ok(Self::Managed(Managed {
            client,
            iam_credentials: config.endpoints.iam_credentials.clone(),
            userinfo: config.endpoints.userinfo.clone(),
            credentials,
        }))
    }

    /// Fetch an ID token for `audience`, calling IAM Credentials with the `source` token
    pub(crate) async fn id_token(
        &self,
        source: &Token,
        audience: &str,
        include_email: bool,
    ) -> Result<IdToken, Error> {
        match self {
            Self::Impersonated(provider) => {
                provider.id_token(source, audience, include_email).await
            }
            Self::Managed(provider) => provider.id_token(source, audience, include_email).await,
        }
    }
}

/// Asks IAM Credentials to sign an ID token for `target_principal`
#[derive(Debug)]
pub(crate) struct Impersonated {
    client: HttpClient,
    iam_credentials: String,
    target_principal: String,
}

impl Impersonated {
    #[instrument(level = Level::DEBUG, skip(self, source), fields(target_principal = %self.target_principal))]
    async fn id_token(
        &self,
        source: &Token,
        audience: &str,
        include_email: bool,
    ) -> Result<IdToken, Error> {
        generate_id_token(
            &self.client,
            &self.iam_credentials,
            source,
            &self.target_principal,
            audience,
            include_email,
        )
        .await
    }
}

/// Works out which service account the source credentials belong to, then asks IAM
/// Credentials to sign an ID token for that same account
pub(crate) struct Managed {
    client: HttpClient,
    iam_credentials: String,
    userinfo: String,
    credentials: Arc<dyn TokenProvider>,
}

impl Managed {
    #[instrument(level = Level::DEBUG, skip(self, source))]
    async fn id_token(
        &self,
        source: &Token,
        audience: &str,
        include_email: bool,
    ) -> Result<IdToken, Error> {
        let email = self.email(source).await?;
        generate_id_token(
            &self.client,
            &self.iam_credentials,
            source,
            &email,
            audience,
            include_email,
        )
        .await
    }

    /// The caller's email: the credentials first, then the token's `sub`, then userinfo
    ///
    /// Key files know their email up front, the metadata server answers on request.
    async fn email(&self, source: &Token) -> Result<String, Error> {
        if let Some(email) = self.credentials.email().await? {
            debug!(%email, "service account email from credentials");
            return Ok(email);
        }

        if let Some(email) = jwt::decode_payload(source.as_str())
            .and_then(|payload| payload.sub)
            .filter(|sub| sub.contains('@'))
        {
            debug!(%email, "service account email from token subject");
            return Ok(email);
        }

        debug!(userinfo = %self.userinfo, "asking userinfo for service account email");
        let response = self
            .client
            .json::<UserInfo>(
                &|| empty_request(Method::GET, &self.userinfo, [bearer(source)]),
                "userinfo",
            )
            .await;

        match response {
            Ok(UserInfo {
                email: Some(email),
            }) if !email.is_empty() => {
                debug!(%email, "service account email from userinfo");
                Ok(email)
            }
            Ok(_) => Err(Error::ServiceAccountNotFound(
                "userinfo returned no email, pass --target-principal to impersonate a service account"
                    .to_owned(),
            )),
            Err(Error::Status(_, status)) if status.is_client_error() => {
                Err(Error::ServiceAccountNotFound(format!(
                    "userinfo rejected the credentials ({status}), pass --target-principal to impersonate a service account"
                )))
            }
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for Managed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("userinfo", &self.userinfo)
            .field("credentials", &"Arc<dyn TokenProvider>")
            .finish_non_exhaustive()
    }
}

// https://developers.google.com/identity/openid-connect/openid-connect#obtainuserinfo
#[derive(Deserialize)]
struct UserInfo {
    email: Option<String>,
}
