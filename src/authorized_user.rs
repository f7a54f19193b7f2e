use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use serde::Serialize;
use tracing::{debug, instrument, Level};

use crate::types::{json_request, AuthorizedUserRefreshToken, HttpClient, Token};
use crate::{Error, TokenProvider};

/// Source credentials from `gcloud auth application-default login`
///
/// Trades the stored refresh token for an access token. These credentials carry no email, so
/// the default identity path falls back to the token or the userinfo endpoint.
#[derive(Debug)]
pub(crate) struct AuthorizedUser {
    client: HttpClient,
    credentials: AuthorizedUserRefreshToken,
    token_uri: String,
}

impl AuthorizedUser {
    pub(crate) fn new(
        credentials: AuthorizedUserRefreshToken,
        client: HttpClient,
        default_token_uri: &str,
    ) -> Self {
        debug!(client = %credentials.client_id, "found user credentials");
        let token_uri = credentials
            .token_uri
            .clone()
            .unwrap_or_else(|| default_token_uri.to_owned());

        Self {
            client,
            credentials,
            token_uri,
        }
    }
}

#[async_trait]
impl TokenProvider for AuthorizedUser {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, _scopes: &[&str]) -> Result<Arc<Token>, Error> {
        let request = RefreshRequest {
            client_id: &self.credentials.client_id,
            client_secret: &self.credentials.client_secret,
            grant_type: "refresh_token",
            refresh_token: &self.credentials.refresh_token,
        };

        let token = self
            .client
            .json::<Token>(
                &|| json_request(Method::POST, &self.token_uri, [], &request),
                "refresh user credentials",
            )
            .await?;

        Ok(Arc::new(token))
    }
}

#[derive(Serialize, Debug)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{eq, json_decoded, request};
    use httptest::responders::json_encoded;
    use httptest::{all_of, Expectation, Server};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_refreshes_token() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::body(json_decoded(eq(json!({
                    "client_id": "***id***.apps.googleusercontent.com",
                    "client_secret": "***secret***",
                    "grant_type": "refresh_token",
                    "refresh_token": "***refresh***",
                })))),
            ])
            .respond_with(json_encoded(json!({
                "access_token": "user-token",
                "expires_in": 3599,
            }))),
        );

        let credentials = serde_json::from_value(json!({
            "client_id": "***id***.apps.googleusercontent.com",
            "client_secret": "***secret***",
            "quota_project_id": "test_project",
            "refresh_token": "***refresh***",
            "type": "authorized_user"
        }))
        .unwrap();

        let user = AuthorizedUser::new(
            credentials,
            HttpClient::new().unwrap(),
            &server.url("/token").to_string(),
        );

        assert_eq!(user.email().await.unwrap(), None);
        let token = user.token(&[]).await.unwrap();
        assert_eq!(token.as_str(), "user-token");
    }
}
