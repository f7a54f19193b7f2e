//! Fetch an OpenID Connect identity token for an IAP protected App Engine application
//!
//! Identity-Aware Proxy only admits callers presenting an ID token whose audience is the client
//! ID of the application's IAP OAuth client. This crate finds that audience and gets such a
//! token signed by the IAM Credentials API, in four sequential steps:
//!
//! 1. Read the project ID from the environment (`PROJECT_ID` or `GOOGLE_CLOUD_PROJECT`) and
//!    look up the project number in Cloud Resource Manager.
//! 2. List the project's IAP brands and find the OAuth client named `IAP-App-Engine-app`; the
//!    trailing segment of its resource name is the audience.
//! 3. Pick an identity: an explicitly impersonated service account, or the ambient service
//!    account of a managed runtime (App Engine, Cloud Run, Cloud Functions).
//! 4. Call `generateIdToken` for that service account.
//!
//! Calls to Google APIs are authenticated with Application Default Credentials: a credentials
//! file named by `GOOGLE_APPLICATION_CREDENTIALS`, the `gcloud` user credentials file, or the
//! instance metadata server.
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), iap_id_token::Error> {
//! let config = iap_id_token::Config::from_env(None)?;
//! let token = iap_id_token::fetch_id_token(&config).await?;
//! println!("{}", token.as_str());
//! # Ok(())
//! # }
//! ```
//!
//! Without a target principal, the ambient identity is only used when `GOOGLE_CLOUD_REGION` or
//! `GAE_SERVICE` is set. Anywhere else, impersonate a service account instead:
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), iap_id_token::Error> {
//! let principal = "invoker@my-project.iam.gserviceaccount.com".to_owned();
//! let config = iap_id_token::Config::from_env(Some(principal))?;
//! let token = iap_id_token::fetch_id_token(&config).await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]

use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, Level};

mod authorized_user;

mod config;
pub use config::{Config, Endpoints, Environment};

mod credentials;

mod iam_credentials;

mod iap;
pub use iap::APP_ENGINE_CLIENT;

mod identity;
use identity::IdentityProvider;

mod jwt;

mod metadata_server;

mod project;
pub use project::Project;

mod service_account;

mod types;
use types::HttpClient;
pub use types::{IdToken, Token};

/// Fetch an ID token for the IAP App Engine application of the configured project
///
/// Runs the whole sequence: discover source credentials, choose the identity, resolve the
/// project number, discover the audience and ask IAM Credentials to sign the token.
#[instrument(level = Level::DEBUG, skip(config), fields(project_id = config.environment.project_id()))]
pub async fn fetch_id_token(config: &Config) -> Result<IdToken, Error> {
    let client = HttpClient::new()?;
    let credentials = credentials::discover(&client, &config.endpoints)?;
    fetch_with(config, client, credentials).await
}

async fn fetch_with(
    config: &Config,
    client: HttpClient,
    credentials: Arc<dyn TokenProvider>,
) -> Result<IdToken, Error> {
    let provider = IdentityProvider::new(config, client.clone(), credentials.clone())?;

    let token = credentials.token(SCOPES).await?;
    debug!(expires_at = %token.expires_at(), "obtained access token");

    let project = Project::resolve(
        &client,
        &config.endpoints.resource_manager,
        &token,
        config.environment.project_id(),
    )
    .await?;

    let audience = iap::audience(&client, &config.endpoints.iap, &token, &project.number).await?;
    let id_token = provider
        .id_token(&token, &audience, config.include_email)
        .await?;
    debug!(expires_at = ?id_token.expires_at(), "obtained ID token");
    Ok(id_token)
}

/// A source of OAuth2 access tokens used to call Google APIs
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get an access token for the given scopes
    async fn token(&self, scopes: &[&str]) -> Result<Arc<Token>, Error>;

    /// The service account email these credentials belong to, if they can tell
    async fn email(&self) -> Result<Option<String>, Error> {
        Ok(None)
    }
}

/// Scopes requested for the source credentials
pub(crate) const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum Error {
    /// A required lookup came back empty: the project ID, the project, its number or the IAP
    /// App Engine OAuth client
    #[error("{0} not found")]
    EntityNotFound(String),

    /// An ID token for the ambient identity was requested outside a managed runtime
    #[error("{0}")]
    IllegalAccess(&'static str),

    /// The service account behind the ambient credentials could not be determined
    #[error("{0}")]
    ServiceAccountNotFound(String),

    /// A Google API answered with a non-success status
    #[error("{0}: server responded with {1}")]
    Status(&'static str, StatusCode),

    /// The request could not be sent
    #[error("{0}: {1}")]
    Transport(&'static str, #[source] hyper_util::client::legacy::Error),

    /// Uncategorized error
    #[error("{0}")]
    Str(&'static str),

    /// I/O error
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// JSON serialization or deserialization failed
    #[error("{0}: {1}")]
    Json(&'static str, #[source] serde_json::Error),

    /// Reading an HTTP body failed
    #[error("{0}: {1}")]
    Http(&'static str, #[source] hyper::Error),

    /// Other errors
    #[error("{0}: {1}")]
    Other(
        &'static str,
        #[source] Box<dyn std::error::Error + Send + Sync>,
    ),
}

impl Error {
    /// The category this error is reported under
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EntityNotFound(_) => ErrorKind::EntityNotFound,
            Self::IllegalAccess(_) => ErrorKind::IllegalAccess,
            Self::ServiceAccountNotFound(_) => ErrorKind::ServiceAccountNotFound,
            _ => ErrorKind::Unexpected,
        }
    }

    /// A structured `{ type, title, message }` description of this error
    pub fn report(&self) -> ErrorReport {
        let kind = self.kind();
        ErrorReport {
            kind: kind.tag(),
            title: kind.title(),
            message: self.to_string(),
        }
    }

    /// Whether replaying the request that failed this way might succeed
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::Status(_, status) => types::RETRY_STATUSES.contains(status),
            Self::Transport(..) | Self::Http(..) => true,
            _ => false,
        }
    }
}

/// Broad categories of [`Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The project, its number or the IAP App Engine client does not exist
    EntityNotFound,
    /// The ambient identity may not be used here
    IllegalAccess,
    /// The ambient service account email is unknown
    ServiceAccountNotFound,
    /// Anything else, usually a failed or rejected request
    Unexpected,
}

impl ErrorKind {
    /// Stable machine readable tag
    pub fn tag(self) -> &'static str {
        match self {
            Self::EntityNotFound => "entity-not-found",
            Self::IllegalAccess => "illegal-access",
            Self::ServiceAccountNotFound => "service-account-not-found",
            Self::Unexpected => "unexpected",
        }
    }

    /// Short human readable summary
    pub fn title(self) -> &'static str {
        match self {
            Self::EntityNotFound => "Entity not found",
            Self::IllegalAccess => "Illegal access",
            Self::ServiceAccountNotFound => "Service account not found",
            Self::Unexpected => "Unexpected error",
        }
    }
}

/// The serializable form of an [`Error`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    /// [`ErrorKind::tag()`], serialized as `type`
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// [`ErrorKind::title()`]
    pub title: &'static str,
    /// The error's `Display` output
    pub message: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use httptest::matchers::{contains, eq, json_decoded, request};
    use httptest::responders::json_encoded;
    use httptest::{all_of, Expectation, Server};
    use serde_json::json;

    use super::*;

    /// Credentials handing out a fixed token, counting how often they are asked
    pub(crate) struct StaticCredentials {
        token: String,
        email: Option<String>,
        calls: AtomicUsize,
    }

    impl StaticCredentials {
        pub(crate) fn new(token: &str, email: Option<&str>) -> Self {
            Self {
                token: token.to_owned(),
                email: email.map(str::to_owned),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenProvider for StaticCredentials {
        async fn token(&self, _scopes: &[&str]) -> Result<Arc<Token>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Token::from_string(
                self.token.clone(),
                Duration::from_secs(3600),
            )))
        }

        async fn email(&self) -> Result<Option<String>, Error> {
            Ok(self.email.clone())
        }
    }

    const BRAND: &str = "projects/415104041262/brands/415104041262";
    const AUDIENCE: &str = "415104041262-abc.apps.googleusercontent.com";

    fn config(target_principal: Option<&str>, managed: bool, base: &str) -> Config {
        let environment = Environment::from_lookup(|name| match name {
            "GOOGLE_CLOUD_PROJECT" => Some("my-project".to_owned()),
            "GOOGLE_CLOUD_REGION" if managed => Some("europe-west1".to_owned()),
            _ => None,
        })
        .unwrap();

        Config {
            target_principal: target_principal.map(str::to_owned),
            include_email: true,
            environment,
            endpoints: Endpoints::with_base(base),
        }
    }

    fn expect_discovery(server: &Server) {
        server.expect(
            Expectation::matching(request::method_path("GET", "/v1/projects/my-project"))
                .respond_with(json_encoded(json!({
                    "projectId": "my-project",
                    "projectNumber": "415104041262",
                }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/projects/415104041262/brands",
            ))
            .respond_with(json_encoded(json!({ "brands": [{ "name": BRAND }] }))),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/v1/projects/415104041262/brands/415104041262/identityAwareProxyClients",
            ))
            .respond_with(json_encoded(json!({
                "identityAwareProxyClients": [{
                    "name": format!("{BRAND}/identityAwareProxyClients/{AUDIENCE}"),
                    "displayName": APP_ENGINE_CLIENT,
                }]
            }))),
        );
    }

    #[tokio::test]
    async fn test_managed_runtime_end_to_end() {
        let server = Server::run();
        expect_discovery(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path(
                    "POST",
                    "/v1/projects/-/serviceAccounts/my-project@appspot.gserviceaccount.com:generateIdToken"
                ),
                request::headers(contains(("authorization", "Bearer source"))),
                request::body(json_decoded(eq(json!({
                    "audience": AUDIENCE,
                    "includeEmail": true,
                })))),
            ])
            .respond_with(json_encoded(json!({ "token": "header.claims.signature" }))),
        );

        let credentials = Arc::new(StaticCredentials::new(
            "source",
            Some("my-project@appspot.gserviceaccount.com"),
        ));
        let config = config(None, true, &server.url("").to_string());
        let token = fetch_with(&config, HttpClient::new().unwrap(), credentials.clone())
            .await
            .unwrap();
        assert_eq!(token.as_str(), "header.claims.signature");
        assert_eq!(credentials.calls(), 1);
    }

    #[tokio::test]
    async fn test_impersonation_end_to_end() {
        let server = Server::run();
        expect_discovery(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path(
                    "POST",
                    "/v1/projects/-/serviceAccounts/invoker@my-project.iam.gserviceaccount.com:generateIdToken"
                ),
                request::body(json_decoded(eq(json!({
                    "audience": AUDIENCE,
                    "includeEmail": true,
                })))),
            ])
            .respond_with(json_encoded(json!({ "token": "header.claims.signature" }))),
        );

        let credentials = Arc::new(StaticCredentials::new("source", None));
        let config = config(
            Some("invoker@my-project.iam.gserviceaccount.com"),
            false,
            &server.url("").to_string(),
        );
        let token = fetch_with(&config, HttpClient::new().unwrap(), credentials.clone())
            .await
            .unwrap();
        assert_eq!(token.as_str(), "header.claims.signature");
        assert_eq!(credentials.calls(), 1);
    }

    #[tokio::test]
    async fn test_illegal_access_before_any_request() {
        // No expectations: any request would fail the test when the server is dropped.
        let server = Server::run();
        let credentials = Arc::new(StaticCredentials::new("source", None));
        let config = config(None, false, &server.url("").to_string());

        let err = fetch_with(&config, HttpClient::new().unwrap(), credentials.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalAccess);
        assert_eq!(credentials.calls(), 0);
    }

    #[test]
    fn test_error_report() {
        let report = Error::EntityNotFound("project my-project".into()).report();
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "type": "entity-not-found",
                "title": "Entity not found",
                "message": "project my-project not found",
            })
        );

        let report = Error::Str("boom").report();
        assert_eq!(report.kind, "unexpected");
        assert_eq!(report.message, "boom");
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::Status("x", StatusCode::BAD_GATEWAY).is_transient());
        assert!(Error::Status("x", StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!Error::Status("x", StatusCode::FORBIDDEN).is_transient());
        assert!(!Error::EntityNotFound("x".into()).is_transient());
    }
}
