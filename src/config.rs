use std::env;

use tracing::debug;

use crate::Error;

/// Everything one token fetch needs, resolved up front
#[derive(Clone, Debug)]
pub struct Config {
    /// Service account email to impersonate, if any
    pub target_principal: Option<String>,
    /// Ask for the `email` and `email_verified` claims in the ID token
    pub include_email: bool,
    /// Project and runtime facts read from environment variables
    pub environment: Environment,
    /// Google API base URLs
    pub endpoints: Endpoints,
}

impl Config {
    /// Read the [`Environment`] from the process environment and use the public Google endpoints
    pub fn from_env(target_principal: Option<String>) -> Result<Self, Error> {
        Ok(Self {
            target_principal,
            include_email: true,
            environment: Environment::from_env()?,
            endpoints: Endpoints::default(),
        })
    }
}

/// Facts about the runtime taken from environment variables
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Environment {
    project_id: String,
    managed_runtime: bool,
}

impl Environment {
    /// Read `PROJECT_ID`/`GOOGLE_CLOUD_PROJECT` and the managed runtime signals
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`Environment::from_env()`], reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let project_id = PROJECT_ID_VARS
            .iter()
            .find_map(|name| lookup(*name))
            .ok_or_else(|| {
                Error::EntityNotFound(format!(
                    "project ID (set {} or {})",
                    PROJECT_ID_VARS[0], PROJECT_ID_VARS[1]
                ))
            })?;

        let managed_runtime = MANAGED_RUNTIME_VARS
            .iter()
            .any(|name| lookup(*name).is_some());

        debug!(%project_id, managed_runtime, "read environment");
        Ok(Self {
            project_id,
            managed_runtime,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Whether a managed runtime (App Engine, Cloud Run, Cloud Functions) supplies our identity
    pub fn is_managed_runtime(&self) -> bool {
        self.managed_runtime
    }
}

/// Base URLs of the Google APIs this crate talks to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    /// Cloud Resource Manager
    pub resource_manager: String,
    /// Identity-Aware Proxy admin API
    pub iap: String,
    /// IAM Service Account Credentials API
    pub iam_credentials: String,
    /// OpenID Connect userinfo, the full URL
    pub userinfo: String,
    /// OAuth2 token endpoint for credential files that don't name one
    pub oauth2_token: String,
    /// GCP instance metadata server
    pub metadata: String,
}

impl Endpoints {
    /// Point every endpoint at the same base URL
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            resource_manager: base.to_owned(),
            iap: base.to_owned(),
            iam_credentials: base.to_owned(),
            userinfo: format!("{base}/oauth2/v3/userinfo"),
            oauth2_token: format!("{base}/token"),
            metadata: base.to_owned(),
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            resource_manager: "https://cloudresourcemanager.googleapis.com".to_owned(),
            iap: "https://iap.googleapis.com".to_owned(),
            iam_credentials: "https://iamcredentials.googleapis.com".to_owned(),
            userinfo: "https://www.googleapis.com/oauth2/v3/userinfo".to_owned(),
            oauth2_token: "https://oauth2.googleapis.com/token".to_owned(),
            metadata: metadata_root(|name| env::var(name).ok()),
        }
    }
}

/// `GCE_METADATA_HOST` overrides the metadata server host, as the gcloud tools allow
fn metadata_root(lookup: impl Fn(&str) -> Option<String>) -> String {
    match lookup(METADATA_HOST_VAR).filter(|host| !host.is_empty()) {
        Some(host) => format!("http://{host}"),
        None => METADATA_ROOT.to_owned(),
    }
}

const PROJECT_ID_VARS: [&str; 2] = ["PROJECT_ID", "GOOGLE_CLOUD_PROJECT"];
const MANAGED_RUNTIME_VARS: [&str; 2] = ["GOOGLE_CLOUD_REGION", "GAE_SERVICE"];
const METADATA_HOST_VAR: &str = "GCE_METADATA_HOST";
const METADATA_ROOT: &str = "http://metadata.google.internal";
