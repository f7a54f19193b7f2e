use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument, Level};

use crate::authorized_user::AuthorizedUser;
use crate::config::Endpoints;
use crate::metadata_server::MetadataServer;
use crate::service_account::ServiceAccount;
use crate::types::{AuthorizedUserRefreshToken, HttpClient, ServiceAccountKey};
use crate::{Error, TokenProvider};

/// Find the source credentials used to call Google APIs
///
/// Follows the Application Default Credentials order, without touching the network:
///
/// 1. The JSON file named by `GOOGLE_APPLICATION_CREDENTIALS`.
/// 2. `~/.config/gcloud/application_default_credentials.json`, if it exists.
/// 3. The GCP instance metadata server.
#[instrument(level = Level::DEBUG, skip(client, endpoints))]
pub(crate) fn discover(
    client: &HttpClient,
    endpoints: &Endpoints,
) -> Result<Arc<dyn TokenProvider>, Error> {
    if let Some(path) = env::var_os("GOOGLE_APPLICATION_CREDENTIALS") {
        debug!(
            ?path,
            "reading credentials file from GOOGLE_APPLICATION_CREDENTIALS env var"
        );
        return CredentialsFile::from_file(path)?.into_provider(client, endpoints);
    }

    if let Some(path) = user_credentials_path().filter(|path| path.is_file()) {
        debug!(?path, "reading application default credentials");
        return CredentialsFile::from_file(path)?.into_provider(client, endpoints);
    }

    debug!("using GCP instance metadata server");
    Ok(Arc::new(MetadataServer::new(
        client.clone(),
        &endpoints.metadata,
    )))
}

fn user_credentials_path() -> Option<PathBuf> {
    let mut home = home::home_dir()?;
    home.push(USER_CREDENTIALS_PATH);
    Some(home)
}

/// A credentials JSON file, discriminated by its `type` field
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    // `gcloud iam service-accounts keys create key.json --iam-account=...`
    ServiceAccount(ServiceAccountKey),
    // `gcloud auth application-default login`
    AuthorizedUser(AuthorizedUserRefreshToken),
}

impl CredentialsFile {
    fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::open(path.as_ref())
            .map_err(|err| Error::Io("failed to open application credentials file", err))?;
        serde_json::from_reader(file)
            .map_err(|err| Error::Json("failed to deserialize application credentials", err))
    }

    fn into_provider(
        self,
        client: &HttpClient,
        endpoints: &Endpoints,
    ) -> Result<Arc<dyn TokenProvider>, Error> {
        let provider: Arc<dyn TokenProvider> = match self {
            Self::ServiceAccount(key) => Arc::new(ServiceAccount::new(
                key,
                client.clone(),
                &endpoints.oauth2_token,
            )?),
            Self::AuthorizedUser(credentials) => Arc::new(AuthorizedUser::new(
                credentials,
                client.clone(),
                &endpoints.oauth2_token,
            )),
        };

        Ok(provider)
    }
}

const USER_CREDENTIALS_PATH: &str = ".config/gcloud/application_default_credentials.json";
