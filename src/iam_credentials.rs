use http::Method;
use serde::Serialize;
use tracing::{debug, instrument, Level};

use crate::types::{bearer, json_request, HttpClient, IdToken, Token};
use crate::Error;

/// Ask the IAM Credentials API to sign an ID token on behalf of `service_account`
///
/// The caller (identified by `token`) needs `iam.serviceAccounts.getOpenIdToken` on the target
/// account; for a service account asking for itself this is the "Service Account Token Creator"
/// role on itself.
///
/// https://cloud.google.com/iam/docs/reference/credentials/rest/v1/projects.serviceAccounts/generateIdToken
#[instrument(level = Level::DEBUG, skip(client, base, token))]
pub(crate) async fn generate_id_token(
    client: &HttpClient,
    base: &str,
    token: &Token,
    service_account: &str,
    audience: &str,
    include_email: bool,
) -> Result<IdToken, Error> {
    let uri = generate_id_token_uri(base, service_account);
    let request = GenerateIdTokenRequest {
        audience,
        include_email,
    };

    debug!(%uri, "requesting ID token");
    client
        .json(
            &|| json_request(Method::POST, &uri, [bearer(token)], &request),
            "generate ID token",
        )
        .await
}

pub(crate) fn generate_id_token_uri(base: &str, service_account: &str) -> String {
    format!(
        "{}/v1/projects/-/serviceAccounts/{service_account}:generateIdToken",
        base.trim_end_matches('/')
    )
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateIdTokenRequest<'a> {
    audience: &'a str,
    include_email: bool,
}
