//! Identity-Aware Proxy OAuth brand and client discovery
//!
//! An App Engine application protected by IAP gets an OAuth client named
//! [`APP_ENGINE_CLIENT`] under the project's brand. Its client ID is the audience IAP expects
//! in ID tokens.
//!
//! https://cloud.google.com/iap/docs/reference/rest/v1/projects.brands

use http::Method;
use serde::Deserialize;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::types::{bearer, empty_request, HttpClient, Token};
use crate::Error;

/// Display name of the OAuth client IAP creates for App Engine
pub const APP_ENGINE_CLIENT: &str = "IAP-App-Engine-app";

/// Find the audience of the IAP App Engine OAuth client for `project_number`
#[instrument(level = Level::DEBUG, skip(client, base, token))]
pub(crate) async fn audience(
    client: &HttpClient,
    base: &str,
    token: &Token,
    project_number: &str,
) -> Result<String, Error> {
    let base = base.trim_end_matches('/');
    let uri = format!("{base}/v1/projects/{project_number}/brands");
    let brands = client
        .json::<ListBrandsResponse>(
            &|| empty_request(Method::GET, &uri, [bearer(token)]),
            "list IAP brands",
        )
        .await?
        .brands;

    debug!(count = brands.len(), "listed IAP brands");
    for brand in brands {
        if let Some(found) = find_client(client, base, token, &brand.name).await? {
            let audience = client_id(&found.name).to_owned();
            debug!(brand = %brand.name, %audience, "found IAP App Engine client");
            return Ok(audience);
        }
    }

    Err(Error::EntityNotFound(format!(
        "OAuth client {APP_ENGINE_CLIENT:?} for project {project_number}"
    )))
}

/// Page through the clients of `brand` looking for [`APP_ENGINE_CLIENT`]
async fn find_client(
    client: &HttpClient,
    base: &str,
    token: &Token,
    brand: &str,
) -> Result<Option<OAuthClient>, Error> {
    let mut page_token: Option<String> = None;
    loop {
        let mut uri = format!("{base}/v1/{brand}/identityAwareProxyClients");
        if let Some(page_token) = &page_token {
            uri.push('?');
            uri.push_str(
                &form_urlencoded::Serializer::new(String::new())
                    .append_pair("pageToken", page_token)
                    .finish(),
            );
        }

        let page = client
            .json::<ListClientsResponse>(
                &|| empty_request(Method::GET, &uri, [bearer(token)]),
                "list IAP OAuth clients",
            )
            .await?;

        if let Some(found) = page
            .identity_aware_proxy_clients
            .into_iter()
            .find(|c| c.display_name == APP_ENGINE_CLIENT)
        {
            return Ok(Some(found));
        }

        match page.next_page_token {
            Some(next) if !next.is_empty() => page_token = Some(next),
            _ => return Ok(None),
        }
    }
}

/// The trailing segment of a client resource name, which is the OAuth client ID
fn client_id(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[derive(Deserialize)]
struct ListBrandsResponse {
    #[serde(default)]
    brands: Vec<Brand>,
}

#[derive(Deserialize)]
struct Brand {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListClientsResponse {
    #[serde(default)]
    identity_aware_proxy_clients: Vec<OAuthClient>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthClient {
    name: String,
    #[serde(default)]
    display_name: String,
}
