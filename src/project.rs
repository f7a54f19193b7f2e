use http::{Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, Level};

use crate::types::{bearer, empty_request, HttpClient, Token};
use crate::Error;

/// A GCP project as identified by both its ID and its number
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    /// Project ID, such as `my-project`
    pub id: String,
    /// Numeric project number, as a string
    pub number: String,
}

impl Project {
    /// Look up the project number for `project_id` in Cloud Resource Manager
    ///
    /// https://cloud.google.com/resource-manager/reference/rest/v1/projects/get
    #[instrument(level = Level::DEBUG, skip(client, base, token))]
    pub(crate) async fn resolve(
        client: &HttpClient,
        base: &str,
        token: &Token,
        project_id: &str,
    ) -> Result<Self, Error> {
        let uri = format!("{}/v1/projects/{project_id}", base.trim_end_matches('/'));
        let response = client
            .json::<ProjectResponse>(
                &|| empty_request(Method::GET, &uri, [bearer(token)]),
                "get project",
            )
            .await;

        let number = match response {
            Ok(ProjectResponse {
                project_number: Some(number),
            }) if !number.is_empty() => number,
            Ok(_) => {
                return Err(Error::EntityNotFound(format!(
                    "project number for project {project_id}"
                )))
            }
            Err(Error::Status(_, StatusCode::NOT_FOUND)) => {
                return Err(Error::EntityNotFound(format!("project {project_id}")))
            }
            Err(err) => return Err(err),
        };

        debug!(%number, "resolved project number");
        Ok(Self {
            id: project_id.to_owned(),
            number,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    project_number: Option<String>,
}
