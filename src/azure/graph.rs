use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::azure::auth::AccessToken;

/// Directory user as exposed by the HR API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
    /// Group display names, in the order Graph returned the memberships.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Payload accepted by `POST /api/users`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewUser {
    pub display_name: String,
    pub user_principal_name: String,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
    /// Stored as the Graph `jobTitle`.
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl NewUser {
    fn mail_nickname(&self) -> String {
        self.user_principal_name
            .split('@')
            .next()
            .unwrap_or(&self.user_principal_name)
            .to_string()
    }

    fn to_graph_body(&self) -> serde_json::Value {
        let mut body = json!({
            "accountEnabled": true,
            "displayName": self.display_name,
            "userPrincipalName": self.user_principal_name,
            "mailNickname": self.mail_nickname(),
            "givenName": self.given_name,
            "surname": self.surname,
            "jobTitle": self.role,
        });
        if let Some(password) = &self.password {
            body["passwordProfile"] = json!({
                "forceChangePasswordNextSignIn": true,
                "password": password,
            });
        }
        body
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("error calling directory API ({context}): {message}")]
    Request { context: String, message: String },
    #[error("error decoding directory response ({context}): {message}")]
    Decode { context: String, message: String },
    #[error("directory API returned {status} ({context}): {body}")]
    Status {
        context: String,
        status: StatusCode,
        body: String,
    },
    #[error("invalid directory URL: {0}")]
    InvalidUrl(String),
    #[error("invalid user id '{0}'")]
    InvalidId(String),
    #[error("failed to delete user {id}: unexpected status {status}")]
    DeleteFailed {
        id: String,
        status: StatusCode,
        body: String,
    },
    #[error("failed to create user {upn}: unexpected status {status}")]
    CreateFailed {
        upn: String,
        status: StatusCode,
        body: String,
    },
}

#[derive(Debug, Deserialize)]
struct UserPage {
    #[serde(default)]
    value: Vec<User>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Membership {
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MembershipPage {
    #[serde(default)]
    value: Vec<Membership>,
}

/// Microsoft Graph client for the user directory.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    base_url: String,
    role_concurrency: usize,
    http_client: Client,
}

impl DirectoryClient {
    pub fn new(http_client: Client, base_url: &str, role_concurrency: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            role_concurrency: role_concurrency.max(1),
            http_client,
        }
    }

    /// `{base}/v1.0/users` followed by `segments`, each percent-encoded as a
    /// single path segment.
    fn users_url(&self, segments: &[&str]) -> Result<Url, GraphError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| GraphError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GraphError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["v1.0", "users"])
            .extend(segments);
        Ok(url)
    }

    fn user_url(&self, id: &str, tail: &[&str]) -> Result<Url, GraphError> {
        // "." and ".." would be dropped as segments and address the collection
        if id.is_empty() || id == "." || id == ".." {
            return Err(GraphError::InvalidId(id.to_string()));
        }
        let mut segments = vec![id];
        segments.extend_from_slice(tail);
        self.users_url(&segments)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        token: &AccessToken,
        context: &str,
    ) -> Result<T, GraphError> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(token.bearer())
            .send()
            .await
            .map_err(|e| GraphError::Request {
                context: context.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Status {
                context: context.to_string(),
                status,
                body,
            });
        }

        response.json().await.map_err(|e| GraphError::Decode {
            context: context.to_string(),
            message: e.to_string(),
        })
    }

    /// List users from the first page of `/v1.0/users`, each enriched with roles.
    ///
    /// Fails as a whole if any single role lookup fails. The result keeps the
    /// order of the listing response.
    pub async fn list_users(&self, token: &AccessToken) -> Result<Vec<User>, GraphError> {
        let page: UserPage = self
            .get_json(self.users_url(&[])?, token, "list users")
            .await?;

        if page.next_link.is_some() {
            debug!("directory returned more pages; only the first page is listed");
        }

        let users = futures::stream::iter(page.value)
            .map(|mut user| async move {
                user.roles = self.fetch_user_roles(token, &user.id).await?;
                Ok::<_, GraphError>(user)
            })
            .buffered(self.role_concurrency)
            .try_collect::<Vec<_>>()
            .await?;

        info!(count = users.len(), "listed directory users");
        Ok(users)
    }

    /// Display names of the groups the user is a member of, in upstream order.
    pub async fn fetch_user_roles(
        &self,
        token: &AccessToken,
        user_id: &str,
    ) -> Result<Vec<String>, GraphError> {
        let url = self.user_url(user_id, &["memberOf"])?;
        let context = format!("roles for user {}", user_id);
        let page: MembershipPage = self.get_json(url, token, &context).await?;

        // one entry per membership; objects without a display name map to ""
        Ok(page
            .value
            .into_iter()
            .map(|m| m.display_name.unwrap_or_default())
            .collect())
    }

    /// Delete a user. Only `204 No Content` counts as success.
    pub async fn delete_user(&self, token: &AccessToken, user_id: &str) -> Result<(), GraphError> {
        let response = self
            .http_client
            .delete(self.user_url(user_id, &[])?)
            .bearer_auth(token.bearer())
            .send()
            .await
            .map_err(|e| GraphError::Request {
                context: format!("delete user {}", user_id),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::NO_CONTENT {
            let body = response.text().await.unwrap_or_default();
            warn!(user_id = %user_id, status = %status, "directory rejected delete");
            return Err(GraphError::DeleteFailed {
                id: user_id.to_string(),
                status,
                body,
            });
        }

        info!(user_id = %user_id, "user deleted");
        Ok(())
    }

    /// Create a user. Only `201 Created` counts as success.
    pub async fn create_user(&self, token: &AccessToken, new_user: &NewUser) -> Result<(), GraphError> {
        let response = self
            .http_client
            .post(self.users_url(&[])?)
            .bearer_auth(token.bearer())
            .json(&new_user.to_graph_body())
            .send()
            .await
            .map_err(|e| GraphError::Request {
                context: "create user".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(upn = %new_user.user_principal_name, status = %status, "directory rejected create");
            return Err(GraphError::CreateFailed {
                upn: new_user.user_principal_name.clone(),
                status,
                body,
            });
        }

        info!(upn = %new_user.user_principal_name, "user created");
        Ok(())
    }
}
