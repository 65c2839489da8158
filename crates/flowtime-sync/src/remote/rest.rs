//! REST implementation of the remote collection contract
//!
//! Speaks a PostgREST-style dialect: equality filters as query parameters,
//! upsert-by-id via `on_conflict` plus a merge-duplicates `Prefer` header.
//! Includes the missing-column shim: when the remote schema lags a client
//! rollout and rejects an unknown field, the payload is resent once with
//! that field stripped instead of surfacing an error.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{RemoteCollection, RemoteFilter, RemoteRow};
use crate::error::{SyncError, SyncResult};

/// REST client for the backend's per-user collections
#[derive(Clone)]
pub struct RestRemote {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl RestRemote {
    /// Create a client for the given endpoint and API key
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> SyncResult<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        Ok(Self {
            base_url,
            api_key: api_key.into(),
            client: reqwest::Client::builder().build()?,
        })
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/{collection}", self.base_url)
    }

    fn query(filter: &RemoteFilter) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if let Some(owner) = &filter.owner {
            params.push(("owner".to_string(), format!("eq.{owner}")));
        }
        if let Some(id) = &filter.id {
            params.push(("id".to_string(), format!("eq.{id}")));
        }
        if let Some(archived) = filter.archived {
            params.push(("archived".to_string(), format!("eq.{archived}")));
        }
        if let Some(order) = &filter.order_by {
            params.push(("order".to_string(), order.clone()));
        }
        params
    }

    async fn send_upsert(
        &self,
        collection: &str,
        rows: &[RemoteRow],
        conflict_key: &str,
    ) -> SyncResult<()> {
        let response = self
            .client
            .post(self.url(collection))
            .query(&[("on_conflict", conflict_key)])
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }
}

#[async_trait]
impl RemoteCollection for RestRemote {
    async fn select(&self, collection: &str, filter: &RemoteFilter) -> SyncResult<Vec<RemoteRow>> {
        let response = self
            .client
            .get(self.url(collection))
            .query(&Self::query(filter))
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn upsert(
        &self,
        collection: &str,
        rows: Vec<RemoteRow>,
        conflict_key: &str,
    ) -> SyncResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        match self.send_upsert(collection, &rows, conflict_key).await {
            Ok(()) => Ok(()),
            Err(SyncError::Api { status: 400, message }) => {
                // Schema drift: retry once with the unknown column stripped.
                let Some(stripped) = strip_missing_column(&rows, &message) else {
                    return Err(SyncError::Api {
                        status: 400,
                        message,
                    });
                };
                tracing::warn!(collection, %message, "remote schema missing column; retrying without it");
                self.send_upsert(collection, &stripped, conflict_key)
                    .await
                    .map_err(|error| SyncError::SchemaDrift(error.to_string()))
            }
            Err(other) => Err(other),
        }
    }

    async fn delete(&self, collection: &str, filter: &RemoteFilter) -> SyncResult<()> {
        // An unfiltered delete would wipe the collection.
        if filter.owner.is_none() && filter.id.is_none() {
            return Err(SyncError::InvalidRequest(
                "refusing unfiltered remote delete".to_string(),
            ));
        }
        let response = self
            .client
            .delete(self.url(collection))
            .query(&Self::query(filter))
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .send()
            .await?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: reqwest::Response) -> SyncResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Api {
        status: status.as_u16(),
        message: parse_api_error(status, &body),
    })
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return message.trim().to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

/// Recovery payload for a schema-drift 400: the rows with the unknown
/// column removed from each, or `None` when the message names no column
/// (an ordinary bad request, not drift)
fn strip_missing_column(rows: &[RemoteRow], message: &str) -> Option<Vec<RemoteRow>> {
    let column = parse_missing_column(message)?;
    Some(
        rows.iter()
            .cloned()
            .map(|mut row| {
                row.remove(&column);
                row
            })
            .collect(),
    )
}

/// Extract the column name from a schema-drift rejection, e.g.
/// `Could not find the 'ambiance' column of 'presets' in the schema cache`
fn parse_missing_column(message: &str) -> Option<String> {
    let marker = "Could not find the '";
    let start = message.find(marker)? + marker.len();
    let rest = &message[start..];
    let end = rest.find('\'')?;
    let column = &rest[..end];
    if column.is_empty() || !rest[end..].contains("column") {
        return None;
    }
    Some(column.to_string())
}

fn normalize_endpoint(raw: String) -> SyncResult<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(SyncError::InvalidRequest(
            "endpoint must not be empty".to_string(),
        ));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(SyncError::InvalidRequest(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}
