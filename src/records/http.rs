//! REST client for the remote record service.

use super::{FragmentPage, RecordService, SessionFragment, StoredFragment};
use crate::client::Member;
use crate::config::RecordsConfig;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RecordEnvelope {
    id: String,
    fields: SessionFragment,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<RecordEnvelope>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct RosterUpload<'a> {
    members: &'a [Member],
    scanned_at: chrono::DateTime<Utc>,
}

pub struct HttpRecordService {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRecordService {
    pub fn new(config: &RecordsConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client for the record service")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        req
    }

    async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("{what} failed with {status}: {body}"))
    }
}

#[async_trait]
impl RecordService for HttpRecordService {
    async fn list_fragments(
        &self,
        session_id: &str,
        only_active: bool,
        offset: Option<&str>,
    ) -> Result<FragmentPage> {
        let mut req = self
            .request(reqwest::Method::GET, format!("{}/fragments", self.base_url))
            .query(&[("session_id", session_id), ("sort", "chunk_index")]);
        if only_active {
            req = req.query(&[("active", "true")]);
        }
        if let Some(offset) = offset {
            req = req.query(&[("offset", offset)]);
        }

        let resp = req.send().await.context("Record service is unreachable")?;
        let resp = Self::ensure_success(resp, "Fragment listing").await?;
        let body: ListResponse = resp.json().await.context("Malformed fragment listing")?;

        Ok(FragmentPage {
            fragments: body
                .records
                .into_iter()
                .map(|r| StoredFragment {
                    record_id: r.id,
                    fragment: r.fields,
                })
                .collect(),
            next_offset: body.offset,
        })
    }

    async fn create_fragment(&self, fragment: &SessionFragment) -> Result<String> {
        let resp = self
            .request(reqwest::Method::POST, format!("{}/fragments", self.base_url))
            .json(&serde_json::json!({ "fields": fragment }))
            .send()
            .await
            .context("Record service is unreachable")?;
        let resp = Self::ensure_success(resp, "Fragment write").await?;
        let body: CreateResponse = resp.json().await.context("Malformed create response")?;
        Ok(body.id)
    }

    async fn delete_fragment(&self, record_id: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                format!("{}/fragments/{record_id}", self.base_url),
            )
            .send()
            .await
            .context("Record service is unreachable")?;
        Self::ensure_success(resp, "Fragment delete").await?;
        Ok(())
    }

    async fn record_group_scan(&self, group_name: &str, members: &[Member]) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::PUT,
                format!(
                    "{}/rosters/{}",
                    self.base_url,
                    urlencoding::encode(group_name)
                ),
            )
            .json(&RosterUpload {
                members,
                scanned_at: Utc::now(),
            })
            .send()
            .await
            .context("Record service is unreachable")?;
        Self::ensure_success(resp, "Roster upload").await?;
        Ok(())
    }
}
