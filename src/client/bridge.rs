//! HTTP bridge to the browser-automation sidecar.
//!
//! The sidecar owns the actual browser and the messaging web client; this
//! module is a thin typed client over its REST surface plus a polling pump
//! that turns its event feed into [`ClientEvent`] broadcasts.

use super::types::{Chat, Member, RawChat, RawParticipant};
use super::{AutomationClient, ClientEvent};
use crate::config::ClientConfig;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Serialize)]
struct InitRequest<'a> {
    backend: &'a str,
    headless: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportResponse {
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    seq: u64,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    payload: Option<String>,
}

impl RawEvent {
    fn into_event(self) -> Option<ClientEvent> {
        match self.kind.as_str() {
            "qr" => Some(ClientEvent::Qr(self.payload.unwrap_or_default())),
            "authenticated" => Some(ClientEvent::Authenticated),
            "ready" => Some(ClientEvent::Ready),
            "auth_failure" => Some(ClientEvent::AuthFailure(
                self.payload.unwrap_or_else(|| "unknown reason".into()),
            )),
            "disconnected" => Some(ClientEvent::Disconnected(
                self.payload.unwrap_or_else(|| "unknown reason".into()),
            )),
            other => {
                tracing::debug!(kind = other, seq = self.seq, "ignoring unknown sidecar event");
                None
            }
        }
    }
}

pub struct BridgeClient {
    config: ClientConfig,
    http: reqwest::Client,
    base_url: String,
    events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build HTTP client for the automation bridge")?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let base_url = config.endpoint.trim_end_matches('/').to_string();

        Ok(Self {
            config,
            http,
            base_url,
            events,
            pump: Mutex::new(None),
        })
    }

    async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(anyhow!("{what} failed with {status}: {body}"))
    }

    fn spawn_event_pump(&self) {
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let events = self.events.clone();
        let interval = self.config.event_poll_interval();

        let handle = tokio::spawn(async move {
            let mut cursor = 0u64;
            loop {
                match poll_events(&http, &base_url, cursor).await {
                    Ok(batch) => {
                        for raw in batch {
                            cursor = cursor.max(raw.seq);
                            if let Some(event) = raw.into_event() {
                                // Send fails only when nobody listens yet.
                                let _ = events.send(event);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!("sidecar event feed poll failed: {e}");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        if let Some(old) = self.pump.lock().replace(handle) {
            old.abort();
        }
    }

    fn stop_event_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

async fn poll_events(
    http: &reqwest::Client,
    base_url: &str,
    after: u64,
) -> Result<Vec<RawEvent>> {
    let resp = http
        .get(format!("{base_url}/session/events"))
        .query(&[("after", after)])
        .send()
        .await?;
    let resp = BridgeClient::ensure_success(resp, "Event feed poll").await?;
    Ok(resp.json().await?)
}

#[async_trait]
impl AutomationClient for BridgeClient {
    async fn initialize(&self, restored: Option<&[u8]>) -> Result<()> {
        let body = InitRequest {
            backend: &self.config.backend,
            headless: self.config.headless,
            session: restored.map(|blob| BASE64.encode(blob)),
        };
        let resp = self
            .http
            .post(format!("{}/session/init", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Automation sidecar is unreachable")?;
        Self::ensure_success(resp, "Session init").await?;

        self.spawn_event_pump();
        tracing::info!(
            backend = %self.config.backend,
            restored = restored.is_some(),
            "automation client started"
        );
        Ok(())
    }

    async fn get_chats(&self) -> Result<Vec<Chat>> {
        let resp = self
            .http
            .get(format!("{}/chats", self.base_url))
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "Chat listing").await?;
        let raw: Vec<RawChat> = resp.json().await.context("Malformed chat listing")?;
        Ok(raw.into_iter().filter_map(RawChat::into_chat).collect())
    }

    async fn get_group_members(&self, chat_id: &str) -> Result<Vec<Member>> {
        let resp = self
            .http
            .get(format!("{}/chats/{chat_id}/members", self.base_url))
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "Membership fetch").await?;
        let raw: Vec<RawParticipant> = resp.json().await.context("Malformed member listing")?;
        let joined = Utc::now();
        Ok(raw
            .into_iter()
            .filter_map(|p| p.into_member(joined))
            .collect())
    }

    async fn export_session(&self) -> Result<Option<Vec<u8>>> {
        let resp = self
            .http
            .get(format!("{}/session/export", self.base_url))
            .send()
            .await?;
        let resp = Self::ensure_success(resp, "Session export").await?;
        let body: ExportResponse = resp.json().await.context("Malformed export response")?;
        match body.session {
            Some(encoded) => {
                let blob = BASE64
                    .decode(encoded.trim())
                    .context("Exported session artifact is not valid base64")?;
                Ok(Some(blob))
            }
            None => Ok(None),
        }
    }

    async fn logout(&self) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/session/logout", self.base_url))
            .send()
            .await?;
        Self::ensure_success(resp, "Remote logout").await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.stop_event_pump();
        let resp = self
            .http
            .post(format!("{}/session/destroy", self.base_url))
            .send()
            .await?;
        Self::ensure_success(resp, "Session teardown").await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(server: &MockServer) -> BridgeClient {
        BridgeClient::new(ClientConfig {
            endpoint: server.uri(),
            event_poll_ms: 10,
            ..ClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn initialize_forwards_backend_and_restored_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/init"))
            .and(body_partial_json(serde_json::json!({
                "backend": "chromium",
                "headless": true,
                "session": BASE64.encode(b"artifact"),
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        client.initialize(Some(b"artifact")).await.unwrap();
    }

    #[tokio::test]
    async fn initialize_surfaces_sidecar_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/init"))
            .respond_with(ResponseTemplate::new(500).set_body_string("browser crashed"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.initialize(None).await.expect_err("init should fail");
        assert!(err.to_string().contains("browser crashed"));
    }

    #[tokio::test]
    async fn get_chats_coerces_and_drops_malformed_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": "g1@chat", "name": "Team Alpha", "isGroup": true},
                {"name": "no id, dropped"},
                {"id": "c1@chat", "name": "Direct", "isGroup": false},
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let chats = client.get_chats().await.unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].name, "Team Alpha");
        assert!(chats[0].is_group);
        assert!(!chats[1].is_group);
    }

    #[tokio::test]
    async fn get_group_members_normalizes_participants() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/chats/g1@chat/members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"phone": "+111", "name": "Ana"},
                {"pushname": "no phone, dropped"},
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let members = client.get_group_members("g1@chat").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].phone_number, "+111");
        assert!(members[0].is_active);
    }

    #[tokio::test]
    async fn export_session_decodes_base64() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/export"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "session": BASE64.encode(b"state bytes"),
            })))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let blob = client.export_session().await.unwrap();
        assert_eq!(blob.as_deref(), Some(&b"state bytes"[..]));
    }

    #[tokio::test]
    async fn export_session_without_artifact_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/export"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let client = test_client(&server);
        assert!(client.export_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn event_pump_broadcasts_feed_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/init"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/events"))
            .and(query_param("after", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"seq": 1, "kind": "qr", "payload": "qr-payload"},
                {"seq": 2, "kind": "bogus"},
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/events"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let mut rx = client.subscribe();
        client.initialize(None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        match event {
            ClientEvent::Qr(payload) => assert_eq!(payload, "qr-payload"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
