//! Boundary to the opaque browser-automation client.
//!
//! The core never talks to the messaging platform directly. Everything goes
//! through [`AutomationClient`], and lifecycle notifications arrive as typed
//! [`ClientEvent`]s on a broadcast channel instead of ad-hoc callbacks.

pub mod bridge;
pub mod types;

pub use types::{Chat, Member};

use crate::config::ClientConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Lifecycle notifications emitted by an automation client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A pairing QR payload is ready to be scanned.
    Qr(String),
    Authenticated,
    /// The web client finished loading after authentication.
    Ready,
    AuthFailure(String),
    Disconnected(String),
}

/// One live handle onto the controlled browser session.
#[async_trait]
pub trait AutomationClient: Send + Sync {
    /// Start the underlying web client, optionally restoring a previously
    /// exported session artifact. Authentication completes asynchronously
    /// via the event stream.
    async fn initialize(&self, restored: Option<&[u8]>) -> anyhow::Result<()>;

    /// List every chat the session can see.
    async fn get_chats(&self) -> anyhow::Result<Vec<Chat>>;

    /// Fetch the membership of one group chat.
    async fn get_group_members(&self, chat_id: &str) -> anyhow::Result<Vec<Member>>;

    /// Export the opaque session artifact, if the client has one.
    async fn export_session(&self) -> anyhow::Result<Option<Vec<u8>>>;

    /// Invalidate the session on the remote platform.
    async fn logout(&self) -> anyhow::Result<()>;

    /// Tear down the browser session and release every resource.
    async fn destroy(&self) -> anyhow::Result<()>;

    /// Subscribe to lifecycle events. Late subscribers only see events
    /// emitted after they subscribe.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}

/// Builds a fresh client handle per initialization attempt, so a failed
/// attempt can be torn down completely before the next one starts.
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Arc<dyn AutomationClient>>;
}

/// Factory for the HTTP bridge client.
pub struct BridgeFactory {
    config: ClientConfig,
}

impl BridgeFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for BridgeFactory {
    fn create(&self) -> anyhow::Result<Arc<dyn AutomationClient>> {
        Ok(Arc::new(bridge::BridgeClient::new(self.config.clone())?))
    }
}
