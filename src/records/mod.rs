//! Boundary to the remote record service.
//!
//! The record store is an external HTTP service with two collections used
//! here: session-artifact fragments (small text records, paginated) and the
//! group rosters produced by scans. Provisioning of its schema/permissions
//! happens elsewhere; this module only consumes it.

pub mod http;

pub use http::HttpRecordService;

use crate::client::Member;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One chunk of the compressed, base64-encoded session artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFragment {
    pub session_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: String,
    pub compressed: bool,
    pub active: bool,
    pub timestamp: DateTime<Utc>,
}

/// A fragment as stored, with the record id the service assigned to it.
#[derive(Debug, Clone)]
pub struct StoredFragment {
    pub record_id: String,
    pub fragment: SessionFragment,
}

/// One page of a fragment listing. `next_offset` is an opaque continuation
/// token; `None` means the listing is exhausted.
#[derive(Debug, Default)]
pub struct FragmentPage {
    pub fragments: Vec<StoredFragment>,
    pub next_offset: Option<String>,
}

#[async_trait]
pub trait RecordService: Send + Sync {
    /// List fragments for a session, sorted by chunk index, one page at a
    /// time. `only_active` restricts the listing to the current generation.
    async fn list_fragments(
        &self,
        session_id: &str,
        only_active: bool,
        offset: Option<&str>,
    ) -> anyhow::Result<FragmentPage>;

    /// Store one fragment; returns the record id assigned by the service.
    async fn create_fragment(&self, fragment: &SessionFragment) -> anyhow::Result<String>;

    async fn delete_fragment(&self, record_id: &str) -> anyhow::Result<()>;

    /// Upsert the roster scanned for one group.
    async fn record_group_scan(&self, group_name: &str, members: &[Member])
    -> anyhow::Result<()>;
}
