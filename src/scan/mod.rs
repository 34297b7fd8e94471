//! Bulk group-membership scanning against the live session.
//!
//! One batch fetches the chat list once, then walks the target names one at
//! a time against the single automation-client handle. A slow or failing
//! target costs at most its own per-item budget; its failure is carried in
//! the result map, never thrown at the batch caller.

use crate::client::{AutomationClient, Chat, Member};
use crate::config::ScanConfig;
use crate::error::Error;
use crate::records::RecordService;
use crate::retry::RetryPolicy;
use crate::session::SessionController;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Outcome for one target name.
#[derive(Debug, Clone, Serialize)]
pub struct GroupScanResult {
    pub name: String,
    pub members: Vec<Member>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GroupScanResult {
    fn failed(name: &str, error: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Live progress of the current batch; stays readable as the last-job
/// snapshot once the batch resolves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanProgress {
    pub total: usize,
    pub completed: usize,
    pub successful: usize,
    pub failed: usize,
    pub failed_names: Vec<String>,
}

impl ScanProgress {
    /// 100 exactly when `completed == total` (an empty batch is complete).
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

pub struct ScanOrchestrator {
    session: Arc<SessionController>,
    records: Arc<dyn RecordService>,
    config: ScanConfig,
    scanning: AtomicBool,
    progress: Mutex<ScanProgress>,
    previous_members: Mutex<HashMap<String, Vec<Member>>>,
}

/// Releases the single-flight guard and re-arms the idle auto-close when the
/// batch ends, on every exit path.
struct ScanGuard<'a> {
    orchestrator: &'a ScanOrchestrator,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.scanning.store(false, Ordering::SeqCst);
        self.orchestrator.session.end_activity();
    }
}

impl ScanOrchestrator {
    pub fn new(
        session: Arc<SessionController>,
        records: Arc<dyn RecordService>,
        config: ScanConfig,
    ) -> Self {
        Self {
            session,
            records,
            config,
            scanning: AtomicBool::new(false),
            progress: Mutex::new(ScanProgress::default()),
            previous_members: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> ScanProgress {
        self.progress.lock().clone()
    }

    /// Members seen for a group on its most recent successful scan.
    pub fn previous_members(&self, group_name: &str) -> Option<Vec<Member>> {
        self.previous_members.lock().get(group_name).cloned()
    }

    /// Scan the membership of every named group.
    ///
    /// Rejects immediately when the session is not authenticated or another
    /// batch is already running; everything else is reported per target.
    pub async fn scan_groups(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, GroupScanResult>, Error> {
        if !self.session.is_authenticated() {
            return Err(Error::AuthenticationRequired);
        }
        let client = self.session.client().ok_or(Error::AuthenticationRequired)?;

        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ScanInProgress);
        }
        let _guard = ScanGuard { orchestrator: self };
        self.session.begin_activity();

        *self.progress.lock() = ScanProgress {
            total: names.len(),
            ..ScanProgress::default()
        };

        let mut results = HashMap::new();
        if names.is_empty() {
            return Ok(results);
        }

        let job = Uuid::new_v4();
        tracing::info!(job = %job, targets = names.len(), "group scan started");

        // One chat listing per batch; every target resolves against it.
        let groups: Vec<Chat> = match client.get_chats().await {
            Ok(chats) => chats.into_iter().filter(|c| c.is_group).collect(),
            Err(e) => {
                tracing::error!(job = %job, "chat listing failed: {e}");
                let reason = format!("chat listing failed: {e}");
                for name in names {
                    let result = GroupScanResult::failed(name, reason.clone());
                    self.note_completed(&result);
                    results.insert(name.clone(), result);
                }
                return Ok(results);
            }
        };
        tracing::debug!(job = %job, groups = groups.len(), "chat list fetched");

        for name in names {
            let result = self.scan_one(&client, &groups, name).await;
            self.note_completed(&result);

            if result.success {
                self.previous_members
                    .lock()
                    .insert(name.clone(), result.members.clone());
                // Forwarding is best-effort; the scan result stands either way.
                if let Err(e) = self.records.record_group_scan(name, &result.members).await {
                    tracing::warn!(job = %job, group = %name, "roster upload failed: {e}");
                }
            }

            results.insert(name.clone(), result);
        }

        let progress = self.progress();
        tracing::info!(
            job = %job,
            successful = progress.successful,
            failed = progress.failed,
            "group scan finished"
        );
        Ok(results)
    }

    async fn scan_one(
        &self,
        client: &Arc<dyn AutomationClient>,
        groups: &[Chat],
        name: &str,
    ) -> GroupScanResult {
        // Resolution is local; an unresolved name costs no network round trip.
        let Some(chat) = resolve_target(groups, name) else {
            tracing::debug!(group = %name, "no group chat matches this name");
            return GroupScanResult::failed(name, "no group chat matches this name");
        };

        let policy = RetryPolicy::fixed(self.config.max_retries, self.config.retry_delay());
        let attempts = policy.run("group membership fetch", || {
            let client = Arc::clone(client);
            let chat_id = chat.id.clone();
            async move { client.get_group_members(&chat_id).await }
        });

        match tokio::time::timeout(self.config.per_item_timeout(), attempts).await {
            Ok(Ok(members)) => {
                tracing::debug!(group = %name, members = members.len(), "membership fetched");
                GroupScanResult {
                    name: name.to_string(),
                    members,
                    success: true,
                    error: None,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(group = %name, "membership fetch failed: {e:#}");
                GroupScanResult::failed(name, format!("{e:#}"))
            }
            Err(_) => {
                let budget = self.config.per_item_timeout_secs;
                tracing::warn!(group = %name, budget_secs = budget, "membership fetch timed out");
                GroupScanResult::failed(
                    name,
                    format!("membership fetch timed out after {budget}s"),
                )
            }
        }
    }

    fn note_completed(&self, result: &GroupScanResult) {
        let mut progress = self.progress.lock();
        progress.completed += 1;
        if result.success {
            progress.successful += 1;
        } else {
            progress.failed += 1;
            progress.failed_names.push(result.name.clone());
        }
    }
}

/// Exact case-insensitive match first, then substring containment.
fn resolve_target<'a>(groups: &'a [Chat], name: &str) -> Option<&'a Chat> {
    let needle = name.trim().to_lowercase();
    groups
        .iter()
        .find(|chat| chat.name.to_lowercase() == needle)
        .or_else(|| {
            groups
                .iter()
                .find(|chat| chat.name.to_lowercase().contains(&needle))
        })
}
