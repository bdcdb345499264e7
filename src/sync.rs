//! Panel-to-ledger reconciliation.
//!
//! Pages through every panel account, merges each one in its own
//! transaction, then retires local identities the panel no longer knows.
//! A failed page fetch stops the run before the second pass: retiring
//! against a partial account list would deactivate live subscriptions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::engine::{MergeOutcome, SkipReason, SubscriptionEngine};
use crate::error::LedgerError;
use crate::ledger::Ledger;
use crate::models::{SyncState, SyncStatus};
use crate::notify::{Notification, Notifier};
use crate::panel::PanelUser;

pub const MAX_RECORDED_ERRORS: usize = 100;
pub const MAX_DETAILS_LEN: usize = 1000;
const ERRORS_IN_DETAILS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a reconciliation run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub state: SyncState,
    pub started_at: DateTime<Utc>,
    pub users_processed: usize,
    pub users_synced: usize,
    pub subscriptions_synced: usize,
    pub deactivated: u64,
    pub error_count: usize,
    /// First [`MAX_RECORDED_ERRORS`] error messages.
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        SyncReport {
            state: SyncState::Success,
            started_at,
            users_processed: 0,
            users_synced: 0,
            subscriptions_synced: 0,
            deactivated: 0,
            error_count: 0,
            errors: Vec::new(),
        }
    }

    fn record_error(&mut self, message: String) {
        warn!("Sync: {}", message);
        self.error_count += 1;
        if self.errors.len() < MAX_RECORDED_ERRORS {
            self.errors.push(message);
        }
    }

    pub fn details(&self) -> String {
        let mut details = format!(
            "Processed {} users. Synced {} subscriptions.",
            self.users_processed, self.subscriptions_synced
        );
        if self.error_count > 0 {
            let first: Vec<&str> = self
                .errors
                .iter()
                .take(ERRORS_IN_DETAILS)
                .map(String::as_str)
                .collect();
            details.push_str(&format!(
                " Errors: {}. First errors: {}",
                self.error_count,
                first.join("; ")
            ));
        }
        truncate(&details, MAX_DETAILS_LEN)
    }

    pub fn to_status(&self) -> SyncStatus {
        SyncStatus {
            last_sync_time: self.started_at,
            status: self.state.as_str().to_string(),
            details: self.details(),
            users_processed: clamp_i32(self.users_processed),
            subscriptions_synced: clamp_i32(self.subscriptions_synced),
        }
    }
}

fn clamp_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

pub struct ReconciliationJob {
    ledger: Arc<dyn Ledger>,
    engine: SubscriptionEngine,
    notifier: Arc<dyn Notifier>,
    page_size: usize,
    page_delay: Duration,
    running: Mutex<()>,
}

impl ReconciliationJob {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        engine: SubscriptionEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let page_size = engine.settings().panel_page_size.max(1);
        let page_delay = engine.settings().panel_page_delay;
        ReconciliationJob {
            ledger,
            engine,
            notifier,
            page_size,
            page_delay,
            running: Mutex::new(()),
        }
    }

    /// Runs one full reconciliation and persists its summary. Concurrent
    /// calls are refused rather than queued.
    pub async fn run(&self) -> Result<SyncReport, SyncError> {
        let _running = self.running.try_lock().map_err(|_| SyncError::AlreadyRunning)?;

        let now = Utc::now();
        let mut report = SyncReport::new(now);
        let mut remote_identities = HashSet::new();
        info!("Sync started (page size {})", self.page_size);

        let mut start = 0;
        let complete = loop {
            let page = match self.engine.panel().list_users(start, self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    report.record_error(format!(
                        "Failed to fetch panel users at offset {}: {}",
                        start, e
                    ));
                    break false;
                }
            };
            let fetched = page.len();
            debug!("Sync: fetched {} panel accounts at offset {}", fetched, start);

            for remote in &page {
                report.users_processed += 1;
                if let Some(uuid) = remote.uuid.as_deref().filter(|u| !u.is_empty()) {
                    remote_identities.insert(uuid.to_string());
                }
                self.merge_one(remote, now, &mut report).await;
            }

            if fetched < self.page_size {
                break true;
            }
            start += fetched;
            tokio::time::sleep(self.page_delay).await;
        };

        if !complete {
            report.state = SyncState::Failed;
        } else if remote_identities.is_empty() {
            warn!("Sync: panel returned no accounts; skipping retirement pass");
        } else if let Err(e) = self.retire_missing(&remote_identities, &mut report).await {
            report.record_error(format!("Retirement pass failed: {}", e));
        }

        if report.state != SyncState::Failed && report.error_count > 0 {
            report.state = SyncState::PartialSuccess;
        }

        let mut tx = self.ledger.begin().await?;
        tx.save_sync_status(&report.to_status()).await?;
        tx.commit().await?;

        info!(
            "Sync finished ({}): {} Deactivated {} subscriptions.",
            report.state.as_str(),
            report.details(),
            report.deactivated
        );
        Ok(report)
    }

    /// Last persisted summary, if any run has completed.
    pub async fn latest_status(&self) -> Result<Option<SyncStatus>, LedgerError> {
        let mut tx = self.ledger.begin().await?;
        let status = tx.sync_status().await?;
        tx.rollback().await?;
        Ok(status)
    }

    /// Runs the job on a fixed interval until the process exits.
    pub async fn run_periodically(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match self.run().await {
                Ok(_) => {}
                Err(SyncError::AlreadyRunning) => info!("Sync skipped: previous run still active"),
                Err(e) => error!("Sync run failed: {}", e),
            }
        }
    }

    async fn merge_one(&self, remote: &PanelUser, now: DateTime<Utc>, report: &mut SyncReport) {
        let label = format!(
            "panel account {} (telegram id {})",
            remote.uuid.as_deref().unwrap_or("?"),
            remote
                .telegram_id
                .map_or_else(|| "none".to_string(), |id| id.to_string())
        );

        let mut tx = match self.ledger.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                report.record_error(format!("{}: cannot open transaction: {}", label, e));
                return;
            }
        };

        let outcome = match self.engine.merge_remote_account(tx.as_mut(), remote, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    error!("Sync: rollback for {} failed: {}", label, rb);
                }
                report.record_error(format!("{}: {}", label, e));
                return;
            }
        };

        let keep = match &outcome {
            MergeOutcome::Synced { .. } | MergeOutcome::Retired { .. } => true,
            MergeOutcome::Skipped(SkipReason::MissingExpiry) => true,
            MergeOutcome::Skipped(SkipReason::BadDate(_)) => true,
            MergeOutcome::Skipped(_) | MergeOutcome::Conflict { .. } => false,
        };
        let finished = if keep {
            tx.commit().await
        } else {
            tx.rollback().await
        };
        if let Err(e) = finished {
            report.record_error(format!("{}: {}", label, e));
            return;
        }

        match outcome {
            MergeOutcome::Synced { .. } => {
                report.users_synced += 1;
                report.subscriptions_synced += 1;
            }
            MergeOutcome::Retired { .. } => report.users_synced += 1,
            MergeOutcome::Conflict {
                panel_identity,
                owner,
            } => {
                let message = format!(
                    "{}: identity {} already linked to local user {}",
                    label, panel_identity, owner
                );
                self.notifier
                    .notify(&Notification::AdminAlert {
                        message: format!("Sync conflict: {}", message),
                    })
                    .await;
                report.record_error(message);
            }
            MergeOutcome::Skipped(SkipReason::NoTelegramId) => {
                debug!("Sync: {} has no telegram id; skipped", label);
            }
            MergeOutcome::Skipped(SkipReason::MissingExpiry) => {
                warn!("Sync: {} has a subscription link but no expiry; skipped", label);
            }
            MergeOutcome::Skipped(SkipReason::NoPanelIdentity) => {
                report.record_error(format!("{}: missing uuid", label));
            }
            MergeOutcome::Skipped(SkipReason::BadDate(e)) => {
                report.record_error(format!("Bad date for {}: {}", label, e));
            }
        }
    }

    async fn retire_missing(
        &self,
        remote_identities: &HashSet<String>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mut tx = self.ledger.begin().await?;
        let local = tx.users_with_panel_identity().await?;
        for user in local {
            let Some(identity) = user.panel_identity.as_deref() else {
                continue;
            };
            if remote_identities.contains(identity) {
                continue;
            }
            match self.engine.retire_identity(tx.as_mut(), identity).await {
                Ok(n) => {
                    if n > 0 {
                        info!(
                            "Sync: user {} lost panel identity {}; {} subscription(s) deactivated",
                            user.user_id, identity, n
                        );
                    }
                    report.deactivated += n;
                }
                Err(e) => {
                    tx.rollback().await?;
                    report.deactivated = 0;
                    report.record_error(format!(
                        "Retiring identity {} of user {} failed: {}",
                        identity, user.user_id, e
                    ));
                    return Ok(());
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}
