use crate::panel::PanelError;

/// Failures of the local store.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("constraint violated: {0}")]
    Constraint(String),
}

/// Infrastructure and integrity failures of the subscription engine.
///
/// Business outcomes (ineligible trial, nothing to extend, promo already
/// redeemed) are not errors; they are variants of the outcome types in
/// [`crate::engine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A panel identity is claimed by two local users. Never auto-resolved.
    #[error("panel identity {panel_identity} is linked to user {owner}, not {requester}")]
    Conflict {
        panel_identity: String,
        owner: i64,
        requester: i64,
    },

    /// Several panel accounts carry the same telegram id.
    #[error("{count} panel accounts are bound to telegram id {user_id}")]
    AmbiguousPanelAccount { user_id: i64, count: usize },

    #[error("not found: {0}")]
    NotFound(String),

    /// Day count that is not positive or pushes a date past chrono's range.
    #[error("cannot extend a subscription by {0} days")]
    InvalidDays(i64),

    #[error("panel unavailable: {0}")]
    TransientUpstream(#[from] PanelError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::AmbiguousPanelAccount { .. }
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Ledger(LedgerError::Database(e))
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
