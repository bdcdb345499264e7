use chrono::{Duration, Utc};
use log::{error, info, warn};

use super::SubscriptionEngine;
use crate::error::EngineError;
use crate::ledger::LedgerTx;
use crate::models::User;
use crate::panel::{
    format_panel_time, NewPanelUser, PanelError, PanelUser, PanelUserUpdate, ACTIVE_STATUS,
};

/// The panel account a local user is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelLink {
    pub panel_identity: String,
    pub subscription_link: String,
    pub short_id: Option<String>,
    pub subscription_url: Option<String>,
}

/// Username given to panel accounts created for a telegram user.
pub fn panel_username(user_id: i64) -> String {
    format!("tg_{}", user_id)
}

impl SubscriptionEngine {
    /// Finds or creates the panel account for `user` and links it locally.
    ///
    /// Lookup order: by telegram id, then by the stored panel identity, then
    /// create `tg_<id>` (falling back to a username lookup when the panel
    /// reports the name as taken). An identity already owned by another
    /// local user is a [`EngineError::Conflict`].
    pub async fn resolve_panel_account(
        &self,
        tx: &mut dyn LedgerTx,
        user: &User,
    ) -> Result<PanelLink, EngineError> {
        let user_id = user.user_id;

        let mut by_telegram = self.panel.users_by_telegram_id(user_id).await?;
        if by_telegram.len() > 1 {
            error!(
                "{} panel accounts carry telegram id {}; manual intervention needed",
                by_telegram.len(),
                user_id
            );
            return Err(EngineError::AmbiguousPanelAccount {
                user_id,
                count: by_telegram.len(),
            });
        }

        let mut remote = by_telegram.pop();
        if remote.is_none() {
            if let Some(identity) = user.panel_identity.as_deref() {
                remote = self.panel.get_user(identity).await?;
                if remote.is_none() {
                    warn!(
                        "Panel identity {} of user {} is unknown to the panel; creating a new account",
                        identity, user_id
                    );
                }
            }
        }
        let remote = match remote {
            Some(remote) => remote,
            None => self.create_panel_account(user_id).await?,
        };

        let identity = remote
            .uuid
            .clone()
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| PanelError::Decode(format!("panel account for {} has no uuid", user_id)))?;

        if user.panel_identity.as_deref() != Some(identity.as_str()) {
            if let Some(owner) = tx.user_by_panel_identity(&identity).await? {
                if owner.user_id != user_id {
                    error!(
                        "Panel identity {} resolved for user {} is already linked to user {}",
                        identity, user_id, owner.user_id
                    );
                    return Err(EngineError::Conflict {
                        panel_identity: identity,
                        owner: owner.user_id,
                        requester: user_id,
                    });
                }
            }
            if let Some(previous) = user.panel_identity.as_deref() {
                warn!(
                    "Relinking user {} from panel identity {} to {}",
                    user_id, previous, identity
                );
            }
            tx.set_panel_identity(user_id, Some(&identity)).await?;
        }

        if remote.telegram_id != Some(user_id) {
            let mut update = PanelUserUpdate::new(identity.clone());
            update.telegram_id = Some(user_id);
            if let Err(e) = self.panel.update_user(&update).await {
                warn!("Could not set telegram id {} on panel account {}: {}", user_id, identity, e);
            }
        }

        let subscription_link = remote
            .subscription_link()
            .map(str::to_string)
            .ok_or_else(|| {
                PanelError::Decode(format!("panel account {} has no subscription link", identity))
            })?;

        Ok(PanelLink {
            panel_identity: identity,
            subscription_link,
            short_id: remote.short_uuid.clone(),
            subscription_url: remote.subscription_url.clone(),
        })
    }

    async fn create_panel_account(&self, user_id: i64) -> Result<PanelUser, EngineError> {
        let username = panel_username(user_id);
        let new_user = NewPanelUser {
            username: username.clone(),
            status: ACTIVE_STATUS.to_string(),
            // placeholder expiry; the activation push sets the real one
            expire_at: format_panel_time(Utc::now() + Duration::days(1)),
            traffic_limit_strategy: self.settings.user_traffic_strategy.clone(),
            traffic_limit_bytes: self.settings.user_traffic_limit_bytes(),
            telegram_id: Some(user_id),
            active_internal_squads: self.settings.user_squad_uuids.clone(),
        };

        match self.panel.create_user(&new_user).await {
            Ok(created) => {
                info!("Created panel account {} ({:?})", username, created.uuid);
                Ok(created)
            }
            Err(e) if e.is_duplicate_username() => {
                warn!("Panel username {} already exists; looking it up", username);
                self.panel
                    .user_by_username(&username)
                    .await?
                    .ok_or_else(|| {
                        EngineError::TransientUpstream(PanelError::Decode(format!(
                            "panel reported {} as taken but cannot find it",
                            username
                        )))
                    })
            }
            Err(e) => Err(e.into()),
        }
    }
}
