use std::sync::Arc;

use chrono::{Duration, Utc};

use super::*;
use crate::config::Settings;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::testing::{
    panel_account, seed_subscription, seed_user, AutocommitLedger, FakePanel, MemoryLedger,
};

fn engine_with(panel: &Arc<FakePanel>, settings: Settings) -> SubscriptionEngine {
    SubscriptionEngine::new(panel.clone(), Arc::new(settings))
}

fn engine(panel: &Arc<FakePanel>) -> SubscriptionEngine {
    engine_with(panel, Settings::default())
}

fn paid(user_id: i64, months: i32, payment_id: i64) -> PaidActivation {
    PaidActivation {
        user_id,
        months,
        payment_id,
        promo_code_id: None,
        provider: Provider::Yookassa,
    }
}

async fn active_rows(ledger: &MemoryLedger, identity: &str) -> Vec<Subscription> {
    ledger
        .snapshot()
        .await
        .subscriptions
        .into_iter()
        .filter(|s| s.panel_identity == identity && s.is_active)
        .collect()
}

#[tokio::test]
async fn trial_creates_one_row_for_new_user() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let engine = engine(&panel);
    seed_user(&ledger, 1, None, None).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine.activate_trial(tx.as_mut(), 1).await.unwrap();
    tx.commit().await.unwrap();

    let TrialOutcome::Activated(activation) = outcome else {
        panic!("expected activation, got {:?}", outcome);
    };
    let sub = &activation.subscription;
    assert_eq!(sub.end_time - sub.start_time, Duration::days(3));
    assert_eq!(sub.duration_months, 0);
    assert_eq!(sub.status_label.as_deref(), Some(TRIAL_STATUS));
    assert!(activation.subscription_url.is_some());

    let state = ledger.snapshot().await;
    assert_eq!(state.subscriptions.len(), 1);
    assert_eq!(
        state.users[0].panel_identity.as_deref(),
        Some(activation.panel_identity.as_str())
    );

    let panel_state = panel.state();
    assert_eq!(panel_state.created.len(), 1);
    assert_eq!(panel_state.created[0].username, "tg_1");
    let push = panel_state.updates.last().unwrap();
    assert_eq!(push.status.as_deref(), Some("ACTIVE"));
    assert_eq!(push.traffic_limit_bytes, Some(5 * 1024 * 1024 * 1024));
}

#[tokio::test]
async fn trial_is_refused_after_any_previous_subscription() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    seed_subscription(&ledger, 1, "p-1", "link-old", Utc::now() - Duration::days(30))
        .await
        .unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel).activate_trial(tx.as_mut(), 1).await.unwrap();
    assert_eq!(
        outcome,
        TrialOutcome::Ineligible(TrialIneligible::AlreadyHadSubscription)
    );
    assert!(panel.state().created.is_empty());
}

#[tokio::test]
async fn trial_respects_feature_switch_and_unknown_users() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let disabled = engine_with(
        &panel,
        Settings {
            trial_enabled: false,
            ..Settings::default()
        },
    );

    let mut tx = ledger.begin().await.unwrap();
    assert_eq!(
        disabled.activate_trial(tx.as_mut(), 1).await.unwrap(),
        TrialOutcome::Ineligible(TrialIneligible::Disabled)
    );
    assert_eq!(
        engine(&panel).activate_trial(tx.as_mut(), 1).await.unwrap(),
        TrialOutcome::Ineligible(TrialIneligible::UnknownUser)
    );
}

#[tokio::test]
async fn trial_fails_cleanly_when_panel_is_down() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    panel.state().unavailable = true;
    seed_user(&ledger, 1, None, None).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel).activate_trial(tx.as_mut(), 1).await.unwrap();
    tx.rollback().await.unwrap();

    assert!(matches!(outcome, TrialOutcome::Failed(_)));
    assert!(ledger.snapshot().await.subscriptions.is_empty());
}

#[tokio::test]
async fn duplicate_username_reuses_existing_panel_account() {
    let ledger = MemoryLedger::new();
    let mut orphan = panel_account("p-orphan", None, Some("link-o"), "ACTIVE", None);
    orphan.username = Some("tg_1".to_string());
    let panel = Arc::new(FakePanel::with_users(vec![orphan]));
    seed_user(&ledger, 1, None, None).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel).activate_trial(tx.as_mut(), 1).await.unwrap();
    tx.commit().await.unwrap();

    let TrialOutcome::Activated(activation) = outcome else {
        panic!("expected activation, got {:?}", outcome);
    };
    assert_eq!(activation.panel_identity, "p-orphan");
    assert_eq!(activation.subscription.panel_subscription_link, "link-o");
    assert!(panel.state().created.is_empty());
    assert_eq!(panel.user("p-orphan").unwrap().telegram_id, Some(1));
}

#[tokio::test]
async fn extend_stacks_on_a_future_end() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    let old_end = Utc::now() + Duration::days(10);
    seed_subscription(&ledger, 1, "p-1", "link-1", old_end)
        .await
        .unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel)
        .extend(tx.as_mut(), 1, 7, BonusReason::Admin)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let ExtendOutcome::Extended { new_end, .. } = outcome else {
        panic!("expected extension");
    };
    assert_eq!(new_end, old_end + Duration::days(7));
    let row = &active_rows(&ledger, "p-1").await[0];
    assert_eq!(row.end_time, new_end);
    assert_eq!(row.last_notification_sent, None);
}

#[tokio::test]
async fn extend_counts_from_now_when_lapsed() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    seed_subscription(&ledger, 1, "p-1", "link-1", Utc::now() - Duration::days(5))
        .await
        .unwrap();

    let before = Utc::now();
    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel)
        .extend(tx.as_mut(), 1, 7, BonusReason::Admin)
        .await
        .unwrap();
    let after = Utc::now();

    let ExtendOutcome::Extended { new_end, .. } = outcome else {
        panic!("expected extension");
    };
    assert!(new_end >= before + Duration::days(7));
    assert!(new_end <= after + Duration::days(7));
}

#[tokio::test]
async fn extend_rejects_unusable_day_counts() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    let old_end = Utc::now() + Duration::days(10);
    seed_subscription(&ledger, 1, "p-1", "link-1", old_end)
        .await
        .unwrap();
    let engine = engine(&panel);

    let mut tx = ledger.begin().await.unwrap();
    for days in [0i64, -5, 100_000_000, i64::MAX] {
        let err = engine.admin_extend(tx.as_mut(), 1, days).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDays(d) if d == days));
    }
    tx.rollback().await.unwrap();

    assert_eq!(active_rows(&ledger, "p-1").await[0].end_time, old_end);
    assert!(panel.state().updates.is_empty());
}

#[tokio::test]
async fn paid_activation_with_absurd_months_is_an_error() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::with_users(vec![panel_account(
        "p-1",
        Some(1),
        Some("link-1"),
        "ACTIVE",
        None,
    )]));
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let err = engine(&panel)
        .activate_paid(tx.as_mut(), &paid(1, i32::MAX, 100))
        .await
        .unwrap_err();
    tx.rollback().await.unwrap();

    assert!(matches!(err, EngineError::InvalidDays(_)));
    assert!(ledger.snapshot().await.subscriptions.is_empty());
}

#[test]
fn add_days_reports_overflow() {
    let now = Utc::now();
    assert_eq!(add_days(now, 2).unwrap(), now + Duration::days(2));
    assert!(matches!(
        add_days(now, 100_000_000),
        Err(EngineError::InvalidDays(100_000_000))
    ));
}

#[test]
fn extended_end_never_regresses() {
    let now = Utc::now();
    for offset in [-30i64, -1, 0, 1, 45] {
        let current = now + Duration::days(offset);
        for days in [1i64, 3, 30] {
            let new_end = extended_end(current, now, days).unwrap();
            if current > now {
                assert_eq!(new_end, current + Duration::days(days));
            } else {
                assert_eq!(new_end, now + Duration::days(days));
            }
        }
    }
}

#[tokio::test]
async fn extend_never_creates_a_subscription() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, None, None).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel)
        .extend(tx.as_mut(), 1, 7, BonusReason::Promo)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome, ExtendOutcome::NotFound);
    assert!(ledger.snapshot().await.subscriptions.is_empty());
    assert!(panel.state().updates.is_empty());
}

#[tokio::test]
async fn failed_push_is_drift_unless_strict() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    panel.state().fail_updates = true;
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    let old_end = Utc::now() + Duration::days(2);
    seed_subscription(&ledger, 1, "p-1", "link-1", old_end)
        .await
        .unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let outcome = engine(&panel)
        .extend(tx.as_mut(), 1, 3, BonusReason::Admin)
        .await
        .unwrap();
    assert!(matches!(outcome, ExtendOutcome::Extended { .. }));
    tx.rollback().await.unwrap();

    let strict = engine_with(
        &panel,
        Settings {
            panel_push_strict: true,
            ..Settings::default()
        },
    );
    let mut tx = ledger.begin().await.unwrap();
    let err = strict
        .extend(tx.as_mut(), 1, 3, BonusReason::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransientUpstream(_)));
}

#[tokio::test]
async fn paid_renewal_extends_from_current_end() {
    let ledger = MemoryLedger::new();
    let old_end = Utc::now() + Duration::days(10);
    let panel = Arc::new(FakePanel::with_users(vec![panel_account(
        "p-1",
        Some(1),
        Some("link-1"),
        "ACTIVE",
        Some(old_end),
    )]));
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    seed_subscription(&ledger, 1, "p-1", "link-1", old_end)
        .await
        .unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let activation = engine(&panel)
        .activate_paid(tx.as_mut(), &paid(1, 1, 100))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(activation.end_time, old_end + Duration::days(30));
    let rows = active_rows(&ledger, "p-1").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].duration_months, 1);
    assert_eq!(rows[0].provider.as_deref(), Some("yookassa"));
    assert!(!rows[0].skip_notifications);
}

#[tokio::test]
async fn paid_activation_applies_attached_promo_once() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let promo = ledger.add_promo_code("BONUS5", 5, 10, None).await;
    seed_user(&ledger, 1, None, None).await.unwrap();

    let mut request = paid(1, 1, 100);
    request.promo_code_id = Some(promo.id);

    let mut tx = ledger.begin().await.unwrap();
    let before = Utc::now();
    let activation = engine(&panel)
        .activate_paid(tx.as_mut(), &request)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(activation.applied_promo_days, 5);
    assert!(activation.end_time >= before + Duration::days(35));

    let state = ledger.snapshot().await;
    assert_eq!(state.promo_activations.len(), 1);
    assert_eq!(state.promo_activations[0].payment_id, Some(100));
    assert_eq!(state.promo_codes[0].current_activations, 1);

    request.payment_id = 101;
    let mut tx = ledger.begin().await.unwrap();
    let second = engine(&panel)
        .activate_paid(tx.as_mut(), &request)
        .await
        .unwrap();
    assert_eq!(second.applied_promo_days, 0);
}

#[tokio::test]
async fn paid_activation_rejects_identity_owned_by_another_user() {
    let ledger = MemoryLedger::new();
    let end = Utc::now() + Duration::days(20);
    let panel = Arc::new(FakePanel::with_users(vec![panel_account(
        "p-shared",
        Some(1),
        Some("link-b"),
        "ACTIVE",
        Some(end),
    )]));
    seed_user(&ledger, 1, None, None).await.unwrap();
    seed_user(&ledger, 2, Some("p-shared"), None).await.unwrap();
    seed_subscription(&ledger, 2, "p-shared", "link-b", end)
        .await
        .unwrap();
    let before = ledger.snapshot().await.subscriptions;

    let mut tx = ledger.begin().await.unwrap();
    let err = engine(&panel)
        .activate_paid(tx.as_mut(), &paid(1, 1, 100))
        .await
        .unwrap_err();
    tx.rollback().await.unwrap();

    match err {
        EngineError::Conflict {
            panel_identity,
            owner,
            requester,
        } => {
            assert_eq!(panel_identity, "p-shared");
            assert_eq!(owner, 2);
            assert_eq!(requester, 1);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    let state = ledger.snapshot().await;
    assert_eq!(state.subscriptions, before);
    assert_eq!(state.users[0].panel_identity, None);
}

#[tokio::test]
async fn new_link_retires_the_previous_grant() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::with_users(vec![panel_account(
        "p-1",
        Some(1),
        Some("link-new"),
        "ACTIVE",
        None,
    )]));
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    seed_subscription(&ledger, 1, "p-1", "link-old", Utc::now() + Duration::days(3))
        .await
        .unwrap();

    let mut tx = ledger.begin().await.unwrap();
    engine(&panel)
        .activate_paid(tx.as_mut(), &paid(1, 3, 100))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let rows = active_rows(&ledger, "p-1").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].panel_subscription_link, "link-new");
    assert_eq!(ledger.snapshot().await.subscriptions.len(), 2);
}

#[tokio::test]
async fn tribute_activation_skips_expiry_notifications() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, None, None).await.unwrap();

    let mut request = paid(1, 1, 100);
    request.provider = Provider::Tribute;
    let mut tx = ledger.begin().await.unwrap();
    let activation = engine(&panel)
        .activate_paid(tx.as_mut(), &request)
        .await
        .unwrap();

    assert!(activation.subscription.skip_notifications);
    assert_eq!(activation.subscription.provider.as_deref(), Some("tribute"));
}

#[tokio::test]
async fn referral_bonuses_go_through_extension() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let inviter_end = Utc::now() + Duration::days(5);
    seed_user(&ledger, 10, Some("p-10"), None).await.unwrap();
    seed_subscription(&ledger, 10, "p-10", "link-10", inviter_end)
        .await
        .unwrap();
    seed_user(&ledger, 11, None, Some(10)).await.unwrap();
    seed_user(&ledger, 12, None, Some(99)).await.unwrap();

    let engine = engine(&panel);
    let mut tx = ledger.begin().await.unwrap();
    let activation = engine
        .activate_paid(tx.as_mut(), &paid(11, 1, 100))
        .await
        .unwrap();
    let bonuses = engine
        .apply_referral_bonuses(tx.as_mut(), 11, 1)
        .await
        .unwrap();

    assert_eq!(bonuses.inviter_id, Some(10));
    assert_eq!(bonuses.inviter_new_end, Some(inviter_end + Duration::days(3)));
    assert_eq!(
        bonuses.referee_new_end,
        Some(activation.end_time + Duration::days(1))
    );

    // inviter 99 is unknown locally: nothing to extend
    let none = engine
        .apply_referral_bonuses(tx.as_mut(), 12, 1)
        .await
        .unwrap();
    assert_eq!(none.inviter_new_end, None);
}

#[tokio::test]
async fn promo_extends_by_exact_bonus_and_only_once() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    ledger.add_promo_code("WEEK", 7, 100, None).await;
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    let old_end = Utc::now() + Duration::days(10);
    seed_subscription(&ledger, 1, "p-1", "link-1", old_end)
        .await
        .unwrap();
    let engine = engine(&panel);

    let mut tx = ledger.begin().await.unwrap();
    let applied = engine
        .apply_promo_code(tx.as_mut(), 1, " week ")
        .await
        .unwrap();
    assert_eq!(
        applied,
        PromoOutcome::Applied {
            bonus_days: 7,
            new_end: old_end + Duration::days(7),
        }
    );
    let again = engine.apply_promo_code(tx.as_mut(), 1, "WEEK").await.unwrap();
    assert_eq!(again, PromoOutcome::Ineligible(PromoIneligible::AlreadyUsed));
    let unknown = engine.apply_promo_code(tx.as_mut(), 1, "NOPE").await.unwrap();
    assert_eq!(unknown, PromoOutcome::Ineligible(PromoIneligible::UnknownCode));
}

#[tokio::test]
async fn last_promo_slot_goes_to_one_of_two_concurrent_users() {
    let store = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let end = Utc::now() + Duration::days(10);
    for (user_id, identity, link) in [(1, "p-1", "link-1"), (2, "p-2", "link-2")] {
        seed_user(&store, user_id, Some(identity), None).await.unwrap();
        seed_subscription(&store, user_id, identity, link, end)
            .await
            .unwrap();
    }
    store.add_promo_code("LAST", 7, 1, None).await;
    let ledger = AutocommitLedger::new(store.clone());
    let engine = engine(&panel);

    let mut first = ledger.begin().await.unwrap();
    let mut second = ledger.begin().await.unwrap();
    let (a, b) = tokio::join!(
        engine.apply_promo_code(first.as_mut(), 1, "last"),
        engine.apply_promo_code(second.as_mut(), 2, "last"),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, PromoOutcome::Applied { .. }))
            .count(),
        1
    );
    assert!(outcomes.contains(&PromoOutcome::Ineligible(PromoIneligible::NotRedeemable)));
    let state = store.snapshot().await;
    assert_eq!(state.promo_codes[0].current_activations, 1);
    assert_eq!(state.promo_activations.len(), 1);
    let extended = state
        .subscriptions
        .iter()
        .filter(|s| s.end_time == end + Duration::days(7))
        .count();
    assert_eq!(extended, 1);
}

#[tokio::test]
async fn promo_without_active_subscription_is_not_consumed() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    ledger.add_promo_code("WEEK", 7, 100, None).await;
    ledger
        .add_promo_code("OLD", 7, 100, Some(Utc::now() - Duration::days(1)))
        .await;
    seed_user(&ledger, 1, None, None).await.unwrap();
    let engine = engine(&panel);

    let mut tx = ledger.begin().await.unwrap();
    assert_eq!(
        engine.apply_promo_code(tx.as_mut(), 1, "week").await.unwrap(),
        PromoOutcome::Ineligible(PromoIneligible::NoActiveSubscription)
    );
    assert_eq!(
        engine.apply_promo_code(tx.as_mut(), 1, "old").await.unwrap(),
        PromoOutcome::Ineligible(PromoIneligible::NotRedeemable)
    );
    tx.commit().await.unwrap();

    let state = ledger.snapshot().await;
    assert!(state.promo_activations.is_empty());
    assert!(state.promo_codes.iter().all(|p| p.current_activations == 0));
}

#[tokio::test]
async fn merging_the_same_snapshot_twice_is_idempotent() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let engine = engine(&panel);
    let now = Utc::now();
    let remote = panel_account(
        "p-1",
        Some(1),
        Some("link-1"),
        "ACTIVE",
        Some(now + Duration::days(15)),
    );

    let mut tx = ledger.begin().await.unwrap();
    let first = engine
        .merge_remote_account(tx.as_mut(), &remote, now)
        .await
        .unwrap();
    let second = engine
        .merge_remote_account(tx.as_mut(), &remote, now)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(first, second);
    let MergeOutcome::Synced { subscription } = first else {
        panic!("expected sync");
    };
    assert!(subscription.is_active);
    let state = ledger.snapshot().await;
    assert_eq!(state.subscriptions.len(), 1);
    assert_eq!(state.users.len(), 1);
    assert_eq!(state.users[0].panel_identity.as_deref(), Some("p-1"));
}

#[tokio::test]
async fn merge_marks_expired_or_disabled_accounts_inactive() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let engine = engine(&panel);
    let now = Utc::now();

    let mut tx = ledger.begin().await.unwrap();
    let expired = panel_account("p-1", Some(1), Some("l-1"), "ACTIVE", Some(now - Duration::days(1)));
    let disabled = panel_account("p-2", Some(2), Some("l-2"), "disabled", Some(now + Duration::days(9)));
    for remote in [&expired, &disabled] {
        match engine.merge_remote_account(tx.as_mut(), remote, now).await.unwrap() {
            MergeOutcome::Synced { subscription } => assert!(!subscription.is_active),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[tokio::test]
async fn merge_without_link_retires_local_grant() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    seed_subscription(&ledger, 1, "p-1", "link-1", Utc::now() + Duration::days(10))
        .await
        .unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let remote = panel_account("p-1", Some(1), None, "ACTIVE", None);
    let outcome = engine(&panel)
        .merge_remote_account(tx.as_mut(), &remote, Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome, MergeOutcome::Retired { deactivated: 1 });
    let state = ledger.snapshot().await;
    assert_eq!(state.subscriptions.len(), 1);
    assert!(!state.subscriptions[0].is_active);
}

#[tokio::test]
async fn merge_never_steals_a_linked_identity() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    seed_user(&ledger, 2, Some("p-1"), None).await.unwrap();

    let mut tx = ledger.begin().await.unwrap();
    let remote = panel_account("p-1", Some(1), Some("link-1"), "ACTIVE", Some(Utc::now() + Duration::days(3)));
    let outcome = engine(&panel)
        .merge_remote_account(tx.as_mut(), &remote, Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(
        outcome,
        MergeOutcome::Conflict {
            panel_identity: "p-1".to_string(),
            owner: 2,
        }
    );
    let state = ledger.snapshot().await;
    assert_eq!(state.users.len(), 1);
    assert!(state.subscriptions.is_empty());
}

#[tokio::test]
async fn merge_skips_accounts_without_telegram_id_or_valid_dates() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::new());
    let engine = engine(&panel);
    let mut tx = ledger.begin().await.unwrap();

    let anonymous = panel_account("p-1", None, Some("l-1"), "ACTIVE", None);
    assert_eq!(
        engine.merge_remote_account(tx.as_mut(), &anonymous, Utc::now()).await.unwrap(),
        MergeOutcome::Skipped(SkipReason::NoTelegramId)
    );

    let mut garbled = panel_account("p-2", Some(2), Some("l-2"), "ACTIVE", None);
    garbled.expire_at = Some("next tuesday".to_string());
    assert!(matches!(
        engine.merge_remote_account(tx.as_mut(), &garbled, Utc::now()).await.unwrap(),
        MergeOutcome::Skipped(SkipReason::BadDate(_))
    ));
}

#[tokio::test]
async fn ban_disables_panel_account_and_keeps_local_flag_on_panel_error() {
    let ledger = MemoryLedger::new();
    let panel = Arc::new(FakePanel::with_users(vec![panel_account(
        "p-1",
        Some(1),
        Some("link-1"),
        "ACTIVE",
        None,
    )]));
    seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
    seed_user(&ledger, 2, Some("p-gone"), None).await.unwrap();
    let engine = engine(&panel);

    let mut tx = ledger.begin().await.unwrap();
    engine.set_banned(tx.as_mut(), 1, true).await.unwrap();
    engine.set_banned(tx.as_mut(), 2, true).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(panel.user("p-1").unwrap().status.as_deref(), Some("DISABLED"));
    let state = ledger.snapshot().await;
    assert!(state.users.iter().all(|u| u.is_banned));
}
