//! Entitlement store: token issuance, tier writes, and quota metering

#[path = "../common/mod.rs"]
mod common;

use common::*;
use entitlement_engine::error::AppError;
use entitlement_engine::util::utc_date;

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn validate(conn: &mut rusqlite::Connection, token: &str, solution_id: &str) -> ValidationResult {
    tokens::validate(conn, &test_config(), token, solution_id, None, false, now())
        .expect("validate should not error")
}

#[test]
fn test_issue_creates_registered_entitlement() {
    let mut conn = setup_test_db();
    let config = test_config();

    let issued = tokens::issue(&mut conn, &config, "U1", Some("u1@example.com"), "S1", Tier::Registered)
        .expect("issue failed");
    assert!(issued.created);
    assert_eq!(issued.tier, Tier::Registered);
    assert!(issued.token.starts_with(tokens::TOKEN_PREFIX));

    let ent = get_ent(&conn, "U1", "S1");
    assert_eq!(ent.token.as_deref(), Some(issued.token.as_str()));
    assert_eq!(ent.quota_daily_limit, config.quotas.registered);
    assert_eq!(ent.user_email.as_deref(), Some("u1@example.com"));

    let history = queries::list_subscription_events(&conn, "U1", "S1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, SubscriptionAction::Register);
    assert_eq!(history[0].from_tier, Tier::Free);
    assert_eq!(history[0].to_tier, Tier::Registered);
}

#[test]
fn test_issue_is_idempotent() {
    let mut conn = setup_test_db();
    let config = test_config();

    let first = tokens::issue(&mut conn, &config, "U1", None, "S1", Tier::Registered).unwrap();
    let second = tokens::issue(&mut conn, &config, "U1", None, "S1", Tier::Registered).unwrap();

    assert!(!second.created);
    assert_eq!(first.token, second.token, "token must be stable across calls");
    assert_eq!(
        queries::list_subscription_events(&conn, "U1", "S1").unwrap().len(),
        1,
        "no extra history for a repeat issue"
    );
}

#[test]
fn test_issue_refuses_pro() {
    let mut conn = setup_test_db();
    let result = tokens::issue(&mut conn, &test_config(), "U1", None, "S1", Tier::Pro);
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert!(queries::get_entitlement(&conn, "U1", "S1").unwrap().is_none());
}

#[test]
fn test_free_is_promoted_to_registered() {
    let mut conn = setup_test_db();
    let config = test_config();

    let free = tokens::issue(&mut conn, &config, "U1", None, "S1", Tier::Free).unwrap();
    assert_eq!(free.tier, Tier::Free);
    assert_eq!(get_ent(&conn, "U1", "S1").quota_daily_limit, config.quotas.free);
    assert!(queries::list_subscription_events(&conn, "U1", "S1").unwrap().is_empty());

    let registered = tokens::issue(&mut conn, &config, "U1", None, "S1", Tier::Registered).unwrap();
    assert_eq!(registered.tier, Tier::Registered);
    assert_eq!(registered.token, free.token);
    assert_eq!(
        get_ent(&conn, "U1", "S1").quota_daily_limit,
        config.quotas.registered
    );

    let history = queries::list_subscription_events(&conn, "U1", "S1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, SubscriptionAction::Register);
}

#[test]
fn test_entitlements_are_per_solution() {
    let mut conn = setup_test_db();
    let config = test_config();
    let a = create_test_entitlement(&mut conn, &config, "U1", "S1");
    let b = create_test_entitlement(&mut conn, &config, "U1", "S2");
    assert_ne!(a, b);
}

#[test]
fn test_validate_consumes_quota() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");

    let first = validate(&mut conn, &token, "S1");
    assert!(first.allowed);
    assert_eq!(first.tier, Tier::Registered);
    assert_eq!(first.quota_limit, 10);
    assert_eq!(first.quota_remaining, 9);

    for _ in 0..9 {
        assert!(validate(&mut conn, &token, "S1").allowed);
    }

    let over = validate(&mut conn, &token, "S1");
    assert!(!over.allowed);
    assert_eq!(over.reason, Some(DenyReason::QuotaExceeded));
    assert_eq!(over.quota_remaining, 0);
    assert_eq!(get_ent(&conn, "U1", "S1").daily_usage_count, 10);
}

#[test]
fn test_check_only_does_not_consume() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");

    for _ in 0..3 {
        let result = tokens::validate(&mut conn, &config, &token, "S1", None, true, now()).unwrap();
        assert!(result.allowed);
        assert_eq!(result.quota_remaining, 10);
    }
    assert_eq!(get_ent(&conn, "U1", "S1").daily_usage_count, 0);
}

#[test]
fn test_usage_resets_on_new_utc_day() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");
    let ent = get_ent(&conn, "U1", "S1");

    let yesterday = now() - ONE_DAY;
    for _ in 0..10 {
        queries::consume_quota(&conn, &ent.id, &utc_date(yesterday), yesterday).unwrap();
    }
    assert!(
        queries::consume_quota(&conn, &ent.id, &utc_date(yesterday), yesterday)
            .unwrap()
            .is_none(),
        "yesterday's quota is used up"
    );

    let today = validate(&mut conn, &token, "S1");
    assert!(today.allowed, "a new day starts a fresh count");
    assert_eq!(today.quota_remaining, 9);
}

#[test]
fn test_wrong_solution_is_denied() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");

    let result = validate(&mut conn, &token, "S2");
    assert!(!result.allowed);
    assert_eq!(result.reason, Some(DenyReason::SolutionMismatch));
    assert_eq!(get_ent(&conn, "U1", "S1").daily_usage_count, 0);
}

#[test]
fn test_unknown_token_is_denied() {
    let mut conn = setup_test_db();
    let result = validate(&mut conn, "tok_doesnotexist", "S1");
    assert!(!result.allowed);
    assert_eq!(result.reason, Some(DenyReason::InvalidToken));
    assert_eq!(result.tier, Tier::Free);
}

#[test]
fn test_user_id_lookup_still_checks_token() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");

    let good = tokens::validate(&mut conn, &config, &token, "S1", Some("U1"), false, now()).unwrap();
    assert!(good.allowed);

    let stolen =
        tokens::validate(&mut conn, &config, &token, "S1", Some("U2"), false, now()).unwrap();
    assert_eq!(stolen.reason, Some(DenyReason::InvalidToken));

    let wrong = tokens::validate(&mut conn, &config, "tok_guess", "S1", Some("U1"), false, now())
        .unwrap();
    assert_eq!(wrong.reason, Some(DenyReason::InvalidToken));
}

#[test]
fn test_unlimited_quota() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");
    let ent = get_ent(&conn, "U1", "S1");
    queries::grant_pro(&conn, &ent.id, now() + ONE_DAY, -1, None).unwrap();

    for _ in 0..25 {
        let result = validate(&mut conn, &token, "S1");
        assert!(result.allowed);
        assert_eq!(result.tier, Tier::Pro);
        assert_eq!(result.quota_remaining, -1);
        assert_eq!(result.quota_limit, -1);
    }
}

#[test]
fn test_lapsed_pro_validates_as_registered() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");
    let ent = get_ent(&conn, "U1", "S1");
    let expired_at = now() - 60;
    queries::grant_pro(&conn, &ent.id, expired_at, -1, None).unwrap();

    let result = validate(&mut conn, &token, "S1");
    assert!(result.allowed);
    assert_eq!(result.tier, Tier::Registered);
    assert_eq!(result.quota_limit, config.quotas.registered);
    assert_eq!(result.quota_remaining, config.quotas.registered - 1);

    let stored = get_ent(&conn, "U1", "S1");
    assert_eq!(stored.tier, Tier::Registered);
    assert_eq!(stored.tier_expires_at, Some(expired_at), "expiry is kept for history");
    assert_eq!(stored.token.as_deref(), Some(token.as_str()));
    assert_eq!(stored.status, EntitlementStatus::Active, "lapse changes the tier only");

    let history = queries::list_subscription_events(&conn, "U1", "S1").unwrap();
    let expires: Vec<_> = history
        .iter()
        .filter(|e| e.action == SubscriptionAction::Expire)
        .collect();
    assert_eq!(expires.len(), 1);
    assert_eq!(expires[0].from_tier, Tier::Pro);
    assert_eq!(expires[0].to_tier, Tier::Registered);
}

#[test]
fn test_expired_status_denies_regardless_of_tier() {
    let mut conn = setup_test_db();
    let config = test_config();
    let token = create_test_entitlement(&mut conn, &config, "U1", "S1");
    let ent = get_ent(&conn, "U1", "S1");
    queries::grant_pro(&conn, &ent.id, now() + ONE_DAY, -1, None).unwrap();
    conn.execute(
        "UPDATE entitlements SET status = 'expired' WHERE id = ?1",
        [&ent.id],
    )
    .unwrap();

    let result = validate(&mut conn, &token, "S1");
    assert!(!result.allowed);
    assert_eq!(result.reason, Some(DenyReason::Inactive));

    let stored = get_ent(&conn, "U1", "S1");
    assert_eq!(stored.status, EntitlementStatus::Expired);
    assert_eq!(stored.daily_usage_count, 0);
}

#[test]
fn test_sweep_downgrades_each_lapsed_row_once() {
    let mut conn = setup_test_db();
    let config = test_config();
    for user in ["U1", "U2", "U3"] {
        create_test_entitlement(&mut conn, &config, user, "S1");
    }
    let past = now() - 10;
    for user in ["U1", "U2"] {
        let ent = get_ent(&conn, user, "S1");
        queries::grant_pro(&conn, &ent.id, past, -1, None).unwrap();
    }
    let ent = get_ent(&conn, "U3", "S1");
    queries::grant_pro(&conn, &ent.id, now() + ONE_DAY, -1, None).unwrap();

    assert_eq!(tokens::sweep_expired(&mut conn, &config, now()).unwrap(), 2);
    assert_eq!(tokens::sweep_expired(&mut conn, &config, now()).unwrap(), 0);

    assert_eq!(get_ent(&conn, "U1", "S1").tier, Tier::Registered);
    assert_eq!(get_ent(&conn, "U2", "S1").tier, Tier::Registered);
    assert_eq!(get_ent(&conn, "U3", "S1").tier, Tier::Pro);
}
