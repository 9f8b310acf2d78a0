//! Click two-phase (prepare/complete) webhook tests, including the full
//! UZ subscription scenario.

mod common;

use common::*;

const MTI: &str = "sub_U1_P1_1699000000";

fn setup_uz_fixture(conn: &rusqlite::Connection) {
    create_test_user(conn, "U1", "UZ");
    create_test_plan(conn, "P1", "UZ", "UZS", 50000);
}

// ============ Prepare ============

#[test]
fn prepare_creates_pending_row() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    let reply = click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));

    assert_eq!(reply["error"], serde_json::json!(0));
    assert_eq!(reply["error_note"], serde_json::json!("Success"));
    assert_eq!(reply["click_trans_id"], serde_json::json!("T1"));
    assert_eq!(reply["merchant_trans_id"], serde_json::json!(MTI));
    assert!(reply["merchant_prepare_id"].is_string());

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .expect("ledger row created");
    assert_eq!(txn.status, TransactionStatus::Pending);
    assert_eq!(txn.amount, 50000);
    assert_eq!(txn.user_id, "U1");
}

#[test]
fn prepare_rejects_malformed_merchant_trans_id() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    for bad in [
        "garbage",
        "sub_U1_P1",                 // missing epoch
        "buy_U1_P1_1699000000",      // wrong prefix
        "sub__P1_1699000000",        // empty user id
        "sub_U1__1699000000",        // empty plan id
        "sub_U1_P1_notanumber",      // non-numeric epoch
        "sub_U1_P1_1699000000_extra" // too many parts
    ] {
        let reply = click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, bad, 0));
        assert_eq!(reply["error"], serde_json::json!(-5), "id {:?} must be rejected", bad);
    }

    assert_eq!(
        queries::count_transactions(&conn).unwrap(),
        0,
        "No ledger row may be created for malformed ids"
    );
}

#[test]
fn prepare_rejects_unknown_user_and_plan() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    let reply = click_call(
        &provider,
        &mut conn,
        &click_payload(0, "T1", 50000, "sub_ghost_P1_1699000000", 0),
    );
    assert_eq!(reply["error"], serde_json::json!(-5));
    assert_eq!(reply["error_note"], serde_json::json!("User not found"));

    let reply = click_call(
        &provider,
        &mut conn,
        &click_payload(0, "T1", 50000, "sub_U1_nope_1699000000", 0),
    );
    assert_eq!(reply["error"], serde_json::json!(-5));
    assert_eq!(reply["error_note"], serde_json::json!("Plan not found"));

    assert_eq!(queries::count_transactions(&conn).unwrap(), 0);
}

#[test]
fn prepare_rejects_amount_mismatch_without_creating_row() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    // Plan costs 50000 for UZ; payload says 49999.
    let reply = click_call(&provider, &mut conn, &click_payload(0, "T1", 49999, MTI, 0));

    assert_eq!(reply["error"], serde_json::json!(-2));
    assert_eq!(reply["error_note"], serde_json::json!("Invalid amount"));
    assert_eq!(queries::count_transactions(&conn).unwrap(), 0);
}

#[test]
fn prepare_duplicate_rejected_without_mutation() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));
    let before = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();

    let reply = click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));

    assert_eq!(reply["error"], serde_json::json!(-4));
    assert_eq!(queries::count_transactions(&conn).unwrap(), 1);

    let after = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.updated_at, after.updated_at);
}

// ============ Complete ============

#[test]
fn complete_unknown_transaction_not_found() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    let reply = click_call(&provider, &mut conn, &click_payload(1, "T404", 50000, MTI, 0));
    assert_eq!(reply["error"], serde_json::json!(-6));
}

#[test]
fn complete_succeeds_and_activates_one_month_subscription() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));
    let reply = click_call(&provider, &mut conn, &click_payload(1, "T1", 50000, MTI, 0));

    assert_eq!(reply["error"], serde_json::json!(0));
    assert!(reply["merchant_confirm_id"].is_string());

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Succeeded);
    // Complete merges the payload into the stored provider data.
    let data: serde_json::Value =
        serde_json::from_str(txn.provider_data.as_deref().unwrap()).unwrap();
    assert_eq!(data["action"], serde_json::json!(1));

    let subscription =
        queries::get_subscription_by_provider_id(&conn, ProviderName::Click, "T1")
            .unwrap()
            .expect("subscription activated");
    assert_eq!(subscription.user_id, "U1");
    assert_eq!(subscription.plan_id, "P1");
    assert_eq!(subscription.status, SubscriptionStatus::Active);

    // One-month period, within calendar-month wiggle room.
    let period = subscription.current_period_end - subscription.current_period_start;
    assert!(
        (28..=31).contains(&(period / 86400)),
        "period should be about one month, got {} days",
        period / 86400
    );
}

#[test]
fn complete_replay_reports_already_completed_without_mutation() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));
    let complete = click_payload(1, "T1", 50000, MTI, 0);
    click_call(&provider, &mut conn, &complete);

    let row_before = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    let subs_before = queries::count_subscriptions(&conn).unwrap();

    // Identical redelivery
    let reply = click_call(&provider, &mut conn, &complete);

    assert_eq!(reply["error"], serde_json::json!(-4));
    assert_eq!(reply["error_note"], serde_json::json!("Transaction already completed"));

    let row_after = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    assert_eq!(row_before.status, row_after.status);
    assert_eq!(row_before.updated_at, row_after.updated_at);
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), subs_before);
}

#[test]
fn complete_with_upstream_error_fails_transaction() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));
    let reply = click_call(&provider, &mut conn, &click_payload(1, "T1", 50000, MTI, -5017));

    // Fixed cancellation code regardless of the upstream reason.
    assert_eq!(reply["error"], serde_json::json!(-9));
    assert_eq!(reply["error_note"], serde_json::json!("Transaction canceled"));

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(txn.failure_reason.as_deref(), Some("Upstream failure"));
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), 0);
}

#[test]
fn complete_success_after_failure_cannot_resurrect_row() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));
    click_call(&provider, &mut conn, &click_payload(1, "T1", 50000, MTI, -5017));

    // A late out-of-order success delivery for a failed row
    let reply = click_call(&provider, &mut conn, &click_payload(1, "T1", 50000, MTI, 0));

    assert_eq!(reply["error"], serde_json::json!(-9));
    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed, "terminal states are one-way");
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), 0);
}

#[test]
fn unknown_action_rejected() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    let reply = click_call(&provider, &mut conn, &click_payload(7, "T1", 50000, MTI, 0));
    assert_eq!(reply["error"], serde_json::json!(-8));
    assert_eq!(queries::count_transactions(&conn).unwrap(), 0);
}

/// The full concrete scenario: prepare -> complete -> replay.
#[test]
fn uz_subscription_scenario_end_to_end() {
    let mut conn = setup_test_db();
    setup_uz_fixture(&conn);
    let provider = click_provider();

    // Prepare with correct signature and exact UZ price
    let prepare = click_call(&provider, &mut conn, &click_payload(0, "T1", 50000, MTI, 0));
    assert_eq!(prepare["error"], serde_json::json!(0));
    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Click, "T1")
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Pending);

    // Complete settles and activates U1/P1
    let complete = click_payload(1, "T1", 50000, MTI, 0);
    let reply = click_call(&provider, &mut conn, &complete);
    assert_eq!(reply["error"], serde_json::json!(0));
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), 1);

    // Replay: duplicate code, nothing changes
    let replay = click_call(&provider, &mut conn, &complete);
    assert_eq!(replay["error"], serde_json::json!(-4));
    assert_eq!(queries::count_transactions(&conn).unwrap(), 1);
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), 1);
}
