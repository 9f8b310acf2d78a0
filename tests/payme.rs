//! Payme JSON-RPC webhook state machine tests.

mod common;

use common::*;
use serde_json::json;

const TXN_ID: &str = "payme_txn_1";

fn account(user_id: &str, plan_id: &str) -> serde_json::Value {
    json!({ "user_id": user_id, "plan_id": plan_id })
}

#[test]
fn check_perform_allows_known_user() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    let reply = payme_call(
        &provider,
        &mut conn,
        "CheckPerformTransaction",
        json!({ "amount": 5000000, "account": account("U1", "P1") }),
    );

    assert_eq!(reply["result"]["allow"], json!(true));
}

#[test]
fn check_perform_rejects_unknown_user() {
    let mut conn = setup_test_db();
    let provider = payme_provider();

    let reply = payme_call(
        &provider,
        &mut conn,
        "CheckPerformTransaction",
        json!({ "amount": 5000000, "account": account("ghost", "P1") }),
    );

    assert_eq!(reply["error"]["code"], json!(-31050));
}

#[test]
fn check_perform_has_no_side_effects() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    let before = queries::count_transactions(&conn).unwrap();

    // Valid, invalid user, invalid amount - none may touch the ledger.
    for params in [
        json!({ "amount": 5000000, "account": account("U1", "P1") }),
        json!({ "amount": 5000000, "account": account("ghost", "P1") }),
        json!({ "amount": 0, "account": account("U1", "P1") }),
        json!({}),
    ] {
        payme_call(&provider, &mut conn, "CheckPerformTransaction", params);
    }

    let after = queries::count_transactions(&conn).unwrap();
    assert_eq!(before, after, "CheckPerformTransaction must be side-effect-free");
}

#[test]
fn create_transaction_creates_pending_row() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    let reply = payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );

    assert_eq!(reply["result"]["state"], json!(1));
    assert!(reply["result"]["transaction"].is_string());
    assert!(reply["result"]["create_time"].as_i64().unwrap() > 0);

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .expect("ledger row created");
    assert_eq!(txn.status, TransactionStatus::Pending);
    assert_eq!(txn.amount, 5000000);
    assert_eq!(txn.currency, "UZS");
}

#[test]
fn create_transaction_duplicate_returns_same_row() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();
    let params = json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") });

    let first = payme_call(&provider, &mut conn, "CreateTransaction", params.clone());
    let second = payme_call(&provider, &mut conn, "CreateTransaction", params);

    assert_eq!(first["result"]["transaction"], second["result"]["transaction"]);
    assert_eq!(first["result"]["create_time"], second["result"]["create_time"]);
    assert_eq!(queries::count_transactions(&conn).unwrap(), 1);
}

#[test]
fn create_transaction_amount_mismatch_on_duplicate() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );
    let reply = payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 999, "account": account("U1", "P1") }),
    );

    assert_eq!(reply["error"]["code"], json!(-31001));
}

#[test]
fn perform_unknown_transaction_not_found() {
    let mut conn = setup_test_db();
    let provider = payme_provider();

    let reply = payme_call(
        &provider,
        &mut conn,
        "PerformTransaction",
        json!({ "id": "never_created" }),
    );

    assert_eq!(reply["error"]["code"], json!(-31003));
}

#[test]
fn perform_succeeds_and_activates_subscription() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    create_test_plan(&conn, "P1", "UZ", "UZS", 5000000);
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );
    let reply = payme_call(
        &provider,
        &mut conn,
        "PerformTransaction",
        json!({ "id": TXN_ID }),
    );

    assert_eq!(reply["result"]["state"], json!(2));
    assert!(reply["result"]["perform_time"].as_i64().unwrap() > 0);

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Succeeded);

    let subscription =
        queries::get_subscription_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
            .unwrap()
            .expect("subscription activated");
    assert_eq!(subscription.user_id, "U1");
    assert_eq!(subscription.plan_id, "P1");
    assert_eq!(subscription.status, SubscriptionStatus::Active);
}

#[test]
fn perform_twice_is_idempotent() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    create_test_plan(&conn, "P1", "UZ", "UZS", 5000000);
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );
    let first = payme_call(&provider, &mut conn, "PerformTransaction", json!({ "id": TXN_ID }));
    let second = payme_call(&provider, &mut conn, "PerformTransaction", json!({ "id": TXN_ID }));

    // Same terminal reply both times, one subscription, one ledger row.
    assert_eq!(first["result"]["state"], json!(2));
    assert_eq!(second["result"]["state"], json!(2));
    assert_eq!(first["result"]["transaction"], second["result"]["transaction"]);
    assert_eq!(first["result"]["perform_time"], second["result"]["perform_time"]);
    assert_eq!(queries::count_transactions(&conn).unwrap(), 1);
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), 1);
}

#[test]
fn cancel_records_reason_and_state() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );
    let reply = payme_call(
        &provider,
        &mut conn,
        "CancelTransaction",
        json!({ "id": TXN_ID, "reason": { "message": "Insufficient funds" } }),
    );

    assert_eq!(reply["result"]["state"], json!(-1));
    assert!(reply["result"]["cancel_time"].as_i64().unwrap() > 0);

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed);
    assert_eq!(txn.failure_reason.as_deref(), Some("Insufficient funds"));
}

#[test]
fn cancel_of_performed_transaction_is_refused() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    create_test_plan(&conn, "P1", "UZ", "UZS", 5000000);
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );
    payme_call(&provider, &mut conn, "PerformTransaction", json!({ "id": TXN_ID }));
    let reply = payme_call(
        &provider,
        &mut conn,
        "CancelTransaction",
        json!({ "id": TXN_ID, "reason": 5 }),
    );

    assert_eq!(reply["error"]["code"], json!(-31007));
    // Terminal state untouched
    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Succeeded);
}

#[test]
fn check_transaction_maps_all_states() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );

    // Pending -> 1
    let reply = payme_call(&provider, &mut conn, "CheckTransaction", json!({ "id": TXN_ID }));
    assert_eq!(reply["result"]["state"], json!(1));
    assert_eq!(reply["result"]["perform_time"], json!(0));
    assert_eq!(reply["result"]["cancel_time"], json!(0));

    // Canceled -> -1, with reason echoed
    payme_call(
        &provider,
        &mut conn,
        "CancelTransaction",
        json!({ "id": TXN_ID, "reason": { "message": "timeout" } }),
    );
    let reply = payme_call(&provider, &mut conn, "CheckTransaction", json!({ "id": TXN_ID }));
    assert_eq!(reply["result"]["state"], json!(-1));
    assert!(reply["result"]["cancel_time"].as_i64().unwrap() > 0);
    assert_eq!(reply["result"]["reason"]["message"], json!("timeout"));

    // Refunded -> -2 (set directly; refunds arrive out of band)
    conn.execute(
        "UPDATE transactions SET status = 'refunded' WHERE provider_transaction_id = ?1",
        rusqlite::params![TXN_ID],
    )
    .unwrap();
    let reply = payme_call(&provider, &mut conn, "CheckTransaction", json!({ "id": TXN_ID }));
    assert_eq!(reply["result"]["state"], json!(-2));
}

#[test]
fn check_transaction_never_mutates() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );
    let before = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .unwrap();

    payme_call(&provider, &mut conn, "CheckTransaction", json!({ "id": TXN_ID }));

    let after = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.updated_at, after.updated_at);
}

#[test]
fn unknown_method_returns_method_not_found() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    let before = queries::count_transactions(&conn).unwrap();
    let reply = payme_call(
        &provider,
        &mut conn,
        "ExplodeTransaction",
        json!({ "id": TXN_ID }),
    );

    assert_eq!(reply["error"]["code"], json!(-32601));
    assert_eq!(reply["error"]["message"], json!("Method not found"));
    assert_eq!(queries::count_transactions(&conn).unwrap(), before);
}

#[test]
fn malformed_body_returns_parse_error() {
    let mut conn = setup_test_db();
    let provider = payme_provider();

    let reply = provider.handle_webhook(&mut conn, b"not json at all").body;
    assert_eq!(reply["error"]["code"], json!(-32700));
}

#[test]
fn amount_round_trips_in_minor_units() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "UZ");
    let provider = payme_provider();

    // 50000 UZS = 5_000_000 tiyin; the ledger stores and echoes minor
    // units untouched.
    payme_call(
        &provider,
        &mut conn,
        "CreateTransaction",
        json!({ "id": TXN_ID, "amount": 5000000, "account": account("U1", "P1") }),
    );

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Payme, TXN_ID)
        .unwrap()
        .unwrap();
    assert_eq!(txn.amount, 5000000);
    assert_eq!(txn.amount / 100, 50000);
}
