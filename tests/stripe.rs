//! Stripe webhook dispatch tests: event routing, invoice-driven ledger
//! completion, and idempotent redelivery.

mod common;

use common::*;
use serde_json::json;

const SUB_ID: &str = "sub_test_1";
const INVOICE_ID: &str = "in_test_1";

fn event(event_type: &str, object: serde_json::Value) -> Vec<u8> {
    json!({ "type": event_type, "data": { "object": object } })
        .to_string()
        .into_bytes()
}

fn invoice_paid_event() -> Vec<u8> {
    event(
        "invoice.payment_succeeded",
        json!({
            "id": INVOICE_ID,
            "subscription": SUB_ID,
            "amount_paid": 999,
            "currency": "usd",
            "period_end": queries::now() + 30 * 86400,
        }),
    )
}

fn setup_subscription_fixture(conn: &rusqlite::Connection) {
    create_test_user(conn, "U1", "US");
    create_test_plan(conn, "P1", "US", "USD", 999);
    create_local_subscription(
        conn,
        "U1",
        "P1",
        ProviderName::Stripe,
        SUB_ID,
        SubscriptionStatus::Pending,
    );
}

#[test]
fn unrecognized_event_type_reports_failure_without_mutation() {
    let mut conn = setup_test_db();
    setup_subscription_fixture(&conn);
    let provider = stripe_provider();

    let before = queries::count_transactions(&conn).unwrap();
    let reply = provider
        .handle_webhook(&mut conn, &event("charge.captured", json!({ "id": "ch_1" })))
        .body;

    assert_eq!(reply["success"], json!(false));
    assert_eq!(reply["error"], json!("Unhandled event type"));
    assert_eq!(queries::count_transactions(&conn).unwrap(), before);
}

#[test]
fn invalid_json_reports_failure() {
    let mut conn = setup_test_db();
    let provider = stripe_provider();

    let reply = provider.handle_webhook(&mut conn, b"{{{").body;
    assert_eq!(reply["success"], json!(false));
}

#[test]
fn invoice_payment_succeeded_completes_ledger_and_activates() {
    let mut conn = setup_test_db();
    setup_subscription_fixture(&conn);
    let provider = stripe_provider();

    let reply = provider.handle_webhook(&mut conn, &invoice_paid_event()).body;
    assert_eq!(reply["success"], json!(true));

    // Ledger row keyed by the invoice id, settled in one delivery
    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Stripe, INVOICE_ID)
        .unwrap()
        .expect("invoice recorded in ledger");
    assert_eq!(txn.status, TransactionStatus::Succeeded);
    assert_eq!(txn.amount, 999);
    assert_eq!(txn.kind, TransactionKind::Subscription);

    // The pending local subscription is now active with the invoice period
    let sub = queries::get_subscription_by_provider_id(&conn, ProviderName::Stripe, SUB_ID)
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[test]
fn invoice_redelivery_is_already_processed() {
    let mut conn = setup_test_db();
    setup_subscription_fixture(&conn);
    let provider = stripe_provider();

    provider.handle_webhook(&mut conn, &invoice_paid_event());
    let subs_before = queries::count_subscriptions(&conn).unwrap();
    let row_before = queries::get_transaction_by_provider_id(&conn, ProviderName::Stripe, INVOICE_ID)
        .unwrap()
        .unwrap();

    let reply = provider.handle_webhook(&mut conn, &invoice_paid_event()).body;

    assert_eq!(reply["success"], json!(true));
    assert_eq!(reply["action"], json!("already_processed"));

    let row_after = queries::get_transaction_by_provider_id(&conn, ProviderName::Stripe, INVOICE_ID)
        .unwrap()
        .unwrap();
    assert_eq!(row_before.updated_at, row_after.updated_at);
    assert_eq!(queries::count_subscriptions(&conn).unwrap(), subs_before);
}

#[test]
fn invoice_payment_failed_marks_subscription_past_due() {
    let mut conn = setup_test_db();
    setup_subscription_fixture(&conn);
    let provider = stripe_provider();

    let reply = provider
        .handle_webhook(
            &mut conn,
            &event(
                "invoice.payment_failed",
                json!({
                    "id": INVOICE_ID,
                    "subscription": SUB_ID,
                    "amount_due": 999,
                    "currency": "usd",
                }),
            ),
        )
        .body;
    assert_eq!(reply["success"], json!(true));

    let txn = queries::get_transaction_by_provider_id(&conn, ProviderName::Stripe, INVOICE_ID)
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Failed);

    let sub = queries::get_subscription_by_provider_id(&conn, ProviderName::Stripe, SUB_ID)
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::PastDue);
}

#[test]
fn invoice_for_unknown_subscription_reports_failure_without_mutation() {
    let mut conn = setup_test_db();
    create_test_user(&conn, "U1", "US");
    let provider = stripe_provider();

    let reply = provider.handle_webhook(&mut conn, &invoice_paid_event()).body;

    assert_eq!(reply["success"], json!(false));
    assert_eq!(queries::count_transactions(&conn).unwrap(), 0);
}

#[test]
fn subscription_deleted_cancels_local_row() {
    let mut conn = setup_test_db();
    setup_subscription_fixture(&conn);
    let provider = stripe_provider();

    let reply = provider
        .handle_webhook(
            &mut conn,
            &event(
                "customer.subscription.deleted",
                json!({ "id": SUB_ID, "status": "canceled" }),
            ),
        )
        .body;
    assert_eq!(reply["success"], json!(true));

    let sub = queries::get_subscription_by_provider_id(&conn, ProviderName::Stripe, SUB_ID)
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert!(sub.canceled_at.is_some());
}

#[test]
fn subscription_updated_syncs_status_and_period() {
    let mut conn = setup_test_db();
    setup_subscription_fixture(&conn);
    let provider = stripe_provider();

    let start = queries::now();
    let end = start + 30 * 86400;
    let reply = provider
        .handle_webhook(
            &mut conn,
            &event(
                "customer.subscription.updated",
                json!({
                    "id": SUB_ID,
                    "status": "active",
                    "current_period_start": start,
                    "current_period_end": end,
                }),
            ),
        )
        .body;
    assert_eq!(reply["success"], json!(true));

    let sub = queries::get_subscription_by_provider_id(&conn, ProviderName::Stripe, SUB_ID)
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_end, end);
}
