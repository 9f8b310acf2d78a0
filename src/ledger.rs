//! The transaction ledger: single source of truth for every payment
//! attempt across all three networks.
//!
//! Webhook deliveries are at-least-once and may arrive concurrently for
//! the same remote transaction id. The UNIQUE(provider,
//! provider_transaction_id) constraint is the only serialization point:
//! `record` resolves losing inserts to the existing row, and `transition`
//! classifies replays as already-processed instead of mutating twice.
//! Status moves pending -> {succeeded | failed | refunded} exactly once;
//! terminal rows never change again.

use rusqlite::{params, Connection, TransactionBehavior};

use crate::db::queries::{self, is_unique_violation};
use crate::error::{AppError, Result};
use crate::models::{
    NewSubscription, NewTransaction, ProviderName, Subscription, SubscriptionStatus, Transaction,
    TransactionStatus,
};
use crate::util::one_month_after;

/// Outcome of recording a payment attempt.
#[derive(Debug)]
pub enum RecordOutcome {
    /// A new ledger row was created.
    Created(Transaction),
    /// A row for this (provider, provider_transaction_id) already existed.
    Existing(Transaction),
}

impl RecordOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Created(t) | Self::Existing(t) => t,
        }
    }
}

/// Outcome of a terminal-state transition attempt.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// This call performed the transition.
    Applied(Transaction),
    /// The row was already in the requested terminal state. Normal
    /// idempotency path for redelivered webhooks, not an anomaly.
    AlreadyProcessed(Transaction),
    /// No row exists for the remote transaction id.
    NotFound,
}

/// Record a payment attempt, resolving duplicate inserts to the existing
/// row. Two concurrent deliveries of the same remote id converge: one
/// creates, the other observes.
pub fn record(conn: &Connection, input: &NewTransaction) -> Result<RecordOutcome> {
    match queries::insert_transaction(conn, input) {
        Ok(txn) => {
            tracing::info!(
                provider = %txn.provider,
                provider_transaction_id = %txn.provider_transaction_id,
                amount = txn.amount,
                "ledger: transaction recorded"
            );
            Ok(RecordOutcome::Created(txn))
        }
        Err(AppError::Database(ref e)) if is_unique_violation(e) => {
            let existing = queries::get_transaction_by_provider_id(
                conn,
                input.provider,
                &input.provider_transaction_id,
            )?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "transaction {}:{} vanished after unique conflict",
                    input.provider, input.provider_transaction_id
                ))
            })?;
            tracing::debug!(
                provider = %input.provider,
                provider_transaction_id = %input.provider_transaction_id,
                "ledger: duplicate insert resolved to existing row"
            );
            Ok(RecordOutcome::Existing(existing))
        }
        Err(e) => Err(e),
    }
}

/// Move a pending row into a terminal state.
///
/// Runs in an IMMEDIATE transaction so that of two concurrent deliveries
/// exactly one applies the mutation and the other observes
/// `AlreadyProcessed`. A terminal row re-observed with the same target
/// status is `AlreadyProcessed`; with a different terminal status it is a
/// conflict - terminal states are one-way.
pub fn transition(
    conn: &mut Connection,
    provider: ProviderName,
    provider_transaction_id: &str,
    target: TransactionStatus,
    failure_reason: Option<&str>,
    merge_data: Option<&serde_json::Value>,
) -> Result<TransitionOutcome> {
    debug_assert!(target.is_terminal(), "transition target must be terminal");

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing =
        match queries::get_transaction_by_provider_id(&tx, provider, provider_transaction_id)? {
            Some(t) => t,
            None => return Ok(TransitionOutcome::NotFound),
        };

    if existing.status == target {
        tracing::debug!(
            provider = %provider,
            provider_transaction_id = %provider_transaction_id,
            status = %target,
            "ledger: transition replay, already processed"
        );
        return Ok(TransitionOutcome::AlreadyProcessed(existing));
    }

    if existing.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "transaction {}:{} is already {}, cannot move to {}",
            provider, provider_transaction_id, existing.status, target
        )));
    }

    let provider_data = merge_provider_data(existing.provider_data.as_deref(), merge_data)?;
    let failure_reason = failure_reason
        .map(|r| r.to_string())
        .or_else(|| existing.failure_reason.clone());
    let now = queries::now();

    tx.execute(
        "UPDATE transactions
         SET status = ?1, failure_reason = COALESCE(?2, failure_reason),
             provider_data = ?3, updated_at = ?4
         WHERE id = ?5 AND status = 'pending'",
        params![target.as_str(), &failure_reason, &provider_data, now, &existing.id],
    )?;
    tx.commit()?;

    tracing::info!(
        provider = %provider,
        provider_transaction_id = %provider_transaction_id,
        status = %target,
        "ledger: transaction transitioned"
    );

    Ok(TransitionOutcome::Applied(Transaction {
        status: target,
        failure_reason,
        provider_data,
        updated_at: now,
        ..existing
    }))
}

/// Merge new provider payload into the stored one. Objects merge key-wise
/// (new keys win); anything else replaces the stored value.
fn merge_provider_data(
    existing: Option<&str>,
    incoming: Option<&serde_json::Value>,
) -> Result<Option<String>> {
    let incoming = match incoming {
        Some(v) => v,
        None => return Ok(existing.map(|s| s.to_string())),
    };

    let merged = match existing.and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok()) {
        Some(serde_json::Value::Object(mut base)) => {
            if let serde_json::Value::Object(new) = incoming {
                for (k, v) in new {
                    base.insert(k.clone(), v.clone());
                }
                serde_json::Value::Object(base)
            } else {
                incoming.clone()
            }
        }
        _ => incoming.clone(),
    };

    Ok(Some(merged.to_string()))
}

// ============ Subscription activator ============

/// Metadata key recording which transaction activated the current period.
const ACTIVATED_BY: &str = "activated_by";

fn activated_by(subscription: &Subscription) -> Option<String> {
    subscription
        .metadata
        .as_deref()
        .and_then(|m| serde_json::from_str::<serde_json::Value>(m).ok())
        .and_then(|v| v.get(ACTIVATED_BY).and_then(|t| t.as_str().map(String::from)))
}

/// Create or extend a subscription as a consequence of `txn` reaching
/// `succeeded`.
///
/// Idempotent two ways: a subscription that was already activated by this
/// transaction is returned unchanged, and a concurrent duplicate insert
/// loses the UNIQUE(provider, provider_subscription_id) race and resolves
/// to the winner's row.
pub fn activate_for(
    conn: &Connection,
    txn: &Transaction,
    user_id: &str,
    plan_id: &str,
    provider_subscription_id: &str,
    period_end: Option<i64>,
) -> Result<Subscription> {
    let now = queries::now();
    let period_end = period_end.unwrap_or_else(|| one_month_after(now));

    if let Some(existing) =
        queries::get_subscription_by_provider_id(conn, txn.provider, provider_subscription_id)?
    {
        if activated_by(&existing).as_deref() == Some(txn.id.as_str()) {
            tracing::debug!(
                subscription_id = %existing.id,
                transaction_id = %txn.id,
                "activator: replay, subscription already activated by this transaction"
            );
            return Ok(existing);
        }

        // Renewal: extend the period and stamp the activating transaction.
        let metadata = serde_json::json!({ ACTIVATED_BY: txn.id }).to_string();
        queries::extend_subscription_period(conn, &existing.id, now, period_end, Some(&metadata))?;
        tracing::info!(
            subscription_id = %existing.id,
            transaction_id = %txn.id,
            period_end,
            "activator: subscription period extended"
        );
        return queries::get_subscription_by_id(conn, &existing.id)?.ok_or_else(|| {
            AppError::Internal(format!("subscription {} vanished during extension", existing.id))
        });
    }

    let input = NewSubscription {
        user_id: user_id.to_string(),
        plan_id: plan_id.to_string(),
        provider: txn.provider,
        provider_subscription_id: provider_subscription_id.to_string(),
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: period_end,
        metadata: Some(serde_json::json!({ ACTIVATED_BY: txn.id })),
    };

    match queries::insert_subscription(conn, &input) {
        Ok(subscription) => {
            tracing::info!(
                subscription_id = %subscription.id,
                user_id = %user_id,
                plan_id = %plan_id,
                transaction_id = %txn.id,
                "activator: subscription created"
            );
            Ok(subscription)
        }
        Err(AppError::Database(ref e)) if is_unique_violation(e) => {
            // Lost a concurrent activation race - the winner's row is ours.
            queries::get_subscription_by_provider_id(conn, txn.provider, provider_subscription_id)?
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "subscription {}:{} vanished after unique conflict",
                        txn.provider, provider_subscription_id
                    ))
                })
        }
        Err(e) => Err(e),
    }
}
