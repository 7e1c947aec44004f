//! Two-phase quota reservation.
//!
//! Pre-consume places a hold (pending row + conditional decrements),
//! post-consume reconciles against the true cost, cancel refunds. A
//! sweep worker auto-confirms holds whose timeout elapsed. For every
//! transaction the quota deltas applied across its lifetime sum to
//! its final cost (0 when canceled).

use std::time::Duration;

use rusqlite::types::Value as SqlValue;

use crate::clock;
use crate::config;
use crate::db::transactions::TransactionStatus;
use crate::db::Store;
use crate::error::{GatewayError, GatewayResult};
use crate::logger;
use crate::quota;

/// Everything pre-consume needs to place a hold.
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub transaction_id: String,
    pub token_id: i64,
    pub user_id: i64,
    /// Whether the token side skips quota movement entirely.
    pub token_unlimited: bool,
    pub pre_quota: i64,
    pub reason: String,
    pub request_id: String,
    pub trace_id: String,
}

/// Phase one: insert the pending row, then decrement user and token.
/// Either decrement failing unwinds the hold; the caller must not go
/// upstream. Re-posting the same (token, transaction) id is a no-op.
pub fn pre_consume(store: &Store, hold: &HoldRequest) -> GatewayResult<()> {
    let expires_at = clock::now_s() + config::load().transaction_timeout_secs;
    match store.insert_transaction(
        &hold.transaction_id,
        hold.token_id,
        hold.user_id,
        hold.pre_quota,
        &hold.reason,
        &hold.request_id,
        &hold.trace_id,
        expires_at,
    ) {
        Ok(_) => {}
        Err(GatewayError::Conflict(_)) => {
            // Idempotent replay of an existing hold.
            logger::debug(
                "transaction",
                &format!(
                    "hold ({}, {}) already placed",
                    hold.token_id, hold.transaction_id
                ),
            );
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    if let Err(e) = quota::decrease_user_quota(store, hold.user_id, hold.pre_quota) {
        store.finalize_transaction(
            hold.token_id,
            &hold.transaction_id,
            TransactionStatus::Canceled,
            None,
            false,
        )?;
        return Err(e);
    }

    if !hold.token_unlimited {
        if let Err(e) = quota::decrease_token_quota(store, hold.token_id, hold.pre_quota) {
            // Unwind the user side so the canceled hold nets to zero.
            quota::increase_user_quota(store, hold.user_id, hold.pre_quota)?;
            store.finalize_transaction(
                hold.token_id,
                &hold.transaction_id,
                TransactionStatus::Canceled,
                None,
                false,
            )?;
            return Err(e);
        }
    }
    Ok(())
}

/// Phase two: settle the hold against the true cost `final_quota`.
///
/// A hold the sweep already auto-confirmed still gets its quota delta
/// applied (the only catch-up path) but the transaction row keeps its
/// auto_confirmed status; confirmed and canceled rows refuse with
/// AlreadyFinalized and move no quota.
pub fn post_consume(
    store: &Store,
    token_id: i64,
    transaction_id: &str,
    token_unlimited: bool,
    final_quota: i64,
    elapsed_ms: i64,
) -> GatewayResult<()> {
    let tx = store
        .get_transaction(token_id, transaction_id)?
        .ok_or_else(|| {
            GatewayError::NotFound(format!("transaction ({}, {})", token_id, transaction_id))
        })?;

    let moved = store.finalize_transaction(
        token_id,
        transaction_id,
        TransactionStatus::Confirmed,
        Some(final_quota),
        false,
    )?;
    if moved {
        store.update_transaction_fields(
            token_id,
            transaction_id,
            &[("elapsed_time_ms", SqlValue::Integer(elapsed_ms))],
        )?;
        apply_delta(store, &tx, token_unlimited, final_quota - tx.pre_quota)?;
        quota::check_quota_remind(store, tx.user_id);
        return Ok(());
    }

    // Lost the race to a sweep or a duplicate settle; reload and decide.
    let current = store
        .get_transaction(token_id, transaction_id)?
        .ok_or_else(|| {
            GatewayError::NotFound(format!("transaction ({}, {})", token_id, transaction_id))
        })?;
    match current.status {
        TransactionStatus::AutoConfirmed => {
            // Late settle: bill the difference, leave the row alone.
            logger::info(
                "transaction",
                &format!(
                    "late post-consume on auto-confirmed ({}, {}): delta {}",
                    token_id,
                    transaction_id,
                    final_quota - current.pre_quota
                ),
            );
            apply_delta(store, &current, token_unlimited, final_quota - current.pre_quota)?;
            quota::check_quota_remind(store, current.user_id);
            Ok(())
        }
        TransactionStatus::Confirmed | TransactionStatus::Canceled => {
            Err(GatewayError::AlreadyFinalized(format!(
                "transaction ({}, {}) is {:?}",
                token_id, transaction_id, current.status
            )))
        }
        TransactionStatus::Pending => Err(GatewayError::Internal(format!(
            "transaction ({}, {}) pending after refused transition",
            token_id, transaction_id
        ))),
    }
}

/// Cancel a hold the upstream refused before any billing event.
pub fn cancel(
    store: &Store,
    token_id: i64,
    transaction_id: &str,
    token_unlimited: bool,
) -> GatewayResult<()> {
    let tx = store
        .get_transaction(token_id, transaction_id)?
        .ok_or_else(|| {
            GatewayError::NotFound(format!("transaction ({}, {})", token_id, transaction_id))
        })?;
    let moved = store.finalize_transaction(
        token_id,
        transaction_id,
        TransactionStatus::Canceled,
        None,
        false,
    )?;
    if !moved {
        return Err(GatewayError::AlreadyFinalized(format!(
            "transaction ({}, {}) cannot be canceled",
            token_id, transaction_id
        )));
    }
    quota::increase_user_quota(store, tx.user_id, tx.pre_quota)?;
    if !token_unlimited {
        quota::increase_token_quota(store, token_id, tx.pre_quota)?;
    }
    Ok(())
}

fn apply_delta(
    store: &Store,
    tx: &crate::db::transactions::TokenTransaction,
    token_unlimited: bool,
    delta: i64,
) -> GatewayResult<()> {
    if delta > 0 {
        // True cost exceeded the hold: collect the difference.
        quota::decrease_user_quota(store, tx.user_id, delta)?;
        if !token_unlimited {
            quota::decrease_token_quota(store, tx.token_id, delta)?;
        }
    } else if delta < 0 {
        quota::increase_user_quota(store, tx.user_id, -delta)?;
        if !token_unlimited {
            quota::increase_token_quota(store, tx.token_id, -delta)?;
        }
    }
    Ok(())
}

/// One sweep pass: move expired pending holds to auto_confirmed with
/// `final_quota = pre_quota`. Safe to run concurrently; the transition
/// guard makes it idempotent.
pub fn sweep_expired(store: &Store) -> GatewayResult<usize> {
    let confirmed = store.auto_confirm_expired(clock::now_s())?;
    if !confirmed.is_empty() {
        logger::info(
            "transaction",
            &format!("auto-confirmed {} expired holds", confirmed.len()),
        );
    }
    Ok(confirmed.len())
}

/// Spawn the timeout sweeper.
pub fn start_sweeper(store: Store) {
    let period = config::load().transaction_sweep_interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_expired(&store) {
                logger::error("transaction", &format!("timeout sweep failed: {}", e));
            }
        }
    });
}
