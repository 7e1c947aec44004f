//! Batched quota updates: five in-memory delta ledgers keyed by
//! entity id, drained periodically into single conditional updates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config;
use crate::db::Store;
use crate::error::GatewayResult;
use crate::logger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    UserQuota,
    TokenQuota,
    UsedQuota,
    ChannelUsedQuota,
    RequestCount,
}

const ALL_KINDS: [BatchKind; 5] = [
    BatchKind::UserQuota,
    BatchKind::TokenQuota,
    BatchKind::UsedQuota,
    BatchKind::ChannelUsedQuota,
    BatchKind::RequestCount,
];

// One mutex per ledger so writers on different kinds never contend.
static USER_QUOTA: Lazy<Mutex<HashMap<i64, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static TOKEN_QUOTA: Lazy<Mutex<HashMap<i64, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static USED_QUOTA: Lazy<Mutex<HashMap<i64, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static CHANNEL_USED_QUOTA: Lazy<Mutex<HashMap<i64, i64>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static REQUEST_COUNT: Lazy<Mutex<HashMap<i64, i64>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn ledger(kind: BatchKind) -> &'static Mutex<HashMap<i64, i64>> {
    match kind {
        BatchKind::UserQuota => &USER_QUOTA,
        BatchKind::TokenQuota => &TOKEN_QUOTA,
        BatchKind::UsedQuota => &USED_QUOTA,
        BatchKind::ChannelUsedQuota => &CHANNEL_USED_QUOTA,
        BatchKind::RequestCount => &REQUEST_COUNT,
    }
}

/// Accumulate a delta for (kind, id).
pub fn record(kind: BatchKind, id: i64, delta: i64) {
    let mut entries = ledger(kind).lock().expect("batch ledger lock poisoned");
    *entries.entry(id).or_insert(0) += delta;
}

fn take(kind: BatchKind) -> HashMap<i64, i64> {
    let mut entries = ledger(kind).lock().expect("batch ledger lock poisoned");
    std::mem::take(&mut *entries)
}

fn apply(store: &Store, kind: BatchKind, id: i64, delta: i64) -> GatewayResult<()> {
    if delta == 0 {
        return Ok(());
    }
    match kind {
        BatchKind::UserQuota => {
            if delta > 0 {
                store.increase_user_quota(id, delta)
            } else {
                store.decrease_user_quota(id, -delta)
            }
        }
        BatchKind::TokenQuota => {
            if delta > 0 {
                store.increase_token_quota(id, delta)
            } else {
                store.decrease_token_quota(id, -delta)
            }
        }
        BatchKind::UsedQuota => store.increase_user_used_quota_and_request_count(id, delta, 0),
        BatchKind::ChannelUsedQuota => store.increase_channel_used_quota(id, delta),
        BatchKind::RequestCount => store.increase_user_used_quota_and_request_count(id, 0, delta),
    }
}

/// Flush every ledger. One conditional update per (kind, id). A
/// refused decrement is dropped: the quota floor wins, and the only
/// record of the lost delta is the error log below.
pub fn drain_once(store: &Store) {
    for kind in ALL_KINDS {
        let entries = take(kind);
        for (id, delta) in entries {
            if let Err(e) = apply(store, kind, id, delta) {
                logger::error(
                    "batch",
                    &format!("flush {:?} for {} (delta {}) failed: {}", kind, id, delta, e),
                );
            }
        }
    }
}

/// Spawn the drain worker. Runs until process exit; one final drain
/// happens on teardown via `drain_once`.
pub fn start_worker(store: Store) {
    let period = config::load().batch_update_interval_secs.max(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(period));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            drain_once(&store);
        }
    });
    logger::info("batch", &format!("batched updates enabled, period {}s", period));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;
    use crate::db::users::UserRole;

    // One test body: the ledgers are process-wide, so interleaved
    // drains against different test stores would cross wires.
    #[test]
    fn deltas_accumulate_drain_once_and_respect_floor() {
        let (_dir, store) = test_store();
        let rich = store
            .insert_user("batch-u", "U", "h", UserRole::Common, "default", 100)
            .unwrap();
        let poor = store
            .insert_user("batch-v", "V", "h", UserRole::Common, "default", 5)
            .unwrap();

        record(BatchKind::UserQuota, rich, 30);
        record(BatchKind::UserQuota, rich, -10);
        record(BatchKind::RequestCount, rich, 1);
        record(BatchKind::RequestCount, rich, 1);
        record(BatchKind::UserQuota, poor, -50);
        drain_once(&store);

        let user = store.get_user(rich).unwrap().unwrap();
        assert_eq!(user.quota, 120);
        assert_eq!(user.request_count, 2);
        // The refused decrement leaves the balance untouched.
        assert_eq!(store.get_user_quota(poor).unwrap(), 5);

        // Ledgers are empty after the drain.
        drain_once(&store);
        assert_eq!(store.get_user_quota(rich).unwrap(), 120);
    }
}
