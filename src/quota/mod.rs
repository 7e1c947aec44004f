//! Quota ledger
//!
//! Per-user and per-token balances. Decrements are conditional SQL
//! updates and fail fast; increments and accounting counters go
//! through the batched ledgers when batching is enabled.

pub mod batch;
pub mod transaction;

use crate::config;
use crate::db::Store;
use crate::error::GatewayResult;
use crate::logger;

pub use batch::BatchKind;

pub fn get_user_quota(store: &Store, user_id: i64) -> GatewayResult<i64> {
    store.get_user_quota(user_id)
}

/// (remaining, unlimited).
pub fn get_token_quota(store: &Store, token_id: i64) -> GatewayResult<(i64, bool)> {
    store.get_token_quota(token_id)
}

/// Refund or top-up. Routed through the user-quota ledger when
/// batching is on.
pub fn increase_user_quota(store: &Store, user_id: i64, q: i64) -> GatewayResult<()> {
    debug_assert!(q >= 0);
    if config::load().batch_update_enabled {
        batch::record(BatchKind::UserQuota, user_id, q);
        return Ok(());
    }
    store.increase_user_quota(user_id, q)
}

/// Conditional decrement; InsufficientQuota when the row cannot cover
/// `q`. Never batched: the caller needs the refusal before it spends
/// anything upstream.
pub fn decrease_user_quota(store: &Store, user_id: i64, q: i64) -> GatewayResult<()> {
    debug_assert!(q >= 0);
    store.decrease_user_quota(user_id, q)
}

pub fn increase_token_quota(store: &Store, token_id: i64, q: i64) -> GatewayResult<()> {
    debug_assert!(q >= 0);
    if config::load().batch_update_enabled {
        batch::record(BatchKind::TokenQuota, token_id, q);
        return Ok(());
    }
    store.increase_token_quota(token_id, q)
}

/// Conditional decrement on the token row. Unlimited tokens are the
/// caller's responsibility to skip.
pub fn decrease_token_quota(store: &Store, token_id: i64, q: i64) -> GatewayResult<()> {
    debug_assert!(q >= 0);
    store.decrease_token_quota(token_id, q)
}

/// Post-billing accounting: used-quota counters on user, token, and
/// channel plus the user's request count.
pub fn record_usage(
    store: &Store,
    user_id: i64,
    token_id: i64,
    channel_id: i64,
    used: i64,
) -> GatewayResult<()> {
    store.increase_token_used_quota(token_id, used)?;
    if config::load().batch_update_enabled {
        batch::record(BatchKind::UsedQuota, user_id, used);
        batch::record(BatchKind::RequestCount, user_id, 1);
        batch::record(BatchKind::ChannelUsedQuota, channel_id, used);
        return Ok(());
    }
    store.increase_user_used_quota_and_request_count(user_id, used, 1)?;
    store.increase_channel_used_quota(channel_id, used)?;
    Ok(())
}

/// Warn when a settled decrement leaves the user under the remind
/// threshold. Delivery of the actual notification is external.
pub fn check_quota_remind(store: &Store, user_id: i64) {
    let threshold = config::load().quota_remind_threshold;
    if threshold <= 0 {
        return;
    }
    match store.get_user_quota(user_id) {
        Ok(quota) if quota < threshold => {
            logger::warn(
                "quota",
                &format!(
                    "user {} quota {} is below the remind threshold {}",
                    user_id, quota, threshold
                ),
            );
        }
        Ok(_) => {}
        Err(e) => logger::debug("quota", &format!("remind check failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_store;
    use crate::db::users::UserRole;
    use crate::error::GatewayError;

    #[test]
    fn direct_path_updates_all_counters() {
        let (_dir, store) = test_store();
        let user_id = store
            .insert_user("u", "U", "h", UserRole::Common, "default", 1000)
            .unwrap();
        let token_id = store
            .insert_token(user_id, "key-quota-mod-test-000000000000000000000000000000", "t", -1, 1000, false, None)
            .unwrap();
        let channel_id = store
            .insert_channel(
                crate::db::channels::ChannelType::OpenAI,
                "k",
                "c",
                1,
                0,
                "",
                "m",
                "default",
                None,
                None,
            )
            .unwrap();

        decrease_user_quota(&store, user_id, 70).unwrap();
        decrease_token_quota(&store, token_id, 70).unwrap();
        record_usage(&store, user_id, token_id, channel_id, 70).unwrap();

        let user = store.get_user(user_id).unwrap().unwrap();
        assert_eq!(user.quota, 930);
        assert_eq!(user.used_quota, 70);
        assert_eq!(user.request_count, 1);
        assert_eq!(store.get_token_quota(token_id).unwrap().0, 930);
    }

    #[test]
    fn refusal_reports_insufficient_quota() {
        let (_dir, store) = test_store();
        let user_id = store
            .insert_user("u2", "U", "h", UserRole::Common, "default", 10)
            .unwrap();
        let err = decrease_user_quota(&store, user_id, 11).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientQuota(_)));
    }
}
