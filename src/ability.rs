//! In-memory routing table over the ability rows.
//!
//! Readers take an `Arc` snapshot of the whole two-level map; writers
//! build a replacement map and publish it with a single swap, so
//! selection never blocks behind an index rebuild.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use rand::Rng;

use crate::clock;
use crate::db::Store;
use crate::error::{GatewayError, GatewayResult};
use crate::logger;

/// One candidate channel for a (group, model) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEntry {
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u64,
    /// Epoch ms; entries with a future value are skipped.
    pub suspend_until: Option<i64>,
    /// Configured completion ceiling for this model on this channel.
    pub max_tokens: i64,
}

type IndexMap = HashMap<String, HashMap<String, Vec<ChannelEntry>>>;

static INDEX: Lazy<RwLock<Arc<IndexMap>>> = Lazy::new(|| RwLock::new(Arc::new(HashMap::new())));
static WRITER: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn snapshot() -> Arc<IndexMap> {
    INDEX.read().expect("ability index lock poisoned").clone()
}

fn publish(map: IndexMap) {
    *INDEX.write().expect("ability index lock poisoned") = Arc::new(map);
}

/// Rebuild the whole index from the store. Serialized with every
/// other index write.
pub fn init_channel_cache(store: &Store) -> GatewayResult<()> {
    let _writer = WRITER.lock().expect("ability writer lock poisoned");
    let abilities = store.list_abilities()?;
    let channels = store.list_channels()?;
    let max_tokens_by_channel: HashMap<i64, HashMap<String, i64>> = channels
        .iter()
        .map(|c| {
            let per_model = c
                .model_list()
                .into_iter()
                .map(|m| {
                    let max = c.max_tokens_for(&m);
                    (m, max)
                })
                .collect();
            (c.id, per_model)
        })
        .collect();

    let mut map: IndexMap = HashMap::new();
    for ability in abilities {
        let max_tokens = max_tokens_by_channel
            .get(&ability.channel_id)
            .and_then(|per_model| per_model.get(&ability.model))
            .copied()
            .unwrap_or(0);
        map.entry(ability.group.clone())
            .or_default()
            .entry(ability.model.clone())
            .or_default()
            .push(ChannelEntry {
                channel_id: ability.channel_id,
                enabled: ability.enabled,
                priority: ability.priority,
                weight: ability.weight,
                suspend_until: ability.suspend_until,
                max_tokens,
            });
    }
    let sequences: usize = map.values().map(|models| models.len()).sum();
    logger::info(
        "ability",
        &format!("channel cache rebuilt: {} (group, model) sequences", sequences),
    );
    publish(map);
    Ok(())
}

/// Write a suspension window and patch only the affected sequence in
/// the published snapshot.
pub fn suspend_ability(
    store: &Store,
    channel_id: i64,
    group: &str,
    model: &str,
    duration_ms: i64,
) -> GatewayResult<()> {
    let until = clock::now_ms() + duration_ms;
    store.suspend_ability(group, model, channel_id, until)?;

    let _writer = WRITER.lock().expect("ability writer lock poisoned");
    let mut map = (*snapshot()).clone();
    if let Some(entries) = map
        .get_mut(group)
        .and_then(|models| models.get_mut(model))
    {
        for entry in entries.iter_mut() {
            if entry.channel_id == channel_id {
                entry.suspend_until = Some(until);
            }
        }
    }
    publish(map);
    logger::warn(
        "ability",
        &format!(
            "channel {} suspended for ({}, {}) until {}",
            channel_id, group, model, until
        ),
    );
    Ok(())
}

static NO_EXCLUSIONS: Lazy<HashSet<i64>> = Lazy::new(HashSet::new);

/// Selection parameters for one attempt.
#[derive(Debug)]
pub struct Selection<'a> {
    pub group: &'a str,
    pub model: &'a str,
    pub excluded: &'a HashSet<i64>,
    /// After an upstream 413: only candidates whose configured
    /// max_tokens strictly exceeds this budget survive the filter.
    pub prefer_larger_max_tokens: bool,
    pub current_max_tokens: i64,
}

impl Default for Selection<'_> {
    fn default() -> Self {
        Self {
            group: "",
            model: "",
            excluded: &NO_EXCLUSIONS,
            prefer_larger_max_tokens: false,
            current_max_tokens: 0,
        }
    }
}

/// Pick a channel for (group, model) under the exclusion and
/// suspension filters. Weighted random among the top-priority
/// partition; weight 0 counts as 1.
pub fn select(selection: &Selection<'_>) -> GatewayResult<ChannelEntry> {
    let snapshot = snapshot();
    let entries = snapshot
        .get(selection.group)
        .and_then(|models| models.get(selection.model))
        .ok_or_else(|| {
            GatewayError::NoCandidate(format!(
                "no channel serves ({}, {})",
                selection.group, selection.model
            ))
        })?;
    let now = clock::now_ms();
    let candidates = filter_candidates(entries, selection, now);
    if candidates.is_empty() {
        return Err(GatewayError::NoCandidate(format!(
            "all channels for ({}, {}) are filtered out",
            selection.group, selection.model
        )));
    }
    let total: u64 = candidates.iter().map(|e| effective_weight(e)).sum();
    let draw = rand::thread_rng().gen_range(0..total);
    Ok(pick_by_draw(&candidates, draw).clone())
}

/// Models currently routable for a group, sorted and deduplicated.
pub fn models_for_group(group: &str) -> Vec<String> {
    let snapshot = snapshot();
    let now = clock::now_ms();
    let mut models: Vec<String> = snapshot
        .get(group)
        .map(|by_model| {
            by_model
                .iter()
                .filter(|(_, entries)| {
                    entries.iter().any(|e| {
                        e.enabled && e.suspend_until.map(|until| until <= now).unwrap_or(true)
                    })
                })
                .map(|(model, _)| model.clone())
                .collect()
        })
        .unwrap_or_default();
    models.sort();
    models.dedup();
    models
}

fn effective_weight(entry: &ChannelEntry) -> u64 {
    entry.weight.max(1)
}

fn filter_candidates<'a>(
    entries: &'a [ChannelEntry],
    selection: &Selection<'_>,
    now_ms: i64,
) -> Vec<&'a ChannelEntry> {
    let live: Vec<&ChannelEntry> = entries
        .iter()
        .filter(|e| e.enabled)
        .filter(|e| !selection.excluded.contains(&e.channel_id))
        .filter(|e| e.suspend_until.map(|until| until <= now_ms).unwrap_or(true))
        .filter(|e| {
            !selection.prefer_larger_max_tokens || e.max_tokens > selection.current_max_tokens
        })
        .collect();
    let Some(top_priority) = live.iter().map(|e| e.priority).max() else {
        return Vec::new();
    };
    live.into_iter()
        .filter(|e| e.priority == top_priority)
        .collect()
}

fn pick_by_draw<'a>(candidates: &[&'a ChannelEntry], draw: u64) -> &'a ChannelEntry {
    let mut running = 0u64;
    for entry in candidates {
        running += effective_weight(entry);
        if running > draw {
            return entry;
        }
    }
    candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(channel_id: i64, priority: i64, weight: u64) -> ChannelEntry {
        ChannelEntry {
            channel_id,
            enabled: true,
            priority,
            weight,
            suspend_until: None,
            max_tokens: 8192,
        }
    }

    #[test]
    fn filter_drops_disabled_excluded_and_suspended() {
        let now = clock::now_ms();
        let mut disabled = entry(1, 0, 1);
        disabled.enabled = false;
        let mut suspended = entry(2, 0, 1);
        suspended.suspend_until = Some(now + 60_000);
        let mut resumed = entry(3, 0, 1);
        resumed.suspend_until = Some(now - 1);
        let excluded_entry = entry(4, 0, 1);
        let entries = vec![disabled, suspended, resumed, excluded_entry];

        let excluded: HashSet<i64> = [4].into_iter().collect();
        let selection = Selection {
            group: "default",
            model: "m",
            excluded: &excluded,
            ..Default::default()
        };
        let live = filter_candidates(&entries, &selection, now);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].channel_id, 3);
    }

    #[test]
    fn only_top_priority_partition_survives() {
        let entries = vec![entry(1, 0, 5), entry(2, 10, 1), entry(3, 10, 2)];
        let excluded = HashSet::new();
        let selection = Selection {
            group: "default",
            model: "m",
            excluded: &excluded,
            ..Default::default()
        };
        let live = filter_candidates(&entries, &selection, 0);
        let ids: Vec<i64> = live.iter().map(|e| e.channel_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn weighted_draw_walks_running_sum() {
        let a = entry(1, 0, 3);
        let b = entry(2, 0, 1);
        let candidates: Vec<&ChannelEntry> = vec![&a, &b];
        // weights 3 + 1: draws 0..=2 land on a, draw 3 on b.
        assert_eq!(pick_by_draw(&candidates, 0).channel_id, 1);
        assert_eq!(pick_by_draw(&candidates, 2).channel_id, 1);
        assert_eq!(pick_by_draw(&candidates, 3).channel_id, 2);
    }

    #[test]
    fn zero_weights_count_as_one_each() {
        let a = entry(1, 0, 0);
        let b = entry(2, 0, 0);
        let candidates: Vec<&ChannelEntry> = vec![&a, &b];
        assert_eq!(
            candidates.iter().map(|e| effective_weight(e)).sum::<u64>(),
            2
        );
        assert_eq!(pick_by_draw(&candidates, 0).channel_id, 1);
        assert_eq!(pick_by_draw(&candidates, 1).channel_id, 2);
    }

    #[test]
    fn larger_max_tokens_filter() {
        let mut small = entry(1, 0, 1);
        small.max_tokens = 8192;
        let mut large = entry(2, 0, 1);
        large.max_tokens = 128_000;
        let entries = vec![small, large];
        let excluded = HashSet::new();
        let selection = Selection {
            group: "default",
            model: "m",
            excluded: &excluded,
            prefer_larger_max_tokens: true,
            current_max_tokens: 8192,
        };
        let live = filter_candidates(&entries, &selection, 0);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].channel_id, 2);

        // No strictly larger candidate left: empty.
        let selection = Selection {
            current_max_tokens: 128_000,
            ..selection
        };
        assert!(filter_candidates(&entries, &selection, 0).is_empty());
    }

    #[test]
    fn select_reports_no_candidate_for_unknown_pair() {
        let excluded = HashSet::new();
        let err = select(&Selection {
            group: "nobody",
            model: "ghost",
            excluded: &excluded,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, GatewayError::NoCandidate(_)));
    }

    #[test]
    fn index_rebuild_and_select_end_to_end() {
        let (_dir, store) = crate::db::test_store();
        let id = store
            .insert_channel(
                crate::db::channels::ChannelType::OpenAI,
                "k",
                "c",
                1,
                0,
                "",
                "gpt-4o",
                "default",
                None,
                None,
            )
            .unwrap();
        let channel = store.get_channel(id).unwrap().unwrap();
        store.rebuild_channel_abilities(&channel).unwrap();
        init_channel_cache(&store).unwrap();

        let excluded = HashSet::new();
        let picked = select(&Selection {
            group: "default",
            model: "gpt-4o",
            excluded: &excluded,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(picked.channel_id, id);

        // Suspension takes effect on the live snapshot.
        suspend_ability(&store, id, "default", "gpt-4o", 60_000).unwrap();
        let err = select(&Selection {
            group: "default",
            model: "gpt-4o",
            excluded: &excluded,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, GatewayError::NoCandidate(_)));
    }
}
