//! Upstream channel records: provider type, credentials, supported
//! models, per-model pricing, and group membership.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;
use crate::clock;
use crate::error::GatewayResult;

/// Provider discriminator. The adapter registry keys off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    OpenAI,
    Anthropic,
    Bedrock,
    Vertex,
    Cohere,
    Qwen,
    Azure,
}

impl ChannelType {
    pub fn as_i64(&self) -> i64 {
        match self {
            ChannelType::OpenAI => 1,
            ChannelType::Anthropic => 14,
            ChannelType::Bedrock => 33,
            ChannelType::Vertex => 24,
            ChannelType::Cohere => 34,
            ChannelType::Qwen => 17,
            ChannelType::Azure => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            14 => ChannelType::Anthropic,
            33 => ChannelType::Bedrock,
            24 => ChannelType::Vertex,
            34 => ChannelType::Cohere,
            17 => ChannelType::Qwen,
            3 => ChannelType::Azure,
            _ => ChannelType::OpenAI,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Bedrock => "bedrock",
            ChannelType::Vertex => "vertex",
            ChannelType::Cohere => "cohere",
            ChannelType::Qwen => "qwen",
            ChannelType::Azure => "azure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Unknown,
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

impl ChannelStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            ChannelStatus::Unknown => 0,
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => ChannelStatus::Enabled,
            2 => ChannelStatus::ManuallyDisabled,
            3 => ChannelStatus::AutoDisabled,
            _ => ChannelStatus::Unknown,
        }
    }
}

/// Unified per-model pricing entry from the channel's `model_configs`
/// blob: quota units per prompt token, the completion multiplier, and
/// the completion budget ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelConfig {
    #[serde(default)]
    pub ratio: f64,
    #[serde(default)]
    pub completion_ratio: f64,
    #[serde(default)]
    pub max_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Channel {
    pub id: i64,
    pub channel_type: ChannelType,
    #[serde(skip_serializing)]
    pub key: String,
    pub status: ChannelStatus,
    pub name: String,
    pub weight: u64,
    pub priority: i64,
    pub base_url: String,
    /// Comma-separated supported models.
    pub models: String,
    /// Requested model name -> provider model id.
    pub model_mapping: Option<String>,
    /// Requested model name -> ModelConfig, JSON.
    pub model_configs: Option<String>,
    /// Comma-separated group membership.
    pub groups: String,
    /// Arbitrary per-provider config blob, JSON.
    pub config: Option<String>,
    pub test_model: Option<String>,
    pub rate_limit: i64,
    /// Model -> inference-profile ARN (AWS), JSON.
    pub inference_profile_arn_map: Option<String>,
    pub created_time: i64,
}

impl Channel {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Channel {
            id: row.get("id")?,
            channel_type: ChannelType::from_i64(row.get("type")?),
            key: row.get("key")?,
            status: ChannelStatus::from_i64(row.get("status")?),
            name: row.get("name")?,
            weight: row.get::<_, i64>("weight")?.max(0) as u64,
            priority: row.get("priority")?,
            base_url: row.get("base_url")?,
            models: row.get("models")?,
            model_mapping: row.get("model_mapping")?,
            model_configs: row.get("model_configs")?,
            groups: row.get("groups")?,
            config: row.get("config")?,
            test_model: row.get("test_model")?,
            rate_limit: row.get("rate_limit")?,
            inference_profile_arn_map: row.get("inference_profile_arn_map")?,
            created_time: row.get("created_time")?,
        })
    }

    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect()
    }

    pub fn group_list(&self) -> Vec<String> {
        self.groups
            .split(',')
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect()
    }

    /// Provider model id after applying the channel's model mapping.
    pub fn mapped_model(&self, model: &str) -> String {
        let Some(raw) = self.model_mapping.as_deref() else {
            return model.to_string();
        };
        let mapping: HashMap<String, String> = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(_) => return model.to_string(),
        };
        mapping
            .get(model)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn model_config(&self, model: &str) -> Option<ModelConfig> {
        let raw = self.model_configs.as_deref()?;
        let configs: HashMap<String, ModelConfig> = serde_json::from_str(raw).ok()?;
        configs.get(model).copied()
    }

    /// Configured completion ceiling for `model`; 0 when unspecified.
    pub fn max_tokens_for(&self, model: &str) -> i64 {
        self.model_config(model).map(|c| c.max_tokens).unwrap_or(0)
    }

    pub fn inference_profile_arn(&self, model: &str) -> Option<String> {
        let raw = self.inference_profile_arn_map.as_deref()?;
        let map: HashMap<String, String> = serde_json::from_str(raw).ok()?;
        map.get(model).cloned()
    }
}

const CHANNEL_COLUMNS: &str = "id, type, key, status, name, weight, priority, base_url, models, \
     model_mapping, model_configs, groups, config, test_model, rate_limit, \
     inference_profile_arn_map, created_time";

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn insert_channel(
        &self,
        channel_type: ChannelType,
        key: &str,
        name: &str,
        weight: u64,
        priority: i64,
        base_url: &str,
        models: &str,
        groups: &str,
        model_configs: Option<&str>,
        model_mapping: Option<&str>,
    ) -> GatewayResult<i64> {
        let now = clock::now_s();
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "INSERT INTO channels (type, key, status, name, weight, priority, base_url, \
                 models, groups, model_configs, model_mapping, created_time) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    channel_type.as_i64(),
                    key,
                    ChannelStatus::Enabled.as_i64(),
                    name,
                    weight as i64,
                    priority,
                    base_url,
                    models,
                    groups,
                    model_configs,
                    model_mapping,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn get_channel(&self, id: i64) -> GatewayResult<Option<Channel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM channels WHERE id = ?1",
            CHANNEL_COLUMNS
        ))?;
        Ok(stmt.query_row(params![id], Channel::from_row).optional()?)
    }

    pub fn list_channels(&self) -> GatewayResult<Vec<Channel>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM channels ORDER BY id",
            CHANNEL_COLUMNS
        ))?;
        let rows = stmt.query_map([], Channel::from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn update_channel_status(&self, id: i64, status: ChannelStatus) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE channels SET status = ?1 WHERE id = ?2",
                params![status.as_i64(), id],
            )
        })?;
        Ok(())
    }

    pub fn increase_channel_used_quota(&self, id: i64, q: i64) -> GatewayResult<()> {
        self.with_busy_retry(None, |conn| {
            conn.execute(
                "UPDATE channels SET used_quota = used_quota + ?1 WHERE id = ?2",
                params![q, id],
            )
        })?;
        Ok(())
    }
}
