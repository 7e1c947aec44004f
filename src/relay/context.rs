//! Per-request relay state: the resolved caller, the requested model,
//! correlation ids, and pricing arithmetic.

use std::time::Instant;

use crate::clock::{self, CancelToken};
use crate::db::channels::ModelConfig;
use crate::db::tokens::Token;
use crate::relay::request::Usage;

/// Built by the middleware once authentication and model extraction
/// succeed; owned by the dispatcher for the rest of the request.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub trace_id: String,
    /// External id for the quota reservation; one per logical request.
    pub transaction_id: String,
    pub token: Token,
    pub user_id: i64,
    pub username: String,
    pub group: String,
    pub requested_model: String,
    pub cancel: CancelToken,
    pub started: Instant,
}

impl RelayContext {
    pub fn new(token: Token, user_id: i64, username: String, group: String, model: String) -> Self {
        Self {
            request_id: clock::new_request_id(),
            trace_id: clock::new_trace_id(),
            transaction_id: clock::new_request_id(),
            token,
            user_id,
            username,
            group,
            requested_model: model,
            cancel: CancelToken::new(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }
}

/// Pricing for one (channel, model) pair, from the channel's unified
/// model config. `ratio` is quota units per prompt token.
#[derive(Debug, Clone, Copy)]
pub struct Pricing {
    pub ratio: f64,
    pub completion_ratio: f64,
    pub max_tokens: i64,
}

impl Pricing {
    pub fn from_model_config(config: Option<ModelConfig>) -> Self {
        let config = config.unwrap_or_default();
        Self {
            ratio: if config.ratio > 0.0 { config.ratio } else { 1.0 },
            completion_ratio: if config.completion_ratio > 0.0 {
                config.completion_ratio
            } else {
                1.0
            },
            max_tokens: config.max_tokens,
        }
    }

    /// Hold size before the upstream call: prompt estimate plus the
    /// full completion budget, both at prompt rate.
    pub fn pre_quota(&self, estimated_prompt_tokens: i64, completion_budget: i64) -> i64 {
        let tokens = estimated_prompt_tokens.max(0) + completion_budget.max(0);
        ((tokens as f64) * self.ratio).ceil() as i64
    }

    /// True cost from measured usage.
    pub fn final_quota(&self, usage: &Usage) -> i64 {
        let prompt = usage.prompt_tokens.max(0) as f64;
        let completion = usage.completion_tokens.max(0) as f64;
        (prompt * self.ratio + completion * self.ratio * self.completion_ratio).ceil() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_defaults_to_unit_ratios() {
        let pricing = Pricing::from_model_config(None);
        assert_eq!(pricing.pre_quota(40, 60), 100);
        assert_eq!(pricing.final_quota(&Usage::new(40, 30)), 70);
    }

    #[test]
    fn completion_ratio_scales_output_cost() {
        let pricing = Pricing::from_model_config(Some(ModelConfig {
            ratio: 2.0,
            completion_ratio: 3.0,
            max_tokens: 8192,
        }));
        // 40 * 2 + 30 * 2 * 3 = 260.
        assert_eq!(pricing.final_quota(&Usage::new(40, 30)), 260);
        // (40 + 100) * 2 = 280.
        assert_eq!(pricing.pre_quota(40, 100), 280);
    }

    #[test]
    fn fractional_costs_round_up() {
        let pricing = Pricing::from_model_config(Some(ModelConfig {
            ratio: 0.3,
            completion_ratio: 1.0,
            max_tokens: 0,
        }));
        assert_eq!(pricing.final_quota(&Usage::new(1, 0)), 1);
    }
}
