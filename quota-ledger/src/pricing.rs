//! Price resolution and charge computation
//!
//! A [`PriceSnapshot`] is resolved once per request, before the first
//! attempt, so every retry is billed against the same prices.
//!
//! Token-priced models:
//!
//! ```text
//! base       = prompt - cached - image - audio(if separately priced)
//! prompt_q   = base + cached * cache_ratio + image * image_ratio + audio * audio_ratio
//! complete_q = (completion - completion_audio) * completion_ratio
//!            + completion_audio * audio_ratio * audio_completion_ratio
//! quota      = (prompt_q + complete_q) * model_ratio * group_ratio + tools
//! ```
//!
//! Per-call priced models: `model_price * quota_per_unit * group_ratio + tools`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::{BuiltInTool, Quota, Usage};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Default web search context size
pub const DEFAULT_SEARCH_CONTEXT_SIZE: &str = "medium";

/// Configured prices
///
/// Ratios are relative to the base unit; prices are in currency and
/// converted with `quota_per_unit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    /// Per-token multiplier by model
    pub model_ratio: HashMap<String, Decimal>,

    /// Per-call price by model (takes precedence over the ratio)
    pub model_price: HashMap<String, Decimal>,

    /// Completion multiplier by model (default 1)
    pub completion_ratio: HashMap<String, Decimal>,

    /// Cached prompt multiplier by model (default 1)
    pub cache_ratio: HashMap<String, Decimal>,

    /// Image input multiplier by model (default 1)
    pub image_ratio: HashMap<String, Decimal>,

    /// Audio input multiplier by model (absent: audio billed as text)
    pub audio_ratio: HashMap<String, Decimal>,

    /// Audio output multiplier relative to audio input (default 1)
    pub audio_completion_ratio: HashMap<String, Decimal>,

    /// Audio input price per million tokens, added on top of the token charge
    pub audio_input_price: HashMap<String, Decimal>,

    /// Multiplier by user group (default 1)
    pub group_ratio: HashMap<String, Decimal>,

    /// Web search price per thousand calls, by context size
    pub web_search_price: HashMap<String, Decimal>,

    /// File search price per thousand calls
    pub file_search_price: Decimal,
}

impl Default for PriceTable {
    fn default() -> Self {
        let model_ratio = [
            ("gpt-4o", Decimal::new(125, 2)),
            ("gpt-4o-mini", Decimal::new(75, 3)),
            ("gpt-4o-search-preview", Decimal::new(125, 2)),
            ("gpt-3.5-turbo", Decimal::new(25, 2)),
            ("claude-3-5-sonnet-20241022", Decimal::new(15, 1)),
            ("deepseek-chat", Decimal::new(135, 3)),
            ("text-embedding-3-small", Decimal::new(1, 2)),
        ];
        let completion_ratio = [
            ("gpt-4o", Decimal::from(4)),
            ("gpt-4o-mini", Decimal::from(4)),
            ("gpt-4o-search-preview", Decimal::from(4)),
            ("gpt-3.5-turbo", Decimal::from(3)),
            ("claude-3-5-sonnet-20241022", Decimal::from(5)),
            ("deepseek-chat", Decimal::from(2)),
        ];
        let cache_ratio = [
            ("gpt-4o", Decimal::new(5, 1)),
            ("gpt-4o-mini", Decimal::new(5, 1)),
            ("claude-3-5-sonnet-20241022", Decimal::new(1, 1)),
        ];
        let group_ratio = [
            ("default", Decimal::ONE),
            ("vip", Decimal::ONE),
            ("svip", Decimal::ONE),
        ];
        let web_search_price = [
            ("low", Decimal::from(30)),
            ("medium", Decimal::from(35)),
            ("high", Decimal::from(50)),
        ];
        fn owned(entries: &[(&str, Decimal)]) -> HashMap<String, Decimal> {
            entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        }

        Self {
            model_ratio: owned(&model_ratio),
            model_price: owned(&[("dall-e-3", Decimal::new(4, 2))]),
            completion_ratio: owned(&completion_ratio),
            cache_ratio: owned(&cache_ratio),
            image_ratio: HashMap::new(),
            audio_ratio: HashMap::new(),
            audio_completion_ratio: HashMap::new(),
            audio_input_price: HashMap::new(),
            group_ratio: owned(&group_ratio),
            web_search_price: owned(&web_search_price),
            file_search_price: Decimal::new(25, 1),
        }
    }
}

/// What a price lookup needs to know about the request
#[derive(Debug, Clone, Default)]
pub struct PriceQuery<'a> {
    /// Upstream model name
    pub model: &'a str,
    /// Billing group
    pub group: &'a str,
    /// Estimated prompt tokens
    pub prompt_tokens: u32,
    /// Requested `max_tokens` (0 when unset)
    pub max_tokens: u32,
}

impl PriceTable {
    /// Resolve the prices for one request
    pub fn resolve(&self, query: &PriceQuery<'_>, config: &Config) -> Result<PriceSnapshot> {
        let group_ratio = match self.group_ratio.get(query.group) {
            Some(ratio) => *ratio,
            None => {
                warn!(group = query.group, "group ratio not found, using 1");
                Decimal::ONE
            }
        };

        let model_price = self.model_price.get(query.model).copied();
        let model_ratio = match (self.model_ratio.get(query.model), model_price) {
            (Some(ratio), _) => *ratio,
            (None, Some(_)) => Decimal::ZERO,
            (None, None) if config.allow_unpriced_models => {
                warn!(model = query.model, "model has no price, billing at ratio 1");
                Decimal::ONE
            }
            (None, None) => {
                return Err(Error::PriceNotFound {
                    model: query.model.to_string(),
                })
            }
        };

        let ratio_or_one = |table: &HashMap<String, Decimal>| {
            table.get(query.model).copied().unwrap_or(Decimal::ONE)
        };

        let mut snapshot = PriceSnapshot {
            model_name: query.model.to_string(),
            group: query.group.to_string(),
            model_ratio,
            group_ratio,
            model_price,
            completion_ratio: ratio_or_one(&self.completion_ratio),
            cache_ratio: ratio_or_one(&self.cache_ratio),
            image_ratio: ratio_or_one(&self.image_ratio),
            audio_ratio: self.audio_ratio.get(query.model).copied(),
            audio_completion_ratio: ratio_or_one(&self.audio_completion_ratio),
            audio_input_price: self.audio_input_price.get(query.model).copied(),
            web_search_price: self.web_search_price.clone(),
            file_search_price: self.file_search_price,
            quota_per_unit: config.quota_per_unit,
            estimated_quota: 0,
        };
        snapshot.estimated_quota = snapshot.estimate(query, config);
        Ok(snapshot)
    }
}

/// Prices fixed for the lifetime of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    /// Upstream model name
    pub model_name: String,

    /// Billing group
    pub group: String,

    /// Per-token multiplier
    pub model_ratio: Decimal,

    /// Group multiplier
    pub group_ratio: Decimal,

    /// Per-call price, if the model is priced per call
    pub model_price: Option<Decimal>,

    /// Completion multiplier
    pub completion_ratio: Decimal,

    /// Cached prompt multiplier
    pub cache_ratio: Decimal,

    /// Image input multiplier
    pub image_ratio: Decimal,

    /// Audio input multiplier when audio is priced separately
    pub audio_ratio: Option<Decimal>,

    /// Audio output multiplier
    pub audio_completion_ratio: Decimal,

    /// Audio input price per million tokens
    pub audio_input_price: Option<Decimal>,

    /// Web search price per thousand calls, by context size
    pub web_search_price: HashMap<String, Decimal>,

    /// File search price per thousand calls
    pub file_search_price: Decimal,

    /// Quota units per currency unit
    pub quota_per_unit: Decimal,

    /// Amount to reserve before the upstream call
    pub estimated_quota: Quota,
}

/// Itemised charge for one settled request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeBreakdown {
    /// Token charge before tools (or the per-call price)
    pub base_quota: Decimal,

    /// Web search surcharge
    pub web_search_quota: Decimal,

    /// File search surcharge
    pub file_search_quota: Decimal,

    /// Audio input surcharge
    pub audio_input_quota: Decimal,

    /// Final rounded charge
    pub quota: Quota,

    /// Upstream reported no tokens
    pub probable_upstream_error: bool,

    /// Human readable price summary for the usage log
    pub summary: String,
}

impl PriceSnapshot {
    /// Whether the model is billed per call
    pub fn uses_price(&self) -> bool {
        self.model_price.is_some()
    }

    fn estimate(&self, query: &PriceQuery<'_>, config: &Config) -> Quota {
        if let Some(price) = self.model_price {
            return round_quota(price * self.quota_per_unit * self.group_ratio);
        }
        let tokens = if query.max_tokens > 0 {
            u64::from(query.prompt_tokens) + u64::from(query.max_tokens)
        } else {
            u64::from(config.default_pre_consume_tokens)
        };
        round_quota(Decimal::from(tokens) * self.model_ratio * self.group_ratio)
    }

    /// Compute the final charge for observed usage
    pub fn charge(&self, usage: &Usage) -> ChargeBreakdown {
        let ratio = self.model_ratio * self.group_ratio;
        let details = &usage.prompt_tokens_details;

        let base_quota = match self.model_price {
            Some(price) => price * self.quota_per_unit * self.group_ratio,
            None => {
                let cached = Decimal::from(details.cached_tokens);
                let image = Decimal::from(details.image_tokens);
                let audio = Decimal::from(details.audio_tokens);

                let mut base = Decimal::from(usage.prompt_tokens) - cached - image;
                let mut prompt_quota = cached * self.cache_ratio + image * self.image_ratio;
                let mut completion_text = Decimal::from(usage.completion_tokens);
                let mut completion_quota = Decimal::ZERO;
                if let Some(audio_ratio) = self.audio_ratio {
                    let completion_audio =
                        Decimal::from(usage.completion_tokens_details.audio_tokens);
                    base -= audio;
                    prompt_quota += audio * audio_ratio;
                    completion_text -= completion_audio;
                    completion_quota +=
                        completion_audio * audio_ratio * self.audio_completion_ratio;
                }
                prompt_quota += base;
                completion_quota += completion_text * self.completion_ratio;

                (prompt_quota + completion_quota) * ratio
            }
        };

        let per_thousand = self.quota_per_unit * self.group_ratio / Decimal::from(1000);

        let mut web_search_quota = Decimal::ZERO;
        let mut web_search_note = None;
        if let Some(tool) = usage.tool(BuiltInTool::WebSearch) {
            let size = tool
                .search_context_size
                .as_deref()
                .unwrap_or(DEFAULT_SEARCH_CONTEXT_SIZE);
            let price = self
                .web_search_price
                .get(size)
                .or_else(|| self.web_search_price.get(DEFAULT_SEARCH_CONTEXT_SIZE))
                .copied()
                .unwrap_or(Decimal::ZERO);
            web_search_quota = price * Decimal::from(tool.call_count) * per_thousand;
            web_search_note = Some(format!(
                "web search {} calls ({}), price {}/1K",
                tool.call_count, size, price
            ));
        }

        let mut file_search_quota = Decimal::ZERO;
        let mut file_search_note = None;
        if let Some(tool) = usage.tool(BuiltInTool::FileSearch) {
            file_search_quota =
                self.file_search_price * Decimal::from(tool.call_count) * per_thousand;
            file_search_note = Some(format!(
                "file search {} calls, price {}/1K",
                tool.call_count, self.file_search_price
            ));
        }

        let mut audio_input_quota = Decimal::ZERO;
        if let Some(price) = self.audio_input_price {
            let audio_tokens = Decimal::from(details.audio_tokens);
            audio_input_quota = price / Decimal::from(1_000_000)
                * audio_tokens
                * self.group_ratio
                * self.quota_per_unit;
        }

        let total = base_quota + web_search_quota + file_search_quota + audio_input_quota;
        let mut quota = round_quota(total);

        // Positive charges that round away still cost one unit.
        if quota <= 0 && (total > Decimal::ZERO || (!self.uses_price() && !ratio.is_zero())) {
            quota = 1;
        }

        let probable_upstream_error = usage.billable_tokens() == 0;
        if probable_upstream_error {
            quota = 0;
        }

        let mut summary = match self.model_price {
            Some(price) => format!(
                "model price {}, group ratio {}",
                price.normalize(),
                self.group_ratio.normalize()
            ),
            None => format!(
                "model ratio {}, completion ratio {}, group ratio {}",
                self.model_ratio.normalize(),
                self.completion_ratio.normalize(),
                self.group_ratio.normalize()
            ),
        };
        for note in [web_search_note, file_search_note].into_iter().flatten() {
            summary.push_str(", ");
            summary.push_str(&note);
        }
        if probable_upstream_error {
            summary.push_str(" (probable upstream error)");
        }

        ChargeBreakdown {
            base_quota,
            web_search_quota,
            file_search_quota,
            audio_input_quota,
            quota,
            probable_upstream_error,
            summary,
        }
    }
}

/// Round half away from zero to whole quota units
pub fn round_quota(value: Decimal) -> Quota {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(Quota::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PromptTokensDetails, ToolUsage};
    use rust_decimal_macros::dec;

    fn table() -> PriceTable {
        let mut table = PriceTable::default();
        table.model_ratio.insert("m".into(), dec!(1));
        table.group_ratio.insert("g".into(), dec!(1));
        table
    }

    fn snapshot(query: PriceQuery<'_>) -> PriceSnapshot {
        table().resolve(&query, &Config::default()).unwrap()
    }

    fn query(model: &str) -> PriceQuery<'_> {
        PriceQuery {
            model,
            group: "g",
            prompt_tokens: 0,
            max_tokens: 0,
        }
    }

    #[test]
    fn test_estimate_uses_max_tokens() {
        let prices = snapshot(PriceQuery {
            prompt_tokens: 3,
            max_tokens: 2,
            ..query("m")
        });
        assert_eq!(prices.estimated_quota, 5);
    }

    #[test]
    fn test_estimate_defaults_without_max_tokens() {
        let prices = snapshot(PriceQuery {
            prompt_tokens: 3,
            ..query("m")
        });
        assert_eq!(prices.estimated_quota, 500);
    }

    #[test]
    fn test_plain_token_charge() {
        let prices = snapshot(query("m"));
        let charge = prices.charge(&Usage::new(4, 3));
        assert_eq!(charge.quota, 7);
        assert!(!charge.probable_upstream_error);
    }

    #[test]
    fn test_sub_unit_charge_rounds_up_to_one() {
        let mut table = table();
        table.model_ratio.insert("tiny".into(), dec!(0.001));
        let prices = table.resolve(&query("tiny"), &Config::default()).unwrap();

        let charge = prices.charge(&Usage::new(10, 10));
        assert_eq!(charge.quota, 1);
    }

    #[test]
    fn test_zero_tokens_forces_zero_charge() {
        let prices = snapshot(query("m"));
        let charge = prices.charge(&Usage::default());
        assert_eq!(charge.quota, 0);
        assert!(charge.probable_upstream_error);
        assert!(charge.summary.contains("probable upstream error"));
    }

    #[test]
    fn test_cached_tokens_discounted() {
        let mut table = table();
        table.cache_ratio.insert("m".into(), dec!(0.5));
        let prices = table.resolve(&query("m"), &Config::default()).unwrap();

        let usage = Usage {
            prompt_tokens: 100,
            completion_tokens: 0,
            total_tokens: 100,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: 40,
                ..Default::default()
            },
            ..Default::default()
        };
        // 60 + 40 * 0.5
        assert_eq!(prices.charge(&usage).quota, 80);
    }

    #[test]
    fn test_audio_billed_as_text_without_ratio() {
        let prices = snapshot(query("m"));
        let usage = Usage {
            prompt_tokens: 50,
            total_tokens: 50,
            prompt_tokens_details: PromptTokensDetails {
                audio_tokens: 20,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(prices.charge(&usage).quota, 50);
    }

    #[test]
    fn test_separately_priced_audio() {
        let mut table = table();
        table.audio_ratio.insert("m".into(), dec!(8));
        table.audio_completion_ratio.insert("m".into(), dec!(2));
        let prices = table.resolve(&query("m"), &Config::default()).unwrap();

        let usage = Usage {
            prompt_tokens: 30,
            completion_tokens: 15,
            total_tokens: 45,
            prompt_tokens_details: PromptTokensDetails {
                audio_tokens: 10,
                ..Default::default()
            },
            completion_tokens_details: crate::types::CompletionTokensDetails {
                audio_tokens: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        // (20 + 10 * 8) + (10 + 5 * 8 * 2)
        assert_eq!(prices.charge(&usage).quota, 190);
    }

    #[test]
    fn test_group_ratio_multiplies() {
        let mut table = table();
        table.group_ratio.insert("vip".into(), dec!(0.5));
        let prices = table
            .resolve(
                &PriceQuery {
                    group: "vip",
                    ..query("m")
                },
                &Config::default(),
            )
            .unwrap();
        assert_eq!(prices.charge(&Usage::new(10, 10)).quota, 10);
    }

    #[test]
    fn test_per_call_price() {
        let mut table = table();
        table.model_price.insert("img".into(), dec!(0.04));
        let prices = table.resolve(&query("img"), &Config::default()).unwrap();

        assert!(prices.uses_price());
        assert_eq!(prices.estimated_quota, 20_000);
        assert_eq!(prices.charge(&Usage::new(1, 0)).quota, 20_000);
    }

    #[test]
    fn test_web_search_surcharge() {
        let prices = snapshot(query("m"));
        let usage = Usage {
            tool_calls: vec![ToolUsage {
                tool: BuiltInTool::WebSearch,
                call_count: 2,
                search_context_size: Some("low".into()),
            }],
            ..Usage::new(10, 0)
        };
        let charge = prices.charge(&usage);
        // 30 / 1000 * 2 * 500_000
        assert_eq!(charge.web_search_quota, dec!(30000));
        assert_eq!(charge.quota, 30_010);
        assert!(charge.summary.contains("web search 2 calls (low)"));
    }

    #[test]
    fn test_file_search_surcharge() {
        let prices = snapshot(query("m"));
        let usage = Usage {
            tool_calls: vec![ToolUsage {
                tool: BuiltInTool::FileSearch,
                call_count: 4,
                search_context_size: None,
            }],
            ..Usage::new(10, 0)
        };
        assert_eq!(prices.charge(&usage).quota, 5_010);
    }

    #[test]
    fn test_unknown_model_rejected() {
        let err = table()
            .resolve(&query("nope"), &Config::default())
            .unwrap_err();
        assert!(matches!(err, Error::PriceNotFound { .. }));
    }

    #[test]
    fn test_unknown_model_allowed_when_configured() {
        let config = Config {
            allow_unpriced_models: true,
            ..Config::default()
        };
        let prices = table().resolve(&query("nope"), &config).unwrap();
        assert_eq!(prices.model_ratio, Decimal::ONE);
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_quota(dec!(2.5)), 3);
        assert_eq!(round_quota(dec!(2.4)), 2);
        assert_eq!(round_quota(dec!(-2.5)), -3);
    }
}
