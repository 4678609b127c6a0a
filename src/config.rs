use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::engine::EngineConfig;
use crate::error::{BotError, Result};
use crate::instruments::InstrumentOverride;
use crate::resilience::ResilienceConfig;
use crate::risk::{PerformanceConfig, RiskConfig};
use crate::strategy::{PatternConfig, VolatilityConfig};

const ENV_PREFIX: &str = "RETESTBOT";

/// Simulated venue settings used by the binary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PaperConfig {
    pub starting_equity: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_equity: 10_000.0,
        }
    }
}

/// Every tunable threshold of the bot
///
/// Loaded once at startup; sections missing from the file keep their
/// defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotConfig {
    pub pattern: PatternConfig,
    pub volatility: VolatilityConfig,
    pub risk: RiskConfig,
    pub performance: PerformanceConfig,
    pub resilience: ResilienceConfig,
    pub engine: EngineConfig,
    pub paper: PaperConfig,
    /// Broker-reported instrument properties, keyed by symbol
    pub instruments: HashMap<String, InstrumentOverride>,
}

impl BotConfig {
    /// Defaults, then the optional TOML file, then `RETESTBOT_*` variables
    /// (`RETESTBOT_RISK__RISK_FRACTION=0.004`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&BotConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let mut config: BotConfig = builder
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        // Symbols are matched case-insensitively
        config.instruments = config
            .instruments
            .into_iter()
            .map(|(symbol, ov)| (symbol.to_uppercase(), ov))
            .collect();

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work together
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        let p = &self.pattern;
        if p.lookback == 0 {
            problems.push("pattern.lookback must be positive".to_string());
        }
        if p.min_breakout_pips < 0.0 || p.trigger_offset_pips < 0.0 {
            problems.push("pattern pip distances must not be negative".to_string());
        }
        if p.trigger_bar < 2 {
            problems.push("pattern.trigger_bar must be at least 2".to_string());
        }
        if p.timeout_bars < p.trigger_bar {
            problems.push("pattern.timeout_bars must not be below trigger_bar".to_string());
        }

        let v = &self.volatility;
        if v.window == 0 {
            problems.push("volatility.window must be positive".to_string());
        }
        if v.min_pips < 0.0 || v.min_pips > v.max_pips {
            problems.push(format!(
                "volatility band [{}, {}] is empty",
                v.min_pips, v.max_pips
            ));
        }

        let r = &self.risk;
        if !(r.risk_fraction > 0.0 && r.risk_fraction <= 0.05) {
            problems.push(format!(
                "risk.risk_fraction {} outside (0, 0.05]",
                r.risk_fraction
            ));
        }
        if r.max_risk_multiple < 1.0 {
            problems.push("risk.max_risk_multiple must be at least 1".to_string());
        }
        if r.account_currency.len() != 3 || !r.account_currency.chars().all(|c| c.is_ascii_alphabetic()) {
            problems.push(format!(
                "risk.account_currency {:?} is not a currency code",
                r.account_currency
            ));
        }

        let perf = &self.performance;
        if perf.profit_threshold <= 0.0 {
            problems.push("performance.profit_threshold must be positive".to_string());
        }
        if perf.week_start_hour_utc > 23 {
            problems.push("performance.week_start_hour_utc must be 0-23".to_string());
        }
        if perf.standard_reward_ratio <= 0.0 || perf.extended_reward_ratio <= 0.0 {
            problems.push("performance reward ratios must be positive".to_string());
        }

        let res = &self.resilience;
        if res.breaker.failure_threshold == 0 || res.breaker.success_threshold == 0 {
            problems.push("resilience.breaker thresholds must be positive".to_string());
        }
        if res.retry.max_attempts == 0 {
            problems.push("resilience.retry.max_attempts must be positive".to_string());
        }
        if res.retry.backoff_base < 1.0 {
            problems.push("resilience.retry.backoff_base must be at least 1".to_string());
        }
        if res.call_timeout_ms == 0 {
            problems.push("resilience.call_timeout_ms must be positive".to_string());
        }

        let e = &self.engine;
        if e.bar_buffer == 0 {
            problems.push("engine.bar_buffer must be positive".to_string());
        }
        if e.structure_timeframe.minutes() <= e.confirmation_timeframe.minutes() {
            problems.push(format!(
                "structure timeframe {} must be above confirmation timeframe {}",
                e.structure_timeframe, e.confirmation_timeframe
            ));
        }

        if self.paper.starting_equity <= 0.0 {
            problems.push("paper.starting_equity must be positive".to_string());
        }

        let mut symbols: Vec<_> = self.instruments.keys().collect();
        symbols.sort();
        for symbol in symbols {
            let ctx = self.instruments[symbol].resolve(symbol);
            problems.extend(
                ctx.problems()
                    .into_iter()
                    .map(|problem| format!("instruments.{}", problem)),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(BotError::Validation(problems.join("; ")))
        }
    }
}
