// =============================================================================
// Runtime Configuration -- engine settings with atomic save
// =============================================================================
//
// Every tunable of the engine lives in `CoreConfig`. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Persistence uses an atomic tmp + rename pattern to prevent
// corruption on crash.
//
// `validate()` runs once at startup; a failure is fatal and the process exits
// nonzero.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::agents::KNOWN_AGENTS;
use crate::types::{EngineMode, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_instruments() -> Vec<String> {
    vec!["NIFTY".to_string(), "BANKNIFTY".to_string()]
}

fn default_timeframes() -> Vec<Timeframe> {
    vec![Timeframe::M1, Timeframe::M5, Timeframe::M15]
}

fn default_primary_timeframe() -> Timeframe {
    Timeframe::M5
}

fn default_context_bars() -> usize {
    100
}

fn default_cycle_interval_seconds() -> u64 {
    60
}

fn default_agent_timeout_seconds() -> u64 {
    20
}

fn default_min_confidence() -> f64 {
    0.55
}

fn default_max_positions() -> usize {
    3
}

fn default_add_to_position_pct() -> f64 {
    0.5
}

fn default_signal_ttl_seconds() -> i64 {
    1800
}

fn default_base_quantity() -> f64 {
    1.0
}

fn default_session_offset_minutes() -> i64 {
    330 // midnight IST
}

fn default_agents() -> Vec<String> {
    vec![
        "momentum".to_string(),
        "trend".to_string(),
        "breakout".to_string(),
    ]
}

fn default_bus_queue_capacity() -> usize {
    1024
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_max_channels_per_conn() -> usize {
    50
}

fn default_max_wildcards_per_conn() -> usize {
    5
}

fn default_client_rate_msg_per_s() -> u64 {
    1000
}

fn default_outbound_buffer() -> usize {
    1024
}

fn default_idle_timeout_s() -> u64 {
    60
}

// =============================================================================
// GatewayConfig
// =============================================================================

/// Per-connection limits for the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum concrete channels + patterns per connection.
    #[serde(default = "default_max_channels_per_conn")]
    pub max_channels_per_conn: usize,

    /// Of which at most this many wildcard patterns.
    #[serde(default = "default_max_wildcards_per_conn")]
    pub max_wildcards_per_conn: usize,

    /// Outbound message budget per second; excess is dropped.
    #[serde(default = "default_client_rate_msg_per_s")]
    pub client_rate_msg_per_s: u64,

    /// Outbound buffer depth; overflow drops oldest.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Close the connection after this long without a client ping.
    #[serde(default = "default_idle_timeout_s")]
    pub idle_timeout_s: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_channels_per_conn: default_max_channels_per_conn(),
            max_wildcards_per_conn: default_max_wildcards_per_conn(),
            client_rate_msg_per_s: default_client_rate_msg_per_s(),
            outbound_buffer: default_outbound_buffer(),
            idle_timeout_s: default_idle_timeout_s(),
        }
    }
}

// =============================================================================
// CoreConfig
// =============================================================================

/// Top-level configuration for the engine core. The `Core` is constructible
/// from this value alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// paper or live execution.
    #[serde(default)]
    pub mode: EngineMode,

    /// Canonical instruments the engine trades.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<String>,

    /// Vendor symbol -> canonical instrument.
    #[serde(default)]
    pub instrument_aliases: HashMap<String, String>,

    /// Timeframes the candle builder maintains.
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<Timeframe>,

    /// Timeframe the orchestrator and signals monitor by default.
    #[serde(default = "default_primary_timeframe")]
    pub primary_timeframe: Timeframe,

    /// Closed bars handed to agents each cycle.
    #[serde(default = "default_context_bars")]
    pub context_bars: usize,

    #[serde(default = "default_cycle_interval_seconds")]
    pub cycle_interval_seconds: u64,

    #[serde(default = "default_agent_timeout_seconds")]
    pub agent_timeout_seconds: u64,

    /// Decisions below this aggregate confidence never become signals.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Open-position cap across all instruments.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Size fraction when adding to an existing position.
    #[serde(default = "default_add_to_position_pct")]
    pub add_to_position_pct: f64,

    #[serde(default = "default_signal_ttl_seconds")]
    pub signal_ttl_seconds: i64,

    /// Base order quantity (lots).
    #[serde(default = "default_base_quantity")]
    pub base_quantity: f64,

    /// Daily session boundary as a fixed UTC offset in minutes.
    #[serde(default = "default_session_offset_minutes")]
    pub session_offset_minutes: i64,

    /// Agents registered for the analysis cycle, by name.
    #[serde(default = "default_agents")]
    pub agents: Vec<String>,

    /// Per-agent vote weight; agents not listed weigh 1.0.
    #[serde(default)]
    pub agent_weights: HashMap<String, f64>,

    /// Completion endpoint for the llm agent, if configured.
    #[serde(default)]
    pub llm_url: Option<String>,

    /// Per-subscriber bus queue capacity.
    #[serde(default = "default_bus_queue_capacity")]
    pub bus_queue_capacity: usize,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::Paper,
            instruments: default_instruments(),
            instrument_aliases: HashMap::new(),
            timeframes: default_timeframes(),
            primary_timeframe: default_primary_timeframe(),
            context_bars: default_context_bars(),
            cycle_interval_seconds: default_cycle_interval_seconds(),
            agent_timeout_seconds: default_agent_timeout_seconds(),
            min_confidence: default_min_confidence(),
            max_positions: default_max_positions(),
            add_to_position_pct: default_add_to_position_pct(),
            signal_ttl_seconds: default_signal_ttl_seconds(),
            base_quantity: default_base_quantity(),
            session_offset_minutes: default_session_offset_minutes(),
            agents: default_agents(),
            agent_weights: HashMap::new(),
            llm_url: None,
            bus_queue_capacity: default_bus_queue_capacity(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = ?config.instruments,
            mode = %config.mode,
            "config loaded"
        );
        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Apply environment overrides (`MERIDIAN_*`).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(instruments) = std::env::var("MERIDIAN_INSTRUMENTS") {
            let parsed: Vec<String> = instruments
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.instruments = parsed;
            }
        }
        if let Ok(mode) = std::env::var("MERIDIAN_MODE") {
            match mode.to_lowercase().as_str() {
                "paper" => self.mode = EngineMode::Paper,
                "live" => self.mode = EngineMode::Live,
                other => warn!(mode = other, "unrecognized MERIDIAN_MODE ignored"),
            }
        }
        if let Ok(addr) = std::env::var("MERIDIAN_BIND_ADDR") {
            self.gateway.bind_addr = addr;
        }
        if let Ok(url) = std::env::var("MERIDIAN_LLM_URL") {
            self.llm_url = Some(url);
        }
    }

    /// Startup validation. Any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.instruments.is_empty() {
            bail!("config: instruments must not be empty");
        }
        if self.timeframes.is_empty() {
            bail!("config: timeframes must not be empty");
        }
        if !self.timeframes.contains(&self.primary_timeframe) {
            bail!(
                "config: primary_timeframe {} is not among the configured timeframes",
                self.primary_timeframe
            );
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            bail!("config: min_confidence must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.add_to_position_pct) {
            bail!("config: add_to_position_pct must be in [0, 1]");
        }
        if self.max_positions == 0 {
            bail!("config: max_positions must be at least 1");
        }
        if self.cycle_interval_seconds == 0 {
            bail!("config: cycle_interval_seconds must be positive");
        }
        if self.signal_ttl_seconds <= 0 {
            bail!("config: signal_ttl_seconds must be positive");
        }
        if self.base_quantity <= 0.0 || !self.base_quantity.is_finite() {
            bail!("config: base_quantity must be a positive finite number");
        }
        if self.context_bars == 0 {
            bail!("config: context_bars must be positive");
        }
        if self.agents.is_empty() {
            bail!("config: at least one agent must be registered");
        }
        for agent in &self.agents {
            if !KNOWN_AGENTS.contains(&agent.as_str()) {
                bail!("config: unknown agent '{agent}' (known: {KNOWN_AGENTS:?})");
            }
        }
        for (agent, weight) in &self.agent_weights {
            if !weight.is_finite() || *weight < 0.0 {
                bail!("config: weight for agent '{agent}' must be a non-negative finite number");
            }
        }
        if self.gateway.max_channels_per_conn == 0
            || self.gateway.client_rate_msg_per_s == 0
            || self.gateway.outbound_buffer == 0
            || self.gateway.idle_timeout_s == 0
        {
            bail!("config: gateway limits must all be positive");
        }
        Ok(())
    }

    /// Vote weight for an agent (1.0 unless configured otherwise).
    pub fn agent_weight(&self, agent_id: &str) -> f64 {
        self.agent_weights.get(agent_id).copied().unwrap_or(1.0)
    }
}
