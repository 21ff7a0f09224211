// =============================================================================
// Orchestrator -- the periodic multi-agent analysis cycle
// =============================================================================
//
// Every cycle, per instrument:
//   1. Build an AnalysisContext snapshot (bars, indicators, tick, positions,
//      regime hint) from the store and the position book. Agents never read
//      live state.
//   2. Fan out `analyze` to all registered agents concurrently with a
//      per-agent timeout. Timeouts, panics and `None` results are
//      abstentions; they never abort the cycle.
//   3. Aggregate the verdicts into one position-aware TradingDecision:
//      weighted vote per action, conservative tie-break
//      (EXIT > HOLD > BUY > SELL), then position gating.
//   4. If the decision carries a position action and clears the confidence
//      floor, mint a PENDING signal, persist it, and publish it.
//
// The cycle timer runs on the engine clock, so replay mode drives cycles in
// virtual time.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::{channels, MessageBus};
use crate::clock::{Clock, IdSource};
use crate::engine::agents::{self, Agent, LlmClient};
use crate::engine::context::AnalysisContext;
use crate::engine::decision::{AgentVerdict, PositionAction, TradingDecision};
use crate::engine::regime;
use crate::execution::positions::{Position, PositionBook};
use crate::market_data::OhlcBar;
use crate::runtime_config::CoreConfig;
use crate::signal::condition::Condition;
use crate::signal::model::{Signal, SignalStatus};
use crate::store::{keys, TickStore};
use crate::types::{PositionSide, TradeAction};

/// Decisions retained for the audit ring.
const MAX_RECENT_DECISIONS: usize = 100;

pub struct Orchestrator {
    config: Arc<RwLock<CoreConfig>>,
    bus: Arc<MessageBus>,
    store: Arc<TickStore>,
    book: Arc<PositionBook>,
    clock: Arc<dyn Clock>,
    ids: Arc<IdSource>,
    agents: Vec<Arc<dyn Agent>>,

    recent_decisions: RwLock<Vec<TradingDecision>>,
    cycles: AtomicU64,
    agent_failures: AtomicU64,
    rejected_signals: AtomicU64,
}

impl Orchestrator {
    /// Build the orchestrator and its agent set. Unknown agent names are a
    /// startup error.
    pub fn new(
        config: Arc<RwLock<CoreConfig>>,
        bus: Arc<MessageBus>,
        store: Arc<TickStore>,
        book: Arc<PositionBook>,
        clock: Arc<dyn Clock>,
        ids: Arc<IdSource>,
        llm_client: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let agent_names = config.read().agents.clone();
        let mut built: Vec<Arc<dyn Agent>> = Vec::with_capacity(agent_names.len());
        for name in &agent_names {
            match agents::build(name, llm_client.clone()) {
                Some(agent) => built.push(agent),
                None => bail!("unknown agent '{name}' in configuration"),
            }
        }

        Ok(Self {
            config,
            bus,
            store,
            book,
            clock,
            ids,
            agents: built,
            recent_decisions: RwLock::new(Vec::new()),
            cycles: AtomicU64::new(0),
            agent_failures: AtomicU64::new(0),
            rejected_signals: AtomicU64::new(0),
        })
    }

    /// Cycle loop. Spawned once at startup.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.read().cycle_interval_seconds);
        info!(interval_s = interval.as_secs(), "orchestrator started");
        loop {
            tokio::select! {
                _ = self.clock.sleep(interval) => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("orchestrator stopped");
    }

    /// One full cycle over every configured instrument.
    pub async fn run_cycle(&self) {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let instruments = self.config.read().instruments.clone();
        debug!(cycle, instruments = instruments.len(), "analysis cycle starting");

        for instrument in &instruments {
            self.analyze_instrument(instrument).await;
        }
    }

    /// Analyze one instrument and emit at most one decision (and signal).
    pub async fn analyze_instrument(&self, instrument: &str) -> Option<TradingDecision> {
        let ctx = self.build_context(instrument);
        let verdicts = self.fan_out(&ctx).await;

        let config = self.config.read().clone();
        let weighted: Vec<(AgentVerdict, f64)> = verdicts
            .into_iter()
            .map(|v| {
                let w = config.agent_weight(&v.agent_id);
                (v, w)
            })
            .collect();

        let decision = aggregate(
            instrument,
            &weighted,
            &ctx.open_positions,
            self.book.open_count(),
            &config,
            self.clock.now_ms(),
        )?;

        info!(
            instrument,
            action = %decision.action,
            confidence = decision.confidence,
            position_action = %decision.position_action,
            "decision aggregated"
        );

        self.push_decision(decision.clone());
        if let Ok(jsoned) = serde_json::to_value(&decision) {
            self.bus.publish(&channels::decision(instrument), jsoned);
        }

        if decision.position_action != PositionAction::None
            && decision.confidence >= config.min_confidence
        {
            self.emit_signal(&decision, &config);
        }

        Some(decision)
    }

    // ── Context ─────────────────────────────────────────────────────────

    /// Snapshot everything the agents get to see. Bars come from the store's
    /// bucket keys, walked backwards from now; missing buckets are gaps and
    /// are simply skipped.
    fn build_context(&self, instrument: &str) -> AnalysisContext {
        let config = self.config.read();
        let tf = config.primary_timeframe;
        let want = config.context_bars;
        drop(config);

        let now = self.clock.now_ms();
        let mut bars: Vec<OhlcBar> = Vec::with_capacity(want);
        let mut bucket = tf.bucket_start(now);
        // Scan with headroom so sparse sessions still fill the window.
        let mut scanned = 0usize;
        while bars.len() < want && scanned < want * 3 {
            bucket -= tf.duration_ms();
            scanned += 1;
            if bucket < 0 {
                break;
            }
            if let Some(bar) = self
                .store
                .get::<OhlcBar>(&keys::ohlc_bucket(instrument, tf, bucket))
            {
                bars.push(bar);
            }
        }
        bars.reverse();

        let market_regime = regime::classify(&bars);

        AnalysisContext {
            instrument: instrument.to_string(),
            timeframe: tf,
            bars,
            indicators: self.store.get(&keys::indicators_latest(instrument, tf)),
            last_tick: self.store.get(&keys::tick_latest(instrument)),
            open_positions: self.book.open_for(instrument),
            market_regime,
            now_ms: now,
        }
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    async fn fan_out(&self, ctx: &AnalysisContext) -> Vec<AgentVerdict> {
        let timeout = Duration::from_secs(self.config.read().agent_timeout_seconds);

        let mut handles = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let agent = agent.clone();
            let ctx = ctx.clone();
            let clock = self.clock.clone();
            let id = agent.id().to_string();
            handles.push((
                id,
                tokio::spawn(async move {
                    tokio::select! {
                        verdict = agent.analyze(&ctx) => verdict,
                        _ = clock.sleep(timeout) => None,
                    }
                }),
            ));
        }

        let mut verdicts = Vec::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(Some(verdict)) => verdicts.push(verdict),
                Ok(None) => {
                    debug!(agent = %id, "agent abstained or timed out");
                }
                Err(e) => {
                    self.agent_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(agent = %id, error = %e, "agent task failed -- treated as abstention");
                }
            }
        }
        verdicts
    }

    // ── Signal construction ─────────────────────────────────────────────

    fn emit_signal(&self, decision: &TradingDecision, config: &CoreConfig) {
        let now = self.clock.now_ms();

        // Closing decisions fire immediately; entries take the strongest
        // contributing condition, falling back to an immediate trigger.
        let is_close = matches!(
            decision.position_action,
            PositionAction::CloseLong | PositionAction::CloseShort
        );
        let condition = if is_close {
            Condition::Always
        } else {
            strongest_condition(decision, config).unwrap_or(Condition::Always)
        };

        let quantity = match decision.position_action {
            PositionAction::AddToLong | PositionAction::AddToShort => {
                config.base_quantity * config.add_to_position_pct
            }
            PositionAction::CloseLong | PositionAction::CloseShort => {
                self.close_quantity(decision)
            }
            _ => config.base_quantity,
        };

        let signal = Signal {
            signal_id: self.ids.next_id("sig"),
            instrument: decision.instrument.clone(),
            action: decision.action,
            status: SignalStatus::Pending,
            confidence: decision.confidence,
            condition,
            timeframe: config.primary_timeframe,
            entry_price: decision.entry_price,
            stop_loss: decision.stop_loss,
            take_profit: decision.take_profit,
            quantity,
            position_action: decision.position_action,
            created_at: now,
            expires_at: now + config.signal_ttl_seconds * 1000,
            triggered_at: None,
            trigger_snapshot: None,
            position_id: None,
            reason: None,
            metadata: json!({ "rationale": decision.rationale }),
        };

        if !signal.levels_sane() {
            self.rejected_signals.fetch_add(1, Ordering::Relaxed);
            warn!(
                instrument = %signal.instrument,
                action = %signal.action,
                entry = ?signal.entry_price,
                sl = ?signal.stop_loss,
                tp = ?signal.take_profit,
                "signal rejected: price levels fail sanity check"
            );
            return;
        }

        if self
            .store
            .put(&keys::signal(&signal.signal_id), &signal)
            .is_err()
        {
            warn!(signal_id = %signal.signal_id, "failed to persist signal -- not emitting");
            return;
        }
        self.store
            .set_add(&keys::signals_pending(&signal.instrument), &signal.signal_id);

        info!(
            signal_id = %signal.signal_id,
            instrument = %signal.instrument,
            action = %signal.action,
            confidence = signal.confidence,
            expires_at = signal.expires_at,
            "signal emitted"
        );

        if let Ok(jsoned) = serde_json::to_value(&signal) {
            self.bus
                .publish(&channels::signal(&signal.instrument), jsoned);
        }
    }

    fn close_quantity(&self, decision: &TradingDecision) -> f64 {
        let side = if decision.position_action == PositionAction::CloseLong {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        self.book
            .find_open(&decision.instrument, side)
            .map(|p| p.quantity)
            .unwrap_or(self.config.read().base_quantity)
    }

    fn push_decision(&self, decision: TradingDecision) {
        let mut ring = self.recent_decisions.write();
        ring.push(decision);
        while ring.len() > MAX_RECENT_DECISIONS {
            ring.remove(0);
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn recent_decisions(&self) -> Vec<TradingDecision> {
        self.recent_decisions.read().clone()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn agent_failure_count(&self) -> u64 {
        self.agent_failures.load(Ordering::Relaxed)
    }

    pub fn rejected_signal_count(&self) -> u64 {
        self.rejected_signals.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Aggregation (pure)
// =============================================================================

/// Weighted, position-aware vote aggregation.
///
/// `score(a) = sum over verdicts v with action a of weight(v) * confidence(v)`.
/// The winner is the highest score; ties break conservatively
/// (EXIT > HOLD > BUY > SELL). Aggregate confidence is the winner's score over
/// the total weighted confidence mass of all cast verdicts.
pub fn aggregate(
    instrument: &str,
    weighted: &[(AgentVerdict, f64)],
    open_positions: &[Position],
    total_open: usize,
    config: &CoreConfig,
    now_ms: i64,
) -> Option<TradingDecision> {
    if weighted.is_empty() {
        return None;
    }

    let mut scores: HashMap<TradeAction, f64> = HashMap::new();
    let mut total_mass = 0.0;
    for (verdict, weight) in weighted {
        let mass = weight * verdict.confidence;
        *scores.entry(verdict.action).or_insert(0.0) += mass;
        total_mass += mass;
    }
    if total_mass <= 0.0 {
        return None;
    }

    let (&chosen, &score) = scores
        .iter()
        .max_by(|(a1, s1), (a2, s2)| {
            s1.partial_cmp(s2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a1.priority().cmp(&a2.priority()))
        })?;
    let confidence = (score / total_mass).clamp(0.0, 1.0);

    // ── Position gating ─────────────────────────────────────────────────
    let has_long = open_positions
        .iter()
        .any(|p| p.instrument == instrument && p.side == PositionSide::Long);
    let has_short = open_positions
        .iter()
        .any(|p| p.instrument == instrument && p.side == PositionSide::Short);

    let mut action = chosen;
    let intended = match chosen {
        TradeAction::Buy => {
            if has_short {
                action = TradeAction::Exit;
                PositionAction::CloseShort
            } else if has_long {
                PositionAction::AddToLong
            } else {
                PositionAction::OpenNew
            }
        }
        TradeAction::Sell => {
            if has_long {
                action = TradeAction::Exit;
                PositionAction::CloseLong
            } else if has_short {
                PositionAction::AddToShort
            } else {
                PositionAction::OpenNew
            }
        }
        TradeAction::Exit => {
            if has_long {
                PositionAction::CloseLong
            } else if has_short {
                PositionAction::CloseShort
            } else {
                PositionAction::None
            }
        }
        TradeAction::Hold => PositionAction::None,
    };

    // At the position cap only EXIT/CLOSE actions proceed.
    let position_action = if total_open >= config.max_positions
        && matches!(
            intended,
            PositionAction::OpenNew | PositionAction::AddToLong | PositionAction::AddToShort
        ) {
        PositionAction::None
    } else {
        intended
    };
    if position_action == PositionAction::None {
        action = chosen;
    }

    // Price levels from the strongest contributing verdict for the winning
    // action (closes carry no entry levels).
    let (entry_price, stop_loss, take_profit) = if matches!(
        position_action,
        PositionAction::CloseLong | PositionAction::CloseShort
    ) {
        (None, None, None)
    } else {
        strongest_for(weighted, chosen)
            .map(|v| (v.entry_price, v.stop_loss, v.take_profit))
            .unwrap_or((None, None, None))
    };

    let contributing: Vec<AgentVerdict> = weighted.iter().map(|(v, _)| v.clone()).collect();
    let rationale = format!(
        "{chosen} score {score:.3} of {total_mass:.3} across {} verdicts ({})",
        contributing.len(),
        contributing
            .iter()
            .map(|v| format!("{}:{}@{:.2}", v.agent_id, v.action, v.confidence))
            .collect::<Vec<_>>()
            .join(", ")
    );

    Some(TradingDecision {
        instrument: instrument.to_string(),
        action,
        confidence,
        entry_price,
        stop_loss,
        take_profit,
        position_action,
        rationale,
        contributing,
        created_at: now_ms,
    })
}

/// Strongest (weight * confidence) verdict that voted for `action`.
fn strongest_for(weighted: &[(AgentVerdict, f64)], action: TradeAction) -> Option<&AgentVerdict> {
    weighted
        .iter()
        .filter(|(v, _)| v.action == action)
        .max_by(|(v1, w1), (v2, w2)| {
            (w1 * v1.confidence)
                .partial_cmp(&(w2 * v2.confidence))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(v, _)| v)
}

/// Condition from the strongest contributing verdict that attached one.
fn strongest_condition(decision: &TradingDecision, config: &CoreConfig) -> Option<Condition> {
    let vote_action = match decision.action {
        // EXIT decisions aggregate from the side that voted to leave.
        TradeAction::Exit => return None,
        other => other,
    };
    decision
        .contributing
        .iter()
        .filter(|v| v.action == vote_action && v.condition.is_some())
        .max_by(|v1, v2| {
            (config.agent_weight(&v1.agent_id) * v1.confidence)
                .partial_cmp(&(config.agent_weight(&v2.agent_id) * v2.confidence))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .and_then(|v| v.condition.clone())
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.agents.len())
            .field("cycles", &self.cycle_count())
            .finish()
    }
}
