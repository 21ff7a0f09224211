// =============================================================================
// Core -- one value that owns every subsystem
// =============================================================================
//
// The engine has no globals and no singletons: `Core::build` wires the bus,
// store, clock, candle builder, indicator engine, position book, executor,
// orchestrator, signal monitor and gateway together from a `CoreConfig`, and
// tests construct a fresh one per case. Live mode without a broker adapter is
// a configuration error.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::bus::MessageBus;
use crate::clock::{Clock, IdSource, WallClock};
use crate::engine::agents::{HttpLlmClient, LlmClient};
use crate::engine::orchestrator::Orchestrator;
use crate::execution::broker::{BrokerAdapter, PaperBroker};
use crate::execution::executor::Executor;
use crate::execution::positions::PositionBook;
use crate::gateway::ws::Gateway;
use crate::indicators::engine::IndicatorEngine;
use crate::market_data::{CandleBuilder, InstrumentMap};
use crate::runtime_config::CoreConfig;
use crate::signal::monitor::SignalMonitor;
use crate::store::TickStore;
use crate::types::EngineMode;

pub struct Core {
    pub config: Arc<RwLock<CoreConfig>>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<IdSource>,
    pub bus: Arc<MessageBus>,
    pub store: Arc<TickStore>,
    pub builder: Arc<CandleBuilder>,
    pub indicators: Arc<IndicatorEngine>,
    pub book: Arc<PositionBook>,
    pub executor: Arc<Executor>,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<SignalMonitor>,
    pub gateway: Arc<Gateway>,
}

impl Core {
    /// Build with the wall clock and random IDs -- the live/paper default.
    pub fn new(config: CoreConfig) -> Result<Arc<Self>> {
        Self::build(config, Arc::new(WallClock), IdSource::random(), None)
    }

    /// Full wiring with explicit clock, id source, and optionally a broker
    /// adapter (required for live mode; paper mode ignores it).
    pub fn build(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<IdSource>,
        live_broker: Option<Arc<dyn BrokerAdapter>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let bus = Arc::new(MessageBus::new(config.bus_queue_capacity));
        let store = Arc::new(TickStore::new());

        let builder = Arc::new(CandleBuilder::new(
            bus.clone(),
            store.clone(),
            config.timeframes.clone(),
            InstrumentMap::new(config.instrument_aliases.clone()),
        ));

        let indicators = Arc::new(IndicatorEngine::new(
            bus.clone(),
            store.clone(),
            config.session_offset_minutes,
        ));

        let book = Arc::new(PositionBook::new(store.clone(), ids.clone()));

        let broker: Arc<dyn BrokerAdapter> = match config.mode {
            EngineMode::Paper => Arc::new(PaperBroker::new(store.clone(), ids.clone())),
            EngineMode::Live => match live_broker {
                Some(adapter) => adapter,
                None => bail!("live mode requires a broker adapter"),
            },
        };

        let executor = Arc::new(Executor::new(
            broker,
            book.clone(),
            bus.clone(),
            clock.clone(),
        ));

        let llm_client: Option<Arc<dyn LlmClient>> = config.llm_url.as_ref().map(|url| {
            let key = std::env::var("MERIDIAN_LLM_KEY").ok();
            Arc::new(HttpLlmClient::new(url.clone(), key)) as Arc<dyn LlmClient>
        });

        let shared_config = Arc::new(RwLock::new(config.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            shared_config.clone(),
            bus.clone(),
            store.clone(),
            book.clone(),
            clock.clone(),
            ids.clone(),
            llm_client,
        )?);

        let monitor = SignalMonitor::new(bus.clone(), store.clone(), clock.clone(), executor.clone());

        let gateway = Gateway::new(bus.clone(), clock.clone(), config.gateway.clone());

        info!(
            mode = %config.mode,
            instruments = ?config.instruments,
            agents = ?config.agents,
            "core wired"
        );

        Ok(Arc::new(Self {
            config: shared_config,
            clock,
            ids,
            bus,
            store,
            builder,
            indicators,
            book,
            executor,
            orchestrator,
            monitor,
            gateway,
        }))
    }

    /// Rebuild monitor and position working sets from the store (restart
    /// recovery). Returns (positions, signals) restored.
    pub fn restore(&self) -> (usize, usize) {
        let instruments = self.config.read().instruments.clone();
        let positions = self.book.restore(&instruments);
        let signals = self.monitor.restore(&instruments);
        (positions, signals)
    }

    /// Spawn every background loop. The returned handles finish after the
    /// shutdown signal flips.
    pub fn spawn_subsystems(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let bars = self.indicators.subscribe();
        handles.push(tokio::spawn(
            self.indicators.clone().run(bars, shutdown.clone()),
        ));

        handles.extend(self.monitor.spawn_loops(shutdown.clone()));

        handles.push(tokio::spawn(self.orchestrator.clone().run(shutdown)));

        handles
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("bus", &self.bus)
            .field("store", &self.store)
            .field("book", &self.book)
            .finish()
    }
}
