use super::uci::{EngineLine, UciEngineFactory};
use super::{line_to_result, OracleError, SearchOracle};
use crate::config::{OracleConfig, ScorePerspective};
use crate::position::Position;
use crate::record::EvaluationResult;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub fen: String,
    pub depth: u32,
    /// Number of principal variations (MultiPV)
    pub lines: usize,
}

/// A single search process
pub trait Engine: Send {
    fn search(
        &mut self,
        request: &SearchRequest,
        deadline: Instant,
    ) -> Result<Vec<EngineLine>, OracleError>;

    /// A dead engine is dropped and replaced on the next request
    fn is_alive(&self) -> bool;
}

pub trait EngineFactory: Send + Sync {
    type Engine: Engine;

    fn spawn(&self) -> Result<Self::Engine, OracleError>;
}

pub type UciOracle = EnginePool<UciEngineFactory>;

/// Fixed number of engines shared by every caller.
///
/// Each slot travels through a channel; a caller takes a slot, searches and
/// puts it back. Empty slots (`None`) are filled lazily by the factory.
/// Callers waiting for a slot are bounded by `max_pending`.
pub struct EnginePool<F: EngineFactory> {
    factory: F,
    perspective: ScorePerspective,

    slots_tx: Sender<Option<F::Engine>>,
    slots_rx: Receiver<Option<F::Engine>>,

    waiting: AtomicUsize,
    max_pending: usize,
}

impl EnginePool<UciEngineFactory> {
    pub fn uci(config: &OracleConfig) -> Self {
        EnginePool::new(
            UciEngineFactory::new(config.clone()),
            config.pool_size,
            config.max_pending,
            config.score_perspective,
        )
    }
}

impl<F: EngineFactory> EnginePool<F> {
    pub fn new(
        factory: F,
        pool_size: usize,
        max_pending: usize,
        perspective: ScorePerspective,
    ) -> Self {
        let (slots_tx, slots_rx) = channel::bounded(pool_size);
        for _ in 0..pool_size {
            // cannot fail: the channel has room for every slot
            let _ = slots_tx.send(None);
        }

        EnginePool {
            factory,
            perspective,
            slots_tx,
            slots_rx,
            waiting: AtomicUsize::new(0),
            max_pending,
        }
    }

    fn acquire(&self, deadline: Instant) -> Result<Slot<'_, F>, OracleError> {
        if let Ok(engine) = self.slots_rx.try_recv() {
            return Ok(Slot { pool: self, engine });
        }

        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_pending {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(OracleError::Busy);
        }
        let received = self.slots_rx.recv_deadline(deadline);
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(engine) => Ok(Slot { pool: self, engine }),
            Err(RecvTimeoutError::Timeout) => Err(OracleError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(OracleError::Engine("engine pool closed".to_string()))
            }
        }
    }

    pub fn search(
        &self,
        request: &SearchRequest,
        time_budget: Duration,
    ) -> Result<Vec<EngineLine>, OracleError> {
        let deadline = Instant::now() + time_budget;
        let mut slot = self.acquire(deadline)?;

        if slot.engine.is_none() {
            slot.engine = Some(self.factory.spawn()?);
        }
        let Some(engine) = slot.engine.as_mut() else {
            return Err(OracleError::Engine("engine unavailable".to_string()));
        };

        let result = engine.search(request, deadline);
        if !engine.is_alive() {
            tracing::warn!("engine died, it will be restarted on the next request");
            slot.engine = None;
        }
        result
    }
}

/// Puts the engine back into the pool when dropped
struct Slot<'a, F: EngineFactory> {
    pool: &'a EnginePool<F>,
    engine: Option<F::Engine>,
}

impl<F: EngineFactory> Drop for Slot<'_, F> {
    fn drop(&mut self) {
        let _ = self.pool.slots_tx.send(self.engine.take());
    }
}

impl<F: EngineFactory> SearchOracle for EnginePool<F> {
    fn evaluate_lines(
        &self,
        position: &Position,
        depth: u32,
        time_budget: Duration,
        lines: usize,
    ) -> Result<Vec<EvaluationResult>, OracleError> {
        let request = SearchRequest {
            fen: position.fen(),
            depth,
            lines: lines.max(1),
        };
        let engine_lines = self.search(&request, time_budget)?;

        Ok(engine_lines
            .iter()
            .map(|line| line_to_result(line, self.perspective, position.turn()))
            .collect())
    }
}
