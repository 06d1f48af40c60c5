//! The compute context passed into every collective dataset operation.
//!
//! It bundles what a worker needs to know about the job: its rank and the worker count
//! (through the collective backend), the device its buffers live on, a seeded random
//! generator and the engine configuration. There is no process-wide state.

use crate::config::EngineConfig;
use crate::device::{Cpu, Device};
use crate::distributed::{COORDINATOR, CollectiveBackend};
use crate::error::{DataSetError, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub struct ComputeContext<B: CollectiveBackend, D: Device = Cpu> {
    backend: B,
    device: D,
    rng: StdRng,
    config: EngineConfig,
}

impl<B: CollectiveBackend> ComputeContext<B, Cpu> {
    /// A context whose buffers live in host memory.
    pub fn cpu(backend: B, config: EngineConfig) -> Self {
        Self::new(backend, Cpu, config)
    }
}

impl<B: CollectiveBackend, D: Device> ComputeContext<B, D> {
    /// Creates a context; the generator is seeded with `config.seed + rank` so workers draw
    /// independent but reproducible streams.
    pub fn new(backend: B, device: D, config: EngineConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(backend.rank() as u64));
        Self {
            backend,
            device,
            rng,
            config,
        }
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    /// Whether this worker performs file I/O and roots collectives.
    pub fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Shares the outcome of a coordinator-only step with every worker.
    ///
    /// The coordinator passes `Some(outcome)`, everyone else `None`. The coordinator gets
    /// its own outcome back; the other workers get `Ok(None)` on success and
    /// [`DataSetError::PeerAborted`] if the coordinator failed, so no worker is left
    /// waiting in a collective the others never enter.
    pub fn broadcast_status<T>(
        &self,
        op: &'static str,
        outcome: Option<Result<T>>,
    ) -> Result<Option<T>> {
        let ok = matches!(outcome, Some(Ok(_)));
        let ok = self.backend.broadcast_flag(COORDINATOR, ok)?;
        if self.is_coordinator() {
            match outcome {
                Some(Ok(value)) => Ok(Some(value)),
                Some(Err(e)) => Err(e),
                None => Err(DataSetError::Communication(format!(
                    "{op}: coordinator produced no outcome"
                ))),
            }
        } else if ok {
            Ok(None)
        } else {
            Err(DataSetError::PeerAborted { op })
        }
    }
}
