use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use image::DynamicImage;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use shared::{PoolMode, TagMap};

use crate::dispatch::replica::ReplicaHandle;
use crate::error::TaggerError;
use crate::model::{DeviceKind, ModelLoader, TagModel, Vocabulary};
use crate::scoring;

struct PoolState {
    replicas: Vec<Arc<ReplicaHandle>>,
    cursor: usize,
    mode: PoolMode,
}

/// Round-robin pool of model replicas with one-way failover to a single
/// general-purpose replica.
///
/// Cursor, mode and replica list live behind one mutex and are only touched by
/// `select` and `demote`. `fallback` and `active` mirror mode and replica count
/// for readers that must not wait on a demotion; they are written under the
/// same mutex.
pub struct DispatchPool {
    loader: Arc<dyn ModelLoader>,
    vocabulary: Arc<Vocabulary>,
    executor: Option<ThreadPool>,
    state: Mutex<PoolState>,
    fallback: AtomicBool,
    active: AtomicUsize,
}

impl DispatchPool {
    /// Load the first replica on the accelerator if one is available. When it
    /// lands there, load `parallelism - 1` more; otherwise serve from that
    /// alone.
    pub fn start(
        loader: Arc<dyn ModelLoader>,
        vocabulary: Arc<Vocabulary>,
        parallelism: usize,
    ) -> Result<Self, TaggerError> {
        let first = loader.load(DeviceKind::Accelerator)?;

        if first.device() != DeviceKind::Accelerator {
            log::info!("No accelerator available; serving from a single general-purpose replica");
            return Self::assemble(
                loader,
                vocabulary,
                vec![first],
                PoolMode::SingleReplicaFallback,
            );
        }

        let mut models = vec![first];
        for _ in 1..parallelism.max(1) {
            models.push(loader.load(DeviceKind::Accelerator)?);
        }
        log::info!("Accelerator inference pool enabled with {} replicas", models.len());
        Self::assemble(loader, vocabulary, models, PoolMode::AcceleratorPool)
    }

    /// Build a pool from already loaded models, in the given mode.
    pub fn assemble(
        loader: Arc<dyn ModelLoader>,
        vocabulary: Arc<Vocabulary>,
        mut models: Vec<Box<dyn TagModel>>,
        mode: PoolMode,
    ) -> Result<Self, TaggerError> {
        if models.is_empty() {
            return Err(TaggerError::Config("a pool needs at least one replica".into()));
        }
        if mode == PoolMode::SingleReplicaFallback {
            models.truncate(1);
        }

        let executor = match mode {
            PoolMode::AcceleratorPool => Some(
                ThreadPoolBuilder::new()
                    .num_threads(models.len())
                    .thread_name(|i| format!("accel-infer-{}", i))
                    .build()
                    .map_err(|e| {
                        TaggerError::Config(format!("failed to start inference threads: {}", e))
                    })?,
            ),
            PoolMode::SingleReplicaFallback => None,
        };

        let replicas: Vec<_> = models
            .into_iter()
            .enumerate()
            .map(|(index, model)| Arc::new(ReplicaHandle::new(index, model)))
            .collect();

        Ok(Self {
            loader,
            vocabulary,
            executor,
            fallback: AtomicBool::new(mode == PoolMode::SingleReplicaFallback),
            active: AtomicUsize::new(replicas.len()),
            state: Mutex::new(PoolState {
                replicas,
                cursor: 0,
                mode,
            }),
        })
    }

    /// Current mode. Never blocks, even while a demotion is in progress.
    pub fn mode(&self) -> PoolMode {
        if self.fallback.load(Ordering::Acquire) {
            PoolMode::SingleReplicaFallback
        } else {
            PoolMode::AcceleratorPool
        }
    }

    pub fn replica_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Score a batch and rank each image's tags. Blocks until done.
    pub fn predict(
        &self,
        images: &[DynamicImage],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<TagMap>, TaggerError> {
        if images.is_empty() {
            return Ok(Vec::new());
        }

        let (replica, mode) = self.select();
        let rows = match self.execute(&replica, mode, images) {
            Ok(rows) => rows,
            Err(err) if err.is_device_fault() => {
                log::warn!(
                    "Device fault on replica {}: {}; retrying on the fallback replica",
                    replica.index(),
                    err
                );
                let fallback = self.demote()?;
                fallback.score(images)?
            }
            Err(err) => return Err(err),
        };

        scoring::rank_batch(&rows, &self.vocabulary, threshold, limit)
    }

    fn select(&self) -> (Arc<ReplicaHandle>, PoolMode) {
        let mut state = self.state.lock();
        let replica = Arc::clone(&state.replicas[state.cursor]);
        state.cursor = (state.cursor + 1) % state.replicas.len();
        (replica, state.mode)
    }

    fn execute(
        &self,
        replica: &ReplicaHandle,
        mode: PoolMode,
        images: &[DynamicImage],
    ) -> Result<Vec<Vec<f32>>, TaggerError> {
        match (mode, &self.executor) {
            (PoolMode::AcceleratorPool, Some(executor)) => {
                executor.install(|| replica.score(images))
            }
            _ => replica.score(images),
        }
    }

    /// Move the pool to single-replica fallback mode and return the sole
    /// replica. Only the first caller reinitializes; later callers get the
    /// already demoted replica.
    fn demote(&self) -> Result<Arc<ReplicaHandle>, TaggerError> {
        let mut state = self.state.lock();
        if state.mode == PoolMode::SingleReplicaFallback {
            return Ok(Arc::clone(&state.replicas[0]));
        }

        let model = self.loader.load(DeviceKind::General)?;
        let survivor = Arc::clone(&state.replicas[0]);
        survivor.degrade(model);

        let discarded = state.replicas.len() - 1;
        state.replicas.truncate(1);
        state.cursor = 0;
        state.mode = PoolMode::SingleReplicaFallback;
        self.active.store(1, Ordering::Release);
        self.fallback.store(true, Ordering::Release);
        log::warn!(
            "Accelerator pool demoted to a single general-purpose replica ({} replicas discarded)",
            discarded
        );
        Ok(survivor)
    }
}
