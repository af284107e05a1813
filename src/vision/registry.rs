//! Model registry
//!
//! Owns the detection and recognition model slots. Each slot moves through
//! `Unloaded -> Loading -> Ready`, falls back to `Unloaded` when a load fails
//! and goes back to `Loading` whenever a different config is selected.
//!
//! Loads for one slot run one at a time. Every `select` bumps the slot's
//! generation; a load only publishes its result if its generation is still
//! current, so the slot always ends up matching the last `select`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::backend::OcrBackend;
use super::{ModelConfig, ModelSlot};
use crate::error::PipelineError;

/// A ready model: its config plus the shared backend handle
pub struct LoadedModel<M> {
    config: ModelConfig,
    handle: Arc<M>,
}

impl<M> LoadedModel<M> {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn handle(&self) -> &Arc<M> {
        &self.handle
    }
}

impl<M> Clone for LoadedModel<M> {
    fn clone(&self) -> Self {
        Self {
            config: self.config,
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<M> fmt::Debug for LoadedModel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel").field("config", &self.config).finish()
    }
}

/// Public lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unloaded,
    Loading,
    Ready,
}

/// Snapshot of one slot for logging and status output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotStatus {
    pub slot: ModelSlot,
    pub state: SlotState,
    pub config: Option<ModelConfig>,
}

/// What a slot currently holds
enum SlotCell<M> {
    Unloaded { error: Option<PipelineError> },
    Loading,
    Ready(LoadedModel<M>),
}

/// Selection bookkeeping, guarded separately from the published cell
struct SlotBook {
    config: Option<ModelConfig>,
    generation: u64,
}

struct Slot<M> {
    book: Mutex<SlotBook>,
    cell: watch::Sender<SlotCell<M>>,
    /// Serializes loads for this slot
    load_lock: tokio::sync::Mutex<()>,
}

impl<M> Slot<M> {
    fn new() -> Self {
        let (cell, _) = watch::channel(SlotCell::Unloaded { error: None });
        Self {
            book: Mutex::new(SlotBook {
                config: None,
                generation: 0,
            }),
            cell,
            load_lock: tokio::sync::Mutex::new(()),
        }
    }
}

/// Owns the lifecycle of the detection and recognition models
pub struct ModelRegistry<B: OcrBackend> {
    backend: Arc<B>,
    slots: [Arc<Slot<B::Model>>; 2],
}

impl<B: OcrBackend> ModelRegistry<B> {
    /// Create a registry with both slots unloaded
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slots: [Arc::new(Slot::new()), Arc::new(Slot::new())],
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn slot(&self, slot: ModelSlot) -> &Arc<Slot<B::Model>> {
        &self.slots[slot.index()]
    }

    /// Select a model for `slot`, starting a background load if the config
    /// changed or the previous load failed. Returns whether a load started.
    ///
    /// Must be called from within a tokio runtime.
    pub fn select(&self, slot: ModelSlot, config: ModelConfig) -> bool {
        let entry = Arc::clone(self.slot(slot));

        let generation = {
            let mut book = entry.book.lock();
            let failed = matches!(*entry.cell.borrow(), SlotCell::Unloaded { .. });
            if book.config == Some(config) && !failed {
                debug!("{} model {} already selected", slot, config);
                return false;
            }

            book.config = Some(config);
            book.generation += 1;
            // Replacing a ready cell releases the old handle
            entry.cell.send_replace(SlotCell::Loading);
            book.generation
        };

        info!("Selecting {} model {}", slot, config);
        tokio::spawn(load_slot(Arc::clone(&self.backend), entry, slot, config, generation));
        true
    }

    /// Current lifecycle state of a slot
    pub fn state(&self, slot: ModelSlot) -> SlotState {
        match &*self.slot(slot).cell.borrow() {
            SlotCell::Unloaded { .. } => SlotState::Unloaded,
            SlotCell::Loading => SlotState::Loading,
            SlotCell::Ready(_) => SlotState::Ready,
        }
    }

    /// State and selection of both slots, detection first
    pub fn status(&self) -> Vec<SlotStatus> {
        ModelSlot::ALL
            .into_iter()
            .map(|slot| SlotStatus {
                slot,
                state: self.state(slot),
                config: self.selected(slot),
            })
            .collect()
    }

    /// Config most recently selected for a slot
    pub fn selected(&self, slot: ModelSlot) -> Option<ModelConfig> {
        self.slot(slot).book.lock().config
    }

    /// Error left behind by the last failed load, if any
    pub fn last_error(&self, slot: ModelSlot) -> Option<PipelineError> {
        match &*self.slot(slot).cell.borrow() {
            SlotCell::Unloaded { error } => error.clone(),
            _ => None,
        }
    }

    /// Get a ready model without waiting
    pub fn get(&self, slot: ModelSlot) -> Result<LoadedModel<B::Model>, PipelineError> {
        match &*self.slot(slot).cell.borrow() {
            SlotCell::Ready(model) => Ok(model.clone()),
            _ => Err(PipelineError::ModelNotReady { slot }),
        }
    }

    /// Wait until a slot is ready.
    ///
    /// Fails with the load error if the current load fails, or with
    /// `ModelNotReady` if nothing was ever selected for the slot.
    pub async fn await_ready(&self, slot: ModelSlot) -> Result<LoadedModel<B::Model>, PipelineError> {
        let mut rx = self.slot(slot).cell.subscribe();
        loop {
            {
                let cell = rx.borrow_and_update();
                match &*cell {
                    SlotCell::Ready(model) => return Ok(model.clone()),
                    SlotCell::Unloaded { error: Some(e) } => return Err(e.clone()),
                    SlotCell::Unloaded { error: None } => {
                        return Err(PipelineError::ModelNotReady { slot });
                    }
                    SlotCell::Loading => {}
                }
            }
            if rx.changed().await.is_err() {
                return Err(PipelineError::ModelNotReady { slot });
            }
        }
    }

    /// Release both models and forget the selections
    pub fn unload_all(&self) {
        for slot in ModelSlot::ALL {
            let entry = self.slot(slot);
            let mut book = entry.book.lock();
            book.config = None;
            book.generation += 1;
            entry.cell.send_replace(SlotCell::Unloaded { error: None });
        }
        info!("Released all models");
    }
}

/// Background load for one `select` call
async fn load_slot<B: OcrBackend>(
    backend: Arc<B>,
    entry: Arc<Slot<B::Model>>,
    slot: ModelSlot,
    config: ModelConfig,
    generation: u64,
) {
    let _serial = entry.load_lock.lock().await;

    if entry.book.lock().generation != generation {
        debug!("Skipping superseded {} load of {}", slot, config.architecture);
        return;
    }

    let start = Instant::now();
    let result = tokio::task::spawn_blocking(move || backend.load_model(slot, &config))
        .await
        .unwrap_or_else(|e| Err(anyhow::anyhow!("model load task failed: {}", e)));

    let book = entry.book.lock();
    if book.generation != generation {
        // Dropping the result releases the superseded handle
        debug!("Discarding superseded {} model {}", slot, config.architecture);
        return;
    }

    match result {
        Ok(model) => {
            info!(
                "{} model {} ready in {:?}",
                slot,
                config.architecture,
                start.elapsed()
            );
            entry.cell.send_replace(SlotCell::Ready(LoadedModel {
                config,
                handle: Arc::new(model),
            }));
        }
        Err(e) => {
            error!("Failed to load {} model {}: {:#}", slot, config.architecture, e);
            entry.cell.send_replace(SlotCell::Unloaded {
                error: Some(PipelineError::LoadFailure {
                    slot,
                    architecture: config.architecture,
                    message: format!("{:#}", e),
                }),
            });
        }
    }
    drop(book);
}
