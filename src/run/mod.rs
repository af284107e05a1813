//! Run orchestration
//!
//! The [`RunController`] takes an uploaded file through preparation,
//! inference and reconciliation, and is the only writer of the
//! [`PresentationState`]. Every run gets a fresh [`RunToken`]; a stage may
//! only publish while its token is still current, and the check and the
//! publish happen under the same lock.

pub mod token;

pub use token::{RunContext, RunToken};

use anyhow::Context;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::shared::{EventBus, PresentationState, RunEvent, RunMetadata, RunPhase};
use crate::vision::{
    DetectionVariant, HeatmapBuffer, ImagePreparer, InferenceCoordinator, ModelConfig, ModelRegistry,
    ModelSlot, OcrBackend, RasterImage, RecognitionVariant, SlotState,
};
use crate::words::{reconcile, Word};

/// An image file handed to the pipeline
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Read a file from disk
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read image {:?}", path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, bytes })
    }
}

/// How a run ended, from the caller's point of view
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Results were published
    Completed { token: RunToken, word_count: usize },
    /// The run failed and its error was published
    Failed { token: RunToken, error: PipelineError },
    /// A newer run or a model change took over; nothing was published
    Superseded { token: RunToken },
}

impl RunOutcome {
    pub fn token(&self) -> RunToken {
        match self {
            RunOutcome::Completed { token, .. }
            | RunOutcome::Failed { token, .. }
            | RunOutcome::Superseded { token } => *token,
        }
    }
}

/// Token and cancellation of the current run
struct RunControl {
    current: RunToken,
    cancel: CancellationToken,
}

/// What a successful run hands to the final publish
struct RunResult {
    image: Arc<RasterImage>,
    words: Vec<Word>,
    heatmap: HeatmapBuffer,
}

/// Orchestrates OCR runs and owns the presentation state
pub struct RunController<B: OcrBackend> {
    preparer: ImagePreparer,
    registry: Arc<ModelRegistry<B>>,
    coordinator: Arc<InferenceCoordinator<B>>,
    control: Mutex<RunControl>,
    state: watch::Sender<PresentationState>,
    events: EventBus,
}

impl<B: OcrBackend> RunController<B> {
    pub fn new(
        preparer: ImagePreparer,
        registry: Arc<ModelRegistry<B>>,
        coordinator: Arc<InferenceCoordinator<B>>,
    ) -> Self {
        let (state, _) = watch::channel(PresentationState::default());
        Self {
            preparer,
            registry,
            coordinator,
            control: Mutex::new(RunControl {
                current: RunToken::default(),
                cancel: CancellationToken::new(),
            }),
            state,
            events: EventBus::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry<B>> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<InferenceCoordinator<B>> {
        &self.coordinator
    }

    /// Watch the presentation state
    pub fn subscribe(&self) -> watch::Receiver<PresentationState> {
        self.state.subscribe()
    }

    /// Copy of the current presentation state
    pub fn snapshot(&self) -> PresentationState {
        self.state.borrow().clone()
    }

    /// Whether a run is between upload and its final phase
    pub fn is_running(&self) -> bool {
        self.state.borrow().phase.is_busy()
    }

    /// Receive run events from now on
    pub fn events(&self) -> crossbeam_channel::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// Issue a new token, cancel the previous run and apply `update` in the
    /// same critical section
    fn advance(&self, update: impl FnOnce(&mut PresentationState)) -> RunContext {
        let mut control = self.control.lock();
        control.cancel.cancel();
        control.current = control.current.next();
        control.cancel = CancellationToken::new();

        let ctx = RunContext::new(control.current, control.cancel.clone());
        self.state.send_modify(|state| {
            state.token = ctx.token;
            update(state);
        });
        ctx
    }

    /// Apply `update` only if `ctx` is still the current run
    fn publish(&self, ctx: &RunContext, update: impl FnOnce(&mut PresentationState)) -> bool {
        let control = self.control.lock();
        if control.current != ctx.token {
            return false;
        }
        self.state.send_modify(update);
        true
    }

    fn enter_phase(&self, ctx: &RunContext, phase: RunPhase, update: impl FnOnce(&mut PresentationState)) -> bool {
        let published = self.publish(ctx, |state| {
            state.phase = phase;
            update(state);
        });
        if published {
            self.events.emit(RunEvent::PhaseChanged {
                token: ctx.token,
                phase,
            });
        }
        published
    }

    /// Run the whole pipeline on an uploaded file.
    ///
    /// Supersedes any run in flight. Displayed results are cleared when the
    /// run starts.
    pub async fn start_run(&self, file: UploadedFile) -> RunOutcome {
        let ctx = self.advance(|state| {
            state.clear_results();
            state.image = None;
            state.error = None;
            state.phase = RunPhase::Preparing;
            state.loading_image = true;
            state.extracting_words = false;
        });
        self.events.emit(RunEvent::PhaseChanged {
            token: ctx.token,
            phase: RunPhase::Preparing,
        });
        info!("{} started for {} ({} bytes)", ctx.token, file.name, file.bytes.len());

        let result = match self.prepare(&ctx, file.bytes).await {
            Ok(image) => self.infer(&ctx, image).await,
            Err(e) => Err(e),
        };
        self.finish(&ctx, result)
    }

    /// Re-run inference on the last prepared image, keeping the displayed
    /// results until the new ones are published. Returns `None` when there
    /// is no image to retry.
    pub async fn retry(&self) -> Option<RunOutcome> {
        let image = self.state.borrow().image.clone()?;

        let ctx = self.advance(|state| {
            state.error = None;
            state.phase = RunPhase::Inferring;
            state.loading_image = false;
            state.extracting_words = true;
        });
        self.events.emit(RunEvent::PhaseChanged {
            token: ctx.token,
            phase: RunPhase::Inferring,
        });
        info!("{} retrying inference", ctx.token);

        let result = self.infer(&ctx, image).await;
        Some(self.finish(&ctx, result))
    }

    /// Decode and downscale off the async threads
    async fn prepare(&self, ctx: &RunContext, bytes: Vec<u8>) -> Result<Arc<RasterImage>, PipelineError> {
        let preparer = self.preparer.clone();
        let task = tokio::task::spawn_blocking(move || preparer.prepare(&bytes));

        let prepared = tokio::select! {
            _ = ctx.cancel.cancelled() => Err(PipelineError::Cancelled),
            joined = task => joined
                .map_err(|e| PipelineError::Decode(format!("image preparation task failed: {}", e)))
                .and_then(|prepared| prepared),
        };
        let image = Arc::new(prepared?);
        debug!("{} prepared {}x{} image", ctx.token, image.width(), image.height());

        let published = self.enter_phase(ctx, RunPhase::Inferring, |state| {
            state.image = Some(Arc::clone(&image));
            state.loading_image = false;
            state.extracting_words = true;
        });
        if !published {
            return Err(PipelineError::Cancelled);
        }
        Ok(image)
    }

    /// Wait for both models, run inference and reconcile
    async fn infer(&self, ctx: &RunContext, image: Arc<RasterImage>) -> Result<RunResult, PipelineError> {
        for slot in ModelSlot::ALL {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(PipelineError::Cancelled),
                ready = self.registry.await_ready(slot) => {
                    ready?;
                }
            }
        }

        let output = self
            .coordinator
            .run(Arc::clone(&image), &self.registry, &ctx.cancel)
            .await?;

        if !self.enter_phase(ctx, RunPhase::Reconciling, |_| {}) {
            return Err(PipelineError::Cancelled);
        }

        Ok(RunResult {
            image,
            words: reconcile(output.candidates),
            heatmap: output.heatmap,
        })
    }

    /// Publish the outcome of a run if it is still current
    fn finish(&self, ctx: &RunContext, result: Result<RunResult, PipelineError>) -> RunOutcome {
        let token = ctx.token;
        match result {
            Ok(RunResult { image, words, heatmap }) => {
                let word_count = words.len();
                let metadata = RunMetadata {
                    processing_time: ctx.started.elapsed(),
                    file_size: image.source_size(),
                    resolution: image.resolution(),
                    word_count,
                };

                let published = self.publish(ctx, move |state| {
                    state.words = words;
                    state.heatmap = Some(Arc::new(heatmap));
                    state.metadata = Some(metadata);
                    state.phase = RunPhase::Done;
                    state.error = None;
                    state.clear_flags();
                });

                if published {
                    info!("{} done: {} words", token, word_count);
                    self.events.emit(RunEvent::Completed { token, word_count });
                    RunOutcome::Completed { token, word_count }
                } else {
                    self.discard(token)
                }
            }
            Err(error) if !error.is_reportable() => self.discard(token),
            Err(error) => {
                let message = error.to_string();
                let published = self.publish(ctx, |state| {
                    state.phase = RunPhase::Failed;
                    state.error = Some(message.clone());
                    state.clear_flags();
                });

                if published {
                    warn!("{} failed: {}", token, message);
                    self.events.emit(RunEvent::Failed { token, message });
                    RunOutcome::Failed { token, error }
                } else {
                    self.discard(token)
                }
            }
        }
    }

    fn discard(&self, token: RunToken) -> RunOutcome {
        debug!("{} superseded, result discarded", token);
        self.events.emit(RunEvent::Discarded { token });
        RunOutcome::Superseded { token }
    }

    /// Change the model of one slot.
    ///
    /// Clears the displayed image and results and invalidates any run in
    /// flight before the new model starts loading. Returns `false` without
    /// touching anything if `config` is already selected and usable.
    pub fn select_model(&self, config: ModelConfig) -> bool {
        let slot = config.slot;
        if self.registry.selected(slot) == Some(config) && self.registry.state(slot) != SlotState::Unloaded {
            return false;
        }

        let ctx = self.advance(|state| {
            state.clear_results();
            state.image = None;
            state.error = None;
            state.phase = RunPhase::Idle;
            state.clear_flags();
        });
        debug!("{} invalidated by {} model change", ctx.token, slot);

        self.events.emit(RunEvent::Cleared);
        self.events.emit(RunEvent::ModelSelected {
            slot,
            architecture: config.architecture,
        });
        self.registry.select(slot, config)
    }

    pub fn select_detection(&self, variant: DetectionVariant) -> bool {
        self.select_model(variant.into())
    }

    pub fn select_recognition(&self, variant: RecognitionVariant) -> bool {
        self.select_model(variant.into())
    }

    /// Back to `Idle` with nothing displayed
    pub fn reset(&self) {
        self.advance(|state| {
            let token = state.token;
            *state = PresentationState {
                token,
                ..Default::default()
            };
        });
        self.events.emit(RunEvent::Cleared);
    }

    /// Highlight (or un-highlight) one word. Activating a word deactivates
    /// the others. Returns `false` if no displayed word has `id`.
    pub fn set_word_active(&self, id: Uuid, active: bool) -> bool {
        let mut found = false;
        self.state.send_if_modified(|state| {
            let mut changed = false;
            for word in state.words.iter_mut() {
                let target = if word.id == id {
                    found = true;
                    active
                } else if active {
                    false
                } else {
                    word.is_active
                };
                if word.is_active != target {
                    word.is_active = target;
                    changed = true;
                }
            }
            changed
        });

        if found {
            self.events.emit(RunEvent::WordActivated { id, active });
        }
        found
    }
}
