//! Inference coordination
//!
//! Runs detection then recognition for one prepared image under a time
//! budget, either on the blocking pool of the current runtime or on an
//! offloaded worker thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::OcrBackend;
use super::registry::{LoadedModel, ModelRegistry};
use super::worker::{WorkerHandle, WorkerRequest};
use super::{ExecutionStrategy, InferenceOutput, ModelSlot, RasterImage, TileSize};
use crate::error::PipelineError;

/// Default time budget for one inference pass
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Coordinator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub strategy: ExecutionStrategy,
    pub timeout: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Direct,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// The single offloaded worker and the request it is serving
#[derive(Default)]
struct WorkerSlot {
    handle: Option<WorkerHandle>,
    /// Id and cancel token of the newest submitted request
    in_flight: Option<(u64, CancellationToken)>,
    next_request: u64,
}

/// Runs the two OCR stages for one image
pub struct InferenceCoordinator<B: OcrBackend> {
    backend: Arc<B>,
    options: CoordinatorOptions,
    worker: Mutex<WorkerSlot>,
    live_workers: Arc<AtomicUsize>,
    next_worker_id: AtomicU64,
}

impl<B: OcrBackend> InferenceCoordinator<B> {
    pub fn new(backend: Arc<B>, options: CoordinatorOptions) -> Self {
        Self {
            backend,
            options,
            worker: Mutex::new(WorkerSlot::default()),
            live_workers: Arc::new(AtomicUsize::new(0)),
            next_worker_id: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Number of offloaded worker threads that have not exited yet
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Run detection and recognition on `image`.
    ///
    /// Both models must already be ready in `registry`. The pass is abandoned
    /// with `Timeout` once the budget runs out, or `Cancelled` when `cancel`
    /// fires first.
    pub async fn run(
        &self,
        image: Arc<RasterImage>,
        registry: &ModelRegistry<B>,
        cancel: &CancellationToken,
    ) -> Result<InferenceOutput, PipelineError> {
        let detection = registry.get(ModelSlot::Detection)?;
        let recognition = registry.get(ModelSlot::Recognition)?;

        // Stops a blocking pass between stages once this call returns
        let job_cancel = cancel.child_token();
        let _abort_on_exit = job_cancel.clone().drop_guard();

        let start = Instant::now();
        let work = async {
            match self.options.strategy {
                ExecutionStrategy::Direct => {
                    self.run_direct(Arc::clone(&image), detection, recognition, job_cancel.clone())
                        .await
                }
                ExecutionStrategy::Offloaded => {
                    self.run_offloaded(&image, &detection, &recognition, job_cancel.clone())
                        .await
                }
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(self.options.timeout, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(self.options.timeout)),
            },
        };

        match &result {
            Ok(output) => info!(
                "Inference ({:?}) found {} words in {:?}",
                self.options.strategy,
                output.candidates.len(),
                start.elapsed()
            ),
            Err(PipelineError::Cancelled) => debug!("Inference cancelled after {:?}", start.elapsed()),
            Err(e) => warn!("Inference failed after {:?}: {}", start.elapsed(), e),
        }

        result
    }

    async fn run_direct(
        &self,
        image: Arc<RasterImage>,
        detection: LoadedModel<B::Model>,
        recognition: LoadedModel<B::Model>,
        cancel: CancellationToken,
    ) -> Result<InferenceOutput, PipelineError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            infer_blocking(
                backend.as_ref(),
                detection.handle(),
                detection.config().input_size,
                recognition.handle(),
                recognition.config().input_size,
                &image,
                &cancel,
            )
        })
        .await
        .map_err(|e| PipelineError::inference("Inference task", e))?
    }

    /// Send the job to the coordinator's single worker.
    ///
    /// A newer request cancels the one before it, so the worker skips or
    /// abandons the older job instead of a second thread being started. A
    /// timed-out job is cancelled the same way and the worker picks up the
    /// next request once it lets go of it.
    async fn run_offloaded(
        &self,
        image: &RasterImage,
        detection: &LoadedModel<B::Model>,
        recognition: &LoadedModel<B::Model>,
        cancel: CancellationToken,
    ) -> Result<InferenceOutput, PipelineError> {
        let (reply, response) = oneshot::channel();
        let request_id = self.submit(WorkerRequest {
            image: image.clone(),
            detection: *detection.config(),
            recognition: *recognition.config(),
            cancel,
            reply,
        })?;

        let result = match response.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::inference(
                "Offloaded inference",
                "worker exited without replying",
            )),
        };
        self.settle(request_id, &result);
        result
    }

    fn submit(&self, request: WorkerRequest) -> Result<u64, PipelineError> {
        let mut slot = self.worker.lock();
        if let Some((previous, token)) = slot.in_flight.take() {
            debug!("Offloaded request {} superseded", previous);
            token.cancel();
        }

        let worker = match slot.handle.take() {
            Some(worker) => worker,
            None => {
                let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
                WorkerHandle::spawn(Arc::clone(&self.backend), id, Arc::clone(&self.live_workers))
                    .map_err(|e| PipelineError::inference("Offloaded inference", e))?
            }
        };

        slot.next_request += 1;
        let request_id = slot.next_request;
        let token = request.cancel.clone();
        // A worker that cannot take the request is dropped here
        worker.submit(request)?;
        slot.handle = Some(worker);
        slot.in_flight = Some((request_id, token));
        Ok(request_id)
    }

    /// Clear the finished request and retire the worker after a failure,
    /// unless a newer request is already queued on it
    fn settle(&self, request_id: u64, result: &Result<InferenceOutput, PipelineError>) {
        let mut slot = self.worker.lock();
        if !matches!(&slot.in_flight, Some((id, _)) if *id == request_id) {
            return;
        }
        slot.in_flight = None;

        match result {
            Ok(_) | Err(PipelineError::Cancelled) => {}
            Err(e) => {
                if let Some(worker) = slot.handle.take() {
                    debug!("Retiring worker {} after failure: {}", worker.id(), e);
                }
            }
        }
    }

    /// Cancel any offloaded job and stop the worker
    pub fn shutdown(&self) {
        let mut slot = self.worker.lock();
        if let Some((_, token)) = slot.in_flight.take() {
            token.cancel();
        }
        slot.handle.take();
    }
}

/// Detection then recognition on the calling thread.
///
/// Checks `cancel` between stages so an abandoned pass stops early.
pub(crate) fn infer_blocking<B: OcrBackend>(
    backend: &B,
    detection: &B::Model,
    detection_size: TileSize,
    recognition: &B::Model,
    recognition_size: TileSize,
    image: &RasterImage,
    cancel: &CancellationToken,
) -> Result<InferenceOutput, PipelineError> {
    let start = Instant::now();
    let heatmap = backend
        .detect(detection, image, detection_size)
        .map_err(|e| PipelineError::inference("Detection", e))?;
    let boxes = backend.extract_boxes(&heatmap);
    debug!("Detection produced {} boxes in {:?}", boxes.len(), start.elapsed());

    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let start = Instant::now();
    let candidates = if boxes.is_empty() {
        Vec::new()
    } else {
        backend
            .recognize(recognition, image, &boxes, recognition_size)
            .map_err(|e| PipelineError::inference("Recognition", e))?
    };
    debug!("Recognition took {:?}", start.elapsed());

    Ok(InferenceOutput { heatmap, candidates })
}
