//! Offloaded inference worker
//!
//! A dedicated OS thread that owns its own copies of the models and runs one
//! job at a time from a channel. Dropping the last [`WorkerHandle`] closes
//! the channel; the thread then finishes its current job and exits.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::OcrBackend;
use super::coordinator::infer_blocking;
use super::{InferenceOutput, ModelConfig, ModelSlot, RasterImage};
use crate::error::PipelineError;

/// One inference job for a worker
pub struct WorkerRequest {
    /// Private copy of the prepared pixels
    pub image: RasterImage,
    pub detection: ModelConfig,
    pub recognition: ModelConfig,
    pub cancel: CancellationToken,
    pub reply: oneshot::Sender<Result<InferenceOutput, PipelineError>>,
}

/// Owning handle to a worker thread
pub struct WorkerHandle {
    id: u64,
    sender: Sender<WorkerRequest>,
}

/// Decrements the live worker count when the thread exits
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerHandle {
    /// Start a worker thread. `live` counts threads that have not exited yet.
    pub fn spawn<B: OcrBackend>(backend: Arc<B>, id: u64, live: Arc<AtomicUsize>) -> anyhow::Result<Self> {
        let (sender, receiver) = unbounded();

        live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(live);

        thread::Builder::new()
            .name(format!("ocr-worker-{}", id))
            .spawn(move || {
                let _guard = guard;
                worker_loop(backend.as_ref(), id, receiver);
            })?;

        info!("Started inference worker {}", id);
        Ok(Self { id, sender })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a job. Fails if the worker thread is gone.
    pub fn submit(&self, request: WorkerRequest) -> Result<(), PipelineError> {
        self.sender
            .send(request)
            .map_err(|_| PipelineError::inference("Offloaded inference", "worker thread has exited"))
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        debug!("Terminating inference worker {}", self.id);
    }
}

/// Models a worker keeps between jobs, keyed by their config
struct WorkerModels<M> {
    detection: Option<(ModelConfig, M)>,
    recognition: Option<(ModelConfig, M)>,
}

impl<M> WorkerModels<M> {
    fn ensure<B: OcrBackend<Model = M>>(
        &mut self,
        backend: &B,
        slot: ModelSlot,
        config: ModelConfig,
    ) -> Result<(), PipelineError> {
        let entry = match slot {
            ModelSlot::Detection => &mut self.detection,
            ModelSlot::Recognition => &mut self.recognition,
        };
        if matches!(entry, Some((loaded, _)) if *loaded == config) {
            return Ok(());
        }

        // Release the old model before loading its replacement
        *entry = None;
        let model = backend
            .load_model(slot, &config)
            .map_err(|e| PipelineError::LoadFailure {
                slot,
                architecture: config.architecture,
                message: format!("{:#}", e),
            })?;
        *entry = Some((config, model));
        Ok(())
    }
}

fn worker_loop<B: OcrBackend>(backend: &B, id: u64, receiver: Receiver<WorkerRequest>) {
    let mut models = WorkerModels {
        detection: None,
        recognition: None,
    };

    for request in receiver.iter() {
        if request.reply.is_closed() {
            debug!("Worker {} skipping abandoned job", id);
            continue;
        }
        if request.cancel.is_cancelled() {
            debug!("Worker {} skipping cancelled job", id);
            let _ = request.reply.send(Err(PipelineError::Cancelled));
            continue;
        }

        let result = run_job(backend, &mut models, &request);
        match &result {
            Err(PipelineError::Cancelled) => debug!("Worker {} abandoned a cancelled job", id),
            Err(e) => warn!("Worker {} job failed: {}", id, e),
            Ok(_) => {}
        }

        // The caller may have timed out; a late reply is simply dropped
        let _ = request.reply.send(result);
    }

    info!("Inference worker {} exited", id);
}

fn run_job<B: OcrBackend>(
    backend: &B,
    models: &mut WorkerModels<B::Model>,
    request: &WorkerRequest,
) -> Result<InferenceOutput, PipelineError> {
    models.ensure(backend, ModelSlot::Detection, request.detection)?;
    models.ensure(backend, ModelSlot::Recognition, request.recognition)?;
    // Loading can take a while; a newer request may have arrived meanwhile
    if request.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let (Some((det_config, det_model)), Some((reco_config, reco_model))) =
        (&models.detection, &models.recognition)
    else {
        return Err(PipelineError::ModelNotReady {
            slot: ModelSlot::Detection,
        });
    };

    infer_blocking(
        backend,
        det_model,
        det_config.input_size,
        reco_model,
        reco_config.input_size,
        &request.image,
        &request.cancel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::testing::{raster, FakeBackend};
    use crate::vision::{DetectionVariant, RecognitionVariant};
    use std::time::{Duration, Instant};

    fn request(
        image: RasterImage,
    ) -> (
        WorkerRequest,
        oneshot::Receiver<Result<InferenceOutput, PipelineError>>,
    ) {
        let (reply, rx) = oneshot::channel();
        let request = WorkerRequest {
            image,
            detection: DetectionVariant::DbMobilenetV2.into(),
            recognition: RecognitionVariant::CrnnVgg16Bn.into(),
            cancel: CancellationToken::new(),
            reply,
        };
        (request, rx)
    }

    fn wait_for_zero(live: &AtomicUsize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if live.load(Ordering::SeqCst) == 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[tokio::test]
    async fn test_worker_runs_jobs_and_caches_models() {
        let backend = Arc::new(FakeBackend::new());
        let live = Arc::new(AtomicUsize::new(0));
        let worker = WorkerHandle::spawn(Arc::clone(&backend), 1, Arc::clone(&live)).unwrap();
        assert_eq!(live.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            let (job, rx) = request(raster(64, 64));
            worker.submit(job).unwrap();
            let output = rx.await.unwrap().unwrap();
            assert_eq!(output.candidates.len(), 3);
        }

        // Both models loaded once, then reused
        assert_eq!(backend.load_count(), 2);
    }

    #[tokio::test]
    async fn test_worker_reports_load_failure() {
        let backend = Arc::new(FakeBackend::new());
        backend.fail_model("crnn_vgg16_bn");
        let live = Arc::new(AtomicUsize::new(0));
        let worker = WorkerHandle::spawn(backend, 2, live).unwrap();

        let (job, rx) = request(raster(64, 64));
        worker.submit(job).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::LoadFailure { slot: ModelSlot::Recognition, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_job_gets_cancelled_reply() {
        let backend = Arc::new(FakeBackend::new());
        let live = Arc::new(AtomicUsize::new(0));
        let worker = WorkerHandle::spawn(Arc::clone(&backend), 5, live).unwrap();

        let (job, rx) = request(raster(64, 64));
        job.cancel.cancel();
        worker.submit(job).unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(backend.detect_calls(), 0);
        assert_eq!(backend.load_count(), 0);
    }

    #[test]
    fn test_dropping_handle_stops_thread() {
        let backend = Arc::new(FakeBackend::new());
        let live = Arc::new(AtomicUsize::new(0));
        let worker = WorkerHandle::spawn(backend, 3, Arc::clone(&live)).unwrap();
        drop(worker);
        assert!(wait_for_zero(&live));
    }

    #[test]
    fn test_abandoned_job_is_skipped() {
        let backend = Arc::new(FakeBackend::new());
        let live = Arc::new(AtomicUsize::new(0));
        let worker = WorkerHandle::spawn(Arc::clone(&backend), 4, Arc::clone(&live)).unwrap();

        let (job, rx) = request(raster(64, 64));
        drop(rx);
        worker.submit(job).unwrap();
        drop(worker);

        assert!(wait_for_zero(&live));
        assert_eq!(backend.detect_calls(), 0);
    }
}
