use crate::{
    describe::{DescriptionJob, run_description},
    error::DescribeError,
    model::{ModelInfo, VisionLanguageModel},
};
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};
use tokio::sync::{mpsc, oneshot};

/// Represents the current state of the inference worker.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceEngineState {
    /// Waiting for the next request.
    Idle,
    /// Running a request on the model.
    Processing,
}

impl InferenceEngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceEngineState::Idle => "idle",
            InferenceEngineState::Processing => "processing",
        }
    }
}

struct InferenceEngineRequest {
    id: u64,
    job: DescriptionJob,
    reply: oneshot::Sender<Result<String, DescribeError>>,
}

/// The loaded model, owned by a dedicated inference thread.
///
/// Requests are queued on a bounded channel and executed one at a time, so
/// the model is never entered concurrently. Each caller awaits its own reply.
/// A caller that goes away does not cancel work already queued for it.
pub struct InferenceEngine {
    state: Arc<Mutex<InferenceEngineState>>,
    req_tx: Option<mpsc::Sender<InferenceEngineRequest>>,
    inference_handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
    info: ModelInfo,
}

impl InferenceEngine {
    /// Moves `model` onto a new inference thread.
    ///
    /// `queue_capacity` bounds the number of requests waiting for the model;
    /// further callers wait until a slot frees up.
    pub fn new<M>(mut model: M, queue_capacity: usize, max_new_tokens: usize) -> Self
    where
        M: VisionLanguageModel + Send + 'static,
    {
        let info = model.info();
        let (req_tx, mut req_rx) = mpsc::channel::<InferenceEngineRequest>(queue_capacity.max(1));
        let state = Arc::new(Mutex::new(InferenceEngineState::Idle));

        let inference_handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Some(req) = req_rx.blocking_recv() {
                    log::debug!("Scheduling inference #{}", req.id);

                    set_state(&state, InferenceEngineState::Processing);
                    let start_time = Instant::now();

                    let result = run_description(&mut model, req.job, max_new_tokens);

                    match &result {
                        Ok(_) => log::info!(
                            "Inference #{} completed in {:?}",
                            req.id,
                            start_time.elapsed()
                        ),
                        Err(e) => log::error!("Inference #{} failed: {e}", req.id),
                    }

                    if req.reply.send(result).is_err() {
                        log::warn!("Caller of inference #{} went away, dropping result", req.id);
                    }

                    set_state(&state, InferenceEngineState::Idle);
                }
                log::debug!("Inference worker stopped");
            }
        });

        Self {
            state,
            req_tx: Some(req_tx),
            inference_handle: Some(inference_handle),
            id_counter: AtomicU64::new(0),
            info,
        }
    }

    pub fn state(&self) -> InferenceEngineState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Queues a job and waits for the model's answer.
    pub async fn submit(&self, job: DescriptionJob) -> Result<String, DescribeError> {
        let worker_gone = || DescribeError::InferenceFailed("inference worker is not running".into());

        let tx = self.req_tx.as_ref().ok_or_else(worker_gone)?;
        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();

        tx.send(InferenceEngineRequest { id, job, reply })
            .await
            .map_err(|_| worker_gone())?;

        reply_rx.await.map_err(|_| worker_gone())?
    }

    /// Closes the request queue and waits for the inference thread to drain
    /// it and exit.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.inference_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<InferenceEngineState>, value: InferenceEngineState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value;
}
