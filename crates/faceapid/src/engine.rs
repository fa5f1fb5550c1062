//! Inference adapter.
//!
//! Model inference is blocking and CPU-bound, so each worker owns a loaded
//! analyzer on a dedicated OS thread. Handlers talk to workers over bounded
//! channels and await the reply on a oneshot. A dropped reply receiver (client
//! disconnect) does not interrupt inference; the result is discarded.

use faceapi_core::{
    AnalyzeOptions, AnalyzerError, DecodedImage, FaceAnalysis, FaceAnalyzer, Representation,
    RepresentOptions, Verification, VerifyOptions,
};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("analyzer returned no result")]
    EmptyResult,
    #[error("engine worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result of a represent call after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingOutcome {
    Embedding(Vec<f32>),
    NoFaceDetected,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from HTTP handlers to an engine worker.
enum EngineRequest {
    Analyze {
        image: DecodedImage,
        options: AnalyzeOptions,
        reply: Reply<Vec<FaceAnalysis>>,
    },
    Verify {
        img1: DecodedImage,
        img2: DecodedImage,
        options: VerifyOptions,
        reply: Reply<Verification>,
    },
    Represent {
        image: DecodedImage,
        options: RepresentOptions,
        reply: Reply<Vec<Representation>>,
    },
}

/// Clone-safe handle to the engine workers.
#[derive(Clone)]
pub struct EngineHandle {
    workers: Arc<[mpsc::Sender<EngineRequest>]>,
    next: Arc<AtomicUsize>,
    models: Arc<[String]>,
}

impl EngineHandle {
    /// Analyze an image and return the first (most confident) face record.
    pub async fn analyze(
        &self,
        image: DecodedImage,
        options: AnalyzeOptions,
    ) -> Result<FaceAnalysis, EngineError> {
        let records = self
            .call(|reply| EngineRequest::Analyze {
                image,
                options,
                reply,
            })
            .await?;
        first_record(records)
    }

    /// Compare the faces of two images.
    pub async fn verify(
        &self,
        img1: DecodedImage,
        img2: DecodedImage,
        options: VerifyOptions,
    ) -> Result<Verification, EngineError> {
        self.call(|reply| EngineRequest::Verify {
            img1,
            img2,
            options,
            reply,
        })
        .await
    }

    /// Embed the first face of an image, or report that there was none.
    pub async fn represent(
        &self,
        image: DecodedImage,
        options: RepresentOptions,
    ) -> Result<EmbeddingOutcome, EngineError> {
        let records = self
            .call(|reply| EngineRequest::Represent {
                image,
                options,
                reply,
            })
            .await?;
        first_embedding(records)
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Models loaded by every worker.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.workers[worker]
            .send(request(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// The collaborator answers with one record per face; callers get the first.
fn first_record<T>(records: Vec<T>) -> Result<T, EngineError> {
    records.into_iter().next().ok_or(EngineError::EmptyResult)
}

fn first_embedding(records: Vec<Representation>) -> Result<EmbeddingOutcome, EngineError> {
    match records.into_iter().next() {
        None => Ok(EmbeddingOutcome::NoFaceDetected),
        Some(r) if r.embedding.is_empty() => Err(EngineError::EmptyResult),
        Some(r) => Ok(EmbeddingOutcome::Embedding(r.embedding)),
    }
}

/// Spawn `workers` engine threads.
///
/// `load` is called once per worker, synchronously, before any thread starts
/// serving; startup fails fast if any worker cannot load its models.
pub fn spawn_engine<A, F>(
    workers: usize,
    queue_depth: usize,
    mut load: F,
) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + Send + 'static,
    F: FnMut(usize) -> Result<A, AnalyzerError>,
{
    let workers = workers.max(1);
    let mut senders = Vec::with_capacity(workers);
    let mut models: Vec<String> = Vec::new();

    for id in 0..workers {
        let analyzer = load(id)?;
        if id == 0 {
            models = analyzer.loaded_models();
        }

        let (tx, rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
        std::thread::Builder::new()
            .name(format!("faceapi-engine-{id}"))
            .spawn(move || run_worker(id, analyzer, rx))?;
        senders.push(tx);
    }

    tracing::info!(workers, ?models, "engine started");

    Ok(EngineHandle {
        workers: senders.into(),
        next: Arc::new(AtomicUsize::new(0)),
        models: models.into(),
    })
}

fn run_worker<A: FaceAnalyzer>(id: usize, mut analyzer: A, mut rx: mpsc::Receiver<EngineRequest>) {
    tracing::info!(worker = id, "engine thread started");
    while let Some(req) = rx.blocking_recv() {
        match req {
            EngineRequest::Analyze { image, options, reply } => {
                let result = guarded(|| analyzer.analyze(&image, &options));
                let _ = reply.send(result);
            }
            EngineRequest::Verify { img1, img2, options, reply } => {
                let result = guarded(|| analyzer.verify(&img1, &img2, &options));
                let _ = reply.send(result);
            }
            EngineRequest::Represent { image, options, reply } => {
                let result = guarded(|| analyzer.represent(&image, &options));
                let _ = reply.send(result);
            }
        }
    }
    tracing::info!(worker = id, "engine thread exiting");
}

/// Run one inference call, turning a panic into an error so the worker survives.
fn guarded<T>(f: impl FnOnce() -> Result<T, AnalyzerError>) -> Result<T, EngineError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(EngineError::from),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(%message, "engine worker panicked");
            Err(EngineError::WorkerPanicked(message))
        }
    }
}
