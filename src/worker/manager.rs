//! Bounded request/reply dispatch to the post-processing worker thread

use super::{
    processor::PostProcessor,
    protocol::{Envelope, FrameData, InitOptions, LoadModels, Reply, Request, RunPostProcess},
};
use crate::error::{NennError, Result};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::JoinHandle,
};
use tokio::{
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle as TaskHandle,
};

/// Default number of requests allowed in flight
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 5;

/// Resolver of one in-flight request; dropping it frees a queue slot
struct Pending {
    resolver: oneshot::Sender<Result<Reply>>,
    _permit: OwnedSemaphorePermit,
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

/// The map stays consistent across a panicking holder, so poisoning is ignored
fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, Pending>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends post-processing requests to a dedicated worker thread
///
/// Each request gets the next task id and waits for the reply carrying that
/// id. At most `max_queue_size` requests are in flight; further callers wait
/// until a reply frees a slot. Must be created inside a Tokio runtime.
pub struct PostProcessWorkerManager {
    requests: std_mpsc::Sender<Envelope<Request>>,
    pending: PendingMap,
    capacity: Arc<Semaphore>,
    next_id: AtomicU64,
    max_queue_size: usize,
    worker: JoinHandle<()>,
    dispatcher: TaskHandle<()>,
}

impl std::fmt::Debug for PostProcessWorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostProcessWorkerManager")
            .field("max_queue_size", &self.max_queue_size)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl PostProcessWorkerManager {
    /// Start `processor` on its own thread
    ///
    /// # Errors
    /// - `max_queue_size` is zero
    /// - No Tokio runtime is running
    /// - The worker thread cannot be spawned
    pub fn spawn<P: PostProcessor>(processor: P, max_queue_size: usize) -> Result<Self> {
        if max_queue_size == 0 {
            return Err(NennError::config_value_error(
                "max_queue_size",
                max_queue_size,
                "1 or more",
                Some(DEFAULT_MAX_QUEUE_SIZE),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            NennError::internal(format!("Post-processing worker needs a Tokio runtime: {e}"))
        })?;

        let (request_tx, request_rx) = std_mpsc::channel::<Envelope<Request>>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Envelope<Reply>>();

        let worker = std::thread::Builder::new()
            .name("nenn-postprocess".to_string())
            .spawn(move || {
                // Requests are dropped before replies, so a closed reply channel
                // means no further request can be accepted
                let replies = reply_tx;
                let requests = request_rx;
                run_worker(processor, &requests, &replies);
            })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let capacity = Arc::new(Semaphore::new(max_queue_size));
        let dispatcher = runtime.spawn(dispatch_replies(
            reply_rx,
            Arc::clone(&pending),
            Arc::clone(&capacity),
        ));

        tracing::debug!(max_queue_size, "Post-processing worker started");

        Ok(Self {
            requests: request_tx,
            pending,
            capacity,
            next_id: AtomicU64::new(0),
            max_queue_size,
            worker,
            dispatcher,
        })
    }

    #[must_use]
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Number of requests sent and not yet answered
    #[must_use]
    pub fn pending(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Send `INIT_POST_PROCESS`
    ///
    /// # Errors
    /// - The worker rejected the options or terminated
    pub async fn init(&self, options: InitOptions) -> Result<()> {
        match self.request(Request::InitPostProcess(options)).await? {
            Reply::InitPostProcessDone => Ok(()),
            other => Err(unexpected_reply("INIT_POST_PROCESS", &other)),
        }
    }

    /// Send `LOAD_MODELS`
    ///
    /// # Errors
    /// - The worker failed to load the models or terminated
    pub async fn load_models(&self, request: LoadModels) -> Result<()> {
        match self.request(Request::LoadModels(request)).await? {
            Reply::LoadModelsDone => Ok(()),
            other => Err(unexpected_reply("LOAD_MODELS", &other)),
        }
    }

    /// Send `RUN_POST_PROCESS` and wait for the finished frame
    ///
    /// # Errors
    /// - The worker failed on this frame or terminated
    pub async fn run(&self, task: RunPostProcess) -> Result<FrameData> {
        match self.request(Request::RunPostProcess(task)).await? {
            Reply::RunPostProcessDone(frame) => Ok(frame),
            other => Err(unexpected_reply("RUN_POST_PROCESS", &other)),
        }
    }

    /// Send any request and wait for its reply
    ///
    /// An `ERROR` reply becomes [`NennError::Worker`] for this request only.
    ///
    /// # Errors
    /// - [`NennError::Worker`] when the worker answered with `ERROR`
    /// - [`NennError::WorkerTerminated`] when the worker stopped first
    pub async fn request(&self, request: Request) -> Result<Reply> {
        let permit = Arc::clone(&self.capacity)
            .acquire_owned()
            .await
            .map_err(|_| NennError::WorkerTerminated)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let (resolver, reply) = oneshot::channel();
        lock_pending(&self.pending).insert(
            id,
            Pending {
                resolver,
                _permit: permit,
            },
        );

        tracing::trace!(id, kind, "Dispatching post-processing request");
        if self
            .requests
            .send(Envelope {
                id,
                message: request,
            })
            .is_err()
        {
            lock_pending(&self.pending).remove(&id);
            return Err(NennError::WorkerTerminated);
        }

        match reply.await {
            Ok(Ok(Reply::Error { message })) => Err(NennError::worker(message)),
            Ok(result) => result,
            Err(_) => Err(NennError::WorkerTerminated),
        }
    }

    /// Stop the worker after it has answered every queued request
    ///
    /// # Errors
    /// - The worker thread panicked
    pub async fn shutdown(self) -> Result<()> {
        let Self {
            requests,
            worker,
            dispatcher,
            ..
        } = self;
        drop(requests);

        let joined = tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|e| NennError::internal(format!("Failed to join worker: {e}")))?;
        dispatcher
            .await
            .map_err(|e| NennError::internal(format!("Reply dispatcher failed: {e}")))?;

        tracing::debug!("Post-processing worker stopped");
        joined.map_err(|_| NennError::worker("Post-processing worker panicked"))
    }
}

fn unexpected_reply(request: &str, reply: &Reply) -> NennError {
    NennError::internal(format!("Unexpected reply to {request}: {reply:?}"))
}

fn run_worker<P: PostProcessor>(
    mut processor: P,
    requests: &std_mpsc::Receiver<Envelope<Request>>,
    replies: &mpsc::UnboundedSender<Envelope<Reply>>,
) {
    while let Ok(Envelope { id, message }) = requests.recv() {
        let result = match message {
            Request::InitPostProcess(options) => {
                processor.init(options).map(|()| Reply::InitPostProcessDone)
            },
            Request::LoadModels(request) => {
                processor.load_models(request).map(|()| Reply::LoadModelsDone)
            },
            Request::RunPostProcess(task) => processor.run(task).map(Reply::RunPostProcessDone),
        };
        let message = result.unwrap_or_else(|e| {
            log::warn!("Post-processing task {id} failed: {e}");
            Reply::Error {
                message: e.to_string(),
            }
        });
        if replies.send(Envelope { id, message }).is_err() {
            break;
        }
    }
}

async fn dispatch_replies(
    mut replies: mpsc::UnboundedReceiver<Envelope<Reply>>,
    pending: PendingMap,
    capacity: Arc<Semaphore>,
) {
    while let Some(Envelope { id, message }) = replies.recv().await {
        let entry = lock_pending(&pending).remove(&id);
        match entry {
            Some(entry) => {
                // The caller may have stopped waiting
                let _ = entry.resolver.send(Ok(message));
            },
            None => log::warn!("Reply for unknown post-processing task {id}"),
        }
    }

    // Worker gone: refuse new requests, then fail the ones still waiting
    capacity.close();
    let orphaned: Vec<Pending> = lock_pending(&pending)
        .drain()
        .map(|(_, entry)| entry)
        .collect();
    if !orphaned.is_empty() {
        log::warn!(
            "Post-processing worker stopped with {} pending task(s)",
            orphaned.len()
        );
    }
    for entry in orphaned {
        let _ = entry.resolver.send(Err(NennError::WorkerTerminated));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::rseg::AlphaMatte, worker::processor::Compositor};
    use image::{DynamicImage, RgbImage};
    use std::{sync::mpsc::Receiver, time::Duration};

    fn run_task(value: u8) -> RunPostProcess {
        RunPostProcess {
            frame: FrameData::from_image(&DynamicImage::ImageRgb8(RgbImage::from_pixel(
                1,
                1,
                image::Rgb([value, value, value]),
            ))),
            alpha: AlphaMatte::new(1, 1, vec![1.0]).unwrap(),
        }
    }

    /// Processor that blocks on `RUN_POST_PROCESS` until released
    struct GatedProcessor {
        gate: Receiver<()>,
    }

    impl PostProcessor for GatedProcessor {
        fn init(&mut self, _options: InitOptions) -> Result<()> {
            Ok(())
        }

        fn load_models(&mut self, _request: LoadModels) -> Result<()> {
            Err(NennError::model("no models here"))
        }

        fn run(&mut self, task: RunPostProcess) -> Result<FrameData> {
            self.gate
                .recv()
                .map_err(|_| NennError::worker("gate closed"))?;
            if task.frame.pixels[0] == 13 {
                panic!("unlucky frame");
            }
            Ok(task.frame)
        }
    }

    #[tokio::test]
    async fn test_requests_resolve_with_their_own_replies() {
        let manager = PostProcessWorkerManager::spawn(Compositor::new(), 5).unwrap();
        manager.init(InitOptions::default()).await.unwrap();

        let (a, b) = tokio::join!(manager.run(run_task(10)), manager.run(run_task(20)));
        assert_eq!(a.unwrap().pixels, vec![10, 10, 10]);
        assert_eq!(b.unwrap().pixels, vec![20, 20, 20]);
        assert_eq!(manager.pending(), 0);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_rejects_only_its_task() {
        let (gate_tx, gate) = std::sync::mpsc::channel();
        let manager = PostProcessWorkerManager::spawn(GatedProcessor { gate }, 5).unwrap();
        gate_tx.send(()).unwrap();

        let (load, run) = tokio::join!(
            manager.load_models(LoadModels::default()),
            manager.run(run_task(1))
        );
        assert!(matches!(load, Err(NennError::Worker(ref m)) if m.contains("no models here")));
        assert_eq!(run.unwrap().pixels, vec![1, 1, 1]);

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_limits_in_flight_requests() {
        let (gate_tx, gate) = std::sync::mpsc::channel();
        let manager = Arc::new(PostProcessWorkerManager::spawn(GatedProcessor { gate }, 2).unwrap());

        let mut tasks = Vec::new();
        for value in 0..4 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.run(run_task(value)).await }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.pending(), 2);

        for _ in 0..4 {
            gate_tx.send(()).unwrap();
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(manager.pending(), 0);
    }

    #[tokio::test]
    async fn test_worker_death_rejects_pending_tasks() {
        let (gate_tx, gate) = std::sync::mpsc::channel();
        let manager = Arc::new(PostProcessWorkerManager::spawn(GatedProcessor { gate }, 5).unwrap());

        let doomed = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run(run_task(13)).await })
        };
        // Let the doomed frame reach the worker before queueing the next one
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run(run_task(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate_tx.send(()).unwrap();

        let doomed = doomed.await.unwrap();
        let waiting = waiting.await.unwrap();
        assert!(matches!(doomed, Err(NennError::WorkerTerminated)));
        assert!(matches!(waiting, Err(NennError::WorkerTerminated)));

        let late = manager.run(run_task(3)).await;
        assert!(matches!(late, Err(NennError::WorkerTerminated)));
    }

    #[tokio::test]
    async fn test_queued_requests_are_answered_before_exit() {
        let (gate_tx, gate) = std::sync::mpsc::channel();
        let (request_tx, request_rx) = std_mpsc::channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let capacity = Arc::new(Semaphore::new(3));

        let worker = std::thread::spawn(move || {
            run_worker(GatedProcessor { gate }, &request_rx, &reply_tx);
        });
        let dispatcher = tokio::spawn(dispatch_replies(
            reply_rx,
            Arc::clone(&pending),
            Arc::clone(&capacity),
        ));

        let mut replies = Vec::new();
        for id in 0..3_u8 {
            let (resolver, reply) = oneshot::channel();
            let permit = Arc::clone(&capacity).try_acquire_owned().unwrap();
            lock_pending(&pending).insert(
                u64::from(id),
                Pending {
                    resolver,
                    _permit: permit,
                },
            );
            request_tx
                .send(Envelope {
                    id: u64::from(id),
                    message: Request::RunPostProcess(run_task(id + 1)),
                })
                .unwrap();
            replies.push(reply);
        }

        // Close the request side while all three are still queued
        drop(request_tx);
        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .unwrap()
            .unwrap();
        dispatcher.await.unwrap();

        for (value, reply) in (1_u8..).zip(replies) {
            match reply.await.unwrap().unwrap() {
                Reply::RunPostProcessDone(frame) => assert_eq!(frame.pixels, vec![value; 3]),
                other => panic!("expected a finished frame, got {other:?}"),
            }
        }
        assert!(lock_pending(&pending).is_empty());
    }

    #[tokio::test]
    async fn test_poisoned_pending_map_still_counts() {
        let manager = PostProcessWorkerManager::spawn(Compositor::new(), 2).unwrap();
        manager.init(InitOptions::default()).await.unwrap();

        let map = Arc::clone(&manager.pending);
        let poisoned = std::thread::spawn(move || {
            let _guard = map.lock().unwrap();
            panic!("poison the pending map");
        })
        .join();
        assert!(poisoned.is_err());
        assert!(manager.pending.is_poisoned());

        let (resolver, _reply) = oneshot::channel();
        let permit = Arc::clone(&manager.capacity).try_acquire_owned().unwrap();
        lock_pending(&manager.pending).insert(
            u64::MAX,
            Pending {
                resolver,
                _permit: permit,
            },
        );
        assert_eq!(manager.pending(), 1);

        // Requests keep flowing through the poisoned map
        assert_eq!(manager.run(run_task(7)).await.unwrap().pixels, vec![7, 7, 7]);
        assert_eq!(manager.pending(), 1);

        lock_pending(&manager.pending).remove(&u64::MAX);
        assert_eq!(manager.pending(), 0);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_queue_size_is_rejected() {
        assert!(matches!(
            PostProcessWorkerManager::spawn(Compositor::new(), 0),
            Err(NennError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        assert!(matches!(
            PostProcessWorkerManager::spawn(Compositor::new(), 1),
            Err(NennError::Internal(_))
        ));
    }
}
