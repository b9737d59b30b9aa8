use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use peerbeam_protocol::ids;

use crate::error::UploadError;
use crate::policy::RetryPolicy;
use crate::task::{mime_for_path, TaskOptions, UploadItem, UploadStatus, UploadTask};
use crate::uploader::{ProgressFn, UploadRequest, Uploader};

/// Consumed-slot count that triggers compaction of the backing array.
const COMPACT_THRESHOLD: usize = 50;

/// Capacity of the item event channel.
const EVENT_BUFFER_SIZE: usize = 256;

/// Scheduler limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Uploads running at once.
    pub concurrency: usize,
    /// Retry failed uploads automatically.
    pub auto_retry: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            auto_retry: true,
        }
    }
}

/// Item lifecycle notifications.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Added(UploadItem),
    Updated(UploadItem),
    Removed { id: String },
}

struct QueueInner {
    /// Task array with a read cursor. Consumed slots stay in place
    /// until compaction so in-flight indices stay valid.
    queue: Vec<UploadTask>,
    head: usize,
    active: usize,
    paused: bool,
    /// Canonical task state keyed by id. Survives compaction, so
    /// cancel and retry can always find their target; token clones in
    /// running uploads share state with the entry here.
    tasks: HashMap<String, UploadTask>,
    items: Vec<UploadItem>,
}

/// FIFO-with-priority upload scheduler.
pub struct UploadQueue {
    uploader: Arc<dyn Uploader>,
    config: QueueConfig,
    policy: RetryPolicy,
    inner: Mutex<QueueInner>,
    events_tx: mpsc::Sender<QueueEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<QueueEvent>>>,
}

impl UploadQueue {
    pub fn new(
        uploader: Arc<dyn Uploader>,
        config: QueueConfig,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        Arc::new(Self {
            uploader,
            config,
            policy,
            inner: Mutex::new(QueueInner {
                queue: Vec::new(),
                head: 0,
                active: 0,
                paused: false,
                tasks: HashMap::new(),
                items: Vec::new(),
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<QueueEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot of every item, in submission order.
    pub fn items(&self) -> Vec<UploadItem> {
        self.lock().items.clone()
    }

    /// Enqueues one task per path and kicks the scheduler. Files that
    /// cannot be stat'd surface as error items without being enqueued.
    /// Returns the new task ids, in input order.
    pub async fn add_files(self: &Arc<Self>, paths: &[PathBuf], options: TaskOptions) -> Vec<String> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let id = ids::upload_id();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.clone());

            let size = match tokio::fs::metadata(path).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    warn!(file = %path.display(), "cannot stat file: {e}");
                    let item = UploadItem {
                        id: id.clone(),
                        name,
                        size: 0,
                        progress: 0,
                        speed_mbps: 0.0,
                        status: UploadStatus::Error,
                        error: Some(e.to_string()),
                    };
                    self.lock().items.push(item.clone());
                    self.emit(QueueEvent::Added(item));
                    out.push(id);
                    continue;
                }
            };

            let task = UploadTask {
                id: id.clone(),
                path: path.clone(),
                name: name.clone(),
                size,
                mime: mime_for_path(path),
                priority: options.priority.unwrap_or(0),
                retries: 0,
                max_retries: options.max_retries.unwrap_or(self.policy.max_retries),
                cancel: CancellationToken::new(),
            };
            let item = UploadItem {
                id: id.clone(),
                name,
                size,
                progress: 0,
                speed_mbps: 0.0,
                status: UploadStatus::Waiting,
                error: None,
            };

            {
                let mut inner = self.lock();
                inner.tasks.insert(id.clone(), task.clone());
                inner.queue.push(task);
                sort_pending(&mut inner);
                inner.items.push(item.clone());
            }
            debug!(task = %id, file = %path.display(), "upload queued");
            self.emit(QueueEvent::Added(item));
            out.push(id);
        }
        self.process();
        out
    }

    /// Fires the task's cancellation token. An in-flight upload aborts
    /// at its next chunk boundary; a pending one settles cancelled when
    /// the scheduler reaches it. Idempotent, unknown ids are ignored.
    pub fn cancel_task(&self, id: &str) {
        let token = self.lock().tasks.get(id).map(|t| t.cancel.clone());
        if let Some(token) = token {
            debug!(task = %id, "cancelling upload");
            token.cancel();
        }
    }

    /// Cancels the task and drops it from the queue and the item list.
    pub fn remove_task(self: &Arc<Self>, id: &str) {
        {
            let mut inner = self.lock();
            let Some(task) = inner.tasks.remove(id) else {
                return;
            };
            task.cancel.cancel();
            // Filter the pending region only; consumed slots must stay
            // put or the cursor drifts.
            let head = inner.head;
            let tail = inner.queue.split_off(head);
            inner.queue.extend(tail.into_iter().filter(|t| t.id != id));
            inner.items.retain(|i| i.id != id);
        }
        self.emit(QueueEvent::Removed { id: id.to_owned() });
        self.process();
    }

    /// Re-enqueues a settled task with a fresh cancellation token and a
    /// zeroed retry count.
    pub fn retry_task(self: &Arc<Self>, id: &str) {
        let updated = {
            let mut inner = self.lock();
            let Some(task) = inner.tasks.get_mut(id) else {
                return;
            };
            task.cancel = CancellationToken::new();
            task.retries = 0;
            let task = task.clone();
            inner.queue.push(task);
            sort_pending(&mut inner);
            update_in_place(&mut inner, id, |item| {
                item.status = UploadStatus::Waiting;
                item.progress = 0;
                item.error = None;
            })
        };
        if let Some(item) = updated {
            self.emit(QueueEvent::Updated(item));
        }
        self.process();
    }

    /// Stops launching new uploads. Running ones continue.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Resumes launching uploads.
    pub fn resume(self: &Arc<Self>) {
        self.lock().paused = false;
        self.process();
    }

    /// Cancels everything and clears the queue. The active count drains
    /// on its own as in-flight runs abort.
    pub fn clear(&self) {
        let mut inner = self.lock();
        for task in inner.tasks.values() {
            task.cancel.cancel();
        }
        inner.queue.clear();
        inner.head = 0;
        inner.paused = false;
        inner.tasks.clear();
        inner.items.clear();
    }

    /// Scheduler pass: start pending tasks while capacity remains.
    fn process(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut inner = self.lock();
            if inner.paused {
                return;
            }
            while inner.active < self.config.concurrency && inner.head < inner.queue.len() {
                let task = inner.queue[inner.head].clone();
                inner.head += 1;
                inner.active += 1;
                started.push(task);
            }
        }
        for task in started {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.run(task).await;
            });
        }
    }

    async fn run(self: Arc<Self>, mut task: UploadTask) {
        // A cancel that landed while pending settles without starting.
        if task.cancel.is_cancelled() {
            self.update_item(&task.id, |item| item.status = UploadStatus::Cancelled);
            self.finish_run();
            return;
        }

        self.update_item(&task.id, |item| item.status = UploadStatus::Uploading);

        let request = self.request_for(&task);
        let result = self.uploader.upload(request).await;

        match result {
            Ok(()) => {
                debug!(task = %task.id, "upload complete");
                self.update_item(&task.id, |item| {
                    item.status = UploadStatus::Done;
                    item.progress = 100;
                    item.error = None;
                });
            }
            Err(e) if e.is_abort() || task.cancel.is_cancelled() => {
                debug!(task = %task.id, "upload aborted: {e}");
                self.update_item(&task.id, |item| item.status = UploadStatus::Cancelled);
            }
            Err(e) if self.config.auto_retry && task.retries < task.max_retries => {
                task.retries += 1;
                let attempt = task.retries;
                warn!(task = %task.id, attempt, "upload failed, retrying: {e}");
                self.update_item(&task.id, |item| {
                    item.status = UploadStatus::Waiting;
                    item.progress = 0;
                    item.error = Some(format!("retrying ({attempt}/{max})", max = task.max_retries));
                });

                // The backoff holds this task's concurrency slot, so a
                // flapping transport cannot hammer the peer.
                let delay = self.policy.delay_for_attempt(attempt);
                tokio::select! {
                    _ = task.cancel.cancelled() => {
                        self.update_item(&task.id, |item| item.status = UploadStatus::Cancelled);
                        self.finish_run();
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                self.requeue(task);
            }
            Err(e) => {
                warn!(task = %task.id, "upload failed: {e}");
                self.update_item(&task.id, |item| {
                    item.status = UploadStatus::Error;
                    item.error = Some(e.to_string());
                });
            }
        }

        self.finish_run();
    }

    /// Releases the concurrency slot, compacts consumed slots, and
    /// re-invokes the scheduler.
    fn finish_run(self: &Arc<Self>) {
        {
            let mut inner = self.lock();
            inner.active = inner.active.saturating_sub(1);
            if inner.head > COMPACT_THRESHOLD {
                let head = inner.head;
                inner.queue.drain(..head);
                inner.head = 0;
            }
        }
        self.process();
    }

    fn requeue(&self, task: UploadTask) {
        let mut inner = self.lock();
        // Removed while backing off; let it die.
        if !inner.tasks.contains_key(&task.id) {
            return;
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        inner.queue.push(task);
        sort_pending(&mut inner);
    }

    fn request_for(self: &Arc<Self>, task: &UploadTask) -> UploadRequest {
        let weak = Arc::downgrade(self);
        let id = task.id.clone();
        let progress: ProgressFn = Arc::new(move |percent, speed_mbps| {
            if let Some(queue) = weak.upgrade() {
                queue.update_item(&id, |item| {
                    item.progress = percent.min(100);
                    if let Some(mbps) = speed_mbps {
                        item.speed_mbps = mbps;
                    }
                });
            }
        });
        UploadRequest {
            id: task.id.clone(),
            path: task.path.clone(),
            name: task.name.clone(),
            size: task.size,
            mime: task.mime.clone(),
            cancel: task.cancel.clone(),
            progress,
        }
    }

    fn update_item(&self, id: &str, f: impl FnOnce(&mut UploadItem)) {
        let updated = {
            let mut inner = self.lock();
            update_in_place(&mut inner, id, f)
        };
        if let Some(item) = updated {
            self.emit(QueueEvent::Updated(item));
        }
    }

    /// Events are advisory; a slow consumer loses updates, not uploads.
    fn emit(&self, event: QueueEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("queue event dropped: {e}");
        }
    }
}

fn update_in_place(
    inner: &mut QueueInner,
    id: &str,
    f: impl FnOnce(&mut UploadItem),
) -> Option<UploadItem> {
    let item = inner.items.iter_mut().find(|i| i.id == id)?;
    f(item);
    Some(item.clone())
}

/// Stable sort of the pending region by priority, highest first.
fn sort_pending(inner: &mut QueueInner) {
    let head = inner.head;
    inner.queue[head..].sort_by(|a, b| b.priority.cmp(&a.priority));
}
