//! Request coalescing: one transfer per URL shared by many callbacks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use url::Url;

use super::downloader::DownloadOptions;
use crate::domain::entities::ImageLoadingResult;
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::DownloadRequest;

/// One logical request riding on a [`SessionDataTask`].
pub struct TaskCallback {
    /// Receives the final outcome.
    pub completion: oneshot::Sender<ImageResult<ImageLoadingResult>>,
    /// Options of the request that registered this callback.
    pub options: Arc<DownloadOptions>,
}

struct TaskState {
    callbacks: BTreeMap<u64, TaskCallback>,
    next_token: u64,
    finished: bool,
    data: Vec<u8>,
    transfer: Option<AbortHandle>,
}

/// A single network transfer for one URL.
pub struct SessionDataTask {
    url: Url,
    request: DownloadRequest,
    state: Mutex<TaskState>,
}

impl SessionDataTask {
    fn new(request: DownloadRequest) -> Self {
        Self {
            url: request.url.clone(),
            request,
            state: Mutex::new(TaskState {
                callbacks: BTreeMap::new(),
                next_token: 0,
                finished: false,
                data: Vec::new(),
                transfer: None,
            }),
        }
    }

    /// URL the task is registered under.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Request the transfer was started with.
    #[must_use]
    pub const fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Number of callbacks still waiting.
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Returns whether the task completed or was torn down.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Appends a received chunk. Returns the total received so far.
    pub fn did_receive_data(&self, chunk: &[u8]) -> u64 {
        let mut state = self.state.lock();
        state.data.extend_from_slice(chunk);
        state.data.len() as u64
    }

    /// Takes the accumulated response bytes.
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().data)
    }

    /// Options of every waiting callback, in registration order.
    #[must_use]
    pub fn callback_options(&self) -> Vec<Arc<DownloadOptions>> {
        self.state
            .lock()
            .callbacks
            .values()
            .map(|callback| callback.options.clone())
            .collect()
    }

    /// Options of the most recently registered callback.
    #[must_use]
    pub fn last_callback_options(&self) -> Option<Arc<DownloadOptions>> {
        self.state
            .lock()
            .callbacks
            .values()
            .next_back()
            .map(|callback| callback.options.clone())
    }

    /// Attaches the running transfer. Aborts it at once if every callback
    /// already cancelled.
    pub fn set_transfer(&self, transfer: AbortHandle) {
        let mut state = self.state.lock();
        if state.finished {
            transfer.abort();
        } else {
            state.transfer = Some(transfer);
        }
    }

    fn add_callback(&self, callback: TaskCallback) -> u64 {
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.callbacks.insert(token, callback);
        token
    }

    fn finish(&self) -> (Vec<TaskCallback>, Option<AbortHandle>) {
        let mut state = self.state.lock();
        state.finished = true;
        let callbacks = std::mem::take(&mut state.callbacks).into_values().collect();
        (callbacks, state.transfer.take())
    }
}

impl fmt::Debug for SessionDataTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDataTask")
            .field("url", &self.url.as_str())
            .field("callbacks", &self.callback_count())
            .finish_non_exhaustive()
    }
}

/// Registry of in-flight transfers keyed by URL.
///
/// Lock order is registry, then task.
#[derive(Default)]
pub struct SessionDelegate {
    tasks: Mutex<HashMap<Url, Arc<SessionDataTask>>>,
}

/// Result of [`SessionDelegate::add_or_append`].
pub struct Registration {
    /// The shared task.
    pub task: Arc<SessionDataTask>,
    /// Cancel token of the new callback.
    pub token: u64,
    /// Whether the task was just created and needs a transfer.
    pub is_new: bool,
}

impl SessionDelegate {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `callback` to the in-flight task for the request URL, or
    /// registers a new task.
    pub fn add_or_append(&self, request: DownloadRequest, callback: TaskCallback) -> Registration {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(&request.url) {
            let token = task.add_callback(callback);
            trace!(url = %request.url, token, "Joined in-flight download");
            return Registration {
                task: task.clone(),
                token,
                is_new: false,
            };
        }
        let url = request.url.clone();
        let task = Arc::new(SessionDataTask::new(request));
        let token = task.add_callback(callback);
        tasks.insert(url.clone(), task.clone());
        trace!(url = %url, token, "Registered new download");
        Registration {
            task,
            token,
            is_new: true,
        }
    }

    /// In-flight task for `url`.
    #[must_use]
    pub fn task(&self, url: &Url) -> Option<Arc<SessionDataTask>> {
        self.tasks.lock().get(url).cloned()
    }

    /// Number of in-flight tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Detaches one callback. The last callback out aborts the transfer.
    pub fn cancel(&self, task: &Arc<SessionDataTask>, token: u64) {
        let (callback, transfer) = {
            let mut tasks = self.tasks.lock();
            let mut state = task.state.lock();
            let Some(callback) = state.callbacks.remove(&token) else {
                return;
            };
            let mut transfer = None;
            if state.callbacks.is_empty() && !state.finished {
                state.finished = true;
                transfer = state.transfer.take();
                if tasks.get(&task.url).is_some_and(|t| Arc::ptr_eq(t, task)) {
                    tasks.remove(&task.url);
                }
                debug!(url = %task.url, "Last callback cancelled, stopping download");
            }
            (callback, transfer)
        };
        if let Some(transfer) = transfer {
            transfer.abort();
        }
        let _ = callback
            .completion
            .send(Err(ImageError::cancelled(Some(task.url.clone()), token)));
    }

    /// Unregisters a completed task and hands back its callbacks.
    pub fn complete(&self, task: &Arc<SessionDataTask>) -> Vec<TaskCallback> {
        let mut tasks = self.tasks.lock();
        if tasks.get(&task.url).is_some_and(|t| Arc::ptr_eq(t, task)) {
            tasks.remove(&task.url);
        }
        task.finish().0
    }

    /// Cancels every callback of the task for `url`.
    pub fn cancel_url(&self, url: &Url) {
        let task = self.tasks.lock().remove(url);
        if let Some(task) = task {
            force_cancel(&task);
        }
    }

    /// Cancels every in-flight task.
    pub fn cancel_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain().map(|(_, task)| task).collect();
        for task in &tasks {
            force_cancel(task);
        }
    }
}

fn force_cancel(task: &Arc<SessionDataTask>) {
    let (callbacks, transfer) = {
        let mut state = task.state.lock();
        state.finished = true;
        let callbacks: Vec<_> = std::mem::take(&mut state.callbacks).into_iter().collect();
        (callbacks, state.transfer.take())
    };
    if let Some(transfer) = transfer {
        transfer.abort();
    }
    debug!(url = %task.url, count = callbacks.len(), "Force cancelled download");
    for (token, callback) in callbacks {
        let _ = callback
            .completion
            .send(Err(ImageError::cancelled(Some(task.url.clone()), token)));
    }
}

impl fmt::Debug for SessionDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDelegate")
            .field("tasks", &self.task_count())
            .finish()
    }
}

/// Handle to one callback on a shared transfer.
#[derive(Clone)]
pub struct DownloadTask {
    session_task: Arc<SessionDataTask>,
    cancel_token: u64,
    delegate: Arc<SessionDelegate>,
}

impl DownloadTask {
    pub(crate) const fn new(
        session_task: Arc<SessionDataTask>,
        cancel_token: u64,
        delegate: Arc<SessionDelegate>,
    ) -> Self {
        Self {
            session_task,
            cancel_token,
            delegate,
        }
    }

    /// The shared transfer.
    #[must_use]
    pub const fn session_task(&self) -> &Arc<SessionDataTask> {
        &self.session_task
    }

    /// Token of this callback.
    #[must_use]
    pub const fn cancel_token(&self) -> u64 {
        self.cancel_token
    }

    /// Detaches this callback; the transfer stops when nobody else waits.
    pub fn cancel(&self) {
        self.delegate.cancel(&self.session_task, self.cancel_token);
    }
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("url", &self.session_task.url.as_str())
            .field("cancel_token", &self.cancel_token)
            .finish()
    }
}
