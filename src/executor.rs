//! Server side of the render event protocol.
//!
//! `RenderExecutor` owns the authoritative `RenderJob` for every project with a
//! render in flight. At most one job runs per project; each job renders inside
//! its own scratch directory, which is removed when the job ends however it ends.
//! Events are fanned out over a broadcast channel and each client connection
//! filters them through its `Session`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelHandle, CancelToken, cancel_pair};
use crate::channel::MemoryChannel;
use crate::error::{RenderError, Result};
use crate::invoker::{RenderOutput, TranscodeInvoker};
use crate::protocol::{ClientEvent, ProgressTracker, RenderJob, RenderState, ServerEvent};
use crate::store::ProjectStore;

const EVENT_BUFFER: usize = 256;
const STDERR_TAIL_LINES: usize = 10;

struct JobEntry {
    job: RenderJob,
    tracker: ProgressTracker,
    cancel: CancelHandle,
}

impl JobEntry {
    fn starting(id: &str, cancel: CancelHandle) -> Self {
        let mut job = RenderJob::new(id);
        job.state = RenderState::Starting;
        job.status_message = "Starting render".to_string();
        Self {
            job,
            tracker: ProgressTracker::new(),
            cancel,
        }
    }

    fn resume_event(&self) -> ServerEvent {
        ServerEvent::RenderResume {
            id: self.job.id.clone(),
            progress: self.job.progress,
            status: self.job.status_message.clone(),
        }
    }
}

/// Cancels a synchronous render whose caller went away
struct CancelOnDrop {
    executor: Option<Arc<RenderExecutor>>,
    project_id: String,
}

impl CancelOnDrop {
    fn disarm(mut self) {
        self.executor = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(executor) = self.executor.take() {
            warn!("Caller dropped render for {}, cancelling", self.project_id);
            executor.cancel(&self.project_id);
        }
    }
}

pub struct RenderExecutor {
    store: Arc<dyn ProjectStore>,
    invoker: TranscodeInvoker,
    jobs: DashMap<String, JobEntry>,
    events: broadcast::Sender<ServerEvent>,
}

impl RenderExecutor {
    pub fn new(store: Arc<dyn ProjectStore>, invoker: TranscodeInvoker) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            store,
            invoker,
            jobs: DashMap::new(),
            events,
        })
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    pub fn invoker(&self) -> &TranscodeInvoker {
        &self.invoker
    }

    /// Every event the executor emits, for all projects
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn session(self: &Arc<Self>) -> Session {
        Session {
            executor: Arc::clone(self),
            observed: HashSet::new(),
        }
    }

    /// Snapshot of the project's in-flight job
    pub fn job(&self, project_id: &str) -> Option<RenderJob> {
        self.jobs.get(project_id).map(|entry| entry.job.clone())
    }

    /// Start rendering in the background.
    ///
    /// Returns the events addressed only to the caller: a `render:resume` when a
    /// job for the project is already in flight, in which case nothing new starts.
    pub fn start(self: &Arc<Self>, project_id: &str) -> Vec<ServerEvent> {
        let token = match self.claim(project_id) {
            Ok(token) => token,
            Err(resume) => {
                debug!("Render for {} already in flight, replaying state", project_id);
                return vec![resume];
            }
        };

        let executor = Arc::clone(self);
        let id = project_id.to_string();
        tokio::spawn(async move {
            let _ = executor.run(&id, token).await;
        });

        info!("Render queued for {}", project_id);
        vec![]
    }

    /// Render and wait for the output, for the synchronous HTTP path.
    ///
    /// The job runs on its own task. Dropping the returned future before it
    /// resolves cancels the job, so an abandoned request never holds the project.
    pub async fn render_now(self: &Arc<Self>, project_id: &str) -> Result<RenderOutput> {
        let token = self
            .claim(project_id)
            .map_err(|_| RenderError::AlreadyRendering(project_id.to_string()))?;

        let executor = Arc::clone(self);
        let id = project_id.to_string();
        let worker = tokio::spawn(async move { executor.run(&id, token).await });

        let guard = CancelOnDrop {
            executor: Some(Arc::clone(self)),
            project_id: project_id.to_string(),
        };
        let result = worker.await;
        guard.disarm();

        result.map_err(|e| RenderError::Media(format!("Render worker for {} stopped: {}", project_id, e)))?
    }

    /// Request cancellation.
    ///
    /// The acknowledgement is broadcast once the worker has stopped. With no job
    /// in flight it is returned immediately.
    pub fn cancel(&self, project_id: &str) -> Vec<ServerEvent> {
        if let Some(mut entry) = self.jobs.get_mut(project_id) {
            if entry.job.state.is_active() {
                entry.job.state = RenderState::Cancelling;
                entry.job.status_message = "Cancelling".to_string();
                entry.cancel.cancel();
                info!("Cancel requested for {}", project_id);
                return vec![];
            }
        }

        debug!("Cancel for {} with no job in flight", project_id);
        vec![ServerEvent::RenderCancelled {
            id: project_id.to_string(),
        }]
    }

    /// Replay a project's state to a client that joined or rejoined
    pub async fn join(&self, project_id: &str) -> Vec<ServerEvent> {
        let id = project_id.to_string();
        let mut replies = match self.store.get(project_id).await {
            Ok(Some(record)) => match record.transcript {
                Some(transcript) => vec![ServerEvent::Finished { id, transcript }],
                None => vec![ServerEvent::Status {
                    id,
                    status: "processing".to_string(),
                    progress: 0,
                }],
            },
            Ok(None) => vec![ServerEvent::Error {
                id,
                error: RenderError::ProjectNotFound(project_id.to_string()).to_string(),
            }],
            Err(e) => {
                warn!("Failed to load project {}: {}", project_id, e);
                vec![ServerEvent::Error {
                    id,
                    error: e.to_string(),
                }]
            }
        };

        if let Some(entry) = self.jobs.get(project_id) {
            if entry.job.state.is_active() {
                replies.push(entry.resume_event());
            }
        }
        replies
    }

    /// Register a new job, or hand back the running job's resume event
    fn claim(&self, project_id: &str) -> std::result::Result<CancelToken, ServerEvent> {
        match self.jobs.entry(project_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().job.state.is_active() {
                    return Err(entry.get().resume_event());
                }
                let (handle, token) = cancel_pair();
                entry.insert(JobEntry::starting(project_id, handle));
                Ok(token)
            }
            Entry::Vacant(entry) => {
                let (handle, token) = cancel_pair();
                entry.insert(JobEntry::starting(project_id, handle));
                Ok(token)
            }
        }
    }

    async fn run(&self, project_id: &str, token: CancelToken) -> Result<RenderOutput> {
        let result = match self.execute(project_id, token).await {
            Ok(output) => self
                .store
                .set_final_video(project_id, &output.media_ref)
                .await
                .map(|_| output),
            Err(e) => Err(e),
        };
        self.jobs.remove(project_id);

        match &result {
            Ok(output) => {
                info!("Render {} finished: {}", project_id, output.media_ref);
                self.broadcast(ServerEvent::RenderFinished {
                    id: project_id.to_string(),
                    video: output.media_ref.clone(),
                });
            }
            Err(RenderError::Cancelled) => {
                info!("Render {} cancelled", project_id);
                self.broadcast(ServerEvent::RenderCancelled {
                    id: project_id.to_string(),
                });
            }
            Err(e) => {
                error!("Render {} failed: {}", project_id, e);
                if let Err(store_error) = self.store.set_render_failed(project_id).await {
                    warn!("Could not flag {} as failed: {}", project_id, store_error);
                }
                self.broadcast(ServerEvent::RenderError {
                    id: project_id.to_string(),
                    error: describe_failure(e),
                });
            }
        }

        result
    }

    async fn execute(&self, project_id: &str, token: CancelToken) -> Result<RenderOutput> {
        let record = self
            .store
            .get(project_id)
            .await?
            .ok_or_else(|| RenderError::ProjectNotFound(project_id.to_string()))?;
        let words = record
            .transcript
            .ok_or_else(|| RenderError::Media(format!("Project {} has no transcript", project_id)))?;

        let scratch = self.invoker.scratch_dir().await?;
        let on_progress = |progress: u8, status: &str| self.report_progress(project_id, progress, status);
        let result = self
            .invoker
            .render(project_id, &record.media_url, &words, scratch.path(), &on_progress, token)
            .await;

        if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch directory for {}: {}", project_id, e);
        }
        result
    }

    fn report_progress(&self, project_id: &str, progress: u8, status: &str) {
        let event = {
            let Some(mut entry) = self.jobs.get_mut(project_id) else {
                return;
            };
            if entry.job.state == RenderState::Cancelling {
                return;
            }

            let progress = entry.tracker.advance(progress);
            if entry.job.state == RenderState::Rendering
                && entry.job.progress == progress
                && entry.job.status_message == status
            {
                return;
            }

            entry.job.state = RenderState::Rendering;
            entry.job.progress = progress;
            entry.job.status_message = status.to_string();
            ServerEvent::RenderProgress {
                id: project_id.to_string(),
                progress,
                status: status.to_string(),
            }
        };

        self.broadcast(event);
    }

    fn broadcast(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("No listeners for executor event");
        }
    }
}

/// Error text for a `render:error`, with the tail of the transcoder's output
pub fn describe_failure(error: &RenderError) -> String {
    match error.detail() {
        Some(detail) => {
            let lines: Vec<&str> = detail.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            format!("{}\n{}", error, tail)
        }
        None => error.to_string(),
    }
}

/// One client connection's view of the executor
pub struct Session {
    executor: Arc<RenderExecutor>,
    observed: HashSet<String>,
}

impl Session {
    /// Apply a client command and return the replies addressed to this client
    pub async fn handle(&mut self, command: ClientEvent) -> Vec<ServerEvent> {
        let id = command.project_id().to_string();
        self.observed.insert(id.clone());

        match command {
            ClientEvent::Join { .. } => self.executor.join(&id).await,
            ClientEvent::RenderStart { .. } => self.executor.start(&id),
            ClientEvent::RenderCancel { .. } => self.executor.cancel(&id),
        }
    }

    /// Whether a broadcast event concerns a project this client has touched
    pub fn wants(&self, event: &ServerEvent) -> bool {
        self.observed.contains(event.project_id())
    }
}

/// Serve a `MemoryChannel` from an executor in the same process.
///
/// Runs until the returned task is aborted.
pub fn serve_in_process(executor: Arc<RenderExecutor>, channel: Arc<MemoryChannel>) -> JoinHandle<()> {
    let mut commands = channel.take_outgoing();
    let mut events = executor.subscribe();
    let mut session = executor.session();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    for reply in session.handle(command).await {
                        channel.deliver(reply);
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if session.wants(&event) {
                            channel.deliver(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("In-process channel lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}
