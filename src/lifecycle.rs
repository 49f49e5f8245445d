//! Client-side render job state machine.
//!
//! `RenderJobManager` issues `render:start` / `render:cancel` for the project it
//! observes and derives the UI-facing view from the events that come back over
//! an injected `EventChannel`. Events for any other project are dropped.
//!
//! Precedence: a `render:finished` or `render:error` that arrives after a cancel
//! request wins over the cancellation, since the job had already ended. Progress
//! and resume events seen while a cancel is pending are ignored.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channel::{ChannelEvent, EventChannel, Listener, Subscription};
use crate::config::ClientConfig;
use crate::error::RenderError;
use crate::protocol::{ClientEvent, RenderJob, RenderState, ServerEvent};
use crate::reconcile::CompletionStatus;
use crate::subtitle::Word;

pub const RECONNECTING_STATUS: &str = "reconnecting";

const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RenderJobManager {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn EventChannel>,
    stall_timeout: Duration,
    view: Mutex<View>,
}

#[derive(Default)]
struct View {
    project_id: Option<String>,
    job: RenderJob,
    is_cancelling: bool,
    connected: bool,
    last_error: Option<String>,
    project_status: Option<String>,
    project_error: Option<String>,
    transcript: Option<Vec<Word>>,
    last_event_at: Option<Instant>,
    subscription: Option<Subscription>,
}

impl View {
    fn reset_job(&mut self) {
        self.job.reset();
        self.is_cancelling = false;
        self.last_event_at = None;
    }
}

impl RenderJobManager {
    pub fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self::with_stall_timeout(channel, DEFAULT_STALL_TIMEOUT)
    }

    pub fn from_config(channel: Arc<dyn EventChannel>, config: &ClientConfig) -> Self {
        Self::with_stall_timeout(channel, config.stall_timeout())
    }

    pub fn with_stall_timeout(channel: Arc<dyn EventChannel>, stall_timeout: Duration) -> Self {
        let connected = channel.is_connected();
        Self {
            inner: Arc::new(Inner {
                channel,
                stall_timeout,
                view: Mutex::new(View {
                    connected,
                    ..View::default()
                }),
            }),
        }
    }

    /// Observe `project_id`, replacing any project observed before
    pub fn open_project<S: Into<String>>(&self, project_id: S) {
        let project_id = project_id.into();
        drop(self.take_subscription());

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let listener: Listener = Arc::new(move |event: &ChannelEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle(event);
            }
        });
        let subscription = self.inner.channel.subscribe(listener);
        let connected = self.inner.channel.is_connected();

        {
            let mut view = self.inner.view.lock();
            view.reset_job();
            view.job.id = project_id.clone();
            view.project_id = Some(project_id.clone());
            view.project_status = None;
            view.project_error = None;
            view.transcript = None;
            view.connected = connected;
            view.subscription = Some(subscription);
        }

        info!("Observing project {}", project_id);
        if connected {
            self.inner.channel.emit(ClientEvent::Join { id: project_id });
        } else {
            // The Connected callback sends the join
            self.inner.channel.connect();
        }
    }

    pub fn start_render(&self) {
        let command = {
            let mut view = self.inner.view.lock();
            let Some(id) = view.project_id.clone() else {
                debug!("start_render ignored: no project open");
                return;
            };

            if view.is_cancelling {
                debug!("Cancel still pending for {}, re-sending cancel", id);
                ClientEvent::RenderCancel { id }
            } else {
                view.reset_job();
                view.job.state = RenderState::Starting;
                view.job.status_message = "Starting render".to_string();
                view.last_event_at = Some(Instant::now());
                ClientEvent::RenderStart { id }
            }
        };

        self.inner.channel.emit(command);
    }

    pub fn cancel_render(&self) {
        let command = {
            let mut view = self.inner.view.lock();
            let Some(id) = view.project_id.clone() else {
                debug!("cancel_render ignored: no project open");
                return;
            };
            view.reset_job();
            view.is_cancelling = true;
            ClientEvent::RenderCancel { id }
        };

        self.inner.channel.emit(command);
    }

    /// Return to `Idle` from any state
    pub fn reset(&self) {
        self.inner.view.lock().reset_job();
    }

    /// Stop observing the project and release the channel subscription
    pub fn teardown(&self) {
        let subscription = self.take_subscription();
        {
            let mut view = self.inner.view.lock();
            view.reset_job();
            view.job.id.clear();
            view.project_id = None;
            view.project_status = None;
            view.project_error = None;
            view.transcript = None;
        }
        drop(subscription);
    }

    /// Fold in the result of a completion check, used when no terminal event arrived
    pub fn apply_completion(&self, status: CompletionStatus) {
        let mut view = self.inner.view.lock();
        if view.project_id.is_none() {
            return;
        }

        if status.completed {
            view.is_cancelling = false;
            view.job.state = RenderState::Completed;
            view.job.progress = 100;
            view.job.status_message = "Render complete".to_string();
            view.job.error_message = None;
        } else if status.failed {
            view.is_cancelling = false;
            view.job.state = RenderState::Error;
            view.job.status_message = "Render failed".to_string();
            view.job.error_message = Some("Render failed".to_string());
        }
    }

    pub fn job(&self) -> RenderJob {
        self.inner.view.lock().job.clone()
    }

    pub fn state(&self) -> RenderState {
        self.inner.view.lock().job.state
    }

    pub fn project_id(&self) -> Option<String> {
        self.inner.view.lock().project_id.clone()
    }

    pub fn is_rendering(&self) -> bool {
        self.state().is_active()
    }

    pub fn progress(&self) -> u8 {
        self.inner.view.lock().job.progress
    }

    pub fn status_message(&self) -> String {
        self.inner.view.lock().job.status_message.clone()
    }

    pub fn result_media_ref(&self) -> Option<String> {
        self.inner.view.lock().job.result_media_ref.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.inner.view.lock().job.error_message.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state() == RenderState::Completed
    }

    pub fn is_cancelling(&self) -> bool {
        self.inner.view.lock().is_cancelling
    }

    pub fn connected(&self) -> bool {
        self.inner.view.lock().connected
    }

    /// Most recent channel error, cleared on reconnect
    pub fn last_error(&self) -> Option<String> {
        self.inner.view.lock().last_error.clone()
    }

    /// Latest join-family status for the project
    pub fn project_status(&self) -> Option<String> {
        self.inner.view.lock().project_status.clone()
    }

    pub fn project_error(&self) -> Option<String> {
        self.inner.view.lock().project_error.clone()
    }

    pub fn transcript(&self) -> Option<Vec<Word>> {
        self.inner.view.lock().transcript.clone()
    }

    /// A started job has gone `stall_timeout` without a render event
    pub fn is_stalled(&self, now: Instant) -> bool {
        let view = self.inner.view.lock();
        if !view.job.state.is_active() {
            return false;
        }
        view.last_event_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.inner.stall_timeout)
    }

    fn take_subscription(&self) -> Option<Subscription> {
        self.inner.view.lock().subscription.take()
    }
}

impl Inner {
    fn handle(&self, event: &ChannelEvent) {
        let rejoin = {
            let mut view = self.view.lock();
            match event {
                ChannelEvent::Connected => {
                    view.connected = true;
                    view.last_error = None;
                    view.project_id.clone()
                }
                ChannelEvent::Disconnected => {
                    view.connected = false;
                    mark_reconnecting(&mut view);
                    None
                }
                ChannelEvent::ConnectError(message) => {
                    warn!("Event channel error: {}", message);
                    view.connected = false;
                    view.last_error = Some(message.clone());
                    mark_reconnecting(&mut view);
                    None
                }
                ChannelEvent::Server(event) => {
                    apply_server_event(&mut view, event);
                    None
                }
            }
        };

        if let Some(id) = rejoin {
            self.channel.emit(ClientEvent::Join { id });
        }
    }
}

fn mark_reconnecting(view: &mut View) {
    if matches!(view.job.state, RenderState::Starting | RenderState::Rendering) {
        view.job.state = RenderState::Rendering;
        view.job.status_message = RECONNECTING_STATUS.to_string();
    }
}

fn apply_server_event(view: &mut View, event: &ServerEvent) {
    if view.project_id.as_deref() != Some(event.project_id()) {
        let mismatch = RenderError::ProtocolMismatch {
            expected: view.project_id.clone().unwrap_or_default(),
            actual: event.project_id().to_string(),
        };
        debug!("Dropping event: {}", mismatch);
        return;
    }
    // Join replies say nothing about the render, only render events count as activity
    if event.is_render_event() {
        view.last_event_at = Some(Instant::now());
    }

    match event {
        ServerEvent::Status { status, .. } => {
            view.project_status = Some(status.clone());
        }
        ServerEvent::Finished { transcript, .. } => {
            view.project_status = Some("finished".to_string());
            view.transcript = Some(transcript.clone());
        }
        ServerEvent::Error { error, .. } => {
            view.project_error = Some(error.clone());
        }
        ServerEvent::RenderProgress { progress, status, .. }
        | ServerEvent::RenderResume { progress, status, .. } => {
            if view.is_cancelling {
                debug!("Ignoring progress while cancel is pending");
                return;
            }
            let progress = (*progress).min(100);
            view.job.progress = if view.job.state == RenderState::Rendering {
                view.job.progress.max(progress)
            } else {
                progress
            };
            view.job.state = RenderState::Rendering;
            view.job.status_message = status.clone();
            view.job.error_message = None;
            view.job.result_media_ref = None;
        }
        ServerEvent::RenderFinished { video, .. } => {
            view.is_cancelling = false;
            view.job.state = RenderState::Completed;
            view.job.progress = 100;
            view.job.status_message = "Render complete".to_string();
            view.job.result_media_ref = Some(video.clone());
            view.job.error_message = None;
        }
        ServerEvent::RenderError { error, .. } => {
            view.is_cancelling = false;
            view.job.state = RenderState::Error;
            view.job.status_message = "Render failed".to_string();
            view.job.error_message = Some(error.clone());
        }
        ServerEvent::RenderCancelled { .. } => {
            if !view.is_cancelling {
                debug!("Ignoring cancel acknowledgement, no cancel pending");
                return;
            }
            view.reset_job();
            view.job.status_message = "Render cancelled".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    fn connected_manager() -> (Arc<MemoryChannel>, RenderJobManager) {
        let channel = MemoryChannel::new();
        channel.connect();
        let manager = RenderJobManager::new(channel.clone());
        manager.open_project("p1");
        channel.take_sent();
        (channel, manager)
    }

    fn progress(id: &str, progress: u8) -> ServerEvent {
        ServerEvent::RenderProgress {
            id: id.into(),
            progress,
            status: "Encoding video".into(),
        }
    }

    #[test]
    fn test_start_progress_finish() {
        let (channel, manager) = connected_manager();

        manager.start_render();
        assert_eq!(manager.state(), RenderState::Starting);
        assert!(manager.is_rendering());
        assert_eq!(channel.take_sent(), vec![ClientEvent::RenderStart { id: "p1".into() }]);

        channel.deliver(progress("p1", 40));
        assert_eq!(manager.state(), RenderState::Rendering);
        assert_eq!(manager.progress(), 40);
        assert_eq!(manager.status_message(), "Encoding video");

        channel.deliver(ServerEvent::RenderFinished {
            id: "p1".into(),
            video: "/videos/p1.mp4".into(),
        });
        assert_eq!(manager.state(), RenderState::Completed);
        assert!(manager.is_complete());
        assert!(!manager.is_rendering());
        assert_eq!(manager.result_media_ref().as_deref(), Some("/videos/p1.mp4"));
    }

    #[test]
    fn test_start_without_project_is_noop() {
        let channel = MemoryChannel::new();
        channel.connect();
        let manager = RenderJobManager::new(channel.clone());

        manager.start_render();
        manager.cancel_render();

        assert_eq!(manager.state(), RenderState::Idle);
        assert!(channel.take_sent().is_empty());
    }

    #[test]
    fn test_progress_within_job_is_monotonic() {
        let (channel, manager) = connected_manager();
        manager.start_render();

        channel.deliver(progress("p1", 60));
        channel.deliver(progress("p1", 30));
        assert_eq!(manager.progress(), 60);
    }

    #[test]
    fn test_events_for_other_projects_are_dropped() {
        let (channel, manager) = connected_manager();
        manager.start_render();

        channel.deliver(progress("other", 80));
        channel.deliver(ServerEvent::RenderFinished {
            id: "other".into(),
            video: "/videos/other.mp4".into(),
        });

        assert_eq!(manager.state(), RenderState::Starting);
        assert_eq!(manager.progress(), 0);
    }

    #[test]
    fn test_cancel_flow() {
        let (channel, manager) = connected_manager();
        manager.start_render();
        channel.deliver(progress("p1", 50));
        channel.take_sent();

        manager.cancel_render();
        assert_eq!(manager.state(), RenderState::Idle);
        assert_eq!(manager.progress(), 0);
        assert!(manager.is_cancelling());
        assert_eq!(channel.take_sent(), vec![ClientEvent::RenderCancel { id: "p1".into() }]);

        // Late progress from the winding-down worker
        channel.deliver(progress("p1", 70));
        assert_eq!(manager.state(), RenderState::Idle);

        // Starting again while the cancel is pending re-sends the cancel
        manager.start_render();
        assert_eq!(channel.take_sent(), vec![ClientEvent::RenderCancel { id: "p1".into() }]);
        assert_eq!(manager.state(), RenderState::Idle);

        channel.deliver(ServerEvent::RenderCancelled { id: "p1".into() });
        assert!(!manager.is_cancelling());
        assert_eq!(manager.state(), RenderState::Idle);

        manager.start_render();
        assert_eq!(channel.take_sent(), vec![ClientEvent::RenderStart { id: "p1".into() }]);
        assert_eq!(manager.state(), RenderState::Starting);
    }

    #[test]
    fn test_terminal_event_supersedes_pending_cancel() {
        let (channel, manager) = connected_manager();
        manager.start_render();
        manager.cancel_render();

        channel.deliver(ServerEvent::RenderFinished {
            id: "p1".into(),
            video: "/videos/p1.mp4".into(),
        });

        assert!(!manager.is_cancelling());
        assert!(manager.is_complete());

        // The executor acknowledges a cancel that found nothing running
        channel.deliver(ServerEvent::RenderCancelled { id: "p1".into() });
        assert!(manager.is_complete());

        manager.cancel_render();
        channel.deliver(ServerEvent::RenderError {
            id: "p1".into(),
            error: "ffmpeg exited with status 1".into(),
        });
        assert!(!manager.is_cancelling());
        assert_eq!(manager.state(), RenderState::Error);
        assert_eq!(manager.error_message().as_deref(), Some("ffmpeg exited with status 1"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let (channel, manager) = connected_manager();
        manager.start_render();
        channel.deliver(ServerEvent::RenderError {
            id: "p1".into(),
            error: "boom".into(),
        });

        manager.reset();
        let job = manager.job();
        assert_eq!(job.state, RenderState::Idle);
        assert_eq!(job.progress, 0);
        assert!(job.status_message.is_empty());
        assert!(job.error_message.is_none());
        assert!(job.result_media_ref.is_none());
    }

    #[test]
    fn test_disconnect_mid_job_then_resume() {
        let (channel, manager) = connected_manager();
        manager.start_render();
        channel.deliver(progress("p1", 45));

        channel.drop_connection();
        assert!(!manager.connected());
        assert_eq!(manager.state(), RenderState::Rendering);
        assert_eq!(manager.status_message(), RECONNECTING_STATUS);
        assert_eq!(manager.progress(), 45);

        channel.take_sent();
        channel.connect();
        assert!(manager.connected());
        assert_eq!(channel.take_sent(), vec![ClientEvent::Join { id: "p1".into() }]);

        channel.deliver(ServerEvent::RenderResume {
            id: "p1".into(),
            progress: 55,
            status: "Encoding video".into(),
        });
        assert_eq!(manager.state(), RenderState::Rendering);
        assert_eq!(manager.progress(), 55);
        assert_eq!(manager.status_message(), "Encoding video");
    }

    #[test]
    fn test_disconnect_while_idle_is_harmless() {
        let (channel, manager) = connected_manager();
        channel.drop_connection();
        assert_eq!(manager.state(), RenderState::Idle);
        assert!(manager.status_message().is_empty());
    }

    #[test]
    fn test_connect_error_keeps_progress() {
        let (channel, manager) = connected_manager();
        manager.start_render();
        channel.deliver(progress("p1", 35));

        channel.fail("connection refused");
        assert_eq!(manager.last_error().as_deref(), Some("connection refused"));
        assert!(!manager.connected());
        assert_eq!(manager.progress(), 35);
        assert_eq!(manager.status_message(), RECONNECTING_STATUS);

        channel.connect();
        assert!(manager.last_error().is_none());
    }

    #[test]
    fn test_open_project_while_disconnected_joins_on_connect() {
        let channel = MemoryChannel::new();
        let manager = RenderJobManager::new(channel.clone());

        manager.open_project("p9");

        assert!(channel.is_connected());
        assert!(manager.connected());
        assert_eq!(channel.take_sent(), vec![ClientEvent::Join { id: "p9".into() }]);
    }

    #[test]
    fn test_join_family_updates_project_view() {
        let (channel, manager) = connected_manager();

        channel.deliver(ServerEvent::Status {
            id: "p1".into(),
            status: "transcribing".into(),
            progress: 30,
        });
        assert_eq!(manager.project_status().as_deref(), Some("transcribing"));

        channel.deliver(ServerEvent::Finished {
            id: "p1".into(),
            transcript: vec![Word::new(0, 400, "Hello")],
        });
        assert_eq!(manager.transcript().map(|t| t.len()), Some(1));
        assert_eq!(manager.state(), RenderState::Idle);
    }

    #[test]
    fn test_reopening_replaces_subscription() {
        let (channel, manager) = connected_manager();
        assert_eq!(channel.subscriber_count(), 1);

        manager.open_project("p2");
        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(channel.take_sent(), vec![ClientEvent::Join { id: "p2".into() }]);

        channel.deliver(progress("p1", 50));
        assert_eq!(manager.state(), RenderState::Idle);
    }

    #[test]
    fn test_teardown_unsubscribes() {
        let (channel, manager) = connected_manager();
        manager.start_render();

        manager.teardown();
        assert_eq!(channel.subscriber_count(), 0);
        assert_eq!(manager.state(), RenderState::Idle);
        assert!(manager.project_id().is_none());

        drop(manager);
        channel.deliver(progress("p1", 10));
    }

    #[test]
    fn test_dropping_manager_unsubscribes() {
        let (channel, manager) = connected_manager();
        drop(manager);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_stall_detection_and_reconciliation() {
        let channel = MemoryChannel::new();
        channel.connect();
        let manager = RenderJobManager::with_stall_timeout(channel.clone(), Duration::from_secs(30));
        manager.open_project("p1");

        assert!(!manager.is_stalled(Instant::now() + Duration::from_secs(3600)));

        manager.start_render();
        let now = Instant::now();
        assert!(!manager.is_stalled(now));
        assert!(manager.is_stalled(now + Duration::from_secs(31)));

        manager.apply_completion(CompletionStatus { completed: true, failed: false });
        assert!(manager.is_complete());
        assert!(!manager.is_stalled(now + Duration::from_secs(31)));
    }

    #[test]
    fn test_join_replies_do_not_reset_stall_timer() {
        let channel = MemoryChannel::new();
        channel.connect();
        let manager = RenderJobManager::with_stall_timeout(channel.clone(), Duration::from_millis(50));
        manager.open_project("p1");
        manager.start_render();

        std::thread::sleep(Duration::from_millis(60));
        channel.deliver(ServerEvent::Status {
            id: "p1".into(),
            status: "processing".into(),
            progress: 0,
        });
        assert!(manager.is_stalled(Instant::now()));

        channel.deliver(progress("p1", 30));
        assert!(!manager.is_stalled(Instant::now()));
    }

    #[test]
    fn test_reconciled_failure() {
        let (_channel, manager) = connected_manager();
        manager.start_render();

        manager.apply_completion(CompletionStatus::default());
        assert_eq!(manager.state(), RenderState::Starting);

        manager.apply_completion(CompletionStatus { completed: false, failed: true });
        assert_eq!(manager.state(), RenderState::Error);
    }
}
