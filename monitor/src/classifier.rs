//! Console line classification for resource-exhaustion episodes
//!
//! The classifier is `Armed` while the instance is connected and not
//! running, and `Disarmed` otherwise. Standalone, it holds a console
//! subscription only while armed (see [`ConsoleClassifier::sync`]). Inside an
//! `InstanceMonitor` the facade owns the subscription and feeds every line
//! through [`ConsoleClassifier::observe`], which does the gating.
//!
//! An episode opens on the first line that contains one of the signatures
//! below (case-insensitive) and stays open until the viewer dismisses it.
//! Returning to `running` does not close it. Re-arming under a different
//! session than the one the episode was opened in does.

use crate::store::LifecycleState;
use crate::stream::{ConnectionHandle, EventKind, StreamEvent, Subscription};
use log::{debug, warn};
use serde::Serialize;
use shared::SessionId;
use tokio::sync::mpsc;

/// Lower-case fragments that mark a process or thread limit being hit.
pub const RESOURCE_EXHAUSTION_SIGNATURES: [&str; 6] = [
    "pthread_create failed",
    "failed to create thread",
    "unable to create thread",
    "unable to create native thread",
    "unable to create new native thread",
    "exception in thread \"craft async scheduler management thread\"",
];

/// Returns the first signature contained in `line`, ignoring case.
pub fn match_signature(line: &str) -> Option<&'static str> {
    let line = line.to_lowercase();
    RESOURCE_EXHAUSTION_SIGNATURES
        .iter()
        .copied()
        .find(|signature| line.contains(signature))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerCapability {
    Elevated,
    Standard,
}

impl ViewerCapability {
    pub fn is_elevated(self) -> bool {
        matches!(self, ViewerCapability::Elevated)
    }
}

/// Which alert text the viewer gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertBody {
    /// Administrators get the remediation steps.
    Remediation,
    /// Everyone else is told to pass the trigger on to an administrator.
    ContactAdministrator { trigger: String },
}

impl AlertBody {
    pub fn title(&self) -> &'static str {
        match self {
            AlertBody::Remediation => "Memory or process limit reached...",
            AlertBody::ContactAdministrator { .. } => "Possible resource limit reached...",
        }
    }

    pub fn paragraphs(&self) -> Vec<String> {
        match self {
            AlertBody::Remediation => vec![
                "This server has reached the maximum process or memory limit.".to_string(),
                "Increasing container_pid_limit in the node agent configuration (config.yml) \
                 may resolve this issue."
                    .to_string(),
                "Note: the node agent must be restarted for configuration changes to take effect."
                    .to_string(),
            ],
            AlertBody::ContactAdministrator { trigger } => vec![
                "This server is attempting to use more resources than allocated. Please contact \
                 your administrator and give them the error below."
                    .to_string(),
                format!(
                    "{}, possibly out of memory or a process/resource limit was reached.",
                    trigger
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEpisode {
    pub session_id: SessionId,
    pub signature: &'static str,
    pub body: AlertBody,
}

/// Emitted on every signature hit for downstream observability. Carries the
/// signature only, never the console line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifierMatch {
    pub instance_key: String,
    pub matched_signature: &'static str,
    pub viewer_is_elevated: bool,
}

pub trait MatchSink: Send {
    fn record(&self, event: &ClassifierMatch);
}

/// Default sink: a warning in the log.
pub struct LogSink;

impl MatchSink for LogSink {
    fn record(&self, event: &ClassifierMatch) {
        warn!(
            "Resource exhaustion signature on {}: {:?} (elevated viewer: {})",
            event.instance_key, event.matched_signature, event.viewer_is_elevated
        );
    }
}

impl MatchSink for mpsc::UnboundedSender<ClassifierMatch> {
    fn record(&self, event: &ClassifierMatch) {
        let _ = self.send(event.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    Armed { session_id: SessionId },
    Disarmed,
}

pub struct ConsoleClassifier {
    instance_key: String,
    capability: ViewerCapability,
    state: ClassifierState,
    episode: Option<AlertEpisode>,
    subscription: Option<Subscription>,
    sink: Box<dyn MatchSink>,
}

impl ConsoleClassifier {
    pub fn new(instance_key: impl Into<String>, capability: ViewerCapability) -> Self {
        Self::with_sink(instance_key, capability, Box::new(LogSink))
    }

    pub fn with_sink(
        instance_key: impl Into<String>,
        capability: ViewerCapability,
        sink: Box<dyn MatchSink>,
    ) -> Self {
        Self {
            instance_key: instance_key.into(),
            capability,
            state: ClassifierState::Disarmed,
            episode: None,
            subscription: None,
            sink,
        }
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, ClassifierState::Armed { .. })
    }

    pub fn episode(&self) -> Option<&AlertEpisode> {
        self.episode.as_ref()
    }

    pub fn capability(&self) -> ViewerCapability {
        self.capability
    }

    /// Enters `Armed` for `session_id`. An open episode from another session
    /// is stale and gets closed; one from this session carries over.
    pub fn arm(&mut self, session_id: SessionId) {
        if self.state == (ClassifierState::Armed { session_id }) {
            return;
        }

        if matches!(&self.episode, Some(episode) if episode.session_id != session_id) {
            debug!("Clearing alert from previous session on {}", self.instance_key);
            self.episode = None;
        }

        self.state = ClassifierState::Armed { session_id };
    }

    pub fn disarm(&mut self) {
        self.state = ClassifierState::Disarmed;
        self.subscription = None;
    }

    /// Follows the lifecycle: armed while connected and not running. An
    /// instance with no snapshot yet counts as not running.
    pub fn follow(&mut self, lifecycle: &LifecycleState) {
        match lifecycle.connection.active_session() {
            Some(session_id) if !lifecycle.is_running() => self.arm(session_id),
            _ => self.disarm(),
        }
    }

    /// Like [`ConsoleClassifier::follow`], also holding a console
    /// subscription on `stream` exactly while armed.
    pub fn sync(&mut self, lifecycle: &LifecycleState, stream: &ConnectionHandle) {
        self.follow(lifecycle);
        if self.is_armed() && self.subscription.is_none() {
            self.subscription = Some(stream.subscribe(&[EventKind::ConsoleOutput]));
        }
    }

    /// Classifies every console line queued on the subscription.
    pub fn pump(&mut self) {
        let pending = match self.subscription.as_mut() {
            Some(subscription) => subscription.drain(),
            None => return,
        };
        for event in pending {
            if let StreamEvent::ConsoleOutput { session_id, line } = event {
                self.observe(session_id, &line);
            }
        }
    }

    /// Inspects a line that arrived under `session_id`; lines from any
    /// session other than the armed one are skipped.
    pub fn observe(&mut self, session_id: SessionId, line: &str) -> Option<&AlertEpisode> {
        if self.state != (ClassifierState::Armed { session_id }) {
            return None;
        }
        self.inspect(line)
    }

    /// Checks one line. A no-op while disarmed or while an episode is open.
    pub fn inspect(&mut self, line: &str) -> Option<&AlertEpisode> {
        let session_id = match self.state {
            ClassifierState::Armed { session_id } => session_id,
            ClassifierState::Disarmed => return None,
        };

        let signature = match_signature(line)?;
        self.sink.record(&ClassifierMatch {
            instance_key: self.instance_key.clone(),
            matched_signature: signature,
            viewer_is_elevated: self.capability.is_elevated(),
        });

        if self.episode.is_none() {
            let body = match self.capability {
                ViewerCapability::Elevated => AlertBody::Remediation,
                ViewerCapability::Standard => AlertBody::ContactAdministrator {
                    trigger: signature.to_string(),
                },
            };
            self.episode = Some(AlertEpisode {
                session_id,
                signature,
                body,
            });
        }

        self.episode.as_ref()
    }

    /// Viewer closed the alert. Status is left alone.
    pub fn dismiss(&mut self) {
        self.episode = None;
    }
}
