//! Progress events published by a `BoundedRunner`.
//!
//! Events are delivered synchronously to every subscriber in the order tasks
//! actually start and finish. Subscribers are called without any runner lock
//! held, so they may call back into a `RunnerHandle`.

use crate::task::{TaskError, TaskState};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum TaskEvent<'a, T> {
    Start {
        id: &'a str,
        running: usize,
        queued: usize,
    },
    Complete {
        id: &'a str,
        result: &'a T,
        running: usize,
        queued: usize,
    },
    Failed {
        id: &'a str,
        error: &'a TaskError,
        running: usize,
        queued: usize,
    },
}

impl<T> TaskEvent<'_, T> {
    pub fn id(&self) -> &str {
        match self {
            Self::Start { id, .. } | Self::Complete { id, .. } | Self::Failed { id, .. } => id,
        }
    }

    /// (running, queued) right after the transition
    pub fn counts(&self) -> (usize, usize) {
        match self {
            Self::Start {
                running, queued, ..
            }
            | Self::Complete {
                running, queued, ..
            }
            | Self::Failed {
                running, queued, ..
            } => (*running, *queued),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Start { .. })
    }
}

pub trait Subscriber<T>: Send + Sync {
    fn notify(&self, event: &TaskEvent<'_, T>);
}

impl<T, F> Subscriber<T> for F
where
    F: Fn(&TaskEvent<'_, T>) + Send + Sync,
{
    fn notify(&self, event: &TaskEvent<'_, T>) {
        self(event)
    }
}

/// Owned, payload-free copy of a `TaskEvent`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub id: String,
    pub state: TaskState,
    pub running: usize,
    pub queued: usize,
}

impl Progress {
    pub fn from_event<T>(event: &TaskEvent<'_, T>) -> Self {
        let state = match event {
            TaskEvent::Start { .. } => TaskState::Running,
            TaskEvent::Complete { .. } => TaskState::Completed,
            TaskEvent::Failed { error, .. } => error.state(),
        };
        let (running, queued) = event.counts();

        Self {
            id: event.id().to_owned(),
            state,
            running,
            queued,
        }
    }
}

/// Publishes `Progress` values onto a channel, e.g. for a progress bar living in another task
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<Progress>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (sender, receiver) = mpsc::unbounded_channel();

        (Self { sender }, receiver)
    }
}

impl<T> Subscriber<T> for ChannelSubscriber {
    fn notify(&self, event: &TaskEvent<'_, T>) {
        // a closed receiver only means nobody watches progress anymore
        let _ = self.sender.send(Progress::from_event(event));
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Default)]
pub struct LogSubscriber {
    pub scope: &'static str,
}

impl<T> Subscriber<T> for LogSubscriber {
    fn notify(&self, event: &TaskEvent<'_, T>) {
        match event {
            TaskEvent::Start {
                id,
                running,
                queued,
            } => debug!(scope = self.scope, id, running, queued, "Task started"),
            TaskEvent::Complete {
                id,
                running,
                queued,
                ..
            } => debug!(scope = self.scope, id, running, queued, "Task completed"),
            TaskEvent::Failed {
                id,
                error,
                running,
                queued,
            } => warn!(scope = self.scope, id, running, queued, "Task failed: {error}"),
        }
    }
}
