//! The chase-event bus coupling the chasers.
//!
//! Publishing walks the subscriber list under its lock, so no event is
//! observed before `publish` returns and each subscriber sees events in
//! publish order. Consumption is serialized by each chaser's own strand
//! thread. The bus applies no back-pressure; chasers bound their own work.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Chase {
    Start,
    Resume,
    Suspend,
    Bump,
    Checked,
    Valid,
    Unvalid,
    Confirmable,
    Unconfirmable,
    Organized,
    Reorganized,
    Regressed,
    Disorganized,
    Stop,
}

/// Fatal categories carried through `Stop`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultCode {
    Validate(u8),
    Confirm(u8),
    Archive,
    ServiceStopped,
}

impl FaultCode {
    /// Shutdown codes unwind silently; everything else is reported.
    pub fn is_shutdown(self) -> bool {
        matches!(self, FaultCode::ServiceStopped)
    }
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultCode::Validate(step) => write!(f, "validate{step}"),
            FaultCode::Confirm(step) => write!(f, "confirm{step}"),
            FaultCode::Archive => write!(f, "archive"),
            FaultCode::ServiceStopped => write!(f, "service stopped"),
        }
    }
}

/// One bus event: an optional error, a tag, and a height or link payload.
#[derive(Clone, Copy, Debug)]
pub struct ChaseEvent {
    pub ec: Option<FaultCode>,
    pub chase: Chase,
    pub value: u64,
}

impl ChaseEvent {
    pub fn new(chase: Chase, value: u64) -> Self {
        Self {
            ec: None,
            chase,
            value,
        }
    }

    pub fn stop(ec: Option<FaultCode>) -> Self {
        Self {
            ec,
            chase: Chase::Stop,
            value: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ChaseEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. The returned sender reaches only this
    /// subscriber and is used for self-posted events.
    pub fn subscribe(&self) -> (Sender<ChaseEvent>, Receiver<ChaseEvent>) {
        let (sender, receiver) = unbounded();
        self.subscribers
            .lock()
            .expect("bus lock")
            .push(sender.clone());
        (sender, receiver)
    }

    pub fn publish(&self, event: ChaseEvent) {
        let mut subscribers = self.subscribers.lock().expect("bus lock");
        subscribers.retain(|subscriber| subscriber.send(event).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus lock").len()
    }
}
