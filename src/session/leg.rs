use tracing::{error, warn};

use crate::error::Error;

use super::b2b::B2bSession;
use super::callee::CalleeSession;
use super::caller::CallerSession;
use super::event::LegEvent;

/// One side of a call as seen by the registry.
pub enum Leg {
    Caller(CallerSession),
    Callee(CalleeSession),
}

impl Leg {
    pub fn base(&self) -> &B2bSession {
        match self {
            Leg::Caller(caller) => caller.base(),
            Leg::Callee(callee) => callee.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut B2bSession {
        match self {
            Leg::Caller(caller) => caller.base_mut(),
            Leg::Callee(callee) => callee.base_mut(),
        }
    }

    pub fn local_tag(&self) -> &str {
        self.base().local_tag()
    }

    pub fn is_finished(&self) -> bool {
        self.base().is_finished()
    }

    /// Handles one event. Failures are logged here and never propagate.
    pub async fn process(&mut self, event: LegEvent) {
        let kind = event.kind();
        let result = match self {
            Leg::Caller(caller) => caller.process(event).await,
            Leg::Callee(callee) => callee.process(event).await,
        };

        if let Err(err) = result {
            let local_tag = self.local_tag();
            match &err {
                Error::ProtocolInconsistency(_) => {
                    error!(local_tag, event = kind, error = %err, "protocol inconsistency, event dropped")
                }
                _ => warn!(local_tag, event = kind, error = %err, "failed to process event"),
            }
        }
    }

    pub fn teardown(&mut self) {
        self.base_mut().teardown();
    }
}
