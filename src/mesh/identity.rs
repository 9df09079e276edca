//! Process identity assigned on relay connect

use tracing::info;

use super::types::PeerId;

/// Holds the identifier this process announces to the relay.
///
/// The identifier is assigned once per relay session, on the connect
/// event, and no other component may mutate it. A relay disconnect
/// returns the process to the pre-ready state; the next connect assigns
/// a fresh identifier, so ids are never reused within a process.
#[derive(Debug, Default)]
pub struct Identity {
    current: Option<PeerId>,
}

impl Identity {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Assign an identifier for this relay session if none is set yet.
    /// Repeated connect events within one session keep the existing id.
    pub fn assign(&mut self) -> &PeerId {
        if self.current.is_none() {
            let id = PeerId::generate();
            info!("Assigned local peer id {}", id.short());
            self.current = Some(id);
        }
        self.current.as_ref().expect("identity just assigned")
    }

    pub fn get(&self) -> Option<&PeerId> {
        self.current.as_ref()
    }

    /// Drop the session identifier after relay disconnect.
    pub fn clear(&mut self) {
        self.current = None;
    }
}
