//! Call state machine
//!
//! ```text
//!   IDLE ──(local call / start received)──▶ SESSION
//!   SESSION ──(hang up / quit from member)──▶ IDLE
//!   any ──(local fault)──▶ ERROR            (terminal)
//! ```
//!
//! Status is readable lock-free from any task. Transitions are serialised
//! so a start and a quit arriving on parallel connections cannot interleave.

use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::SessionError;
use crate::protocol::{ParticipantList, Status};

/// The call UI and media collaborator driven by the coordinator
pub trait CallPanel: Send + Sync {
    /// Open media to every other participant
    fn start_call(&self, participants: &ParticipantList) -> crate::Result<()>;

    /// Tear down all media of the active call
    fn stop_call(&self);

    /// Participants of the call the panel is running, if any
    fn current_participant_list(&self) -> Option<ParticipantList>;

    /// Whether this node can find itself in `participants`
    fn can_join(&self, _participants: &ParticipantList) -> bool {
        true
    }

    /// Show or hide the main window
    fn set_visible(&self, visible: bool);
}

/// What happened to a quit handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitOutcome {
    /// Sender was a participant; the call ended
    TornDown,
    /// Sender is not in the active call
    NotAMember,
    /// No call is active
    NoSession,
}

/// Holds status and the active participant list
pub struct SessionCoordinator {
    status: AtomicU8,
    participants: RwLock<Option<ParticipantList>>,
    transition: Mutex<()>,
    panel: Arc<dyn CallPanel>,
}

impl SessionCoordinator {
    pub fn new(panel: Arc<dyn CallPanel>) -> Self {
        Self {
            status: AtomicU8::new(Status::Idle as u8),
            participants: RwLock::new(None),
            transition: Mutex::new(()),
            panel,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Participants of the active call
    pub fn current_participants(&self) -> Option<ParticipantList> {
        self.participants.read().clone()
    }

    pub fn panel(&self) -> &Arc<dyn CallPanel> {
        &self.panel
    }

    /// This node placed a call to `participants`
    pub fn start_local_call(&self, participants: ParticipantList) -> Result<(), SessionError> {
        let _guard = self.transition.lock();
        self.require(Status::Idle, "start a call")?;
        tracing::info!("Starting call with {} participants", participants.len());
        self.enter_session(participants)
    }

    /// A start handshake was fully received
    pub fn on_start_received(&self, participants: ParticipantList) -> Result<(), SessionError> {
        let _guard = self.transition.lock();
        if let Err(e) = self.require(Status::Idle, "join a call") {
            tracing::warn!(
                "Ignoring call from {}: {}",
                participants.initiator(),
                e
            );
            return Err(e);
        }
        if !self.panel.can_join(&participants) {
            tracing::warn!(
                "Ignoring call from {}: this node is not in its participant list",
                participants.initiator()
            );
            return Err(SessionError::NotListed);
        }
        tracing::info!("Joining call initiated by {}", participants.initiator());
        self.panel.set_visible(false);
        self.enter_session(participants)
    }

    /// A quit handshake arrived from `sender`
    pub fn on_quit_received(&self, sender: IpAddr) -> QuitOutcome {
        let _guard = self.transition.lock();
        // The panel's view of the call decides membership
        let list = match self.status() {
            Status::Session => self
                .panel
                .current_participant_list()
                .or_else(|| self.participants.read().clone()),
            _ => None,
        };
        let member = list.map(|list| list.contains_ip(sender));
        match member {
            None => {
                tracing::debug!("Quit from {} with no active call", sender);
                QuitOutcome::NoSession
            }
            Some(false) => {
                tracing::warn!("Ignoring quit from non-participant {}", sender);
                QuitOutcome::NotAMember
            }
            Some(true) => {
                tracing::info!("Participant {} quit, ending call", sender);
                self.teardown();
                QuitOutcome::TornDown
            }
        }
    }

    /// Local hang-up
    pub fn hang_up(&self) -> Result<ParticipantList, SessionError> {
        let _guard = self.transition.lock();
        self.require(Status::Session, "hang up")?;
        let participants = self.participants.read().clone();
        self.teardown();
        participants.ok_or(SessionError::InvalidTransition {
            from: Status::Idle,
            event: "hang up",
        })
    }

    /// Enter the terminal error state
    pub fn fail(&self, reason: &str) {
        let _guard = self.transition.lock();
        if self.status() == Status::Session {
            self.panel.stop_call();
        }
        self.enter_error(reason);
    }

    fn require(&self, expected: Status, event: &'static str) -> Result<(), SessionError> {
        let from = self.status();
        if from != expected {
            return Err(SessionError::InvalidTransition { from, event });
        }
        Ok(())
    }

    fn enter_session(&self, participants: ParticipantList) -> Result<(), SessionError> {
        self.status.store(Status::Session as u8, Ordering::SeqCst);
        *self.participants.write() = Some(participants.clone());

        if let Err(e) = self.panel.start_call(&participants) {
            self.panel.stop_call();
            self.panel.set_visible(true);
            self.enter_error(&e.to_string());
            return Err(SessionError::SetupFailed(e.to_string()));
        }
        Ok(())
    }

    fn teardown(&self) {
        self.panel.stop_call();
        *self.participants.write() = None;
        self.status.store(Status::Idle as u8, Ordering::SeqCst);
        self.panel.set_visible(true);
    }

    fn enter_error(&self, reason: &str) {
        tracing::error!("Entering error state: {}", reason);
        *self.participants.write() = None;
        self.status.store(Status::Error as u8, Ordering::SeqCst);
    }
}
