use poml_core::{Identity, PomlError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub mod auth;

pub use auth::{AuthProvider, LocalAuthProvider, Provider};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    SignIn { provider: Provider, identity: Identity },
    SignOut,
    ContinueAsGuest,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::SignIn { .. } => "sign_in",
            SessionEvent::SignOut => "sign_out",
            SessionEvent::ContinueAsGuest => "continue_as_guest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No entry choice made yet.
    Unresolved,
    Anonymous,
    Authenticated(Identity),
}

impl SessionState {
    /// Pure transition function of the session machine.
    pub fn apply(&self, event: &SessionEvent) -> Result<SessionState> {
        match (self, event) {
            (
                SessionState::Unresolved | SessionState::Anonymous,
                SessionEvent::SignIn { identity, .. },
            ) => {
                if identity.is_anonymous() {
                    return Err(PomlError::InvalidTransition(
                        "sign-in must resolve to an authenticated identity".into(),
                    ));
                }
                Ok(SessionState::Authenticated(identity.clone()))
            }
            (SessionState::Unresolved, SessionEvent::ContinueAsGuest) => {
                Ok(SessionState::Anonymous)
            }
            (SessionState::Authenticated(_), SessionEvent::SignOut) => Ok(SessionState::Unresolved),
            (state, event) => Err(PomlError::InvalidTransition(format!(
                "{event:?} is not allowed in state {state:?}"
            ))),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        match self {
            SessionState::Unresolved => None,
            SessionState::Anonymous => Some(Identity::Anonymous),
            SessionState::Authenticated(identity) => Some(identity.clone()),
        }
    }
}

/// Holds the current session and publishes every change.
pub struct SessionManager {
    state: watch::Sender<SessionState>,
    auth: Arc<dyn AuthProvider>,
}

impl SessionManager {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        let (state, _) = watch::channel(SessionState::Unresolved);
        Self { state, auth }
    }

    pub fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.borrow().identity()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Apply an event; a rejected event leaves the state unchanged.
    pub fn transition(&self, event: SessionEvent) -> Result<SessionState> {
        let mut outcome = None;
        self.state.send_if_modified(|state| {
            let applied = state.apply(&event);
            let changed = match &applied {
                Ok(next) => {
                    *state = next.clone();
                    true
                }
                Err(_) => false,
            };
            outcome = Some(applied);
            changed
        });

        let next = outcome
            .unwrap_or_else(|| Err(PomlError::Unknown("session update did not run".into())))?;
        debug!(event = event.name(), "Session transitioned");
        Ok(next)
    }

    pub fn continue_as_guest(&self) -> Result<SessionState> {
        info!("Continuing as guest");
        self.transition(SessionEvent::ContinueAsGuest)
    }

    pub async fn sign_in(&self, provider: Provider) -> Result<SessionState> {
        if matches!(self.current(), SessionState::Authenticated(_)) {
            return Err(PomlError::InvalidTransition("already signed in".into()));
        }

        let identity = self.auth.begin_sign_in(provider).await?;
        let state = self.transition(SessionEvent::SignIn { provider, identity })?;

        info!("Signed in via {}", provider);
        Ok(state)
    }

    pub async fn sign_out(&self) -> Result<SessionState> {
        if !matches!(self.current(), SessionState::Authenticated(_)) {
            return Err(PomlError::InvalidTransition("not signed in".into()));
        }

        self.auth.sign_out().await?;
        let state = self.transition(SessionEvent::SignOut)?;

        info!("Signed out");
        Ok(state)
    }

    /// Consume externally pushed auth changes until the sender side closes.
    pub async fn listen(&self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.transition(event) {
                warn!("Ignoring session event: {}", e);
            }
        }
        debug!("Session event channel closed");
    }
}
