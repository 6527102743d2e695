// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types for tracking the state of a session client.

use std::fmt;
use std::sync::RwLock;

use tokio::sync::Notify;

/// The part of the lifecycle a session client is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection is established and none is being attempted.
    Disconnected,
    /// An initial connection attempt is in progress.
    Connecting,
    /// A connection is established.
    Connected,
    /// The connection dropped and re-establishment is in progress.
    Reconnecting,
    /// The client has been closed and accepts no further operations.
    Disposed,
}

/// Information used to track the state of a session client.
pub(crate) struct SessionState {
    /// State information locked for concurrency protection
    state: RwLock<InnerSessionState>,
    /// Notifier indicating a state change
    changed: Notify,
}

struct InnerSessionState {
    status: SessionStatus,
    /// Incremented on every transition into [`SessionStatus::Connected`].
    /// Used by the sender task to distinguish connections from one another.
    connection_epoch: u64,
    /// Set when the user has requested disconnection; suppresses retries.
    desire_disconnect: bool,
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        self.state.read().unwrap().status
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.status(), SessionStatus::Disposed)
    }

    pub fn connection_epoch(&self) -> u64 {
        self.state.read().unwrap().connection_epoch
    }

    pub fn desire_disconnect(&self) -> bool {
        self.state.read().unwrap().desire_disconnect
    }

    pub fn set_desire_disconnect(&self) {
        let mut state = self.state.write().unwrap();
        state.desire_disconnect = true;
        self.changed.notify_waiters();
        log::info!("User initiated disconnect");
        log::debug!("{state:?}");
    }

    pub fn clear_desire_disconnect(&self) {
        let mut state = self.state.write().unwrap();
        state.desire_disconnect = false;
        self.changed.notify_waiters();
    }

    /// Wait until the session is connected, returning the connection epoch.
    /// Returns [`None`] if the client is disposed.
    pub async fn wait_connected(&self) -> Option<u64> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.read().unwrap();
                match state.status {
                    SessionStatus::Connected => return Some(state.connection_epoch),
                    SessionStatus::Disposed => return None,
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Wait until the connection epoch advances beyond `epoch` (a new
    /// connection was established). Returns false if the client is disposed.
    pub async fn wait_epoch_beyond(&self, epoch: u64) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.read().unwrap();
                if state.status == SessionStatus::Disposed {
                    return false;
                }
                if state.connection_epoch > epoch {
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Transition into `Connecting`. Fails if the client is not idle.
    pub fn transition_connecting(&self) -> Result<(), SessionStatus> {
        let mut state = self.state.write().unwrap();
        match state.status {
            SessionStatus::Disconnected => {
                state.status = SessionStatus::Connecting;
                self.changed.notify_waiters();
                log::debug!("{state:?}");
                Ok(())
            }
            other => Err(other),
        }
    }

    pub fn transition_connected(&self) {
        let mut state = self.state.write().unwrap();
        if state.status == SessionStatus::Disposed {
            return;
        }
        state.status = SessionStatus::Connected;
        state.connection_epoch += 1;
        self.changed.notify_waiters();
        log::info!("Connected (epoch {})", state.connection_epoch);
        log::debug!("{state:?}");
    }

    pub fn transition_reconnecting(&self) {
        let mut state = self.state.write().unwrap();
        if state.status == SessionStatus::Disposed {
            return;
        }
        state.status = SessionStatus::Reconnecting;
        self.changed.notify_waiters();
        log::info!("Connection lost, reconnecting");
        log::debug!("{state:?}");
    }

    pub fn transition_disconnected(&self) {
        let mut state = self.state.write().unwrap();
        if state.status == SessionStatus::Disposed {
            return;
        }
        state.status = SessionStatus::Disconnected;
        self.changed.notify_waiters();
        log::info!("Disconnected");
        log::debug!("{state:?}");
    }

    pub fn transition_disposed(&self) {
        let mut state = self.state.write().unwrap();
        state.status = SessionStatus::Disposed;
        self.changed.notify_waiters();
        log::info!("Session client disposed");
        log::debug!("{state:?}");
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            state: RwLock::new(InnerSessionState {
                status: SessionStatus::Disconnected,
                connection_epoch: 0,
                desire_disconnect: false,
            }),
            changed: Notify::new(),
        }
    }
}

// NOTE: Do NOT log SessionState from inside methods holding the write lock,
// or you will deadlock. Log the InnerSessionState directly.
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap();
        fmt::Debug::fmt(&state, f)
    }
}

impl fmt::Debug for InnerSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("status", &self.status)
            .field("connection_epoch", &self.connection_epoch)
            .field("desire_disconnect", &self.desire_disconnect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_only_from_disconnected() {
        let state = SessionState::default();
        assert!(state.transition_connecting().is_ok());
        assert_eq!(state.status(), SessionStatus::Connecting);
        assert!(state.transition_connecting().is_err());

        state.transition_connected();
        assert!(state.transition_connecting().is_err());

        state.transition_disconnected();
        assert!(state.transition_connecting().is_ok());
    }

    #[test]
    fn epoch_advances_per_connection() {
        let state = SessionState::default();
        assert_eq!(state.connection_epoch(), 0);
        state.transition_connected();
        assert_eq!(state.connection_epoch(), 1);
        state.transition_reconnecting();
        state.transition_connected();
        assert_eq!(state.connection_epoch(), 2);
    }

    #[test]
    fn disposed_is_terminal() {
        let state = SessionState::default();
        state.transition_disposed();
        state.transition_connected();
        assert_eq!(state.status(), SessionStatus::Disposed);
        state.transition_disconnected();
        assert_eq!(state.status(), SessionStatus::Disposed);
    }

    #[tokio::test]
    async fn wait_connected_returns_epoch() {
        let state = std::sync::Arc::new(SessionState::default());
        let waiter = tokio::task::spawn({
            let state = state.clone();
            async move { state.wait_connected().await }
        });
        tokio::task::yield_now().await;
        state.transition_connected();
        assert_eq!(waiter.await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn wait_connected_none_on_dispose() {
        let state = std::sync::Arc::new(SessionState::default());
        let waiter = tokio::task::spawn({
            let state = state.clone();
            async move { state.wait_connected().await }
        });
        tokio::task::yield_now().await;
        state.transition_disposed();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
