//! Connectivity supervisor (spec §4.5): a two-state machine driven by
//! observed success/failure of forwarder calls, emitting `ConnectionUp` /
//! `ConnectionDown` signals only on transition.

use crate::types::ConnectivityState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Broadcast on a state transition. The drainer subscribes to schedule an
/// immediate drain on `ConnectionUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    ConnectionUp,
    ConnectionDown,
}

struct State {
    connectivity: ConnectivityState,
    last_successful_connect: Option<DateTime<Utc>>,
}

pub struct ConnectivitySupervisor {
    state: RwLock<State>,
    signal_tx: broadcast::Sender<ConnectivitySignal>,
}

impl ConnectivitySupervisor {
    pub fn new() -> Self {
        let (signal_tx, _) = broadcast::channel(16);
        Self {
            state: RwLock::new(State {
                connectivity: ConnectivityState::Disconnected,
                last_successful_connect: None,
            }),
            signal_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivitySignal> {
        self.signal_tx.subscribe()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.read().connectivity
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectivityState::Connected)
    }

    pub fn last_successful_connect(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_successful_connect
    }

    /// Observes a successful call. Transitions `Disconnected` -> `Connected`
    /// and emits `ConnectionUp`; a repeated success only updates the
    /// timestamp.
    pub async fn report_success(&self) {
        let transitioned = {
            let mut state = self.state.write();
            state.last_successful_connect = Some(Utc::now());
            let was_disconnected = state.connectivity == ConnectivityState::Disconnected;
            state.connectivity = ConnectivityState::Connected;
            was_disconnected
        };
        if transitioned {
            let _ = self.signal_tx.send(ConnectivitySignal::ConnectionUp);
        }
    }

    /// Observes a failed call. Transitions `Connected` -> `Disconnected`
    /// and emits `ConnectionDown`; a repeated failure is a no-op signal-wise.
    pub async fn report_failure(&self) {
        let transitioned = {
            let mut state = self.state.write();
            let was_connected = state.connectivity == ConnectivityState::Connected;
            state.connectivity = ConnectivityState::Disconnected;
            was_connected
        };
        if transitioned {
            let _ = self.signal_tx.send(ConnectivitySignal::ConnectionDown);
        }
    }
}

impl Default for ConnectivitySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected() {
        let supervisor = ConnectivitySupervisor::new();
        assert!(!supervisor.is_connected());
    }

    #[tokio::test]
    async fn success_while_disconnected_transitions_and_signals() {
        let supervisor = ConnectivitySupervisor::new();
        let mut rx = supervisor.subscribe();
        supervisor.report_success().await;
        assert!(supervisor.is_connected());
        assert_eq!(rx.recv().await.unwrap(), ConnectivitySignal::ConnectionUp);
    }

    #[tokio::test]
    async fn repeated_success_does_not_resignal() {
        let supervisor = ConnectivitySupervisor::new();
        let mut rx = supervisor.subscribe();
        supervisor.report_success().await;
        supervisor.report_success().await;
        assert_eq!(rx.recv().await.unwrap(), ConnectivitySignal::ConnectionUp);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failure_while_connected_transitions_and_signals() {
        let supervisor = ConnectivitySupervisor::new();
        supervisor.report_success().await;
        let mut rx = supervisor.subscribe();
        supervisor.report_failure().await;
        assert!(!supervisor.is_connected());
        assert_eq!(rx.recv().await.unwrap(), ConnectivitySignal::ConnectionDown);
    }
}
