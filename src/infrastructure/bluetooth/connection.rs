//! BLE Connection State Machine
//!
//! Tracks the lifecycle of one device and rejects every transition outside
//! the table below. Each accepted change is published on a watch channel
//! (for the queue handle) and as a [`DeviceEvent::StateChanged`].
//!
//! ```text
//! NOT_CONNECTED ──connect──▶ CONNECTING ──link up──▶ CONNECTED
//!       ▲                        ▲                       │ init begins
//!       │                        │ reconnect             ▼
//!       │               WAITING_FOR_RECONNECT      INITIALIZING
//!       │                        ▲                       │ init done
//!       └──── link lost ─────────┴──── link lost ─── INITIALIZED
//! ```

use crate::domain::error::IllegalTransition;
use crate::domain::models::{ConnectionState, DeviceEvent, DeviceId, StateChange};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Whether `from -> to` appears in the lifecycle table.
pub fn is_legal_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    match (from, to) {
        (NotConnected, Connecting) => true,
        (Connecting, Connected) => true,
        (Connected, Initializing) => true,
        (Initializing, Initialized) => true,
        (WaitingForReconnect, Connecting) => true,
        // link lost / fatal error
        (_, NotConnected) => true,
        (NotConnected | WaitingForReconnect, WaitingForReconnect) => false,
        (_, WaitingForReconnect) => true,
        _ => false,
    }
}

pub struct ConnectionStateMachine {
    device: DeviceId,
    state: ConnectionState,
    auto_reconnect: bool,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl ConnectionStateMachine {
    pub fn new(
        device: DeviceId,
        auto_reconnect: bool,
        state_tx: watch::Sender<ConnectionState>,
        event_sender: Option<mpsc::UnboundedSender<DeviceEvent>>,
    ) -> Self {
        state_tx.send_replace(ConnectionState::NotConnected);
        Self {
            device,
            state: ConnectionState::NotConnected,
            auto_reconnect,
            state_tx,
            event_sender,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn set_auto_reconnect(&mut self, enable: bool) {
        self.auto_reconnect = enable;
    }

    /// Move to `to`, or reject the jump. Returns the previous state.
    pub fn transition_to(
        &mut self,
        to: ConnectionState,
    ) -> Result<ConnectionState, IllegalTransition> {
        let from = self.state;
        if !is_legal_transition(from, to) {
            return Err(IllegalTransition { from, to });
        }
        if from == to {
            return Ok(from);
        }

        self.state = to;
        info!("{}: {} -> {}", self.device, from, to);
        self.state_tx.send_replace(to);
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(DeviceEvent::StateChanged(StateChange {
                device: self.device.clone(),
                previous: from,
                current: to,
            }));
        }
        Ok(from)
    }

    /// Apply a lost link. Reconnect is only worth attempting for a device
    /// that had been fully initialized.
    pub fn link_lost(&mut self, allow_reconnect: bool) -> ConnectionState {
        let target = if allow_reconnect && self.auto_reconnect && self.state.is_initialized() {
            ConnectionState::WaitingForReconnect
        } else {
            ConnectionState::NotConnected
        };
        debug!("{}: link lost in state {}", self.device, self.state);
        // Both targets are reachable from every connected state.
        match self.transition_to(target) {
            Ok(_) => target,
            Err(_) => {
                let _ = self.transition_to(ConnectionState::NotConnected);
                ConnectionState::NotConnected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};
    use ConnectionState::*;

    const ALL: [ConnectionState; 6] = [
        NotConnected,
        Connecting,
        Connected,
        Initializing,
        Initialized,
        WaitingForReconnect,
    ];

    fn machine() -> (
        ConnectionStateMachine,
        watch::Receiver<ConnectionState>,
        mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        let (state_tx, state_rx) = watch::channel(NotConnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let machine =
            ConnectionStateMachine::new(DeviceId::new("AA:BB"), true, state_tx, Some(event_tx));
        (machine, state_rx, event_rx)
    }

    #[test]
    fn test_happy_path_emits_every_transition() {
        let (mut m, state_rx, mut events) = machine();
        for to in [Connecting, Connected, Initializing, Initialized] {
            m.transition_to(to).unwrap();
        }
        assert_eq!(*state_rx.borrow(), Initialized);

        let mut seen = Vec::new();
        while let Ok(DeviceEvent::StateChanged(change)) = events.try_recv() {
            seen.push((change.previous, change.current));
        }
        assert_eq!(
            seen,
            vec![
                (NotConnected, Connecting),
                (Connecting, Connected),
                (Connected, Initializing),
                (Initializing, Initialized),
            ]
        );
    }

    #[test]
    fn test_rejects_jumps() {
        let (mut m, _rx, mut events) = machine();
        let err = m.transition_to(Initialized).unwrap_err();
        assert_eq!(
            err,
            IllegalTransition {
                from: NotConnected,
                to: Initialized
            }
        );
        assert_eq!(m.state(), NotConnected);
        assert!(events.try_recv().is_err());

        m.transition_to(Connecting).unwrap();
        assert!(m.transition_to(Initializing).is_err());
        assert!(m.transition_to(Connecting).is_err());
    }

    #[test]
    fn test_initialized_unreachable_without_intermediate_states() {
        // Breadth-first search over the legal graph, forbidding each
        // intermediate state in turn.
        for forbidden in [Connecting, Connected, Initializing] {
            let mut seen = HashSet::from([NotConnected]);
            let mut frontier = VecDeque::from([NotConnected]);
            while let Some(from) = frontier.pop_front() {
                for to in ALL {
                    if to != forbidden && is_legal_transition(from, to) && seen.insert(to) {
                        frontier.push_back(to);
                    }
                }
            }
            assert!(
                !seen.contains(&Initialized),
                "INITIALIZED reachable while skipping {forbidden}"
            );
        }
    }

    #[test]
    fn test_link_lost_respects_reconnect_policy() {
        let (mut m, _rx, _events) = machine();
        for to in [Connecting, Connected, Initializing, Initialized] {
            m.transition_to(to).unwrap();
        }
        assert_eq!(m.link_lost(true), WaitingForReconnect);
        m.transition_to(Connecting).unwrap();
        m.transition_to(Connected).unwrap();

        // Not initialized yet: no reconnect.
        assert_eq!(m.link_lost(true), NotConnected);

        let (mut m, _rx, _events) = machine();
        m.set_auto_reconnect(false);
        for to in [Connecting, Connected, Initializing, Initialized] {
            m.transition_to(to).unwrap();
        }
        assert_eq!(m.link_lost(true), NotConnected);
    }

    #[test]
    fn test_not_connected_is_idempotent() {
        let (mut m, _rx, mut events) = machine();
        assert_eq!(m.transition_to(NotConnected).unwrap(), NotConnected);
        assert!(events.try_recv().is_err());
    }
}
