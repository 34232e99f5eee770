//! Observable lifecycle state for connected entities.
//!
//! The config provider, every node connection and the client itself each
//! own a [`StateMachine`] and publish their transitions through it.

use tokio::sync::watch;
use tracing::debug;

/// Connection lifecycle of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A watchable lifecycle state holder.
#[derive(Debug)]
pub struct StateMachine {
    name: &'static str,
    tx: watch::Sender<LifecycleState>,
}

impl StateMachine {
    pub fn new(name: &'static str, initial: LifecycleState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { name, tx }
    }

    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    pub fn transition(&self, to: LifecycleState) {
        let from = *self.tx.borrow();
        if from != to {
            debug!("{}: {:?} -> {:?}", self.name, from, to);
            let _ = self.tx.send(to);
        }
    }

    /// A receiver observing every subsequent transition.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_observable() {
        let machine = StateMachine::new("test", LifecycleState::Disconnected);
        let rx = machine.subscribe();

        machine.transition(LifecycleState::Connecting);
        assert_eq!(machine.state(), LifecycleState::Connecting);
        assert_eq!(*rx.borrow(), LifecycleState::Connecting);

        machine.transition(LifecycleState::Connected);
        assert_eq!(*rx.borrow(), LifecycleState::Connected);
    }

    #[tokio::test]
    async fn test_subscriber_sees_changes() {
        let machine = StateMachine::new("test", LifecycleState::Disconnected);
        let mut rx = machine.subscribe();

        machine.transition(LifecycleState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), LifecycleState::Connecting);
    }
}
