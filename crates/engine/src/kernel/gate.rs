//! The pause gate.

use tokio::sync::watch;

/// A gate the kernel holds at every step boundary.
///
/// Pausing closes the gate; executions await [`PauseGate::wait_open`]
/// before dispatching the next step. Cheap to clone; all clones share
/// state.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// An open gate.
    #[must_use]
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    /// Close the gate.
    pub fn pause(&self) {
        let _ = self.paused.send(true);
    }

    /// Open the gate, releasing all waiters.
    pub fn resume(&self) {
        let _ = self.paused.send(false);
    }

    /// Whether the gate is currently closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait_open(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn open_gate_does_not_block() {
        let gate = PauseGate::new();
        tokio::time::timeout(Duration::from_millis(50), gate.wait_open())
            .await
            .expect("open gate must not block");
    }

    #[tokio::test(start_paused = true)]
    async fn paused_gate_blocks_until_resume() {
        let gate = PauseGate::new();
        gate.pause();
        assert!(gate.is_paused());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_open().await })
        };
        // Give the waiter a chance to park.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        waiter.await.unwrap();
    }
}
