use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};

/// Download state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    #[default]
    NotAvailable,
    Downloading,
    Finished,
}

/// Per-piece reactive state, indexed by position in the owning list.
///
/// Each piece owns its own `watch` channel, so waiting on one piece never contends with
/// writers of another. Writes are single-value swaps; a waiter that is dropped mid-wait
/// only drops its receiver.
pub struct PieceStates {
    states: Box<[watch::Sender<PieceState>]>,
    /// Bumped after every reset
    epoch: AtomicU64,
    closed: CancellationToken,
}

impl PieceStates {
    pub fn new(count: usize) -> Self {
        let states = (0..count)
            .map(|_| watch::Sender::new(PieceState::NotAvailable))
            .collect();
        Self {
            states,
            epoch: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, position: usize) -> PieceState {
        *self.sender(position).borrow()
    }

    /// Returns `true` if the state actually changed.
    pub fn set(&self, position: usize, state: PieceState) -> bool {
        self.sender(position).send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Swaps to `update` only if the current state is `expect`.
    pub fn compare_and_set(&self, position: usize, expect: PieceState, update: PieceState) -> bool {
        let mut swapped = false;
        self.sender(position).send_if_modified(|current| {
            if *current != expect {
                return false;
            }
            swapped = true;
            *current = update;
            expect != update
        });
        swapped
    }

    pub fn reset(&self) {
        for position in 0..self.states.len() {
            self.set(position, PieceState::NotAvailable);
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of resets so far. Anything read while this value was lower may be stale.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn finished_count(&self, positions: std::ops::Range<usize>) -> usize {
        positions
            .filter(|&position| self.get(position) == PieceState::Finished)
            .count()
    }

    /// Suspends until the piece at `position` is finished.
    ///
    /// Cancel-safe. Fails with [`StreamError::Closed`] once the store is closed.
    pub async fn wait_finished(&self, position: usize) -> Result<()> {
        let mut rx = self.sender(position).subscribe();
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StreamError::Closed),
            result = rx.wait_for(|state| *state == PieceState::Finished) => {
                result.map(|_| ()).map_err(|_| StreamError::Closed)
            }
        }
    }

    /// Wakes every waiter with [`StreamError::Closed`]. States stay readable.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    // Positions are validated by the owning `PieceList`
    fn sender(&self, position: usize) -> &watch::Sender<PieceState> {
        &self.states[position]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[test]
    fn set_is_idempotent() {
        let states = PieceStates::new(2);

        assert!(states.set(0, PieceState::Finished));
        assert!(!states.set(0, PieceState::Finished));
        assert_eq!(states.get(0), PieceState::Finished);
        assert_eq!(states.get(1), PieceState::NotAvailable);
    }

    #[test]
    fn compare_and_set_never_downgrades_finished() {
        let states = PieceStates::new(1);

        assert!(states.compare_and_set(0, PieceState::NotAvailable, PieceState::Downloading));
        assert_eq!(states.get(0), PieceState::Downloading);

        states.set(0, PieceState::Finished);
        assert!(!states.compare_and_set(0, PieceState::NotAvailable, PieceState::Downloading));
        assert_eq!(states.get(0), PieceState::Finished);
    }

    #[test]
    fn reset_and_count() {
        let states = PieceStates::new(3);
        states.set(0, PieceState::Finished);
        states.set(2, PieceState::Finished);
        assert_eq!(states.finished_count(0..3), 2);
        assert_eq!(states.finished_count(1..3), 1);

        assert_eq!(states.epoch(), 0);
        states.reset();
        assert_eq!(states.finished_count(0..3), 0);
        assert_eq!(states.epoch(), 1);
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_finished() {
        let states = PieceStates::new(1);
        states.set(0, PieceState::Finished);

        assert!(matches!(states.wait_finished(0).now_or_never(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn wait_suspends_until_finished() {
        let states = Arc::new(PieceStates::new(2));

        let waiter = {
            let states = Arc::clone(&states);
            tokio::spawn(async move { states.wait_finished(1).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        // Unrelated piece does not wake the waiter
        states.set(0, PieceState::Finished);
        states.set(1, PieceState::Downloading);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        states.set(1, PieceState::Finished);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let states = Arc::new(PieceStates::new(1));

        let waiter = {
            let states = Arc::clone(&states);
            tokio::spawn(async move { states.wait_finished(0).await })
        };
        tokio::task::yield_now().await;
        states.close();

        assert!(matches!(waiter.await.unwrap(), Err(StreamError::Closed)));
        assert!(states.is_closed());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_state_behind() {
        let states = PieceStates::new(1);

        let wait = states.wait_finished(0);
        assert!(wait.now_or_never().is_none());
        assert_eq!(states.sender(0).receiver_count(), 0);

        states.set(0, PieceState::Finished);
        assert!(states.wait_finished(0).await.is_ok());
    }
}
