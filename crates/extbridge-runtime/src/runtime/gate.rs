//! Per-extension gate coordinating calls against swaps.
//!
//! Callers `enter` before touching the live instance and leave when their
//! [`GatePass`] drops. A swap closes the gate, waits for the in-flight count
//! to reach zero, replaces the instance, and reopens. Callers that arrive
//! while the gate is closed park on a watch channel until it reopens; they
//! are never rejected for arriving mid-swap.

use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    /// Calls proceed immediately.
    Open,
    /// A swap or shutdown was requested; waiting for in-flight calls.
    Closing,
    /// Drained; the instance is being replaced.
    Swapping,
    /// No instance. Calls fail fast; a later swap reopens the gate.
    Unloaded,
    /// Permanently closed.
    Terminated,
}

#[derive(Debug, Clone, Copy)]
struct GateState {
    phase: GatePhase,
    in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct Gate {
    state: watch::Sender<GateState>,
}

/// Proof of entry. Dropping it exits the gate.
#[derive(Debug)]
#[must_use = "dropping the pass exits the gate immediately"]
pub struct GatePass<'a> {
    gate: &'a Gate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

impl Gate {
    pub fn new(phase: GatePhase) -> Self {
        let (state, _) = watch::channel(GateState {
            phase,
            in_flight: 0,
        });
        Self { state }
    }

    pub fn phase(&self) -> GatePhase {
        self.state.borrow().phase
    }

    pub fn in_flight(&self) -> usize {
        self.state.borrow().in_flight
    }

    /// Wait until the gate is open and register a call.
    ///
    /// Fails with [`GateError::ClosedTimeout`] if `cancel` fires while
    /// waiting, and fails fast when the gate is unloaded or terminated.
    pub async fn enter(&self, cancel: &CancellationToken) -> Result<GatePass<'_>, GateError> {
        let mut rx = self.state.subscribe();
        loop {
            let mut outcome = None;
            self.state.send_if_modified(|s| match s.phase {
                GatePhase::Open => {
                    s.in_flight += 1;
                    outcome = Some(Ok(()));
                    false
                }
                GatePhase::Unloaded => {
                    outcome = Some(Err(GateError::Unloaded));
                    false
                }
                GatePhase::Terminated => {
                    outcome = Some(Err(GateError::Terminated));
                    false
                }
                GatePhase::Closing | GatePhase::Swapping => false,
            });

            match outcome {
                Some(Ok(())) => return Ok(GatePass { gate: self }),
                Some(Err(e)) => return Err(e),
                None => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(GateError::ClosedTimeout),
                reopened = rx.wait_for(|s| !matches!(s.phase, GatePhase::Closing | GatePhase::Swapping)) => {
                    if reopened.is_err() {
                        return Err(GateError::Terminated);
                    }
                }
            }
        }
    }

    fn exit(&self) {
        self.state.send_if_modified(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            // Only a drain cares about the count changing.
            s.phase != GatePhase::Open
        });
    }

    /// Stop admitting calls. Returns the phase to restore if the swap is abandoned.
    pub fn close(&self) -> Result<GatePhase, GateError> {
        let mut previous = GatePhase::Open;
        let mut result = Ok(());
        self.state.send_if_modified(|s| {
            previous = s.phase;
            match s.phase {
                GatePhase::Terminated => {
                    result = Err(GateError::Terminated);
                    false
                }
                GatePhase::Closing => false,
                _ => {
                    s.phase = GatePhase::Closing;
                    true
                }
            }
        });
        result.map(|_| previous)
    }

    pub fn set_phase(&self, phase: GatePhase) {
        self.state.send_if_modified(|s| {
            if s.phase == GatePhase::Terminated || s.phase == phase {
                return false;
            }
            s.phase = phase;
            true
        });
    }

    /// Wait for every in-flight call to exit.
    ///
    /// `timeout` bounds the wait; `None` waits until drained or cancelled.
    pub async fn drain(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> DrainOutcome {
        let mut rx = self.state.subscribe();
        let drained = async move {
            // An error means the sender is gone, so nothing can still be in flight.
            let _ = rx.wait_for(|s| s.in_flight == 0).await.map(|_| ());
        };
        let bounded = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, drained).await.is_ok(),
                None => {
                    drained.await;
                    true
                }
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => DrainOutcome::Cancelled,
            done = bounded => if done { DrainOutcome::Drained } else { DrainOutcome::TimedOut },
        }
    }
}
