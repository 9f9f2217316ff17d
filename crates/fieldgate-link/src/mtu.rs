//! MTU negotiation state machine.
//!
//! On client connect the transport requests a large MTU and accepts up to a
//! fixed maximum. A negotiation that does not complete within its window is
//! retried; after the retry budget the transport falls back to a safe MTU
//! and flags the session. Pure state machine: the transport drives it with
//! millisecond ticks and the client's response.

use serde::{Deserialize, Serialize};

/// MTU requested from the client.
pub const MTU_REQUEST: u16 = 517;

/// Largest MTU the server accepts.
pub const MTU_ACCEPT_MAX: u16 = 512;

/// Safe fallback when negotiation fails.
pub const MTU_FALLBACK: u16 = 100;

/// Negotiation window per attempt.
pub const MTU_TIMEOUT_MS: u64 = 5_000;

/// Retries after the first attempt.
pub const MTU_MAX_RETRIES: u32 = 2;

/// Negotiation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MtuState {
    Idle,
    Initiating,
    InProgress,
    Completed,
    Timeout,
    Failed,
}

/// Action the transport must take after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtuAction {
    /// Re-send the MTU request.
    Retry,
    /// Give up and use the fallback MTU.
    UseFallback,
}

/// The negotiation state machine.
#[derive(Debug)]
pub struct MtuNegotiator {
    state: MtuState,
    attempts: u32,
    started_ms: u64,
    mtu: u16,
    uses_fallback: bool,
}

impl MtuNegotiator {
    pub fn new() -> Self {
        Self {
            state: MtuState::Idle,
            attempts: 0,
            started_ms: 0,
            mtu: MTU_FALLBACK,
            uses_fallback: false,
        }
    }

    pub fn state(&self) -> MtuState {
        self.state
    }

    /// Negotiated (or fallback) MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn uses_fallback(&self) -> bool {
        self.uses_fallback
    }

    /// Client connected: begin the first attempt. Returns the MTU to
    /// request.
    pub fn on_connect(&mut self, now_ms: u64) -> u16 {
        self.state = MtuState::Initiating;
        self.attempts = 1;
        self.started_ms = now_ms;
        self.uses_fallback = false;
        self.state = MtuState::InProgress;
        MTU_REQUEST
    }

    /// Client answered with its MTU. Returns the negotiated value.
    pub fn on_response(&mut self, client_mtu: u16) -> u16 {
        self.mtu = client_mtu.min(MTU_ACCEPT_MAX);
        self.state = MtuState::Completed;
        self.uses_fallback = false;
        tracing::info!(mtu = self.mtu, "MTU negotiated");
        self.mtu
    }

    /// Periodic tick. Returns an action when the current attempt expired.
    pub fn on_tick(&mut self, now_ms: u64) -> Option<MtuAction> {
        if self.state != MtuState::InProgress {
            return None;
        }
        if now_ms.saturating_sub(self.started_ms) < MTU_TIMEOUT_MS {
            return None;
        }
        if self.attempts <= MTU_MAX_RETRIES {
            self.attempts += 1;
            self.started_ms = now_ms;
            self.state = MtuState::Timeout;
            // Retry transitions straight back into an in-progress attempt.
            self.state = MtuState::InProgress;
            tracing::debug!(attempt = self.attempts, "MTU negotiation retry");
            Some(MtuAction::Retry)
        } else {
            self.state = MtuState::Failed;
            self.mtu = MTU_FALLBACK;
            self.uses_fallback = true;
            tracing::warn!(fallback = MTU_FALLBACK, "MTU negotiation failed; using fallback");
            Some(MtuAction::UseFallback)
        }
    }

    /// Session closed; forget everything.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for MtuNegotiator {
    fn default() -> Self {
        Self::new()
    }
}
