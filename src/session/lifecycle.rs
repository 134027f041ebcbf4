//! Session lifecycle stage and the finalize-once guard.
//!
//! ```text
//! OPEN ──(first trigger wins)──▶ FINALIZING ──(finalize done)──▶ CLOSED
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStage {
    /// Chunks accepted
    Open = 0,
    /// Exactly one teardown is running
    Finalizing = 1,
    /// Terminal
    Closed = 2,
}

impl SessionStage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStage::Open,
            1 => SessionStage::Finalizing,
            _ => SessionStage::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStage::Open => "open",
            SessionStage::Finalizing => "finalizing",
            SessionStage::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic stage holder. Transitions only move forward.
#[derive(Debug)]
pub struct Lifecycle {
    stage: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            stage: AtomicU8::new(SessionStage::Open as u8),
        }
    }

    pub fn stage(&self) -> SessionStage {
        SessionStage::from_u8(self.stage.load(Ordering::SeqCst))
    }

    /// OPEN → FINALIZING. Returns `true` for exactly one caller.
    pub fn begin_finalizing(&self) -> bool {
        self.stage
            .compare_exchange(
                SessionStage::Open as u8,
                SessionStage::Finalizing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// FINALIZING → CLOSED. Returns `false` if the session was not finalizing.
    pub fn mark_closed(&self) -> bool {
        self.stage
            .compare_exchange(
                SessionStage::Finalizing as u8,
                SessionStage::Closed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
