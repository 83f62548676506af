//! User presence and enrollment state consulted by keystores before every
//! use of a presence-gated key.
//!
//! The actual challenge (device unlock, credential confirmation, biometric
//! prompt) happens outside this crate. The host reports its outcome through
//! [`PresenceGate::confirm_presence`] and enrollment changes through
//! [`PresenceGate::enroll`].

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub type EnrollmentFingerprint = [u8; 32];

#[derive(Debug)]
struct GateState {
    confirmed_at: Option<Instant>,
    enrollment: EnrollmentFingerprint,
}

#[derive(Debug)]
pub struct PresenceGate {
    state: Mutex<GateState>,
}

impl PresenceGate {
    /// A gate with no presence proof yet and an empty enrollment.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                confirmed_at: None,
                enrollment: fingerprint(b""),
            }),
        }
    }

    /// A gate whose user proved presence just now, e.g. by unlocking the device.
    pub fn confirmed() -> Self {
        let gate = Self::new();
        gate.confirm_presence();
        gate
    }

    pub fn confirm_presence(&self) {
        self.lock().confirmed_at = Some(Instant::now());
        debug!("user presence confirmed");
    }

    pub fn revoke_presence(&self) {
        self.lock().confirmed_at = None;
        debug!("user presence revoked");
    }

    /// Whether the last presence proof is younger than `window`.
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.lock()
            .confirmed_at
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Record a change of enrolled authenticators (new fingerprint, new
    /// device credential). Keys bound to the previous enrollment become
    /// permanently unusable.
    pub fn enroll(&self, descriptor: &[u8]) {
        let next = fingerprint(descriptor);
        let mut state = self.lock();
        if state.enrollment != next {
            info!("authenticator enrollment changed");
            state.enrollment = next;
        }
    }

    pub fn enrollment(&self) -> EnrollmentFingerprint {
        self.lock().enrollment
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PresenceGate {
    fn default() -> Self {
        Self::new()
    }
}

fn fingerprint(descriptor: &[u8]) -> EnrollmentFingerprint {
    Sha256::digest(descriptor).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_only_inside_window() {
        let gate = PresenceGate::new();
        assert!(!gate.is_fresh(Duration::from_secs(600)));

        gate.confirm_presence();
        assert!(gate.is_fresh(Duration::from_secs(600)));
        assert!(!gate.is_fresh(Duration::ZERO));

        gate.revoke_presence();
        assert!(!gate.is_fresh(Duration::from_secs(600)));
    }

    #[test]
    fn enrollment_fingerprint_tracks_descriptor() {
        let gate = PresenceGate::confirmed();
        let before = gate.enrollment();
        gate.enroll(b"");
        assert_eq!(gate.enrollment(), before);
        gate.enroll(b"fingerprint #2");
        assert_ne!(gate.enrollment(), before);
    }
}
