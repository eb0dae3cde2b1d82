//! The arbitration-claim record: which client currently holds arbitration,
//! and for which address. Shared between the bus task and the network
//! task; stored as a weak identifier (a client id) rather than a direct
//! connection handle, per the redesign note breaking the cyclic reference
//! between clients and the claim.

use std::sync::Mutex;

/// A held arbitration claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// The client holding the claim.
    pub client_id: u64,
    /// The address it is arbitrating for.
    pub address: u8,
}

/// Single-holder arbitration claim, guarded by a short-held mutex (small,
/// `Copy` payload — never held across an `.await`).
#[derive(Debug, Default)]
pub struct ArbitrationClaim {
    inner: Mutex<Option<Claim>>,
}

impl ArbitrationClaim {
    /// Creates an unclaimed record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to acquire the claim for `client_id`/`address`.
    ///
    /// Returns `Ok(true)` if this call newly acquired (or updated) the
    /// claim, `Ok(false)` if `client_id` already held it for this exact
    /// address (an idempotent repeat — no further action needed), or
    /// `Err(())` if a different client already holds the claim.
    pub fn try_acquire(&self, client_id: u64, address: u8) -> Result<bool, ()> {
        let mut guard = self.inner.lock().expect("arbitration claim mutex poisoned");
        match *guard {
            Some(existing) if existing.client_id == client_id && existing.address == address => {
                Ok(false)
            }
            Some(existing) if existing.client_id == client_id => {
                *guard = Some(Claim { client_id, address });
                Ok(true)
            }
            Some(_) => Err(()),
            None => {
                *guard = Some(Claim { client_id, address });
                Ok(true)
            }
        }
    }

    /// Cancels the claim if `client_id` currently holds it. A no-op
    /// otherwise (including for a disconnected client that never held it).
    pub fn cancel_for(&self, client_id: u64) {
        let mut guard = self.inner.lock().expect("arbitration claim mutex poisoned");
        if matches!(*guard, Some(c) if c.client_id == client_id) {
            *guard = None;
        }
    }

    /// Unconditionally releases the claim (arbitration concluded: won,
    /// lost, or errored).
    pub fn release(&self) {
        *self.inner.lock().expect("arbitration claim mutex poisoned") = None;
    }

    /// The current holder, if any.
    #[must_use]
    pub fn current(&self) -> Option<Claim> {
        *self.inner.lock().expect("arbitration claim mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s6_at_most_one_claim() {
        let claim = ArbitrationClaim::new();
        assert_eq!(claim.try_acquire(1, 0x03), Ok(true));
        assert_eq!(claim.try_acquire(2, 0x07), Err(()));
        assert_eq!(claim.current(), Some(Claim { client_id: 1, address: 0x03 }));
    }

    #[test]
    fn idempotent_repeat_from_same_client() {
        let claim = ArbitrationClaim::new();
        assert_eq!(claim.try_acquire(1, 0x03), Ok(true));
        assert_eq!(claim.try_acquire(1, 0x03), Ok(false));
    }

    #[test]
    fn cancel_releases_only_for_holder() {
        let claim = ArbitrationClaim::new();
        claim.try_acquire(1, 0x03).unwrap();
        claim.cancel_for(2);
        assert!(claim.current().is_some());
        claim.cancel_for(1);
        assert!(claim.current().is_none());
    }

    #[test]
    fn release_after_conclusion_frees_for_others() {
        let claim = ArbitrationClaim::new();
        claim.try_acquire(1, 0x03).unwrap();
        claim.release();
        assert_eq!(claim.try_acquire(2, 0x07), Ok(true));
    }
}
