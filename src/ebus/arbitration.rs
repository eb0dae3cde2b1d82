//! Two-round priority arbitration state machine.
//!
//! After a `SYN`, any master wanting to transmit writes its address. Ties on
//! the high nibble go to a second round; everything else resolves in round
//! one. The engine only interprets bytes; writing them onto the bus and
//! observing the bus's idle/timing state is the caller's job (via
//! [`super::observer::BusObserver`] and a write capability).

use crate::constants::ARBITRATION_MIN_GAP;
use std::time::Duration;

/// Arbitration outcome for the current byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationState {
    /// No claim pending, or waiting for a fresh SYN to start.
    None,
    /// Round 1 resolved as a priority tie; round 2 is pending.
    Arbitrating,
    /// We won the bus.
    Won,
    /// We lost the bus to a higher- or equal-priority master.
    Lost,
    /// A framing anomaly occurred (unexpected byte where a master address
    /// was expected, or an unexpected SYN mid-round).
    Error,
}

/// Instrumentation counters mirroring the original firmware's status
/// fields (`_nbrArbitrations`, `_nbrRestarts1`, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct ArbitrationCounters {
    /// Total arbitration attempts started.
    pub arbitrations: u64,
    /// Restarts because the minimum SYN gap had not yet elapsed.
    pub restarts_round1: u64,
    /// Restarts in round 2 (re-transmission after a tie).
    pub restarts_round2: u64,
    /// Outright wins in round 1.
    pub won_round1: u64,
    /// Wins in round 2 after a tie.
    pub won_round2: u64,
    /// Losses in round 1.
    pub lost_round1: u64,
    /// Losses in round 2.
    pub lost_round2: u64,
    /// Claims that arrived too late to start on the current SYN.
    pub late: u64,
    /// Framing errors observed during arbitration.
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    Idle,
    AwaitingRound1,
    AwaitingRound2,
}

/// Drives one arbitration attempt for a desired own address.
#[derive(Debug)]
pub struct Arbitration {
    round: Round,
    pending_address: Option<u8>,
    counters: ArbitrationCounters,
}

impl Default for Arbitration {
    fn default() -> Self {
        Self::new()
    }
}

impl Arbitration {
    /// Creates an arbitration engine with no pending claim.
    #[must_use]
    pub fn new() -> Self {
        Self {
            round: Round::Idle,
            pending_address: None,
            counters: ArbitrationCounters::default(),
        }
    }

    /// Registers a pending claim for `address`. Takes effect on the next
    /// `SYN` that satisfies the minimum gap.
    pub fn request(&mut self, address: u8) {
        self.pending_address = Some(address);
    }

    /// Cancels any pending or in-progress claim, returning to `None`.
    pub fn cancel(&mut self) {
        self.pending_address = None;
        self.round = Round::Idle;
    }

    /// Current instrumentation snapshot.
    #[must_use]
    pub fn counters(&self) -> ArbitrationCounters {
        self.counters
    }

    /// Called when a fresh `SYN` is observed. `since_last_syn` is the gap
    /// since the previous SYN; `write` attempts to transmit our address and
    /// returns whether the write was accepted. Returns the resulting state;
    /// `None` means no claim is pending or the write was not accepted (retry
    /// next cycle).
    pub fn on_syn(
        &mut self,
        since_last_syn: Duration,
        write: &mut dyn FnMut(u8) -> bool,
    ) -> ArbitrationState {
        let Some(address) = self.pending_address else {
            return ArbitrationState::None;
        };

        match self.round {
            Round::Idle => {
                if since_last_syn < ARBITRATION_MIN_GAP {
                    self.counters.late += 1;
                    return ArbitrationState::None;
                }
                if write(address) {
                    self.counters.arbitrations += 1;
                    self.round = Round::AwaitingRound1;
                } else {
                    self.counters.restarts_round1 += 1;
                }
                ArbitrationState::None
            }
            Round::AwaitingRound2 => {
                if write(address) {
                    ArbitrationState::Arbitrating
                } else {
                    self.counters.restarts_round2 += 1;
                    ArbitrationState::None
                }
            }
            Round::AwaitingRound1 => {
                // A second SYN before the round byte arrived is a framing
                // anomaly.
                self.counters.errors += 1;
                self.cancel();
                ArbitrationState::Error
            }
        }
    }

    /// Called with the byte observed immediately after the address write
    /// (the winning address of this round).
    pub fn on_round_byte(&mut self, byte: u8) -> ArbitrationState {
        let Some(address) = self.pending_address else {
            return ArbitrationState::None;
        };

        match self.round {
            Round::AwaitingRound1 => {
                if byte == address {
                    self.counters.won_round1 += 1;
                    self.cancel();
                    ArbitrationState::Won
                } else if (byte >> 4) == (address >> 4) {
                    self.round = Round::AwaitingRound2;
                    ArbitrationState::Arbitrating
                } else {
                    self.counters.lost_round1 += 1;
                    self.cancel();
                    ArbitrationState::Lost
                }
            }
            Round::AwaitingRound2 => {
                if byte == address {
                    self.counters.won_round2 += 1;
                    self.cancel();
                    ArbitrationState::Won
                } else {
                    self.counters.lost_round2 += 1;
                    self.cancel();
                    ArbitrationState::Lost
                }
            }
            Round::Idle => ArbitrationState::None,
        }
    }

    /// `true` if an arbitration attempt is currently in progress (a round
    /// byte is expected next).
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        !matches!(self.round, Round::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(_b: u8) -> bool {
        true
    }

    #[test]
    fn wins_outright_on_matching_round1_byte() {
        let mut arb = Arbitration::new();
        arb.request(0x03);
        let mut write = accept;
        let state = arb.on_syn(ARBITRATION_MIN_GAP, &mut write);
        assert_eq!(state, ArbitrationState::None);
        assert!(arb.is_in_progress());

        let state = arb.on_round_byte(0x03);
        assert_eq!(state, ArbitrationState::Won);
        assert!(!arb.is_in_progress());
        assert_eq!(arb.counters().won_round1, 1);
    }

    // S5 names own address 0x03 and round byte 0x01, expecting `lost`. Under
    // the textual round-1 rule (tie iff the round byte's high nibble equals
    // ours) those two addresses share high nibble 0x0 and actually tie into
    // round 2 rather than losing outright; see DESIGN.md for this
    // discrepancy. This test exercises the same "outranked by a different
    // priority class" shape with a byte whose high nibble genuinely differs.
    #[test]
    fn arbitration_lost_on_differing_priority_class() {
        let mut arb = Arbitration::new();
        arb.request(0x03);
        let mut write = accept;
        arb.on_syn(ARBITRATION_MIN_GAP, &mut write);
        let state = arb.on_round_byte(0x10);
        assert_eq!(state, ArbitrationState::Lost);
        assert_eq!(arb.counters().lost_round1, 1);
    }

    #[test]
    fn priority_tie_enters_round2_then_resolves() {
        let mut arb = Arbitration::new();
        arb.request(0x13); // high nibble 0x1
        let mut write = accept;
        arb.on_syn(ARBITRATION_MIN_GAP, &mut write);
        let state = arb.on_round_byte(0x10); // same high nibble, different low
        assert_eq!(state, ArbitrationState::Arbitrating);

        let state = arb.on_syn(ARBITRATION_MIN_GAP, &mut write);
        assert_eq!(state, ArbitrationState::Arbitrating);
        let state = arb.on_round_byte(0x13);
        assert_eq!(state, ArbitrationState::Won);
        assert_eq!(arb.counters().won_round2, 1);
    }

    #[test]
    fn late_start_is_retried_not_errored() {
        let mut arb = Arbitration::new();
        arb.request(0x03);
        let mut write = accept;
        let state = arb.on_syn(Duration::from_micros(10), &mut write);
        assert_eq!(state, ArbitrationState::None);
        assert_eq!(arb.counters().late, 1);
        assert!(!arb.is_in_progress());
    }

    #[test]
    fn no_claim_pending_stays_none() {
        let mut arb = Arbitration::new();
        let mut write = accept;
        assert_eq!(arb.on_syn(ARBITRATION_MIN_GAP, &mut write), ArbitrationState::None);
    }
}
