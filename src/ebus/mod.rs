//! The eBUS protocol engine: an I/O-free pure core covering symbol
//! escaping/CRC, the dual-view sequence buffer, telegram assembly and
//! validation, bus-byte observation, arbitration, the top-level transaction
//! state machine, and datatype conversions.
//!
//! Every module here is deterministic and takes no dependency on sockets,
//! serial ports, or wall-clock time beyond what callers pass in explicitly —
//! the composition root in [`crate::bus`] is the only place that touches
//! real I/O.

pub mod arbitration;
pub mod datatypes;
pub mod observer;
pub mod sequence;
pub mod symbol;
pub mod telegram;
pub mod transaction;
