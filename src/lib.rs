// Library modules
pub mod arbitration_claim;
pub mod bus;
pub mod config;
pub mod constants;
pub mod ebus;
pub mod env;
pub mod socket;

// Re-export commonly used types
pub use arbitration_claim::{ArbitrationClaim, Claim};
pub use bus::{Bus, BusCommand, SerialWriter, StatusSnapshot};
pub use config::Config;
pub use env::Environment;
