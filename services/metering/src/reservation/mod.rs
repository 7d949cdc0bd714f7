pub mod error;
pub mod registry;

pub use error::ReservationError;
pub use registry::{Reservation, ReservationRegistry};

pub const DEFAULT_RESERVATION_TTL_SECS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
