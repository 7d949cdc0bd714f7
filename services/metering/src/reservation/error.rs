use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReservationError {
    #[error("reservation token not found")]
    Unknown,
    #[error("reservation token expired")]
    Expired,
    #[error("reservation token does not match the request")]
    Mismatch,
}
