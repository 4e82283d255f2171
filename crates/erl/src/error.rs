use derive_more::Display;

/// Error type shared by the rate limiter and congestion manager components.
#[derive(Debug, Display)]
pub enum ErlError {
    /// No capacity is available for the client, from its reservation or the
    /// shared pool.
    #[display("no capacity available")]
    NoCapacity,
    /// The congestion manager prevented the client from borrowing shared
    /// capacity.
    #[display("congestion manager prevented client from consuming capacity")]
    CongestionDrop,
    /// A reservation was opened twice for the same client.
    #[display("client already has a reservation")]
    AlreadyReserved,
    /// A guard could not return its capacity to the originating queue.
    /// Token accounting is broken if this is ever observed.
    #[display("could not return capacity to its originating queue")]
    ReleaseOverflow,
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl core::error::Error for ErlError {}

impl ErlError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}
