use thiserror::Error;

/// Failure taxonomy for the link layer. Reader and router loops absorb
/// their own errors; everything callers can invoke returns one of these.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no heartbeat from {vehicle} within {waited_secs}s")]
    ConnectionTimeout { vehicle: String, waited_secs: u64 },

    #[error("transport read failed: {0}")]
    TransportRead(String),

    #[error("{vehicle}: timed out waiting for {stage}{}", partial_note(.partial))]
    ProtocolTimeout {
        vehicle: String,
        stage: &'static str,
        /// True when the vehicle saw our mission count and may now hold a
        /// partial mission.
        partial: bool,
    },

    #[error("{vehicle} rejected {what}: {code}")]
    CommandRejected {
        vehicle: String,
        what: &'static str,
        code: String,
    },

    #[error("unknown mode {mode:?} for {vehicle}")]
    UnknownMode { vehicle: String, mode: String },

    #[error("unknown vehicle {0}")]
    UnknownVehicle(String),

    #[error("no connection for {0}")]
    NotConnected(String),

    #[error("mission transfer already running for {0}")]
    TransferBusy(String),

    #[error("cancelled")]
    Cancelled,

    #[error("bad endpoint: {0}")]
    Endpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// True when a failed upload may have left the vehicle holding a
    /// partial mission.
    pub fn left_partial_mission(&self) -> bool {
        matches!(self, LinkError::ProtocolTimeout { partial: true, .. })
    }
}

fn partial_note(partial: &bool) -> &'static str {
    if *partial {
        " (vehicle may hold a partial mission)"
    } else {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_uploads_say_so() {
        let e = LinkError::ProtocolTimeout {
            vehicle: "carrier1".into(),
            stage: "mission request",
            partial: true,
        };
        assert!(e.left_partial_mission());
        assert!(e.to_string().contains("partial mission"));

        let e = LinkError::ProtocolTimeout {
            vehicle: "carrier1".into(),
            stage: "mission count",
            partial: false,
        };
        assert!(!e.left_partial_mission());
        assert!(!e.to_string().contains("partial"));
    }
}
