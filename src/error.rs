use thiserror::Error;

/// Why a pose query could not be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotReadyReason {
    /// Engine deactivated by its owner.
    Inactive,
    /// No visual-inertial correction received since construction or `clear()`.
    Uninitialized,
    /// Re-initialising; waits for the next visual-inertial sample.
    Initializing,
    /// Corrections stale beyond the hard limit; waiting to re-initialise.
    TrackingLost,
    /// Passthrough mode with no visual-inertial sample to pass through.
    NoVisualSample,
    /// Query timestamp is NaN or infinite.
    InvalidTimestamp,
}

impl std::fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Inactive => "engine inactive",
            Self::Uninitialized => "no correction received",
            Self::Initializing => "re-initialising",
            Self::TrackingLost => "tracking lost",
            Self::NoVisualSample => "no visual-inertial sample",
            Self::InvalidTimestamp => "query timestamp not finite",
        };
        f.write_str(text)
    }
}

/// Low-latency tracking error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error("Pose not ready: {0}")]
    NotReady(NotReadyReason),

    #[error("Malformed sample: {0}")]
    MalformedSample(String),

    #[error("Stale input on {stream}: gap {gap_secs:.3}s")]
    StaleInput { stream: &'static str, gap_secs: f64 },

    #[error("Outlier measurement: position residual {position_m:.3}m, orientation residual {orientation_rad:.3}rad")]
    OutlierMeasurement {
        position_m: f64,
        orientation_rad: f64,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TrackingError>;
