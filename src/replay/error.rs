use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// A run is already active for the game; listen to its stream instead.
    AlreadyRunning { game_id: String },
    NotRunning { game_id: String },
    InvalidSpeed(f64),
    StoreWriteFailure(String),
    Source(String),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::AlreadyRunning { game_id } => {
                write!(f, "a run is already active for game {}", game_id)
            }
            ReplayError::NotRunning { game_id } => write!(f, "no active run for game {}", game_id),
            ReplayError::InvalidSpeed(speed) => {
                write!(f, "speed must be a positive number, got {}", speed)
            }
            ReplayError::StoreWriteFailure(msg) => write!(f, "history store failure: {}", msg),
            ReplayError::Source(msg) => write!(f, "event source failure: {}", msg),
        }
    }
}

impl std::error::Error for ReplayError {}
