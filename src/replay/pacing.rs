//! Inter-play delay for paced runs.

use super::ReplayError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Gap used when either play lacks a declared timestamp.
    pub default_gap: Duration,
    /// Upper bound on one gap before speed is applied (halftime, reviews).
    pub max_gap: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            default_gap: Duration::from_millis(1000),
            max_gap: Duration::from_millis(30_000),
        }
    }
}

/// Slowest accepted speed multiplier.
pub const MIN_SPEED: f64 = 0.01;

/// Longest single wait between two plays, whatever the speed.
pub const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Speed must be at least [`MIN_SPEED`]. `f64::INFINITY` means no delay at all.
pub fn validate_speed(speed: f64) -> Result<f64, ReplayError> {
    if speed >= MIN_SPEED {
        Ok(speed)
    } else {
        Err(ReplayError::InvalidSpeed(speed))
    }
}

pub struct Pacer {
    speed: f64,
    config: PacingConfig,
    previous: Option<Option<f64>>,
}

impl Pacer {
    pub fn new(speed: f64, config: PacingConfig) -> Self {
        Self {
            speed,
            config,
            previous: None,
        }
    }

    /// Delay before processing a play declared at `occurred_at`. The first
    /// play of a run is processed immediately.
    pub fn delay_for(&mut self, occurred_at: Option<f64>) -> Duration {
        let gap = match self.previous.replace(occurred_at) {
            None => return Duration::ZERO,
            Some(Some(prev)) => match occurred_at {
                Some(now) => {
                    let secs = (now - prev).clamp(0.0, self.config.max_gap.as_secs_f64());
                    Duration::from_secs_f64(secs)
                }
                None => self.config.default_gap,
            },
            Some(None) => self.config.default_gap,
        };
        Duration::try_from_secs_f64(gap.as_secs_f64() / self.speed)
            .map(|delay| delay.min(MAX_DELAY))
            .unwrap_or(MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_divided_by_speed() {
        let mut pacer = Pacer::new(50.0, PacingConfig::default());
        assert_eq!(pacer.delay_for(Some(0.0)), Duration::ZERO);
        assert_eq!(pacer.delay_for(Some(10.0)), Duration::from_millis(200));
        assert_eq!(pacer.delay_for(Some(15.0)), Duration::from_millis(100));
    }

    #[test]
    fn test_gap_is_clamped() {
        let mut pacer = Pacer::new(1.0, PacingConfig::default());
        pacer.delay_for(Some(100.0));
        assert_eq!(pacer.delay_for(Some(90.0)), Duration::ZERO);
        assert_eq!(pacer.delay_for(Some(1000.0)), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_timestamp_uses_default_gap() {
        let mut pacer = Pacer::new(2.0, PacingConfig::default());
        pacer.delay_for(None);
        assert_eq!(pacer.delay_for(Some(5.0)), Duration::from_millis(500));
        assert_eq!(pacer.delay_for(None), Duration::from_millis(500));
    }

    #[test]
    fn test_infinite_speed_never_waits() {
        let mut pacer = Pacer::new(f64::INFINITY, PacingConfig::default());
        pacer.delay_for(Some(0.0));
        assert_eq!(pacer.delay_for(Some(20.0)), Duration::ZERO);
    }

    #[test]
    fn test_validate_speed() {
        assert!(validate_speed(1.0).is_ok());
        assert!(validate_speed(f64::INFINITY).is_ok());
        assert!(validate_speed(0.0).is_err());
        assert!(validate_speed(-3.0).is_err());
        assert!(validate_speed(f64::NAN).is_err());
        assert!(validate_speed(1e-300).is_err());
        assert!(validate_speed(MIN_SPEED).is_ok());
    }

    #[test]
    fn test_tiny_speed_delay_is_capped() {
        let mut pacer = Pacer::new(1e-300, PacingConfig::default());
        assert_eq!(pacer.delay_for(Some(0.0)), Duration::ZERO);
        assert_eq!(pacer.delay_for(Some(6.0)), MAX_DELAY);

        let mut pacer = Pacer::new(MIN_SPEED, PacingConfig::default());
        pacer.delay_for(Some(0.0));
        let slowest = pacer.delay_for(Some(30.0));
        assert!(slowest > Duration::from_secs(2999) && slowest < MAX_DELAY);
    }
}
