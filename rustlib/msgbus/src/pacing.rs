use std::{fmt, str::FromStr, time::Duration};

/// How the publisher spaces consecutive sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Sleep `interval - elapsed`, so time spent building and sending counts toward the interval
    #[default]
    Compensated,
    /// Sleep the full interval after every send regardless of work time
    Fixed,
}

impl FromStr for Pacing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compensated" => Ok(Pacing::Compensated),
            "fixed" => Ok(Pacing::Fixed),
            other => Err(format!("unknown pacing {:?}, expected compensated or fixed", other)),
        }
    }
}

impl fmt::Display for Pacing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pacing::Compensated => write!(f, "compensated"),
            Pacing::Fixed => write!(f, "fixed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    interval: Duration,
    policy: Pacing,
}

impl Pacer {
    pub fn new(interval: Duration, policy: Pacing) -> Self {
        Self { interval, policy }
    }

    /// Pacer targeting `rate` messages per second. `None` unless the rate is finite, positive
    /// and its interval fits in a `Duration`.
    pub fn from_rate(rate: f64, policy: Pacing) -> Option<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return None;
        }
        let interval = Duration::try_from_secs_f64(1.0 / rate).ok()?;
        Some(Self::new(interval, policy))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn policy(&self) -> Pacing {
        self.policy
    }

    /// Delay before the next send, given how long the current iteration took
    pub fn delay_after(&self, elapsed: Duration) -> Duration {
        match self.policy {
            Pacing::Compensated => self.interval.saturating_sub(elapsed),
            Pacing::Fixed => self.interval,
        }
    }
}
