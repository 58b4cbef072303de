use super::Duration;

/// Request-timeout profile, matched 1:1 with the two axes named in the
/// configuration surface: how urgently the result is needed, and how patient
/// we can afford to be with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkTimeout {
    /// For requests made outside a latency-sensitive critical section.
    Generic(Relaxation),
    /// For requests issued while holding the chain-height-investigation lock.
    Urgent(Relaxation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relaxation {
    Normal,
    Relaxed,
    MostRelaxed,
}

impl NetworkTimeout {
    pub const fn duration(self) -> Duration {
        let secs = match self {
            Self::Generic(Relaxation::Normal) => 30,
            Self::Generic(Relaxation::Relaxed) => 45,
            Self::Generic(Relaxation::MostRelaxed) => 600,
            Self::Urgent(Relaxation::Normal) => 10,
            Self::Urgent(Relaxation::Relaxed) => 20,
            Self::Urgent(Relaxation::MostRelaxed) => 60,
        };
        Duration::from_secs(secs)
    }

    pub const GENERIC_NORMAL: Self = Self::Generic(Relaxation::Normal);
    pub const GENERIC_RELAXED: Self = Self::Generic(Relaxation::Relaxed);
    pub const GENERIC_MOST_RELAXED: Self = Self::Generic(Relaxation::MostRelaxed);
    pub const URGENT_NORMAL: Self = Self::Urgent(Relaxation::Normal);
    pub const URGENT_RELAXED: Self = Self::Urgent(Relaxation::Relaxed);
    pub const URGENT_MOST_RELAXED: Self = Self::Urgent(Relaxation::MostRelaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_match_spec() {
        assert_eq!(NetworkTimeout::GENERIC_NORMAL.duration(), Duration::from_secs(30));
        assert_eq!(NetworkTimeout::GENERIC_RELAXED.duration(), Duration::from_secs(45));
        assert_eq!(NetworkTimeout::GENERIC_MOST_RELAXED.duration(), Duration::from_secs(600));
        assert_eq!(NetworkTimeout::URGENT_NORMAL.duration(), Duration::from_secs(10));
        assert_eq!(NetworkTimeout::URGENT_RELAXED.duration(), Duration::from_secs(20));
        assert_eq!(NetworkTimeout::URGENT_MOST_RELAXED.duration(), Duration::from_secs(60));
    }
}
