//! Password-policy view consulted by the bind handler.
use std::time::Duration;

/// Fields of the effective password policy entry, as fetched from the
/// cache. Values keep the string-list shape of the entry's attributes; a
/// missing policy yields the zero-valued default with lockout disabled.
#[derive(Debug, Clone, Default)]
pub struct PPolicy {
    pub pwd_attribute: Vec<String>,
    pub pwd_lockout: Vec<String>,
    pub pwd_lockout_duration: Vec<String>,
    pub pwd_max_failure: Vec<String>,
}

impl PPolicy {
    pub fn is_lockout_enabled(&self) -> bool {
        self.pwd_lockout.first().map(String::as_str) == Some("TRUE")
    }

    /// True once the failure count has reached the configured maximum.
    pub fn should_lockout(&self, failure_count: usize) -> bool {
        if !self.is_lockout_enabled() {
            return false;
        }
        match self.max_failure() {
            Some(max) if max > 0 => failure_count >= max,
            _ => false,
        }
    }

    pub fn max_failure(&self) -> Option<usize> {
        self.pwd_max_failure.first()?.parse().ok()
    }

    /// Lockout duration; zero means locked until administrative reset.
    pub fn lockout_duration(&self) -> Duration {
        let secs = self
            .pwd_lockout_duration
            .first()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_disables_lockout() {
        let policy = PPolicy::default();
        assert!(!policy.is_lockout_enabled());
        assert!(!policy.should_lockout(100));
        assert_eq!(policy.lockout_duration(), Duration::ZERO);
    }

    #[test]
    fn lockout_thresholds() {
        let policy = PPolicy {
            pwd_lockout: vec!["TRUE".to_string()],
            pwd_max_failure: vec!["3".to_string()],
            pwd_lockout_duration: vec!["300".to_string()],
            ..PPolicy::default()
        };
        assert!(policy.is_lockout_enabled());
        assert!(!policy.should_lockout(2));
        assert!(policy.should_lockout(3));
        assert_eq!(policy.lockout_duration(), Duration::from_secs(300));
    }
}
