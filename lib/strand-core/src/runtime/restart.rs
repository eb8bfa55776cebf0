use std::{fmt, time::Duration};

use quanta::Instant;
use serde::Deserialize;
use strand_config::{ConfigurationError, GenericConfiguration};
use tracing::debug;

/// Which children are restarted when one of them fails.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RestartPolicy {
    /// Restarts the failed child only.
    #[default]
    OneForOne = 0,

    /// Restarts every child, including the failed one.
    OneForAll = 1,

    /// Restarts the failed child, then every child that depends on it, transitively.
    RestForOne = 2,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneForOne => write!(f, "one_for_one"),
            Self::OneForAll => write!(f, "one_for_all"),
            Self::RestForOne => write!(f, "rest_for_one"),
        }
    }
}

/// Restart strategy for a supervisor.
///
/// Defaults to the one-for-one policy with a budget of 3 restarts within a 5 second window.
///
/// # Restart budget
///
/// The window opens at the first restart. Restarts are counted, across all children, until a failure arrives more
/// than `time_window` after the window opened, at which point the count resets and a new window opens. A failure that
/// would push the count past `max_restarts` is not restarted: the failed child is left stopped and the supervisor is
/// marked degraded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestartStrategy {
    policy: RestartPolicy,
    max_restarts: usize,
    time_window: Duration,
}

impl RestartStrategy {
    /// Creates a new `RestartStrategy` with the given policy and budget.
    pub const fn new(policy: RestartPolicy, max_restarts: usize, time_window: Duration) -> Self {
        Self {
            policy,
            max_restarts,
            time_window,
        }
    }

    /// Creates a one-for-one strategy with the default budget.
    pub fn one_for_one() -> Self {
        Self::default().with_policy(RestartPolicy::OneForOne)
    }

    /// Creates a one-for-all strategy with the default budget.
    pub fn one_for_all() -> Self {
        Self::default().with_policy(RestartPolicy::OneForAll)
    }

    /// Creates a rest-for-one strategy with the default budget.
    pub fn rest_for_one() -> Self {
        Self::default().with_policy(RestartPolicy::RestForOne)
    }

    /// Sets the restart policy.
    pub const fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the restart budget.
    pub const fn with_budget(mut self, max_restarts: usize, time_window: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.time_window = time_window;
        self
    }

    /// Reads the strategy from `supervisor.policy`, `supervisor.max_restarts`, and `supervisor.time_window_secs`.
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// If a key is present but has the wrong type, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let mut strategy = Self::default();
        if let Some(policy) = config.try_get_typed("supervisor.policy")? {
            strategy.policy = policy;
        }
        if let Some(max_restarts) = config.try_get_typed("supervisor.max_restarts")? {
            strategy.max_restarts = max_restarts;
        }
        if let Some(secs) = config.try_get_typed::<u64>("supervisor.time_window_secs")? {
            strategy.time_window = Duration::from_secs(secs);
        }
        Ok(strategy)
    }

    /// Returns the restart policy.
    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Returns the maximum number of restarts allowed within one window.
    pub fn max_restarts(&self) -> usize {
        self.max_restarts
    }

    /// Returns the length of the restart window.
    pub fn time_window(&self) -> Duration {
        self.time_window
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self::new(RestartPolicy::OneForOne, 3, Duration::from_secs(5))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum RestartAction {
    /// Restart according to the given policy.
    Restart(RestartPolicy),

    /// The restart budget is exhausted.
    Exhausted,
}

pub(super) struct RestartState {
    strategy: RestartStrategy,
    restart_count: usize,
    last_restart_time: Option<Instant>,
}

impl RestartState {
    pub fn new(strategy: RestartStrategy) -> Self {
        Self {
            strategy,
            restart_count: 0,
            last_restart_time: None,
        }
    }

    pub fn strategy(&self) -> &RestartStrategy {
        &self.strategy
    }

    pub fn restart_count(&self) -> usize {
        self.restart_count
    }

    pub fn reset(&mut self) {
        self.restart_count = 0;
        self.last_restart_time = None;
    }

    /// Records a failure observed at `now` and decides how the supervisor responds.
    pub fn evaluate_restart(&mut self, now: Instant) -> RestartAction {
        let window_expired = match self.last_restart_time {
            Some(last) => now.saturating_duration_since(last) > self.strategy.time_window,
            None => true,
        };
        if window_expired {
            self.restart_count = 0;
            self.last_restart_time = Some(now);
        }

        self.restart_count += 1;
        if self.restart_count > self.strategy.max_restarts {
            debug!(
                restart_count = self.restart_count,
                "Restart limit exceeded ({} in {:?}).", self.strategy.max_restarts, self.strategy.time_window
            );
            return RestartAction::Exhausted;
        }

        RestartAction::Restart(self.strategy.policy)
    }
}

#[cfg(test)]
mod tests {
    use quanta::Clock;
    use strand_config::ConfigurationLoader;

    use super::*;

    #[test]
    fn budget_is_exhausted_within_window() {
        let (clock, mock) = Clock::mock();
        let mut state = RestartState::new(RestartStrategy::one_for_one().with_budget(2, Duration::from_secs(5)));

        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Restart(RestartPolicy::OneForOne));
        mock.increment(Duration::from_secs(1));
        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Restart(RestartPolicy::OneForOne));
        mock.increment(Duration::from_secs(1));
        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Exhausted);
    }

    #[test]
    fn window_expiry_resets_the_count() {
        let (clock, mock) = Clock::mock();
        let mut state = RestartState::new(RestartStrategy::rest_for_one().with_budget(1, Duration::from_secs(5)));

        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Restart(RestartPolicy::RestForOne));
        mock.increment(Duration::from_secs(6));
        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Restart(RestartPolicy::RestForOne));
        assert_eq!(state.restart_count(), 1);
        mock.increment(Duration::from_secs(1));
        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Exhausted);
    }

    #[test]
    fn zero_budget_never_restarts() {
        let clock = Clock::new();
        let mut state = RestartState::new(RestartStrategy::one_for_all().with_budget(0, Duration::from_secs(5)));
        assert_eq!(state.evaluate_restart(clock.now()), RestartAction::Exhausted);
    }

    #[test]
    fn policy_values() {
        assert_eq!(RestartPolicy::OneForOne as u8, 0);
        assert_eq!(RestartPolicy::OneForAll as u8, 1);
        assert_eq!(RestartPolicy::RestForOne as u8, 2);
    }

    #[test]
    fn strategy_from_configuration() {
        let config = ConfigurationLoader::default()
            .from_serialized(serde_json::json!({
                "supervisor": { "policy": "rest_for_one", "max_restarts": 10 }
            }))
            .into_generic();

        let strategy = RestartStrategy::from_configuration(&config).unwrap();
        assert_eq!(strategy.policy(), RestartPolicy::RestForOne);
        assert_eq!(strategy.max_restarts(), 10);
        assert_eq!(strategy.time_window(), Duration::from_secs(5));
    }
}
