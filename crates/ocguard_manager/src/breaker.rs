//! Consecutive failure counter guarding the control loop.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerState {
    Running,
    /// Failure limit reached with shutdown enabled, terminal.
    Tripped,
}

/// What the control loop should do after recording a cycle result.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BreakerAction {
    Continue,
    /// Stop the VPN server and terminate.
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    shutdown_enabled: bool,
    failures: u32,
    state: BreakerState,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(max_failures: u32, shutdown_enabled: bool) -> Self {
        Self {
            max_failures,
            shutdown_enabled,
            failures: 0,
            state: BreakerState::Running,
        }
    }

    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    #[must_use]
    pub const fn state(&self) -> BreakerState {
        self.state
    }

    #[must_use]
    pub const fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Reset the failure counter after a successful cycle.
    pub fn record_success(&mut self) {
        if self.state == BreakerState::Running {
            self.failures = 0;
        }
    }

    /// Count a failed cycle.
    ///
    /// Returns [`BreakerAction::Shutdown`] exactly once, on the failure which
    /// reaches the limit while shutdown is enabled. With shutdown disabled the
    /// counter keeps growing and the loop keeps running.
    pub fn record_failure(&mut self) -> BreakerAction {
        if self.state == BreakerState::Tripped {
            return BreakerAction::Continue;
        }
        self.failures = self.failures.saturating_add(1);
        if self.shutdown_enabled && self.failures >= self.max_failures {
            self.state = BreakerState::Tripped;
            BreakerAction::Shutdown
        } else {
            BreakerAction::Continue
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_trips_on_consecutive_failures() {
        let mut breaker = CircuitBreaker::new(3, true);
        assert_eq!(breaker.record_failure(), BreakerAction::Continue);
        assert_eq!(breaker.record_failure(), BreakerAction::Continue);
        assert_eq!(breaker.record_failure(), BreakerAction::Shutdown);
        assert_eq!(breaker.state(), BreakerState::Tripped);

        // tripped breaker never asks for a second shutdown
        assert_eq!(breaker.record_failure(), BreakerAction::Continue);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Tripped);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut breaker = CircuitBreaker::new(3, true);
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
        breaker.record_failure();
        assert_eq!(breaker.record_failure(), BreakerAction::Continue);
        assert_eq!(breaker.failures(), 2);
        assert_eq!(breaker.state(), BreakerState::Running);
    }

    #[test]
    fn test_disabled_shutdown_keeps_counting() {
        let mut breaker = CircuitBreaker::new(2, false);
        for _ in 0..5 {
            assert_eq!(breaker.record_failure(), BreakerAction::Continue);
        }
        assert_eq!(breaker.failures(), 5);
        assert_eq!(breaker.state(), BreakerState::Running);
    }
}
