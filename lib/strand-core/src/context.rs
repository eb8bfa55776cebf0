//! Explicit runtime context.
//!
//! Anything the runtime would otherwise read from ambient, process-wide state (the clock used for restart windows, the
//! capability checker consulted before privileged operations) is carried by a [`RuntimeContext`] that callers pass to
//! supervisors and endpoints. Tests construct isolated contexts, such as one backed by a mock clock.

use std::{fmt, sync::Arc};

use quanta::Clock;

/// A privileged operation that must be permitted before the runtime performs it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Opening sockets and bridging channels to remote peers.
    Network,

    /// Spawning OS threads.
    Spawn,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Spawn => write!(f, "spawn"),
        }
    }
}

/// Consulted before privileged operations.
///
/// The permission model itself lives outside of the runtime: this is only the boolean check.
pub trait CapabilityCheck: Send + Sync {
    /// Returns `true` if the given capability is granted.
    fn is_permitted(&self, capability: Capability) -> bool;
}

/// Grants every capability.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn is_permitted(&self, _capability: Capability) -> bool {
        true
    }
}

impl<F> CapabilityCheck for F
where
    F: Fn(Capability) -> bool + Send + Sync,
{
    fn is_permitted(&self, capability: Capability) -> bool {
        self(capability)
    }
}

/// Runtime context shared by supervisors and endpoints.
#[derive(Clone)]
pub struct RuntimeContext {
    clock: Clock,
    capabilities: Arc<dyn CapabilityCheck>,
}

impl RuntimeContext {
    /// Creates a new `RuntimeContext` with the given clock and capability checker.
    pub fn new<C>(clock: Clock, capabilities: C) -> Self
    where
        C: CapabilityCheck + 'static,
    {
        Self {
            clock,
            capabilities: Arc::new(capabilities),
        }
    }

    /// Returns a copy of this context that uses the given clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns a copy of this context that uses the given capability checker.
    pub fn with_capabilities<C>(mut self, capabilities: C) -> Self
    where
        C: CapabilityCheck + 'static,
    {
        self.capabilities = Arc::new(capabilities);
        self
    }

    /// Returns the clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Returns `true` if the given capability is granted.
    pub fn is_permitted(&self, capability: Capability) -> bool {
        self.capabilities.is_permitted(capability)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Clock::new(), AllowAll)
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn closure_capability_check() {
        let ctx = RuntimeContext::default().with_capabilities(|cap: Capability| cap != Capability::Network);
        assert!(!ctx.is_permitted(Capability::Network));
        assert!(ctx.is_permitted(Capability::Spawn));
    }

    #[test]
    fn mock_clock_is_shared_by_clones() {
        let (clock, mock) = Clock::mock();
        let ctx = RuntimeContext::default().with_clock(clock);
        let cloned = ctx.clone();

        let before = cloned.clock().now();
        mock.increment(Duration::from_secs(3));
        assert_eq!(ctx.clock().now() - before, Duration::from_secs(3));
    }
}
