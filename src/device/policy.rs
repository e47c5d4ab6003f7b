use crate::device::constants::POLL_INTERVAL;
use crate::device::types::{Capabilities, DeliveryMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Deliver(DeliveryMode),
    NotSubscribable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    /// Keep streaming by polling instead; the subscription failure is only an advisory.
    Poll(DeliveryMode),
    /// The characteristic can not deliver values at all.
    Unusable,
}

/// Decides how values of a characteristic are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicPolicy {
    poll_interval_ms: u64,
}

impl Default for CharacteristicPolicy {
    fn default() -> Self {
        CharacteristicPolicy { poll_interval_ms: POLL_INTERVAL }
    }
}

impl CharacteristicPolicy {
    pub fn new(poll_interval_ms: u64) -> Self {
        // a zero interval would spin the poll timer
        CharacteristicPolicy { poll_interval_ms: poll_interval_ms.max(1) }
    }

    pub fn poll_mode(&self) -> DeliveryMode {
        DeliveryMode::PeriodicPoll { interval_ms: self.poll_interval_ms }
    }

    pub fn choose(&self, capabilities: Capabilities) -> PolicyDecision {
        if capabilities.notify || capabilities.indicate {
            PolicyDecision::Deliver(DeliveryMode::Notify)
        }
        else if capabilities.read {
            PolicyDecision::Deliver(self.poll_mode())
        }
        else {
            PolicyDecision::NotSubscribable
        }
    }

    pub fn on_subscription_failed(&self, capabilities: Capabilities) -> FallbackDecision {
        if capabilities.read {
            FallbackDecision::Poll(self.poll_mode())
        }
        else {
            FallbackDecision::Unusable
        }
    }
}
