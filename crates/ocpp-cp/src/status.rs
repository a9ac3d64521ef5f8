//! # Session Status
//!
//! Operational status of a simulated charge point. Mirrors the StatusNotification values,
//! plus `Offline`, which is never sent on the wire and marks an unsolicited disconnect.

use ocpp_types::v16j::ChargePointStatus;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
    Offline,
}

impl SessionStatus {
    /// Whether the status machine expects `self -> next`.
    ///
    /// The simulator reports whatever it is told to, so an unexpected edge is only logged.
    pub fn is_expected_transition(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (_, Offline) => true,
            (_, Faulted) => true,
            (Offline, _) => true,
            (Faulted, _) => true,
            (_, Unavailable) | (_, Available) => true,
            (Unavailable | Available | Reserved | Finishing, Preparing) => true,
            (Available | Preparing | Reserved, Charging) => true,
            (Charging | SuspendedEV | SuspendedEVSE, Charging) => true,
            (Preparing | Charging | SuspendedEV, SuspendedEVSE) => true,
            (Preparing | Charging | SuspendedEVSE, SuspendedEV) => true,
            (Charging | SuspendedEV | SuspendedEVSE | Preparing, Finishing) => true,
            (Available, Reserved) => true,
            _ => false,
        }
    }

    /// Applies `next`, logging a warning when the edge is unexpected.
    pub fn transition(&mut self, charge_point_id: &str, next: SessionStatus) {
        if !self.is_expected_transition(next) {
            warn!(
                charge_point_id,
                "Unexpected status transition {} -> {}", self, next
            );
        }
        *self = next;
    }

    pub fn is_charging(&self) -> bool {
        matches!(
            self,
            SessionStatus::Charging | SessionStatus::SuspendedEV | SessionStatus::SuspendedEVSE
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Offline => "Offline",
            SessionStatus::Available => ChargePointStatus::Available.as_str(),
            SessionStatus::Preparing => ChargePointStatus::Preparing.as_str(),
            SessionStatus::Charging => ChargePointStatus::Charging.as_str(),
            SessionStatus::SuspendedEV => ChargePointStatus::SuspendedEV.as_str(),
            SessionStatus::SuspendedEVSE => ChargePointStatus::SuspendedEVSE.as_str(),
            SessionStatus::Finishing => ChargePointStatus::Finishing.as_str(),
            SessionStatus::Reserved => ChargePointStatus::Reserved.as_str(),
            SessionStatus::Unavailable => ChargePointStatus::Unavailable.as_str(),
            SessionStatus::Faulted => ChargePointStatus::Faulted.as_str(),
        }
    }
}

impl From<ChargePointStatus> for SessionStatus {
    fn from(status: ChargePointStatus) -> Self {
        match status {
            ChargePointStatus::Available => SessionStatus::Available,
            ChargePointStatus::Preparing => SessionStatus::Preparing,
            ChargePointStatus::Charging => SessionStatus::Charging,
            ChargePointStatus::SuspendedEV => SessionStatus::SuspendedEV,
            ChargePointStatus::SuspendedEVSE => SessionStatus::SuspendedEVSE,
            ChargePointStatus::Finishing => SessionStatus::Finishing,
            ChargePointStatus::Reserved => SessionStatus::Reserved,
            ChargePointStatus::Unavailable => SessionStatus::Unavailable,
            ChargePointStatus::Faulted => SessionStatus::Faulted,
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Unavailable
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_cycle_is_expected() {
        let cycle = [
            SessionStatus::Unavailable,
            SessionStatus::Preparing,
            SessionStatus::Charging,
            SessionStatus::Finishing,
            SessionStatus::Preparing,
            SessionStatus::Charging,
            SessionStatus::Finishing,
            SessionStatus::Available,
        ];
        for pair in cycle.windows(2) {
            assert!(
                pair[0].is_expected_transition(pair[1]),
                "{} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_fault_and_offline_reachable_everywhere() {
        for status in [
            SessionStatus::Available,
            SessionStatus::Preparing,
            SessionStatus::Charging,
            SessionStatus::Finishing,
        ] {
            assert!(status.is_expected_transition(SessionStatus::Faulted));
            assert!(status.is_expected_transition(SessionStatus::Offline));
        }
    }

    #[test]
    fn test_unexpected_transition_still_applies() {
        assert!(!SessionStatus::Finishing.is_expected_transition(SessionStatus::Charging));

        let mut status = SessionStatus::Finishing;
        status.transition("VCP_1", SessionStatus::Charging);
        assert_eq!(status, SessionStatus::Charging);
    }

    #[test]
    fn test_conversion_and_display() {
        assert_eq!(
            SessionStatus::from(ChargePointStatus::SuspendedEVSE),
            SessionStatus::SuspendedEVSE
        );
        assert_eq!(SessionStatus::Offline.to_string(), "Offline");
        assert_eq!(SessionStatus::default(), SessionStatus::Unavailable);
        assert!(SessionStatus::SuspendedEV.is_charging());
        assert!(!SessionStatus::Finishing.is_charging());
    }
}
