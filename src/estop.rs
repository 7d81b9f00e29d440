// E-stop supervisor
//
// Armed -> Tripped when the hardware safety line reads its tripped level or a trip
// was requested (e.g. the session dropped). Tripped -> Armed when the safety line
// reads normal on a later cycle. Evaluated once per control cycle, before the PID.

/// Process-wide interlock status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EstopStatus {
    /// Motors may move
    #[default]
    Armed,
    /// Motors forced to zero, safety light on
    Tripped,
}

/// Level sampled on the safety input. A broken wire reads as `Tripped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyLine {
    Normal,
    Tripped,
}

impl From<bool> for SafetyLine {
    /// `true` is the normal (closed-loop) level
    fn from(normal: bool) -> Self {
        if normal {
            SafetyLine::Normal
        } else {
            SafetyLine::Tripped
        }
    }
}

/// Why the supervisor tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripCause {
    SafetyLine,
    Requested,
}

/// Outcome of one supervisor evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstopTransition {
    /// Was armed, still armed
    Armed,
    /// Was tripped, safety line restored this cycle
    Rearmed,
    /// Entered the tripped state this cycle
    Tripped(TripCause),
    /// Was tripped, still tripped
    Held,
}

impl EstopTransition {
    /// Whether motors must be stopped this cycle
    pub fn is_tripped(&self) -> bool {
        matches!(self, EstopTransition::Tripped(_) | EstopTransition::Held)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EstopSupervisor {
    status: EstopStatus,
    trip_requested: bool,
}

impl EstopSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> EstopStatus {
        self.status
    }

    pub fn is_armed(&self) -> bool {
        self.status == EstopStatus::Armed
    }

    /// Ask for a trip on the next evaluation
    pub fn request_trip(&mut self) {
        self.trip_requested = true;
    }

    pub fn trip_pending(&self) -> bool {
        self.trip_requested
    }

    /// Every accepted session starts armed. A pending request is never dropped here;
    /// the server waits for the control cycle to consume it before accepting.
    pub fn arm_for_session(&mut self) {
        self.status = EstopStatus::Armed;
    }

    /// Sample the safety line and advance the state machine
    pub fn evaluate(&mut self, line: SafetyLine) -> EstopTransition {
        let requested = std::mem::take(&mut self.trip_requested);

        let cause = match (line, requested) {
            (SafetyLine::Tripped, _) => Some(TripCause::SafetyLine),
            (SafetyLine::Normal, true) => Some(TripCause::Requested),
            (SafetyLine::Normal, false) => None,
        };

        match (self.status, cause) {
            (EstopStatus::Armed, Some(cause)) => {
                self.status = EstopStatus::Tripped;
                EstopTransition::Tripped(cause)
            }
            (EstopStatus::Armed, None) => EstopTransition::Armed,
            (EstopStatus::Tripped, Some(_)) => EstopTransition::Held,
            (EstopStatus::Tripped, None) => {
                self.status = EstopStatus::Armed;
                EstopTransition::Rearmed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_armed() {
        let supervisor = EstopSupervisor::new();
        assert!(supervisor.is_armed());
        assert!(!supervisor.trip_pending());
    }

    #[test]
    fn test_safety_line_trip_and_rearm() {
        let mut supervisor = EstopSupervisor::new();
        assert_eq!(supervisor.evaluate(SafetyLine::Normal), EstopTransition::Armed);
        assert_eq!(
            supervisor.evaluate(SafetyLine::Tripped),
            EstopTransition::Tripped(TripCause::SafetyLine)
        );
        assert_eq!(supervisor.status(), EstopStatus::Tripped);
        assert_eq!(supervisor.evaluate(SafetyLine::Tripped), EstopTransition::Held);
        assert_eq!(supervisor.evaluate(SafetyLine::Normal), EstopTransition::Rearmed);
        assert!(supervisor.is_armed());
    }

    #[test]
    fn test_requested_trip_is_consumed() {
        let mut supervisor = EstopSupervisor::new();
        supervisor.request_trip();
        assert!(supervisor.trip_pending());
        assert_eq!(
            supervisor.evaluate(SafetyLine::Normal),
            EstopTransition::Tripped(TripCause::Requested)
        );
        assert!(!supervisor.trip_pending());
        // Line is normal on the following cycle, so the interlock re-arms
        assert_eq!(supervisor.evaluate(SafetyLine::Normal), EstopTransition::Rearmed);
    }

    #[test]
    fn test_safety_line_wins_over_request() {
        let mut supervisor = EstopSupervisor::new();
        supervisor.request_trip();
        assert_eq!(
            supervisor.evaluate(SafetyLine::Tripped),
            EstopTransition::Tripped(TripCause::SafetyLine)
        );
    }

    #[test]
    fn test_session_arm_keeps_pending_request() {
        let mut supervisor = EstopSupervisor::new();
        supervisor.evaluate(SafetyLine::Tripped);
        supervisor.request_trip();
        supervisor.arm_for_session();
        assert!(supervisor.is_armed());
        assert!(supervisor.evaluate(SafetyLine::Normal).is_tripped());
    }

    #[test]
    fn test_safety_line_from_level() {
        assert_eq!(SafetyLine::from(true), SafetyLine::Normal);
        assert_eq!(SafetyLine::from(false), SafetyLine::Tripped);
    }
}
