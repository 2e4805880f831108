//! Trail lifecycle state machine.
//!
//! Every lifecycle operation checks its precondition here before touching
//! git or the filesystem, so a rejected operation never mutates anything.

use crate::core::types::TrailState;
use crate::error::CobblerError;

/// Operations that are gated on the trail's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrailOp {
    Run,
    Resume,
    Stop,
    Switch,
    Reset,
    Measure,
    Stitch,
    TrackerReset,
}

impl TrailOp {
    pub fn as_str(self) -> &'static str {
        match self {
            TrailOp::Run => "run",
            TrailOp::Resume => "resume",
            TrailOp::Stop => "stop",
            TrailOp::Switch => "switch to",
            TrailOp::Reset => "reset",
            TrailOp::Measure => "measure",
            TrailOp::Stitch => "stitch",
            TrailOp::TrackerReset => "reset the tracker of",
        }
    }
}

/// Check that `op` is allowed on a trail in `state`.
pub fn check(name: &str, state: TrailState, op: TrailOp) -> Result<(), CobblerError> {
    let invalid = || CobblerError::InvalidTransition {
        name: name.to_string(),
        operation: op.as_str(),
        state,
    };

    if state == TrailState::Running {
        return Err(CobblerError::TrailBusy {
            name: name.to_string(),
            detail: format!("cannot {} a running trail", op.as_str()),
        });
    }

    match op {
        TrailOp::Run | TrailOp::Measure | TrailOp::Stitch => match state {
            TrailState::Started => Ok(()),
            _ => Err(invalid()),
        },
        TrailOp::Resume => match state {
            TrailState::Interrupted => Ok(()),
            _ => Err(invalid()),
        },
        TrailOp::Stop | TrailOp::TrackerReset => match state {
            TrailState::Started | TrailState::Interrupted => Ok(()),
            _ => Err(invalid()),
        },
        TrailOp::Switch => match state {
            TrailState::Stopped => Err(CobblerError::TrailNotFound {
                name: name.to_string(),
                detail: "trail is stopped".to_string(),
            }),
            _ => Ok(()),
        },
        TrailOp::Reset => Ok(()),
    }
}

/// State a trail is observed in when no live process owns it.
///
/// A persisted `Running` state without a lock holder means the owning
/// process died mid-cycle.
pub fn observe(persisted: TrailState, owner_alive: bool) -> TrailState {
    match persisted {
        TrailState::Running if !owner_alive => TrailState::Interrupted,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_requires_started() {
        check("t", TrailState::Started, TrailOp::Run).expect("started runs");
        let err = check("t", TrailState::Interrupted, TrailOp::Run).unwrap_err();
        assert!(matches!(err, CobblerError::InvalidTransition { .. }));
        assert!(err.to_string().contains("cannot run trail 't' while it is interrupted"));
    }

    #[test]
    fn resume_requires_interrupted() {
        check("t", TrailState::Interrupted, TrailOp::Resume).expect("resume");
        assert!(matches!(
            check("t", TrailState::Started, TrailOp::Resume),
            Err(CobblerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn running_trail_is_busy_for_every_operation() {
        for op in [
            TrailOp::Run,
            TrailOp::Resume,
            TrailOp::Stop,
            TrailOp::Switch,
            TrailOp::Reset,
        ] {
            assert!(matches!(
                check("t", TrailState::Running, op),
                Err(CobblerError::TrailBusy { .. })
            ));
        }
    }

    #[test]
    fn stopped_trail_cannot_be_switched_to_or_stopped_again() {
        assert!(matches!(
            check("t", TrailState::Stopped, TrailOp::Switch),
            Err(CobblerError::TrailNotFound { .. })
        ));
        assert!(matches!(
            check("t", TrailState::Stopped, TrailOp::Stop),
            Err(CobblerError::InvalidTransition { .. })
        ));
        check("t", TrailState::Stopped, TrailOp::Reset).expect("reset stopped");
    }

    #[test]
    fn observe_demotes_orphaned_running() {
        assert_eq!(
            observe(TrailState::Running, false),
            TrailState::Interrupted
        );
        assert_eq!(observe(TrailState::Running, true), TrailState::Running);
        assert_eq!(observe(TrailState::Started, false), TrailState::Started);
    }
}
