//! Frame ordering for one request's stream
//!
//! ```text
//! INIT -> RUN_STARTED -> (STEP_STARTED -> DATA* -> STEP_FINISHED)*
//!      -> STATE_DELTA -> RUN_FINISHED | ERROR -> CLOSED
//! ```

use crate::error::PipelineError;
use crate::models::FrameType;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    /// Between steps.
    Running,
    InStep,
    /// Metadata sent; only RUN_FINISHED or ERROR may follow.
    Finishing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct FrameSequencer {
    phase: RunPhase,
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Init,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn is_closed(&self) -> bool {
        self.phase == RunPhase::Closed
    }

    /// Move to the phase after `frame`, or refuse a frame that is out of order.
    pub fn advance(&mut self, frame: FrameType) -> Result<RunPhase> {
        use FrameType::*;
        use RunPhase::*;

        let next = match (self.phase, frame) {
            (Init, RunStarted) => Running,
            (Running, StepStarted) => InStep,
            (InStep, Data) => InStep,
            (InStep, StepFinished) => Running,
            (Running, StateDelta) => Finishing,
            (Finishing, RunFinished) => Closed,
            (Running | InStep | Finishing, Error) => Closed,
            (phase, frame) => {
                return Err(PipelineError::Protocol(format!(
                    "{} not allowed in phase {:?}",
                    frame, phase
                )));
            }
        };
        self.phase = next;
        Ok(next)
    }
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self::new()
    }
}
