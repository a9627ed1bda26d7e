use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::{FlowError, Result},
    model::ModelDescriptor,
    session::ChatSession,
};

/// One of the three generation passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    One,
    Two,
    Three,
}

impl Step {
    pub const ALL: [Step; 3] = [Step::One, Step::Two, Step::Three];

    /// 1-based step number.
    pub fn number(self) -> u8 {
        match self {
            Step::One => 1,
            Step::Two => 2,
            Step::Three => 3,
        }
    }

    /// 0-based buffer index.
    pub fn index(self) -> usize {
        usize::from(self.number() - 1)
    }
}

impl TryFrom<u8> for Step {
    type Error = FlowError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Step::One),
            2 => Ok(Step::Two),
            3 => Ok(Step::Three),
            other => Err(FlowError::InvalidStep(other)),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}", self.number())
    }
}

/// A single step execution that the fallback controller can retry on another model.
#[async_trait]
pub trait StepAttempt: Send {
    fn step(&self) -> Step;

    /// Runs the step once on `session`, accumulating its output.
    async fn attempt(&mut self, session: &mut dyn ChatSession) -> Result<()>;

    /// Discards whatever a failed attempt accumulated.
    fn reset(&mut self);

    /// Called once the session has moved to a fallback model.
    fn on_model_switch(&mut self, _from: &ModelDescriptor, _to: &ModelDescriptor) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_numbered_in_order() {
        assert_eq!(Step::ALL.map(Step::number), [1, 2, 3]);
        assert_eq!(Step::Two.index(), 1);
        assert_eq!(Step::Three.to_string(), "step 3");
    }

    #[test]
    fn step_numbers_outside_range_are_rejected() {
        assert_eq!(Step::try_from(2), Ok(Step::Two));
        assert_eq!(Step::try_from(4), Err(FlowError::InvalidStep(4)));
        assert_eq!(Step::try_from(0), Err(FlowError::InvalidStep(0)));
    }
}
