//! Iteration controller: the approve / iterate / escalate state machine.

use pipewright_types::quality::{Decision, Gap, Measurement, QualityEvaluation};

use super::scorer::QualityScorer;

/// The quality gate rule.
///
/// Approve at or above the threshold. Below it, iterate only while attempts
/// remain and no gap is non-retryable; otherwise escalate. Once `iteration`
/// reaches `max_iterations` the result is never `Iterate`.
pub fn decide(score: f64, iteration: u32, max_iterations: u32, threshold: f64, gaps: &[Gap]) -> Decision {
    if score >= threshold {
        Decision::Approve
    } else if iteration < max_iterations && gaps.iter().all(|g| g.retryable) {
        Decision::Iterate
    } else {
        Decision::Escalate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Scoring,
    Iterating,
    Approved,
    Escalated,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Approved | ControllerState::Escalated)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("quality gate already decided ({state:?}); evaluate called on a finished attempt")]
    AlreadyTerminal { state: ControllerState },

    #[error("human override requires an escalated quality gate, found {state:?}")]
    NotEscalated { state: ControllerState },
}

/// Drives one iteration-controlled step.
///
/// The counter and history live in the checkpoint's iteration ledger; the
/// controller is rebuilt from them with [`IterationController::resume`].
#[derive(Debug, Clone)]
pub struct IterationController {
    scorer: QualityScorer,
    max_iterations: u32,
    threshold: f64,
    iteration: u32,
    history: Vec<QualityEvaluation>,
    state: ControllerState,
}

impl IterationController {
    pub fn new(scorer: QualityScorer, max_iterations: u32, threshold: f64) -> Self {
        Self {
            scorer,
            max_iterations,
            threshold,
            iteration: 0,
            history: Vec::new(),
            state: ControllerState::Scoring,
        }
    }

    /// Continue from a persisted ledger. A zero counter starts a fresh round;
    /// otherwise the latest decision restores the state.
    pub fn resume(mut self, iteration: u32, history: Vec<QualityEvaluation>) -> Self {
        self.state = match (iteration, history.last().map(|e| e.decision)) {
            (0, _) => ControllerState::Scoring,
            (_, Some(Decision::Approve)) => ControllerState::Approved,
            (_, Some(Decision::Escalate)) => ControllerState::Escalated,
            _ => ControllerState::Iterating,
        };
        self.iteration = iteration;
        self.history = history;
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn history(&self) -> &[QualityEvaluation] {
        &self.history
    }

    /// Score the next attempt and decide. Calling this after approval or
    /// escalation is a programming error.
    pub fn evaluate(&mut self, measurement: &Measurement) -> Result<QualityEvaluation, ControllerError> {
        if self.state.is_terminal() {
            return Err(ControllerError::AlreadyTerminal { state: self.state });
        }

        self.iteration += 1;
        let card = self.scorer.score(self.iteration, measurement);
        let decision = decide(
            card.overall_score,
            self.iteration,
            self.max_iterations,
            self.threshold,
            &card.gaps,
        );

        self.state = match decision {
            Decision::Approve => ControllerState::Approved,
            Decision::Iterate => ControllerState::Iterating,
            Decision::Escalate => ControllerState::Escalated,
        };

        tracing::info!(
            iteration = self.iteration,
            max_iterations = self.max_iterations,
            score = card.overall_score,
            threshold = self.threshold,
            %decision,
            "quality gate decided"
        );

        let evaluation = QualityEvaluation::new(card, decision);
        self.history.push(evaluation.clone());
        Ok(evaluation)
    }

    /// Human `retry`: start counting again, keeping the history.
    pub fn reset(&mut self) -> Result<(), ControllerError> {
        self.require_escalated()?;
        self.iteration = 0;
        self.state = ControllerState::Scoring;
        Ok(())
    }

    /// Human `force-approve`.
    pub fn force_approve(&mut self) -> Result<(), ControllerError> {
        self.require_escalated()?;
        self.state = ControllerState::Approved;
        Ok(())
    }

    fn require_escalated(&self) -> Result<(), ControllerError> {
        if self.state == ControllerState::Escalated {
            Ok(())
        } else {
            Err(ControllerError::NotEscalated { state: self.state })
        }
    }

    /// Gaps of the latest evaluation.
    pub fn outstanding_gaps(&self) -> Vec<Gap> {
        self.history.last().map(|e| e.gaps.clone()).unwrap_or_default()
    }
}
