use serde::Serialize;

/// Sub-steps of a kill, cancel or rename
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Terminate,
    ReleaseLock,
    RemovePartial,
    RemoveQueued,
    RemovePreview,
    RenameArtifact,
    Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step: Step,
    pub outcome: Outcome,
    pub detail: String,
}

/// Ordered record of what a multi-step operation did.
///
/// A failed step never aborts the operation; it only shows up here.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub steps: Vec<StepOutcome>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, step: Step, outcome: Outcome, detail: impl Into<String>) {
        self.steps.push(StepOutcome {
            step,
            outcome,
            detail: detail.into(),
        });
    }

    pub fn done(&mut self, step: Step, detail: impl Into<String>) {
        self.push(step, Outcome::Done, detail);
    }

    pub fn failed(&mut self, step: Step, detail: impl Into<String>) {
        self.push(step, Outcome::Failed, detail);
    }

    pub fn skipped(&mut self, step: Step, detail: impl Into<String>) {
        self.push(step, Outcome::Skipped, detail);
    }

    pub fn has_failures(&self) -> bool {
        self.steps.iter().any(|s| s.outcome == Outcome::Failed)
    }

    /// Outcomes recorded for one step kind
    pub fn outcomes(&self, step: Step) -> Vec<&StepOutcome> {
        self.steps.iter().filter(|s| s.step == step).collect()
    }

    /// One line for operators: everything that happened or failed
    pub fn summary(&self) -> String {
        self.steps
            .iter()
            .filter(|s| s.outcome != Outcome::Skipped)
            .map(|s| match s.outcome {
                Outcome::Failed => format!("FAILED: {}", s.detail),
                _ => s.detail.clone(),
            })
            .collect::<Vec<_>>()
            .join(". ")
    }
}
