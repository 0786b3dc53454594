use crate::Pattern;
use std::time::Duration;

/// One unit of console interaction.
///
/// When `wait_for` is set, the step is not written until the pattern has been
/// observed on the console. `timeout` overrides the engine's default wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub text: String,
    pub wait_for: Option<Pattern>,
    pub timeout: Option<Duration>,
    /// Text is a credential and must never be logged.
    pub secret: bool,
}

impl CommandStep {
    /// A step written without waiting for anything.
    #[must_use]
    pub fn send(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            wait_for: None,
            timeout: None,
            secret: false,
        }
    }

    /// A step written once `prompt` has appeared.
    #[must_use]
    pub fn after(prompt: impl Into<Pattern>, text: impl Into<String>) -> Self {
        Self {
            wait_for: Some(prompt.into()),
            ..Self::send(text)
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    /// Text suitable for logs.
    #[must_use]
    pub fn display_text(&self) -> &str {
        if self.secret { "********" } else { &self.text }
    }
}

/// A named group of steps that together achieve one conceptual action
/// (for example "provision the admin account").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub steps: Vec<CommandStep>,
}

/// An ordered, unconditional sequence of console steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub stages: Vec<Stage>,
}

impl Script {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    #[must_use]
    pub fn stage(
        mut self,
        name: impl Into<String>,
        steps: impl IntoIterator<Item = CommandStep>,
    ) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            steps: steps.into_iter().collect(),
        });
        self
    }

    pub fn steps(&self) -> impl Iterator<Item = (&Stage, &CommandStep)> {
        self.stages
            .iter()
            .flat_map(|stage| stage.steps.iter().map(move |step| (stage, step)))
    }

    #[must_use]
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.steps.len()).sum()
    }

    /// Every line the script writes, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<&str> {
        self.steps().map(|(_, step)| step.text.as_str()).collect()
    }

    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }
}
