//! Model-string → coding-agent backend dispatch (§6).
//!
//! Only the codex harness is implemented; `claude-code` and the generic
//! ("typoi") harness are declared but stubbed, matching the teacher's pattern
//! of an enum-dispatched backend selector with explicit `Unimplemented`
//! variants for backends awaiting a follow-up (`src/claude` vs. the other
//! provider stubs it never finished wiring).

use crate::agent::{AgentRunConfig, AgentSupervisor, RunOutcome};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Harness {
    Codex,
    ClaudeCode,
    Typoi,
}

impl Harness {
    /// `claude-` → claude-code; `codex-`/`gpt-` → codex; else generic.
    pub fn select(model: &str) -> Self {
        if model.starts_with("claude-") {
            Harness::ClaudeCode
        } else if model.starts_with("codex-") || model.starts_with("gpt-") {
            Harness::Codex
        } else {
            Harness::Typoi
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Harness::Codex => "codex",
            Harness::ClaudeCode => "claude-code",
            Harness::Typoi => "typoi",
        }
    }
}

/// Runs `config.model`'s harness; only [`Harness::Codex`] is implemented.
pub async fn run(config: &AgentRunConfig) -> Result<RunOutcome> {
    match Harness::select(&config.model) {
        Harness::Codex => AgentSupervisor::run(config).await,
        other => Err(Error::BackendUnimplemented(other.name().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_harness_from_model_prefix() {
        assert_eq!(Harness::select("claude-opus"), Harness::ClaudeCode);
        assert_eq!(Harness::select("codex-5.1"), Harness::Codex);
        assert_eq!(Harness::select("gpt-5"), Harness::Codex);
        assert_eq!(Harness::select("llama-70b"), Harness::Typoi);
    }

    #[tokio::test]
    async fn non_codex_harness_is_unimplemented() {
        let config = AgentRunConfig {
            model: "claude-opus".to_string(),
            working_dir: std::env::temp_dir(),
            ..Default::default()
        };
        let result = run(&config).await;
        assert!(matches!(result, Err(Error::BackendUnimplemented(name)) if name == "claude-code"));
    }
}
