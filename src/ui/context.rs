//! Interactive versus CI detection

use console::Term;
use std::io::IsTerminal;

/// Environment variables set by common CI systems
const CI_MARKERS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// How the CLI should talk to the person (or pipeline) running it
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    interactive: bool,
    auto_yes: bool,
}

impl UiContext {
    /// Inspect stderr, stdin and the environment
    pub fn detect() -> Self {
        let terminal = Term::stderr().is_term() && std::io::stdin().is_terminal();
        let in_ci = CI_MARKERS.iter().any(|var| std::env::var_os(var).is_some());
        Self {
            interactive: terminal && !in_ci,
            auto_yes: false,
        }
    }

    /// Plain output, no prompts
    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            auto_yes: false,
        }
    }

    /// Answer every confirmation with yes
    pub fn with_auto_yes(mut self, yes: bool) -> Self {
        self.auto_yes = yes;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_interactive_never_prompts() {
        let ctx = UiContext::non_interactive();
        assert!(!ctx.is_interactive());
        assert!(!ctx.auto_yes());
    }

    #[test]
    fn auto_yes_is_kept() {
        assert!(UiContext::non_interactive().with_auto_yes(true).auto_yes());
    }
}
