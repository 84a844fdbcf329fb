//! Interactive console collaborator.
//!
//! Two prompts are needed by the core: a multi-select for choosing exposed
//! services and a batch decision over merge conflicts. [`TerminalConsole`]
//! implements them with `dialoguer`; in non-interactive mode every prompt
//! fails fast with [`ConsoleError::NonInteractive`] instead of blocking.

use std::collections::BTreeMap;
use std::io::IsTerminal;

use camino::Utf8PathBuf;
use dialoguer::MultiSelect;
use dialoguer::theme::ColorfulTheme;
use thiserror::Error;

/// Per-path answer to a merge conflict.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConflictDecision {
    /// Replace the existing file with the generated one.
    Overwrite,
    /// Leave the existing file untouched.
    Keep,
}

/// Errors raised by console prompts.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConsoleError {
    /// Raised when a prompt is required but the console cannot interact.
    #[error("{prompt}: input required but running non-interactively; {hint}")]
    NonInteractive {
        /// Prompt that could not be shown.
        prompt: String,
        /// How to provide the answer without a prompt.
        hint: String,
    },
    /// Raised when the user dismisses a prompt.
    #[error("{prompt}: cancelled by user")]
    Aborted {
        /// Prompt that was dismissed.
        prompt: String,
    },
    /// Raised when the terminal fails.
    #[error("console prompt failed: {0}")]
    Prompt(String),
}

/// Prompts used by the exposure selector and staged merge.
pub trait Console: Send + Sync {
    /// Lets the user pick any subset of `options`; returns the picked
    /// options in their original order.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError`] when the prompt cannot be shown or is
    /// dismissed.
    fn multi_select(&self, message: &str, options: &[String]) -> Result<Vec<String>, ConsoleError>;

    /// Asks for a decision on every conflicting path at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConsoleError`] when the prompt cannot be shown or is
    /// dismissed.
    fn resolve_conflicts(
        &self,
        conflicts: &[Utf8PathBuf],
    ) -> Result<BTreeMap<Utf8PathBuf, ConflictDecision>, ConsoleError>;
}

/// Console backed by the controlling terminal.
#[derive(Debug)]
pub struct TerminalConsole {
    no_prompt: bool,
}

impl TerminalConsole {
    /// Creates a console. With `no_prompt` set, every prompt fails fast.
    #[must_use]
    pub const fn new(no_prompt: bool) -> Self {
        Self { no_prompt }
    }

    fn ensure_interactive(&self, prompt: &str, hint: &str) -> Result<(), ConsoleError> {
        if self.no_prompt || !std::io::stdin().is_terminal() {
            return Err(ConsoleError::NonInteractive {
                prompt: prompt.to_owned(),
                hint: hint.to_owned(),
            });
        }
        Ok(())
    }

    fn pick(&self, message: &str, items: &[String]) -> Result<Vec<usize>, ConsoleError> {
        let selection = MultiSelect::with_theme(&ColorfulTheme::default())
            .with_prompt(message)
            .items(items)
            .interact_opt()
            .map_err(|err| ConsoleError::Prompt(err.to_string()))?;
        selection.ok_or_else(|| ConsoleError::Aborted {
            prompt: message.to_owned(),
        })
    }
}

impl Console for TerminalConsole {
    fn multi_select(&self, message: &str, options: &[String]) -> Result<Vec<String>, ConsoleError> {
        self.ensure_interactive(
            message,
            "record the choice under services.<service>.config.exposedServices",
        )?;
        let picked = self.pick(message, options)?;
        Ok(options
            .iter()
            .enumerate()
            .filter(|(index, _)| picked.contains(index))
            .map(|(_, option)| option.clone())
            .collect())
    }

    fn resolve_conflicts(
        &self,
        conflicts: &[Utf8PathBuf],
    ) -> Result<BTreeMap<Utf8PathBuf, ConflictDecision>, ConsoleError> {
        let message = "Generated files differ from existing ones; select the files to overwrite";
        self.ensure_interactive(message, "move the conflicting files aside and rerun")?;
        let labels: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
        let picked = self.pick(message, &labels)?;
        Ok(conflicts
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let decision = if picked.contains(&index) {
                    ConflictDecision::Overwrite
                } else {
                    ConflictDecision::Keep
                };
                (path.clone(), decision)
            })
            .collect())
    }
}
