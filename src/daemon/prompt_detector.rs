//! Heuristic detection of agent prompts waiting for confirmation.

use regex::Regex;

use crate::{AppError, Result};

/// Confirmation phrases within twenty characters of the end of the last line,
/// or a shell-style prompt (`>>>`, `claude>`, `aider>`, `>`) ending it.
pub const DEFAULT_PROMPT_PATTERN: &str =
    r"(?i)(?:\[y/n\]|\(y/n\)|continue\?|proceed\?|press enter|hit enter).{0,20}$|>$";

/// Matches the tail of captured terminal output against prompt patterns.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    pattern: Regex,
}

impl PromptDetector {
    /// Detector using [`DEFAULT_PROMPT_PATTERN`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the pattern fails to compile.
    pub fn new() -> Result<Self> {
        Self::with_pattern(DEFAULT_PROMPT_PATTERN)
    }

    /// Detector using a custom regular expression, matched against the
    /// last non-blank line with trailing whitespace removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the pattern fails to compile.
    pub fn with_pattern(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|err| AppError::Config(format!("invalid prompt pattern: {err}")))?;
        Ok(Self { pattern })
    }

    /// Whether `output` ends in a prompt.
    #[must_use]
    pub fn is_prompt(&self, output: &str) -> bool {
        last_line(output).is_some_and(|line| self.pattern.is_match(line))
    }
}

/// Last non-blank line of `output`, trailing whitespace removed.
///
/// Pane captures are padded with empty rows below the cursor.
#[must_use]
pub fn last_line(output: &str) -> Option<&str> {
    output
        .lines()
        .map(str::trim_end)
        .rev()
        .find(|line| !line.is_empty())
}
