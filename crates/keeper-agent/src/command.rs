//! Turns a free-form command string into an argv for the package runner.
//!
//! Tokenization is shell-like (quotes and escapes) but nothing is ever passed
//! through a shell.

use std::path::Path;

use crate::error::CommandError;

/// The package runner every app command is executed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerProfile {
    pub program: String,
    /// Arguments synthesized in front of a bare command (`uv run ...`).
    pub run_prefix: Vec<String>,
    /// Runner subcommand that executes an arbitrary package (`uv tool run ...`).
    pub exec_subcommand: Option<String>,
}

impl RunnerProfile {
    pub fn for_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            run_prefix: vec!["run".to_string()],
            exec_subcommand: Some("tool".to_string()),
        }
    }

    fn run_subcommand(&self) -> Option<&str> {
        self.run_prefix.first().map(String::as_str)
    }

    fn is_runner(&self, token: &str) -> bool {
        if token == self.program {
            return true;
        }
        // Allow `/usr/local/bin/uv` or `uv.exe` to name the runner too.
        Path::new(token)
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|stem| stem == self.program)
    }
}

impl Default for RunnerProfile {
    fn default() -> Self {
        Self::for_program("uv")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    /// Renders the command back into a string that resolves to the same argv.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Resolves `raw` against `runner`.
///
/// With `targets_runner` set, the tokens are already runner arguments and only
/// the program name is prepended. Otherwise a leading runner name is honoured and
/// anything else gets the run prefix, so an already wrapped command is never
/// wrapped twice.
pub fn resolve(
    raw: &str,
    targets_runner: bool,
    runner: &RunnerProfile,
) -> Result<ResolvedCommand, CommandError> {
    let tokens = shell_words::split(raw).map_err(|e| CommandError::Parse(e.to_string()))?;
    let Some(first) = tokens.first() else {
        return Err(CommandError::Empty);
    };

    let args = if runner.is_runner(first) {
        let rest = &tokens[1..];
        match rest.first().map(String::as_str) {
            Some(sub) if Some(sub) == runner.run_subcommand() => {
                if rest.starts_with(&runner.run_prefix) {
                    rest.to_vec()
                } else {
                    let mut args = runner.run_prefix.clone();
                    args.extend_from_slice(&rest[1..]);
                    args
                }
            }
            Some(sub) if runner.exec_subcommand.as_deref() == Some(sub) => rest.to_vec(),
            // Any other runner subcommand passes through unchanged too.
            _ => rest.to_vec(),
        }
    } else if targets_runner {
        tokens
    } else {
        let mut args = runner.run_prefix.clone();
        args.extend(tokens);
        args
    };

    Ok(ResolvedCommand {
        program: runner.program.clone(),
        args,
    })
}
