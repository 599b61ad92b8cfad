//! Leading `KEY=value` extraction from an invocation.

use thiserror::Error;

/// A single `KEY=value` assignment found ahead of the command.
///
/// The value keeps everything after the first `=`, so `A=b=c` round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAssignment {
    pub name: String,
    pub value: String,
}

impl EnvAssignment {
    /// Rebuild the original `KEY=value` token.
    pub fn to_token(&self) -> String {
        format!("{}={}", self.name, self.value)
    }
}

/// The invocation with env assignments separated out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrippedCommand {
    pub env_vars: Vec<EnvAssignment>,
    pub cmd: String,
    pub args: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvPrefixError {
    #[error("no command found after environment variable assignments")]
    NoCommand,
}

/// Extract leading `KEY=value` assignments from `cmd` + `args`.
///
/// A token is an assignment iff it contains `=` and does not start with `-`,
/// which keeps `--flag=value` arguments intact. The first non-assignment
/// token becomes the command; everything after it is passed through
/// untouched.
pub fn strip_env_prefix(cmd: &str, args: &[String]) -> Result<StrippedCommand, EnvPrefixError> {
    let mut tokens = Vec::with_capacity(1 + args.len());
    tokens.push(cmd.to_string());
    tokens.extend(args.iter().cloned());

    let mut env_vars = Vec::new();
    for (index, token) in tokens.iter().enumerate() {
        if is_env_assignment(token) {
            let (name, value) = token.split_once('=').unwrap_or((token.as_str(), ""));
            env_vars.push(EnvAssignment {
                name: name.to_string(),
                value: value.to_string(),
            });
        } else {
            return Ok(StrippedCommand {
                env_vars,
                cmd: token.clone(),
                args: tokens[index + 1..].to_vec(),
            });
        }
    }

    Err(EnvPrefixError::NoCommand)
}

fn is_env_assignment(token: &str) -> bool {
    token.contains('=') && !token.starts_with('-')
}
