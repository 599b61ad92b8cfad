//! Command normalization: tokenizing, env-prefix stripping, and shell
//! wrapper decomposition.
//!
//! These three steps turn a raw tool invocation into the command line the
//! policy engine evaluates and the argv the executor spawns. The grammar is
//! deliberately purpose-built: the allow/deny pipeline assumes exactly this
//! tokenization, and any drift between parser and policy is a security gap.

mod env_prefix;
mod tokenizer;
mod wrapper;

pub use env_prefix::{EnvAssignment, EnvPrefixError, StrippedCommand, strip_env_prefix};
pub use tokenizer::tokenize;
pub use wrapper::{ShellKind, WrapperError, WrapperParse, parse_wrapper};
