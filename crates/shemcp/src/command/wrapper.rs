//! Recognition and decomposition of `bash -c` / `sh -c` wrapper commands.
//!
//! When an agent wraps its real command in a shell (`bash -lc "git push"`),
//! the policy must see the inner command. This parser pulls the `-c` string
//! out, records the user's other flags so they can be preserved on respawn,
//! and reports which shell to use.

use thiserror::Error;

use super::tokenizer::tokenize;

/// Which shell a wrapper invocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Sh,
}

impl ShellKind {
    /// Absolute path of the shell binary to spawn.
    pub fn program(&self) -> &'static str {
        match self {
            ShellKind::Bash => "/bin/bash",
            ShellKind::Sh => "/bin/sh",
        }
    }

    /// Strict-mode flags inserted ahead of `-c`.
    ///
    /// `pipefail` is not POSIX, so sh only gets `-e`.
    pub fn strict_flags(&self) -> &'static [&'static str] {
        match self {
            ShellKind::Bash => &["-o", "pipefail", "-o", "errexit"],
            ShellKind::Sh => &["-e"],
        }
    }
}

/// The decomposition of a (possibly) wrapped invocation.
#[derive(Debug, Clone)]
pub struct WrapperParse {
    /// Whether `cmd` was recognized as a shell wrapper with a `-c` string.
    pub is_wrapper: bool,
    /// Detected shell, when `is_wrapper`.
    pub shell: Option<ShellKind>,
    /// Whether `-l` was present anywhere in the short flags.
    pub should_use_login: bool,
    /// The argument to `-c`, verbatim.
    pub command_string: Option<String>,
    /// User flags to re-emit ahead of the strict flags on respawn.
    pub flags_before_command: Vec<String>,
    /// Index into the original args just past the command string; trailing
    /// positional parameters start here.
    pub args_after_command: Option<usize>,
    /// What the policy pipeline should treat as the executable: the first
    /// token of the command string for wrappers, `cmd` itself otherwise.
    pub executable_to_check: String,
}

impl WrapperParse {
    fn direct(cmd: &str) -> Self {
        Self {
            is_wrapper: false,
            shell: None,
            should_use_login: false,
            command_string: None,
            flags_before_command: Vec::new(),
            args_after_command: None,
            executable_to_check: cmd.to_string(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WrapperError {
    /// Flag scan finished without ever seeing `-c`.
    #[error("missing -c command string")]
    MissingCommandFlag,
    /// `-c` was the last thing on the line.
    #[error("missing command string after -c")]
    MissingCommandString,
    /// The `-c` argument tokenized to nothing.
    #[error("empty command string")]
    EmptyCommandString,
}

/// Decompose `cmd` + `args` as a shell wrapper if it is one.
///
/// Only `bash` and `sh` (matched on the basename, so `/bin/bash` counts) are
/// recognized, and only when the first argument is a flag. Anything else is
/// returned as a direct command with `executable_to_check = cmd`.
pub fn parse_wrapper(cmd: &str, args: &[String]) -> Result<WrapperParse, WrapperError> {
    let shell = match basename(cmd) {
        "bash" => ShellKind::Bash,
        "sh" => ShellKind::Sh,
        _ => return Ok(WrapperParse::direct(cmd)),
    };
    if !args.first().is_some_and(|a| a.starts_with('-')) {
        return Ok(WrapperParse::direct(cmd));
    }

    let mut flags = Vec::new();
    let mut login = false;
    let mut expect_value = false;

    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];

        if expect_value && !arg.starts_with('-') {
            flags.push(arg.clone());
            expect_value = false;
            i += 1;
            continue;
        }
        expect_value = false;

        if let Some(cluster) = short_cluster(arg) {
            let mut expect_command = false;
            for ch in cluster.chars() {
                match ch {
                    'l' => login = true,
                    'c' => expect_command = true,
                    // -o takes a value (e.g. `-o posix`)
                    'o' => {
                        flags.push("-o".to_string());
                        expect_value = true;
                    }
                    other => flags.push(format!("-{other}")),
                }
            }
            if expect_command {
                let Some(command_string) = args.get(i + 1) else {
                    return Err(WrapperError::MissingCommandString);
                };
                let tokens = tokenize(command_string);
                let Some(first_token) = tokens.first() else {
                    return Err(WrapperError::EmptyCommandString);
                };
                return Ok(WrapperParse {
                    is_wrapper: true,
                    shell: Some(shell),
                    should_use_login: login,
                    command_string: Some(command_string.clone()),
                    flags_before_command: flags,
                    args_after_command: Some(i + 2),
                    executable_to_check: first_token.clone(),
                });
            }
        } else if arg.starts_with("--") {
            flags.push(arg.clone());
        } else {
            // A positional token before any -c: this is a script invocation,
            // not a wrapper. Policy sees the whole line.
            return Ok(WrapperParse::direct(cmd));
        }
        i += 1;
    }

    Err(WrapperError::MissingCommandFlag)
}

/// Returns the letters of a short-flag cluster (`-lc` → `lc`), or `None` for
/// long flags, a bare `-`, and positional tokens.
fn short_cluster(arg: &str) -> Option<&str> {
    let rest = arg.strip_prefix('-')?;
    if rest.is_empty() || rest.starts_with('-') {
        return None;
    }
    Some(rest)
}

fn basename(cmd: &str) -> &str {
    cmd.rsplit('/').next().unwrap_or(cmd)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_non_shell_command_is_direct() {
        let parse = parse_wrapper("git", &args(&["-c", "core.pager=cat", "log"])).unwrap();
        assert!(!parse.is_wrapper);
        assert_eq!(parse.executable_to_check, "git");
        assert!(!parse.should_use_login);
    }

    #[test]
    fn test_shell_without_flags_is_direct() {
        let parse = parse_wrapper("bash", &args(&["script.sh"])).unwrap();
        assert!(!parse.is_wrapper);
        assert_eq!(parse.executable_to_check, "bash");
    }

    #[test]
    fn test_plain_dash_c() {
        let parse = parse_wrapper("bash", &args(&["-c", "git status"])).unwrap();
        assert!(parse.is_wrapper);
        assert_eq!(parse.shell, Some(ShellKind::Bash));
        assert!(!parse.should_use_login);
        assert_eq!(parse.command_string.as_deref(), Some("git status"));
        assert!(parse.flags_before_command.is_empty());
        assert_eq!(parse.args_after_command, Some(2));
        assert_eq!(parse.executable_to_check, "git");
    }

    #[test]
    fn test_lc_cluster_sets_login() {
        let parse = parse_wrapper("bash", &args(&["-lc", "echo hi"])).unwrap();
        assert!(parse.is_wrapper);
        assert!(parse.should_use_login);
        // Bare -l never re-emits into the preserved flags.
        assert!(parse.flags_before_command.is_empty());
    }

    #[test]
    fn test_separate_l_then_c() {
        let parse = parse_wrapper("sh", &args(&["-l", "-c", "echo hi"])).unwrap();
        assert!(parse.is_wrapper);
        assert_eq!(parse.shell, Some(ShellKind::Sh));
        assert!(parse.should_use_login);
        assert_eq!(parse.args_after_command, Some(3));
    }

    #[test]
    fn test_other_letters_are_reemitted() {
        let parse = parse_wrapper("bash", &args(&["-xec", "make all"])).unwrap();
        assert!(parse.is_wrapper);
        assert_eq!(parse.flags_before_command, args(&["-x", "-e"]));
        assert_eq!(parse.command_string.as_deref(), Some("make all"));
    }

    #[test]
    fn test_long_flags_are_preserved() {
        let parse = parse_wrapper("bash", &args(&["--norc", "-c", "echo hi"])).unwrap();
        assert!(parse.is_wrapper);
        assert_eq!(parse.flags_before_command, args(&["--norc"]));
    }

    #[test]
    fn test_o_flag_consumes_its_value() {
        let parse = parse_wrapper("bash", &args(&["-o", "posix", "-c", "echo hi"])).unwrap();
        assert!(parse.is_wrapper);
        assert_eq!(parse.flags_before_command, args(&["-o", "posix"]));
        assert_eq!(parse.args_after_command, Some(4));
    }

    #[test]
    fn test_trailing_positional_args_index() {
        let parse =
            parse_wrapper("bash", &args(&["-c", "echo \"$@\"", "--", "a", "b"])).unwrap();
        assert_eq!(parse.args_after_command, Some(2));
    }

    #[test]
    fn test_absolute_shell_path_is_recognized() {
        let parse = parse_wrapper("/bin/bash", &args(&["-c", "pwd"])).unwrap();
        assert!(parse.is_wrapper);
        assert_eq!(parse.shell, Some(ShellKind::Bash));
    }

    #[test]
    fn test_missing_c_flag() {
        let err = parse_wrapper("bash", &args(&["-l"])).unwrap_err();
        assert_eq!(err, WrapperError::MissingCommandFlag);
        assert_eq!(err.to_string(), "missing -c command string");
    }

    #[test]
    fn test_missing_command_string_after_c() {
        let err = parse_wrapper("bash", &args(&["-lc"])).unwrap_err();
        assert_eq!(err, WrapperError::MissingCommandString);
        assert_eq!(err.to_string(), "missing command string after -c");
    }

    #[test]
    fn test_empty_command_string() {
        let err = parse_wrapper("bash", &args(&["-c", "   "])).unwrap_err();
        assert_eq!(err, WrapperError::EmptyCommandString);

        let err = parse_wrapper("bash", &args(&["-c", ""])).unwrap_err();
        assert_eq!(err, WrapperError::EmptyCommandString);
    }

    #[test]
    fn test_strict_flags_per_shell() {
        assert_eq!(
            ShellKind::Bash.strict_flags(),
            &["-o", "pipefail", "-o", "errexit"]
        );
        assert_eq!(ShellKind::Sh.strict_flags(), &["-e"]);
    }
}
