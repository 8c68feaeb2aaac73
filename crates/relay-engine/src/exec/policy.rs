//! Static exec policy: a syntax guard plus a binary allowlist.
//!
//! Commands are never handed to a shell. A command line must be a single
//! direct invocation; anything that would need a shell to mean what it says
//! is rejected outright and never reaches the approval queue.

use std::collections::HashSet;

use relay_store::{AllowlistRepo, StoreError};

/// Characters and sequences that only make sense to a shell.
const FORBIDDEN: &[(&str, &str)] = &[
    (";", "command chaining"),
    ("&", "command chaining or backgrounding"),
    ("|", "pipes"),
    (">", "redirection"),
    ("<", "redirection"),
    ("`", "command substitution"),
    ("$(", "command substitution"),
    ("${", "variable expansion"),
    ("\n", "multi-line input"),
    ("\r", "multi-line input"),
];

/// Programs whose job is to run another program.
const LAUNCHERS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "fish", "csh", "tcsh", "pwsh", "powershell", "cmd",
    "env", "eval", "exec", "sudo", "su", "doas", "nohup", "xargs", "nice", "timeout", "watch",
    "script",
];

/// A command line split into a binary and its arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub binary: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecDecision {
    Allowed(ParsedCommand),
    /// Valid syntax, but the binary is not on any allowlist.
    NeedsApproval(ParsedCommand),
    Rejected(String),
}

pub struct ExecPolicy {
    static_allowlist: HashSet<String>,
    dynamic: AllowlistRepo,
}

impl ExecPolicy {
    pub fn new(static_allowlist: impl IntoIterator<Item = String>, dynamic: AllowlistRepo) -> Self {
        Self {
            static_allowlist: static_allowlist.into_iter().collect(),
            dynamic,
        }
    }

    pub fn evaluate(&self, command: &str) -> Result<ExecDecision, StoreError> {
        let parsed = match parse_command(command) {
            Ok(p) => p,
            Err(reason) => return Ok(ExecDecision::Rejected(reason)),
        };
        if self.static_allowlist.contains(&parsed.binary) || self.dynamic.contains(&parsed.binary)? {
            Ok(ExecDecision::Allowed(parsed))
        } else {
            Ok(ExecDecision::NeedsApproval(parsed))
        }
    }
}

/// Apply the syntax guard and split into words. Single and double quotes
/// group words; there is no escaping and no expansion.
pub fn parse_command(command: &str) -> Result<ParsedCommand, String> {
    for (pattern, what) in FORBIDDEN {
        if command.contains(pattern) {
            return Err(format!("{what} is not allowed (found {pattern:?})"));
        }
    }

    let words = split_words(command)?;
    let mut words = words.into_iter();
    let binary = words.next().ok_or_else(|| "empty command".to_string())?;

    let name = binary.rsplit('/').next().unwrap_or(binary.as_str());
    if LAUNCHERS.contains(&name) {
        return Err(format!("`{name}` launches other commands and is not allowed"));
    }

    Ok(ParsedCommand {
        binary,
        args: words.collect(),
    })
}

fn split_words(command: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        return Err("unterminated quote".into());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use relay_store::Database;

    use super::*;

    fn policy() -> (ExecPolicy, AllowlistRepo) {
        let db = Database::in_memory().unwrap();
        let policy = ExecPolicy::new(["ls".to_string(), "git".to_string()], AllowlistRepo::new(db.clone()));
        (policy, AllowlistRepo::new(db))
    }

    #[test]
    fn splits_quoted_words() {
        let parsed = parse_command(r#"git commit -m "fix the thing" --author='A B'"#).unwrap();
        assert_eq!(parsed.binary, "git");
        assert_eq!(parsed.args, vec!["commit", "-m", "fix the thing", "--author=A B"]);
        assert_eq!(parse_command("echo ''").unwrap().args, vec![""]);
    }

    #[test]
    fn rejects_shell_syntax() {
        for cmd in [
            "ls; rm -rf /",
            "ls && rm x",
            "ls | grep a",
            "ls > out.txt",
            "cat < in",
            "echo `id`",
            "echo $(id)",
            "echo ${HOME}",
            "ls\nrm x",
            "sleep 10 &",
        ] {
            assert!(parse_command(cmd).is_err(), "{cmd:?} should be rejected");
        }
    }

    #[test]
    fn rejects_launchers_and_bad_input() {
        assert!(parse_command("bash -c ls").is_err());
        assert!(parse_command("/bin/sh script.sh").is_err());
        assert!(parse_command("env FOO=1 ls").is_err());
        assert!(parse_command("   ").is_err());
        assert!(parse_command("echo 'open").is_err());
    }

    #[test]
    fn allowlist_decides_between_run_and_approval() {
        let (policy, dynamic) = policy();
        assert!(matches!(policy.evaluate("ls -la").unwrap(), ExecDecision::Allowed(_)));
        match policy.evaluate("curl https://example.com").unwrap() {
            ExecDecision::NeedsApproval(p) => assert_eq!(p.binary, "curl"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(policy.evaluate("ls | wc").unwrap(), ExecDecision::Rejected(_)));

        dynamic.add("curl", "approval:appr_1").unwrap();
        assert!(matches!(
            policy.evaluate("curl https://example.com").unwrap(),
            ExecDecision::Allowed(_)
        ));
    }
}
