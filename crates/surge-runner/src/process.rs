use std::process::{Command, Stdio};

use surge_core::OrchestrationError;
use tracing::debug;

/// Run a collaborator CLI to completion and return its stdout.
///
/// A spawn failure or non-zero exit becomes `OrchestrationError::Backend`
/// carrying the last non-empty stderr line.
pub(crate) fn run_capture(cmd: Command) -> Result<String, OrchestrationError> {
    let label = shell_join(&cmd);
    run_capture_labeled(cmd, label)
}

/// Like [`run_capture`], but logs `label` instead of the real argv. Used when
/// arguments carry secret values.
pub(crate) fn run_capture_labeled(
    mut cmd: Command,
    label: String,
) -> Result<String, OrchestrationError> {
    debug!(command = %label, "running collaborator command");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let output = cmd
        .output()
        .map_err(|e| OrchestrationError::backend(&label, e.to_string()))?;
    if !output.status.success() {
        let stderr_tail = String::from_utf8_lossy(&output.stderr)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no stderr output")
            .trim()
            .to_string();
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(OrchestrationError::backend(
            label,
            format!("exit {}: {}", code, stderr_tail),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn shell_join(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    for arg in cmd.get_args() {
        parts.push(shell_quote(&arg.to_string_lossy()));
    }
    parts.join(" ")
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+%".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Expand a leading `~/` against `$HOME`; `Command` never goes through a shell.
pub(crate) fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) if !home.is_empty() => {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        }
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_join_quotes_only_when_needed() {
        let mut cmd = Command::new("aws");
        cmd.args(["ec2", "create-tags", "--tags", "Key=Workflow Tag,Value=IAN_2022_7"]);
        assert_eq!(
            shell_join(&cmd),
            "aws ec2 create-tags --tags 'Key=Workflow Tag,Value=IAN_2022_7'"
        );
    }

    #[test]
    fn failing_command_reports_stderr_tail() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo first >&2; echo 'bucket not found' >&2; exit 3"]);
        let err = run_capture(cmd).expect_err("non-zero exit");
        let msg = err.to_string();
        assert!(msg.contains("exit 3"), "{}", msg);
        assert!(msg.contains("bucket not found"), "{}", msg);
    }

    #[test]
    fn successful_command_returns_stdout() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "printf '12345;cluster'"]);
        assert_eq!(run_capture(cmd).expect("run"), "12345;cluster");
    }
}
