//! Bash entrypoints.

use super::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use super::subprocess;

/// Runs `bash <path> [args...]`. The script does not need an execute bit.
pub struct ShellExecutor;

impl ScriptExecutor for ShellExecutor {
    async fn execute(&self, script_path: &str, input: ScriptInput) -> Result<ScriptOutput, ScriptError> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg(script_path);
        subprocess::run_command(&mut cmd, input).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    use super::*;
    use crate::scripting::test_helpers::{default_input, write_temp_script};
    use crate::types::LogStream;

    async fn run_script(body: &str, input: ScriptInput) -> Result<ScriptOutput, ScriptError> {
        let script = write_temp_script(body);
        let path = script.path().to_str().unwrap().to_string();
        ShellExecutor.execute(&path, input).await
    }

    // -----------------------------------------------------------------------
    // Test: inputs reach the job
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn parameters_are_piped_to_stdin() {
        let output = run_script("cat\n", default_input()).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), r#"{"key":"value"}"#);
    }

    #[tokio::test]
    async fn env_is_set_and_scrubbed() {
        std::env::set_var("OUTPOST_SHELL_TEST_SECRET", "inherited");
        let mut input = default_input();
        input.env_vars = vec![("OUTPOST_RUN_ID".to_string(), "run-42".to_string())];
        input.env_remove = vec!["OUTPOST_SHELL_TEST_SECRET".to_string()];

        let output = run_script(
            "echo \"run=$OUTPOST_RUN_ID\"\necho \"secret=${OUTPOST_SHELL_TEST_SECRET:-unset}\"\n",
            input,
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, "run=run-42\nsecret=unset\n");
    }

    #[tokio::test]
    async fn args_follow_the_script_path() {
        let mut input = default_input();
        input.args = vec!["sample_data".to_string(), "1.1".to_string()];

        let output = run_script("echo \"$1 x$2\"\n", input).await.unwrap();

        assert_eq!(output.stdout.trim(), "sample_data x1.1");
    }

    #[tokio::test]
    async fn runs_in_the_requested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = default_input();
        input.working_directory = Some(dir.path().to_path_buf());

        let output = run_script("touch output_data.txt\n", input).await.unwrap();

        assert!(output.success());
        assert!(dir.path().join("output_data.txt").exists());
    }

    // -----------------------------------------------------------------------
    // Test: outcomes
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn nonzero_exit_is_output_not_error() {
        let output = run_script("echo 'connection refused' >&2\nexit 42\n", default_input())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 42);
        assert_eq!(output.stderr_tail(5), "connection refused");
    }

    #[tokio::test]
    async fn timeout_kills_the_job() {
        let mut input = default_input();
        input.timeout = Duration::from_millis(200);

        let result = run_script("sleep 60\n", input).await;

        assert_matches!(result, Err(ScriptError::Timeout { .. }));
    }

    #[tokio::test]
    async fn cancellation_terminates_promptly() {
        let input = default_input();
        let cancel = input.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result = run_script("sleep 60\n", input).await;

        assert_matches!(result, Err(ScriptError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    // -----------------------------------------------------------------------
    // Test: output capture
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn lines_stream_per_stream_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut input = default_input();
        input.output = Some(tx);

        run_script("echo one\necho two\necho slow >&2\n", input)
            .await
            .unwrap();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Ok(line) = rx.try_recv() {
            match line.stream {
                LogStream::Stdout => stdout.push(line.line),
                _ => stderr.push(line.line),
            }
        }
        assert_eq!(stdout, ["one", "two"]);
        assert_eq!(stderr, ["slow"]);
    }

    #[tokio::test]
    async fn last_json_line_is_parsed() {
        let output = run_script(
            "echo 'Extracted 3 rows'\necho '{\"rows\": 3}'\n",
            default_input(),
        )
        .await
        .unwrap();
        assert_eq!(output.parsed_output.unwrap()["rows"], 3);
    }
}
