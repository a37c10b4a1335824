//! Python entrypoints.
//!
//! Runs the script with an unbuffered interpreter (`-u`) so that log
//! lines reach the agent as they are printed, not when the job exits.

use super::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use super::subprocess;

/// Default interpreter looked up on `PATH`.
const DEFAULT_INTERPRETER: &str = "python3";

/// Executor for Python scripts.
pub struct PythonExecutor {
    interpreter: String,
}

impl Default for PythonExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPRETER.to_string())
    }
}

impl PythonExecutor {
    /// Create an executor using the given interpreter (name or path).
    pub fn new(interpreter: String) -> Self {
        Self { interpreter }
    }
}

impl ScriptExecutor for PythonExecutor {
    async fn execute(
        &self,
        script_path: &str,
        input: ScriptInput,
    ) -> Result<ScriptOutput, ScriptError> {
        if tokio::fs::metadata(script_path).await.is_err() {
            return Err(ScriptError::NotFound(script_path.to_string()));
        }

        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg("-u").arg(script_path);
        subprocess::run_command(&mut cmd, input).await
    }
}
