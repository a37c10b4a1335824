//! Multi-runtime job execution.
//!
//! Provides executor types and implementations for shell, Python, and binary
//! runtimes. All subprocess management is pure (no network or database
//! access) and lives in the `core` crate for isolation and testability.

pub mod binary;
pub mod executor;
pub mod python;
pub mod shell;
pub mod subprocess;

use crate::types::{Entrypoint, Runtime};

use self::binary::BinaryExecutor;
use self::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use self::python::PythonExecutor;
use self::shell::ShellExecutor;

/// Run a deployment entrypoint with the executor matching its runtime.
///
/// The entrypoint's own arguments come first, followed by any extra
/// arguments already present in `input`.
pub async fn execute_entrypoint(
    entrypoint: &Entrypoint,
    mut input: ScriptInput,
) -> Result<ScriptOutput, ScriptError> {
    let mut args = entrypoint.args.clone();
    args.append(&mut input.args);
    input.args = args;

    match entrypoint.runtime {
        Runtime::Shell => ShellExecutor.execute(&entrypoint.path, input).await,
        Runtime::Python => PythonExecutor::default().execute(&entrypoint.path, input).await,
        Runtime::Binary => BinaryExecutor.execute(&entrypoint.path, input).await,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::test_helpers::{default_input, write_temp_script};

    #[tokio::test]
    async fn entrypoint_args_precede_input_args() {
        let script = write_temp_script("echo \"$@\"\n");
        let entrypoint = Entrypoint {
            runtime: Runtime::Shell,
            path: script.path().to_str().expect("path").to_string(),
            args: vec!["--table".to_string(), "sample_data".to_string()],
        };
        let mut input = default_input();
        input.args = vec!["--dry-run".to_string()];

        let output = execute_entrypoint(&entrypoint, input).await.expect("execute");
        assert_eq!(output.stdout.trim(), "--table sample_data --dry-run");
    }
}
