//! Direct execution of compiled job binaries such as `outpost-etl`.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use super::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use super::subprocess;

/// Runs the entrypoint itself, without an interpreter.
pub struct BinaryExecutor;

/// Reject paths that do not exist or carry no execute bit.
///
/// Bare names (`outpost-etl`) are skipped here; `PATH` lookup happens at
/// spawn time and a miss surfaces as [`ScriptError::NotFound`] there.
async fn check_executable(program: &str) -> Result<(), ScriptError> {
    if Path::new(program).components().count() <= 1 {
        return Ok(());
    }

    let mode = tokio::fs::metadata(program)
        .await
        .map_err(|_| ScriptError::NotFound(program.to_string()))?
        .permissions()
        .mode();
    if mode & 0o111 == 0 {
        return Err(ScriptError::PermissionDenied(format!(
            "{program} (mode {mode:#o})"
        )));
    }
    Ok(())
}

impl ScriptExecutor for BinaryExecutor {
    async fn execute(&self, program: &str, input: ScriptInput) -> Result<ScriptOutput, ScriptError> {
        check_executable(program).await?;
        let mut cmd = tokio::process::Command::new(program);
        subprocess::run_command(&mut cmd, input).await
    }
}
