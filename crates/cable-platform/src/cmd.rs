//! External command execution boundary.
//!
//! The only place the process spawns anything. Commands are dispatched
//! argv-style with `tokio::process`; no shell, no string evaluation.

use std::io;
use std::process::ExitStatus;

use tokio::process::Command;
use tracing::debug;

/// Error type for external command dispatch.
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// Run `program` with `args`, wait for it, and require a zero exit status.
pub async fn run(program: &str, args: &[String]) -> Result<(), CmdError> {
    debug!(%program, ?args, "running external command");
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| CmdError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(CmdError::Failed {
            program: program.to_string(),
            status,
        });
    }
    Ok(())
}

/// Run `program` with `args` and capture its stdout (UTF-8, lossy).
pub async fn run_capture(program: &str, args: &[&str]) -> Result<String, CmdError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| CmdError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(CmdError::Failed {
            program: program.to_string(),
            status: output.status,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
