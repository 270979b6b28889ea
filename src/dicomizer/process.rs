//! Bounded execution of external converter processes.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ConversionError;

/// Bytes of stderr kept in a failure cause.
const STDERR_TAIL_BYTES: usize = 4096;

/// Run `command` to completion, killing it after `timeout`.
///
/// Non-zero exit is reported as [`ConversionError::ExitStatus`] with the
/// tail of stderr.
pub(crate) async fn run(
    program: &str,
    mut command: Command,
    timeout: Duration,
) -> Result<Output, ConversionError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(program, command = ?command.as_std(), "starting converter process");
    let child = command.spawn().map_err(|e| ConversionError::Launch {
        program: program.to_string(),
        message: e.to_string(),
    })?;

    // Dropping the wait future drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ConversionError::Io(format!("{program}: {e}")))?,
        Err(_) => {
            warn!(program, seconds = timeout.as_secs(), "converter timed out, killed");
            return Err(ConversionError::Timeout {
                program: program.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    if !output.status.success() {
        return Err(ConversionError::ExitStatus {
            program: program.to_string(),
            code: output.status.code(),
            stderr: stderr_tail(&output.stderr),
        });
    }
    Ok(output)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
