//! Child-process plumbing shared by the local and sandbox backends.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::EnvironmentError;

/// Merged output and exit code of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub output: String,
    pub return_code: i32,
}

/// Run `command` to completion with stdout and stderr merged in arrival
/// order.
///
/// On timeout the whole process group is killed and
/// [`EnvironmentError::Timeout`] carries whatever output was captured so far.
pub async fn run_with_timeout(
    mut command: Command,
    timeout: Duration,
) -> Result<ProcessOutput, EnvironmentError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut readers: Vec<JoinHandle<()>> = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Arc::clone(&buffer)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Arc::clone(&buffer)));
    }

    let finished = tokio::time::timeout(timeout, async {
        let status = child.wait().await?;
        // Readers finish once every holder of the pipes has exited.
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
        Ok::<_, std::io::Error>(status)
    })
    .await;

    match finished {
        Ok(status) => {
            let status = status?;
            Ok(ProcessOutput {
                output: take_output(&buffer),
                return_code: status.code().unwrap_or(-1),
            })
        }
        Err(_) => {
            kill_process_tree(&mut child).await;
            for reader in &readers {
                reader.abort();
            }
            Err(EnvironmentError::Timeout {
                seconds: timeout.as_secs(),
                partial_output: take_output(&buffer),
            })
        }
    }
}

fn spawn_reader<R>(mut reader: R, buffer: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&chunk[..n]),
            }
        }
    })
}

fn take_output(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = buffer.lock().unwrap_or_else(|e| e.into_inner());
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn kill_process_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own process group; take grandchildren down too.
            let _ = Command::new("kill")
                .args(["-KILL", "--", &format!("-{pid}")])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already exited before kill");
    }
}
