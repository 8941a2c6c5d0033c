//! Subprocess supervision.
//!
//! Decoders, the rescanner and the mailer all run as children of the
//! server. Spawning pipes whichever ends the caller asks for; reaping is
//! just awaiting [`Child::wait`], which the caller does from a local task
//! so exit statuses are delivered back into the event loop. Children are
//! killed on drop so an abandoned handle cannot leak a process.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::{Child as TokioChild, ChildStdin, ChildStdout, Command};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("empty command line")]
    EmptyCommand,
    #[error("failed to spawn {label}: {source}")]
    Spawn {
        label: String,
        source: std::io::Error,
    },
    #[error("i/o error talking to {label}: {source}")]
    Io {
        label: String,
        source: std::io::Error,
    },
}

/// A supervised subprocess.
pub struct Child {
    label: String,
    inner: TokioChild,
}

impl Child {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn id(&self) -> Option<u32> {
        self.inner.id()
    }

    /// Deliver SIGKILL without waiting. Reaping still happens via
    /// [`Child::wait`]. A child that already exited is not an error.
    pub fn start_kill(&mut self) {
        match self.inner.start_kill() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
            Err(e) => warn!(label = %self.label, error = %e, "failed to kill child"),
        }
    }

    /// Reap the child and return its exit status.
    pub async fn wait(&mut self) -> Result<std::process::ExitStatus, ChildError> {
        self.inner.wait().await.map_err(|source| ChildError::Io {
            label: self.label.clone(),
            source,
        })
    }
}

fn spawn(
    label: &str,
    argv: &[String],
    stdin: Stdio,
    stdout: Stdio,
) -> Result<Child, ChildError> {
    let (program, args) = argv.split_first().ok_or(ChildError::EmptyCommand)?;
    let inner = Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ChildError::Spawn {
            label: label.to_string(),
            source,
        })?;
    debug!(label, pid = inner.id(), program = %program, "spawned child");
    Ok(Child {
        label: label.to_string(),
        inner,
    })
}

/// Spawn a decoder: PCM arrives on its stdout.
pub fn spawn_decoder(label: &str, argv: &[String]) -> Result<(Child, ChildStdout), ChildError> {
    let mut child = spawn(label, argv, Stdio::null(), Stdio::piped())?;
    let stdout = child.inner.stdout.take().expect("stdout was piped");
    Ok((child, stdout))
}

/// Spawn an audio sink: PCM goes to its stdin.
pub fn spawn_speaker(label: &str, argv: &[String]) -> Result<(Child, ChildStdin), ChildError> {
    let mut child = spawn(label, argv, Stdio::piped(), Stdio::inherit())?;
    let stdin = child.inner.stdin.take().expect("stdin was piped");
    Ok((child, stdin))
}

/// Spawn a helper (rescanner and friends) sharing our stdio, and return
/// the handle for the caller to reap.
pub fn spawn_helper(label: &str, argv: &[String]) -> Result<Child, ChildError> {
    spawn(label, argv, Stdio::null(), Stdio::inherit())
}

/// Feed `message` to a sendmail-style command on stdin and reap it.
pub async fn run_mailer(
    label: &str,
    argv: &[String],
    message: &str,
) -> Result<std::process::ExitStatus, ChildError> {
    let mut child = spawn(label, argv, Stdio::piped(), Stdio::inherit())?;
    let mut stdin = child.inner.stdin.take().expect("stdin was piped");
    stdin
        .write_all(message.as_bytes())
        .await
        .map_err(|source| ChildError::Io {
            label: label.to_string(),
            source,
        })?;
    drop(stdin);
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_decoder_stdout_and_reap() {
        let (mut child, mut stdout) =
            spawn_decoder("echo", &argv(&["/bin/echo", "pcm-bytes"])).unwrap();
        let mut out = String::new();
        stdout.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "pcm-bytes\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_kill_is_reported_in_status() {
        let (mut child, _stdout) =
            spawn_decoder("sleeper", &argv(&["/bin/sleep", "600"])).unwrap();
        child.start_kill();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        assert!(matches!(
            spawn_helper("missing", &argv(&["/no/such/binary"])),
            Err(ChildError::Spawn { .. })
        ));
        assert!(matches!(spawn_helper("empty", &[]), Err(ChildError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_mailer_feeds_stdin() {
        // `cat` drains stdin and exits 0 only once we close it.
        let status = run_mailer("cat", &argv(&["/bin/cat"]), "To: x@y\n\nhello\n")
            .await
            .unwrap();
        assert!(status.success());
    }
}
