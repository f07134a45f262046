//! Spawning external commands with streamed output and a hard timeout.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::command::{CommandSpec, ExitOutcome};
use crate::error::RunError;
use crate::sink::{OutputSink, Stream};

/// Runs one command to completion.
///
/// A non-zero exit is reported through [`ExitOutcome`], never as an `Err`;
/// callers decide what an exit code means for their stage.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink) -> Result<ExitOutcome, RunError>;
}

/// Runs commands as tokio child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink) -> Result<ExitOutcome, RunError> {
        let program = spec.program.display().to_string();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        debug!(command = %spec, cwd = ?spec.cwd, "spawning process");
        let mut child = cmd
            .spawn()
            .map_err(|source| RunError::Spawn { program: program.clone(), source })?;

        let waited = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, drive(&mut child, sink)).await {
                Ok(result) => Some(result),
                Err(_) => None,
            },
            None => Some(drive(&mut child, sink).await),
        };

        match waited {
            Some(Ok(status)) => Ok(outcome(status, false)),
            Some(Err(source)) => Err(RunError::Io { program, source }),
            None => {
                warn!(command = %spec, timeout = ?spec.timeout, "process timed out, killing");
                if let Err(e) = child.kill().await {
                    warn!(command = %spec, error = %e, "failed to kill timed out process");
                }
                let status = child
                    .wait()
                    .await
                    .map_err(|source| RunError::Io { program, source })?;
                Ok(outcome(status, true))
            }
        }
    }
}

/// Pump both pipes into the sink, then reap the child.
async fn drive(child: &mut Child, sink: &dyn OutputSink) -> std::io::Result<ExitStatus> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(pump(stdout, Stream::Stdout, sink), pump(stderr, Stream::Stderr, sink));
    child.wait().await
}

async fn pump<R>(reader: Option<R>, stream: Stream, sink: &dyn OutputSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(trim_newline(&buf));
                sink.line(stream, &line).await;
            }
            Err(e) => {
                debug!(?stream, error = %e, "stopped reading process output");
                break;
            }
        }
    }
}

fn trim_newline(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    bytes.strip_suffix(b"\r").unwrap_or(bytes)
}

fn outcome(status: ExitStatus, timed_out: bool) -> ExitOutcome {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitOutcome { code: status.code(), signal, timed_out }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::sink::CaptureSink;
    use std::time::{Duration, Instant};

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[tokio::test]
    async fn streams_lines_to_sink() {
        let sink = CaptureSink::new();
        let outcome = ProcessRunner
            .run(&sh("echo one; echo two; echo oops >&2"), &sink)
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(sink.stdout(), vec!["one", "two"]);
        assert_eq!(sink.stderr(), vec!["oops"]);
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_outcome() {
        let outcome = ProcessRunner.run(&sh("exit 3"), &CaptureSink::new()).await.unwrap();
        assert_eq!(outcome.code, Some(3));
        assert!(!outcome.success());
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let err = ProcessRunner
            .run(&CommandSpec::new("/definitely/not/here"), &CaptureSink::new())
            .await
            .unwrap_err();
        assert!(err.is_spawn());
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let spec = sh("sleep 30").timeout(Duration::from_millis(200));
        let started = Instant::now();
        let outcome = ProcessRunner.run(&spec, &CaptureSink::new()).await.unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert_eq!(outcome.signal, Some(9));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn latin1_output_is_decoded_lossily_and_drained() {
        let sink = CaptureSink::new();
        let script = "printf 'caf\\351\\n'; sleep 0.2; i=0; while [ $i -lt 3000 ]; do echo line $i; i=$((i+1)); done; exit 0";
        let outcome = ProcessRunner.run(&sh(script), &sink).await.unwrap();

        assert!(outcome.success(), "{outcome:?}");
        let out = sink.stdout();
        assert_eq!(out.len(), 3001);
        assert_eq!(out[0], "caf\u{FFFD}");
        assert_eq!(out[3000], "line 2999");
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CaptureSink::new();
        let spec = sh("echo $CUDA_VISIBLE_DEVICES; pwd").cwd(dir.path()).env("CUDA_VISIBLE_DEVICES", "2");
        ProcessRunner.run(&spec, &sink).await.unwrap();

        let out = sink.stdout();
        assert_eq!(out[0], "2");
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(&out[1]).canonicalize().unwrap(), canonical);
    }
}
