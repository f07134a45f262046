//! Test doubles for code that drives a [`CommandRunner`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{CommandSpec, ExitOutcome};
use crate::error::RunError;
use crate::runner::CommandRunner;
use crate::sink::{OutputSink, Stream};

/// What a scripted command does.
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    pub exit_code: i32,
    pub delay: Duration,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub timed_out: bool,
    pub spawn_error: bool,
}

impl Scripted {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self { exit_code: code, ..Default::default() }
    }

    pub fn spawn_failure() -> Self {
        Self { spawn_error: true, ..Default::default() }
    }

    pub fn timeout() -> Self {
        Self { timed_out: true, exit_code: -1, ..Default::default() }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    pub fn with_stderr(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }
}

type Behavior = dyn Fn(&CommandSpec) -> Scripted + Send + Sync;

/// A [`CommandRunner`] whose commands are answered by a closure.
///
/// The closure runs synchronously when the command "starts" and may create
/// the files the real tool would have written. Every call is recorded, as
/// is the highest number of commands in flight at once.
pub struct ScriptedRunner {
    behavior: Box<Behavior>,
    calls: Mutex<Vec<CommandSpec>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new<F>(behavior: F) -> Arc<Self>
    where
        F: Fn(&CommandSpec) -> Scripted + Send + Sync + 'static,
    {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Every command succeeds immediately.
    pub fn succeeding() -> Arc<Self> {
        Self::new(|_| Scripted::ok())
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Calls whose program file name is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls().into_iter().filter(|c| c.program_name() == program).collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec, sink: &dyn OutputSink) -> Result<ExitOutcome, RunError> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(spec.clone());
        let script = (self.behavior)(spec);
        if script.spawn_error {
            return Err(RunError::Spawn {
                program: spec.program.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        for line in &script.stdout {
            sink.line(Stream::Stdout, line).await;
        }
        for line in &script.stderr {
            sink.line(Stream::Stderr, line).await;
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ExitOutcome {
            code: Some(script.exit_code),
            signal: if script.timed_out { Some(9) } else { None },
            timed_out: script.timed_out,
        })
    }
}
