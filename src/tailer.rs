/// The follow loop: resolve the target, trace it, relay decoded payloads,
/// and start over when the tracer goes away.
use crate::config::FollowConfig;
use crate::lookup::{self, LookupError, TARGET_PROCESS};
use crate::retry::{backoff_delay, RetryDecision, RetryPolicy};
use crate::signals::Shutdown;
use crate::trace_line::{self, WriteCall};
use crate::tracer::{TracerError, TracerSession};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Fatal errors. Lookup failures never show up here unless the lookup is bounded.
#[derive(Debug)]
pub enum TailError {
    Tracer(TracerError),
    /// Writing to the output failed (e.g. stdout closed).
    Output { source: std::io::Error },
    /// Bounded lookup ran out of attempts.
    TargetNotFound { attempts: u32, last: LookupError },
    /// The tracer kept failing without relaying anything.
    TracerFailing {
        failures: u32,
        last_exit: Option<i32>,
    },
}

impl std::fmt::Display for TailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TailError::Tracer(e) => write!(f, "{e}"),
            TailError::Output { source } => write!(f, "failed to write output: {source}"),
            TailError::TargetNotFound { attempts, last } => {
                write!(f, "target not found after {attempts} attempts: {last}")
            }
            TailError::TracerFailing {
                failures,
                last_exit,
            } => match last_exit {
                Some(code) => write!(
                    f,
                    "tracer failed {failures} times in a row (last exit status {code})"
                ),
                None => write!(
                    f,
                    "tracer failed {failures} times in a row (last killed by a signal)"
                ),
            },
        }
    }
}

impl std::error::Error for TailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TailError::Tracer(e) => Some(e),
            TailError::Output { source } => Some(source),
            TailError::TargetNotFound { last, .. } => Some(last),
            TailError::TracerFailing { .. } => None,
        }
    }
}

impl From<TracerError> for TailError {
    fn from(e: TracerError) -> Self {
        TailError::Tracer(e)
    }
}

/// What one tracer session did.
#[derive(Debug, Default)]
pub struct SessionReport {
    pub target_pid: u32,
    pub tracer_exit: Option<i32>,
    pub payloads: u64,
    pub bytes: u64,
    pub skipped_lines: u64,
    /// Payloads relayed only partially because of the tracer's string limit.
    pub truncated_payloads: u64,
    /// Ended by shutdown rather than by the tracer exiting.
    pub stopped: bool,
}

impl SessionReport {
    /// Ended on its own, relayed nothing, and the tracer reported failure.
    fn failed(&self) -> bool {
        !self.stopped && self.payloads == 0 && self.tracer_exit != Some(0)
    }
}

/// Totals over a whole run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub sessions: u64,
    pub payloads: u64,
    pub bytes: u64,
    pub skipped_lines: u64,
    pub lookup_failures: u64,
}

impl RunSummary {
    fn absorb(&mut self, report: &SessionReport) {
        self.sessions += 1;
        self.payloads += report.payloads;
        self.bytes += report.bytes;
        self.skipped_lines += report.skipped_lines;
    }
}

pub struct Tailer<'a> {
    config: &'a FollowConfig,
}

impl<'a> Tailer<'a> {
    pub fn new(config: &'a FollowConfig) -> Self {
        Self { config }
    }

    /// Follow the target until shutdown or a fatal error.
    ///
    /// Every tracer exit sends us back to lookup, so a restarted target is
    /// picked up under its new pid.
    pub async fn run<W>(&self, out: &mut W, mut shutdown: Shutdown) -> Result<RunSummary, TailError>
    where
        W: AsyncWrite + Unpin,
    {
        let lookup_cfg = &self.config.lookup;
        let tracer_cfg = &self.config.tracer;
        let mut policy = RetryPolicy::new(
            Duration::from_millis(lookup_cfg.retry_interval_ms),
            lookup_cfg.max_attempts,
        );
        let mut summary = RunSummary::default();
        let mut consecutive_failures = 0u32;

        while !shutdown.is_triggered() {
            let found = tokio::select! {
                found = lookup::find_pid(lookup_cfg, TARGET_PROCESS) => found,
                _ = shutdown.wait() => break,
            };

            let pid = match found {
                Ok(pid) => {
                    policy.reset();
                    pid
                }
                Err(e) => {
                    summary.lookup_failures += 1;
                    match &e {
                        LookupError::NotFound { .. } => tracing::debug!(error = %e, "target lookup failed"),
                        _ => tracing::warn!(error = %e, "target lookup failed"),
                    }
                    match policy.evaluate() {
                        RetryDecision::Wait { attempt, delay } => {
                            if attempt == 1 {
                                tracing::info!(target_name = TARGET_PROCESS, "waiting for target process");
                            }
                            if !sleep_unless_shutdown(delay, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                        RetryDecision::GiveUp => {
                            return Err(TailError::TargetNotFound {
                                attempts: policy.current_attempt(),
                                last: e,
                            });
                        }
                    }
                }
            };

            tracing::info!(pid, "target process found");
            let report = self.follow(pid, out, &mut shutdown).await?;
            summary.absorb(&report);
            if report.stopped {
                break;
            }

            if report.failed() {
                consecutive_failures += 1;
                tracing::warn!(
                    pid,
                    exit_code = ?report.tracer_exit,
                    consecutive_failures,
                    "tracer exited without relaying anything"
                );
                let max = tracer_cfg.max_consecutive_failures;
                if max > 0 && consecutive_failures >= max {
                    return Err(TailError::TracerFailing {
                        failures: consecutive_failures,
                        last_exit: report.tracer_exit,
                    });
                }
            } else {
                consecutive_failures = 0;
            }

            let delay = backoff_delay(
                Duration::from_millis(tracer_cfg.restart_delay_ms),
                consecutive_failures.saturating_sub(1),
                Duration::from_millis(tracer_cfg.max_restart_delay_ms),
            );
            if !sleep_unless_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        tracing::info!(
            sessions = summary.sessions,
            payloads = summary.payloads,
            bytes = summary.bytes,
            skipped_lines = summary.skipped_lines,
            lookup_failures = summary.lookup_failures,
            "stopped"
        );
        Ok(summary)
    }

    /// Run one tracer session against `pid`, relaying until the tracer's
    /// output closes or shutdown fires.
    pub async fn follow<W>(
        &self,
        pid: u32,
        out: &mut W,
        shutdown: &mut Shutdown,
    ) -> Result<SessionReport, TailError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut session = TracerSession::spawn(&self.config.tracer, pid)?;
        tracing::debug!(tracer_pid = session.pid(), target_pid = pid, "tracing target");
        let mut report = SessionReport {
            target_pid: pid,
            ..Default::default()
        };

        loop {
            let line = tokio::select! {
                line = session.next_line() => line?,
                _ = shutdown.wait() => {
                    report.stopped = true;
                    break;
                }
            };
            let Some(line) = line else { break };
            self.relay_line(&line, out, &mut report).await?;
        }

        report.tracer_exit = if report.stopped {
            let grace = Duration::from_millis(self.config.tracer.stop_grace_ms);
            session.terminate(grace).await?
        } else {
            session.finish().await?
        };

        tracing::info!(
            pid = report.target_pid,
            exit_code = ?report.tracer_exit,
            payloads = report.payloads,
            bytes = report.bytes,
            skipped_lines = report.skipped_lines,
            truncated_payloads = report.truncated_payloads,
            "tracer session ended"
        );
        Ok(report)
    }

    async fn relay_line<W>(
        &self,
        line: &str,
        out: &mut W,
        report: &mut SessionReport,
    ) -> Result<(), TailError>
    where
        W: AsyncWrite + Unpin,
    {
        let call = match trace_line::parse_line(line) {
            Ok(Some(call)) => call,
            Ok(None) => {
                let line = line.trim_end();
                if line.starts_with("strace:") {
                    tracing::info!(output = line, "tracer reported");
                } else if !line.is_empty() {
                    tracing::debug!(line, "ignoring non-write tracer output");
                }
                return Ok(());
            }
            Err(e) => {
                report.skipped_lines += 1;
                tracing::warn!(error = %e, line = line.trim_end(), "skipping malformed trace line");
                return Ok(());
            }
        };

        if !self.should_relay(&call) {
            return Ok(());
        }
        if call.truncated {
            report.truncated_payloads += 1;
            if report.truncated_payloads == 1 {
                tracing::warn!(
                    fd = call.fd,
                    length = call.length,
                    captured = call.payload.len(),
                    string_limit = self.config.tracer.string_limit,
                    "payload truncated at tracer string limit, output is incomplete; raise it with --string-limit"
                );
            } else {
                tracing::debug!(
                    fd = call.fd,
                    length = call.length,
                    captured = call.payload.len(),
                    "payload truncated at tracer string limit"
                );
            }
        }

        out.write_all(&call.payload)
            .await
            .map_err(|e| TailError::Output { source: e })?;
        out.flush()
            .await
            .map_err(|e| TailError::Output { source: e })?;

        report.payloads += 1;
        report.bytes += call.payload.len() as u64;
        Ok(())
    }

    fn should_relay(&self, call: &WriteCall) -> bool {
        if !call.succeeded() {
            tracing::debug!(fd = call.fd, result = ?call.result, "skipping failed write");
            return false;
        }
        let fds = &self.config.filter.fds;
        fds.is_empty() || fds.contains(&call.fd)
    }
}

/// Sleep for `delay`. Returns `false` if shutdown fired first.
async fn sleep_unless_shutdown(delay: Duration, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait() => false,
    }
}
