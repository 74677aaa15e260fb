//! ffmpeg subprocess management: spawn, progress, cancellation.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kartlap_common::error::{KartlapError, KartlapResult};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

/// Bytes of stderr kept for diagnostics.
const STDERR_TAIL_BYTES: usize = 4096;

/// How long ffmpeg gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Progress callback for encoding.
pub type ProgressCallback = Arc<dyn Fn(EncodeProgress) + Send + Sync>;

/// Encoding progress report.
#[derive(Debug, Clone)]
pub struct EncodeProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames encoded so far (estimated from output time).
    pub frames_rendered: u64,

    /// Total frames to encode.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    /// Current stage.
    pub stage: EncodeStage,
}

/// Stages of an encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStage {
    Preparing,
    Encoding,
    Finalizing,
    Complete,
}

impl EncodeProgress {
    /// Progress as an integer percentage.
    pub fn percent(&self) -> u8 {
        (self.progress.clamp(0.0, 1.0) * 100.0).floor() as u8
    }
}

/// A spawned ffmpeg process.
pub struct FfmpegProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    label: String,
    started: Instant,
}

impl FfmpegProcess {
    /// Spawn `ffmpeg` with `args`. `pipe_stdin` exposes stdin for streamed input.
    ///
    /// The arguments should include `-progress pipe:1` for progress reports.
    pub fn spawn(
        binary: &str,
        args: &[String],
        pipe_stdin: bool,
        label: impl Into<String>,
    ) -> KartlapResult<Self> {
        let label = label.into();
        tracing::debug!(args = ?args, label = %label, "Running ffmpeg");

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(if pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            KartlapError::encoding_attempt(&label, format!("failed to start {binary}: {e}"), "")
        })?;
        let stdin = child.stdin.take();

        tracing::info!(
            pid = child.id(),
            args_len = args.len(),
            label = %label,
            "ffmpeg process started"
        );

        Ok(Self {
            child,
            stdin,
            label,
            started: Instant::now(),
        })
    }

    /// Take the stdin pipe (only present when spawned with `pipe_stdin`).
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Wait for ffmpeg to finish, forwarding progress.
    ///
    /// On cancellation the process is terminated and `Cancelled` returned.
    /// A non-zero exit becomes `EncodingAttempt` carrying the stderr tail.
    pub async fn wait(
        mut self,
        expected_duration_secs: f64,
        total_frames: u64,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> KartlapResult<()> {
        // Close stdin unless the caller took it.
        drop(self.stdin.take());

        let stdout = self.child.stdout.take().ok_or_else(|| {
            KartlapError::encoding_attempt(&self.label, "failed to capture ffmpeg stdout", "")
        })?;
        let stderr = self.child.stderr.take().ok_or_else(|| {
            KartlapError::encoding_attempt(&self.label, "failed to capture ffmpeg stderr", "")
        })?;

        // Drain stderr concurrently to avoid ffmpeg blocking on a full stderr pipe.
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut output = Vec::new();
            match reader.read_to_end(&mut output).await {
                Ok(_) => tail_utf8(&output, STDERR_TAIL_BYTES),
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut latest = ProgressState::default();
        let mut last_advance_secs = 0.0f64;
        let mut last_advance_wall = Instant::now();

        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    self.terminate().await;
                    stderr_task.abort();
                    return Err(KartlapError::cancelled("render canceled"));
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed reading ffmpeg progress");
                    break;
                }
            };

            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            latest.update(key, value);
            if key != "progress" {
                continue;
            }

            if latest.out_time_secs > last_advance_secs + 0.001 {
                last_advance_secs = latest.out_time_secs;
                last_advance_wall = Instant::now();
            } else if last_advance_wall.elapsed().as_secs() >= 10 {
                tracing::warn!(
                    out_time_secs = latest.out_time_secs,
                    elapsed_secs = self.started.elapsed().as_secs_f64(),
                    label = %self.label,
                    "No ffmpeg progress advancement for 10s"
                );
                last_advance_wall = Instant::now();
            }

            if let Some(cb) = &progress {
                cb(progress_report(
                    &latest,
                    total_frames,
                    expected_duration_secs,
                    self.started.elapsed().as_secs_f64(),
                ));
            }
        }

        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = self.child.wait() => Some(status),
        };
        let Some(status) = exited else {
            self.terminate().await;
            stderr_task.abort();
            return Err(KartlapError::cancelled("render canceled"));
        };
        let status = status.map_err(|e| {
            KartlapError::encoding_attempt(&self.label, format!("failed to wait on ffmpeg: {e}"), "")
        })?;

        let diagnostics = stderr_task
            .await
            .unwrap_or_else(|_| "<failed to join stderr reader>".to_string());

        if !status.success() {
            return Err(KartlapError::encoding_attempt(
                &self.label,
                format!("ffmpeg exited with {status}"),
                diagnostics.trim(),
            ));
        }

        if let Some(cb) = &progress {
            cb(EncodeProgress {
                progress: 1.0,
                frames_rendered: total_frames,
                total_frames,
                eta_secs: 0.0,
                stage: EncodeStage::Complete,
            });
        }

        tracing::info!(
            label = %self.label,
            elapsed_secs = self.started.elapsed().as_secs_f64(),
            "ffmpeg finished"
        );
        Ok(())
    }

    /// Ask ffmpeg to stop, then kill it if it does not exit in time.
    async fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            // SAFETY: signalling our own child process by pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
                .await
                .is_ok()
            {
                tracing::info!(label = %self.label, "ffmpeg terminated");
                return;
            }
        }

        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, label = %self.label, "Failed to kill ffmpeg");
        } else {
            tracing::info!(label = %self.label, "ffmpeg killed");
        }
    }
}

/// Run a short ffmpeg command to completion and capture its output.
pub async fn run_capture(binary: &str, args: &[&str], timeout: Duration) -> KartlapResult<String> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| KartlapError::probe(format!("{binary} {} timed out", args.join(" "))))?
    .map_err(|e| KartlapError::probe(format!("failed to run {binary}: {e}")))?;

    if !output.status.success() {
        return Err(KartlapError::probe(format!(
            "{binary} {} failed ({}): {}",
            args.join(" "),
            output.status,
            tail_utf8(&output.stderr, STDERR_TAIL_BYTES).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn tail_utf8(bytes: &[u8], max: usize) -> String {
    let start = bytes.len().saturating_sub(max);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

#[derive(Debug, Default)]
struct ProgressState {
    out_time_secs: f64,
    complete: bool,
}

impl ProgressState {
    fn update(&mut self, key: &str, value: &str) {
        match key {
            // ffmpeg reports microseconds under both names.
            "out_time_ms" | "out_time_us" => {
                if let Ok(us) = value.parse::<f64>() {
                    self.out_time_secs = us / 1_000_000.0;
                }
            }
            "progress" => {
                self.complete = value == "end";
            }
            _ => {}
        }
    }
}

fn progress_report(
    state: &ProgressState,
    total_frames: u64,
    expected_duration_secs: f64,
    elapsed_secs: f64,
) -> EncodeProgress {
    let progress = if expected_duration_secs <= 0.0 {
        0.0
    } else {
        (state.out_time_secs / expected_duration_secs).clamp(0.0, 1.0)
    };

    let frames_rendered = (progress * total_frames as f64).round() as u64;
    let eta_secs = if progress > 0.0 {
        (elapsed_secs / progress) - elapsed_secs
    } else {
        0.0
    }
    .max(0.0);

    EncodeProgress {
        progress: if state.complete { 1.0 } else { progress },
        frames_rendered,
        total_frames,
        eta_secs,
        stage: if state.complete {
            EncodeStage::Finalizing
        } else {
            EncodeStage::Encoding
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_state_parses_microseconds() {
        let mut state = ProgressState::default();
        state.update("out_time_us", "5000000");
        assert!((state.out_time_secs - 5.0).abs() < 1e-9);
        state.update("out_time_ms", "7500000");
        assert!((state.out_time_secs - 7.5).abs() < 1e-9);
        state.update("out_time_us", "N/A");
        assert!((state.out_time_secs - 7.5).abs() < 1e-9);
        state.update("progress", "end");
        assert!(state.complete);
    }

    #[test]
    fn test_progress_report_fraction_and_eta() {
        let state = ProgressState {
            out_time_secs: 30.0,
            complete: false,
        };
        let report = progress_report(&state, 3600, 120.0, 10.0);
        assert!((report.progress - 0.25).abs() < 1e-9);
        assert_eq!(report.frames_rendered, 900);
        assert!((report.eta_secs - 30.0).abs() < 1e-9);
        assert_eq!(report.percent(), 25);
        assert_eq!(report.stage, EncodeStage::Encoding);
    }

    #[test]
    fn test_progress_report_complete() {
        let state = ProgressState {
            out_time_secs: 119.0,
            complete: true,
        };
        let report = progress_report(&state, 100, 120.0, 10.0);
        assert_eq!(report.progress, 1.0);
        assert_eq!(report.stage, EncodeStage::Finalizing);
    }

    #[test]
    fn test_tail_utf8_keeps_end() {
        assert_eq!(tail_utf8(b"hello world", 5), "world");
        assert_eq!(tail_utf8(b"hi", 5), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_encoding_attempt_error() {
        let args = vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()];
        let process = FfmpegProcess::spawn("sh", &args, false, "software").unwrap();
        let err = process
            .wait(1.0, 1, None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            KartlapError::EncodingAttempt {
                backend,
                diagnostics,
                ..
            } => {
                assert_eq!(backend, "software");
                assert_eq!(diagnostics, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_process() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let process = FfmpegProcess::spawn("sh", &args, false, "software").unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = process.wait(1.0, 1, None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_progress_lines_are_forwarded() {
        let script = "printf 'out_time_us=500000\\nprogress=continue\\nout_time_us=1000000\\nprogress=end\\n'";
        let args = vec!["-c".to_string(), script.to_string()];
        let process = FfmpegProcess::spawn("sh", &args, false, "software").unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |p: EncodeProgress| {
            sink.lock().unwrap().push(p.percent());
        });
        process
            .wait(1.0, 30, Some(cb), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![50, 100, 100]);
    }
}
