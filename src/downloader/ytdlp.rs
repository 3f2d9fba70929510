use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::AppConfig;
use crate::downloader::catalog;
use crate::downloader::fallback::ErrorClassification;
use crate::downloader::progress::{self, ProgressParser};
use crate::downloader::supervisor::{EventEmitter, EventSender, ProcessHandle, SpawnRequest, Supervisor};
use crate::errors::{AppError, Result};
use crate::utils;

/// Output template inside the job's staging directory.
const OUTPUT_TEMPLATE: &str = "%(title)s [%(id)s].%(ext)s";

#[derive(Debug, Clone)]
pub struct YtDlpSettings {
    pub ytdlp_path: String,
    pub ffmpeg_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub cookies_file: Option<PathBuf>,
    pub cancel_grace: Duration,
    /// Number of stderr lines kept for failure diagnostics.
    pub stderr_tail: usize,
}

impl Default for YtDlpSettings {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".to_string(),
            ffmpeg_path: None,
            proxy: None,
            cookies_file: None,
            cancel_grace: Duration::from_secs(3),
            stderr_tail: 20,
        }
    }
}

impl YtDlpSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ytdlp_path: config.ytdlp_path.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            proxy: config.proxy.clone(),
            cookies_file: config.cookies_file.clone(),
            cancel_grace: config.cancel_grace(),
            ..Self::default()
        }
    }
}

/// Supervises `yt-dlp` processes.
pub struct YtDlpSupervisor {
    name: String,
    settings: Arc<YtDlpSettings>,
}

impl YtDlpSupervisor {
    pub fn new(settings: YtDlpSettings) -> Self {
        Self {
            name: "yt-dlp".to_string(),
            settings: Arc::new(settings),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(YtDlpSettings::from_config(config))
    }

    pub fn build_args(&self, request: &SpawnRequest, staging: &Path) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            progress::progress_template(),
            "--format".to_string(),
            request.format_expression.clone(),
            "--extractor-args".to_string(),
            catalog::extractor_args(&request.player_client),
            "--output".to_string(),
            staging.join(OUTPUT_TEMPLATE).to_string_lossy().to_string(),
        ];

        if let Some(ffmpeg_path) = &self.settings.ffmpeg_path {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg_path.to_string_lossy().to_string());
        }

        if let Some(proxy) = &self.settings.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }

        if let Some(cookies) = &self.settings.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().to_string());
        }

        // URL last, behind `--` so it is never read as an option
        args.push("--".to_string());
        args.push(request.source_url.clone());
        args
    }

    /// Runs `<tool> --version`.
    pub async fn probe(&self) -> Result<String> {
        let output = Command::new(&self.settings.ytdlp_path)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| unavailable(&self.settings.ytdlp_path, &e))?;

        if !output.status.success() {
            return Err(AppError::ProcessUnavailable(format!(
                "{} --version exited with {}",
                self.settings.ytdlp_path, output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn unavailable(path: &str, e: &std::io::Error) -> AppError {
    if e.kind() == std::io::ErrorKind::NotFound {
        AppError::ProcessUnavailable(format!("{} binary is not available: {}", path, e))
    } else {
        AppError::ProcessUnavailable(format!("Failed to spawn {}: {}", path, e))
    }
}

#[async_trait]
impl Supervisor for YtDlpSupervisor {
    async fn spawn(&self, request: SpawnRequest, events: EventSender) -> Result<ProcessHandle> {
        let staging = utils::staging_dir(&request.output_dir, &request.job_id);
        utils::ensure_dir_exists(&staging).await?;

        let args = self.build_args(&request, &staging);
        log::info!(
            "Spawning {} for job {} (generation {}): client={}, format={}",
            self.settings.ytdlp_path,
            request.job_id,
            request.generation,
            request.player_client,
            request.format_expression
        );
        log::debug!("yt-dlp args: {:?}", args);

        let mut cmd = Command::new(&self.settings.ytdlp_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                utils::remove_dir_best_effort(&staging).await;
                return Err(unavailable(&self.settings.ytdlp_path, &e));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("Failed to capture stderr".to_string()))?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let emitter = EventEmitter::new(request.job_id.clone(), request.generation, events);
        let run = RunningProcess {
            child,
            staging,
            output_dir: request.output_dir.clone(),
            emitter,
            settings: self.settings.clone(),
        };

        let task = tokio::spawn(run.supervise(stdout, stderr, cancel_rx));
        Ok(ProcessHandle::new(request.job_id, request.generation, cancel_tx, task))
    }

    fn get_name(&self) -> &str {
        &self.name
    }
}

struct RunningProcess {
    child: Child,
    staging: PathBuf,
    output_dir: PathBuf,
    emitter: EventEmitter,
    settings: Arc<YtDlpSettings>,
}

impl RunningProcess {
    async fn supervise<O, E>(mut self, stdout: O, stderr: E, mut cancel_rx: oneshot::Receiver<()>)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let tail_len = self.settings.stderr_tail.max(1);
        let stderr_task = tokio::spawn(collect_stderr(stderr, tail_len));

        let parser = ProgressParser::new();
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    self.shutdown().await;
                    stderr_task.abort();
                    return;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parser.parse_line(&line) {
                        Some(sample) => self.emitter.progress(sample),
                        None => log::debug!("yt-dlp stdout: {}", line),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Error reading yt-dlp stdout: {}", e);
                        break;
                    }
                },
            }
        }

        let status = tokio::select! {
            _ = &mut cancel_rx => {
                self.shutdown().await;
                stderr_task.abort();
                return;
            }
            status = self.child.wait() => status,
        };

        let tail = stderr_task.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => self.finish_success().await,
            Ok(status) => {
                let message = diagnostic_message(&tail)
                    .unwrap_or_else(|| format!("yt-dlp exited with {}", status));
                log::warn!("yt-dlp failed: {}", message);
                utils::remove_dir_best_effort(&self.staging).await;
                self.emitter.failed(message, None);
            }
            Err(e) => {
                utils::remove_dir_best_effort(&self.staging).await;
                self.emitter.failed(
                    format!("Failed to wait for yt-dlp: {}", e),
                    Some(ErrorClassification::ProcessUnavailable.as_tag().to_string()),
                );
            }
        }
    }

    async fn finish_success(&self) {
        let downloaded = match utils::find_downloaded_file(&self.staging).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                utils::remove_dir_best_effort(&self.staging).await;
                self.emitter
                    .failed("yt-dlp exited successfully but produced no output file", None);
                return;
            }
            Err(e) => {
                self.emitter
                    .failed(format!("Failed to inspect staging directory: {}", e), None);
                return;
            }
        };

        let file_name = downloaded
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let destination = self.output_dir.join(file_name);

        if let Err(e) = utils::move_with_retry(&downloaded, &destination).await {
            log::error!("Could not move finished download: {}", e);
            self.emitter.failed(e.to_string(), None);
            return;
        }

        let size = tokio::fs::metadata(&destination)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        utils::remove_dir_best_effort(&self.staging).await;
        log::info!("Download finished: {:?} ({} bytes)", destination, size);
        self.emitter.completed(destination, size);
    }

    /// SIGTERM, wait for the grace period, then SIGKILL. Partial output
    /// is removed afterwards.
    async fn shutdown(&mut self) {
        terminate(&mut self.child, self.settings.cancel_grace).await;
        utils::remove_dir_best_effort(&self.staging).await;
    }
}

async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {
                if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                    return;
                }
                log::warn!("yt-dlp (pid {}) ignored SIGTERM, killing", pid);
            }
            Err(e) => log::warn!("Failed to signal yt-dlp (pid {}): {}", pid, e),
        }
    }

    #[cfg(not(unix))]
    let _ = grace;

    if let Err(e) = child.kill().await {
        log::debug!("Kill after cancel: {}", e);
    }
}

async fn collect_stderr<E>(stderr: E, tail_len: usize) -> VecDeque<String>
where
    E: AsyncRead + Unpin,
{
    let mut tail = VecDeque::with_capacity(tail_len);
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        log::debug!("yt-dlp stderr: {}", line);
        if tail.len() == tail_len {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    tail
}

/// Prefers `ERROR:` lines; falls back to the whole tail.
fn diagnostic_message(tail: &VecDeque<String>) -> Option<String> {
    let errors: Vec<&str> = tail
        .iter()
        .map(|line| line.trim())
        .filter(|line| line.starts_with("ERROR:"))
        .collect();

    let message = if errors.is_empty() {
        tail.iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        errors.join("\n")
    };

    if message.is_empty() {
        None
    } else {
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::supervisor::{SupervisorEvent, SupervisorEventKind};
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn request(output_dir: &Path) -> SpawnRequest {
        SpawnRequest {
            job_id: "job-1".to_string(),
            generation: 1,
            source_url: "https://www.youtube.com/watch?v=abc".to_string(),
            format_expression: "bestvideo+bestaudio/best".to_string(),
            player_client: "tv".to_string(),
            output_dir: output_dir.to_path_buf(),
        }
    }

    #[test]
    fn args_carry_selection_and_url_last() {
        let supervisor = YtDlpSupervisor::new(YtDlpSettings {
            proxy: Some("http://127.0.0.1:1080".to_string()),
            ..YtDlpSettings::default()
        });
        let req = request(Path::new("/downloads"));
        let args = supervisor.build_args(&req, Path::new("/downloads/.tubequeue/job-1"));

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--format") + 1], "bestvideo+bestaudio/best");
        assert_eq!(args[pos("--extractor-args") + 1], "youtube:player_client=tv");
        assert_eq!(args[pos("--proxy") + 1], "http://127.0.0.1:1080");
        assert!(args[pos("--output") + 1].starts_with("/downloads/.tubequeue/job-1/"));
        assert_eq!(args.last().unwrap(), "https://www.youtube.com/watch?v=abc");
        assert!(!args.contains(&"--cookies".to_string()));
    }

    #[test]
    fn diagnostic_prefers_error_lines() {
        let tail: VecDeque<String> = vec![
            "WARNING: something".to_string(),
            "ERROR: HTTP Error 403: Forbidden".to_string(),
        ]
        .into();
        assert_eq!(
            diagnostic_message(&tail).as_deref(),
            Some("ERROR: HTTP Error 403: Forbidden")
        );
        assert!(diagnostic_message(&VecDeque::new()).is_none());
    }

    #[tokio::test]
    async fn missing_binary_is_process_unavailable() {
        let dir = tempdir().unwrap();
        let supervisor = YtDlpSupervisor::new(YtDlpSettings {
            ytdlp_path: dir.path().join("does-not-exist").to_string_lossy().to_string(),
            ..YtDlpSettings::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = supervisor.spawn(request(dir.path()), tx).await.unwrap_err();
        assert!(matches!(err, AppError::ProcessUnavailable(_)));
        assert!(err.to_string().contains("binary is not available"));
    }

    #[cfg(unix)]
    mod stubbed {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn install_stub(dir: &Path, body: &str) -> PathBuf {
            let script_path = dir.join("yt-dlp");
            let script = format!(
                r#"#!/usr/bin/env bash
set -u
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done
target=$(printf '%s' "$output" | sed -e 's/%(title)s/Sample/' -e 's/%(id)s/abc/' -e 's/%(ext)s/mp4/')
{}
"#,
                body
            );
            std::fs::write(&script_path, script).unwrap();
            let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms).unwrap();
            script_path
        }

        fn supervisor_for(stub: &Path) -> YtDlpSupervisor {
            YtDlpSupervisor::new(YtDlpSettings {
                ytdlp_path: stub.to_string_lossy().to_string(),
                cancel_grace: Duration::from_millis(500),
                ..YtDlpSettings::default()
            })
        }

        async fn drain(mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) -> Vec<SupervisorEvent> {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                let terminal = event.kind.is_terminal();
                events.push(event);
                if terminal {
                    break;
                }
            }
            events
        }

        #[tokio::test]
        async fn success_reports_progress_then_file() {
            let bin = tempdir().unwrap();
            let out = tempdir().unwrap();
            let stub = install_stub(
                bin.path(),
                r#"echo "[progress]|  10.0%|1.00MiB/s|00:09"
echo "[progress]|  55.5%|2.00MiB/s|00:04"
echo "[progress]| 100.0%|2.00MiB/s|00:00"
echo "video-bytes" > "$target"
exit 0"#,
            );
            let supervisor = supervisor_for(&stub);
            let (tx, rx) = mpsc::unbounded_channel();

            let mut handle = supervisor.spawn(request(out.path()), tx).await.unwrap();
            let events = drain(rx).await;
            handle.cancel().await.unwrap();

            let percents: Vec<f32> = events
                .iter()
                .filter_map(|e| match e.kind {
                    SupervisorEventKind::Progress(sample) => Some(sample.percent),
                    _ => None,
                })
                .collect();
            assert_eq!(percents, vec![10.0, 55.5, 100.0]);

            match &events.last().unwrap().kind {
                SupervisorEventKind::Completed { path, size } => {
                    assert_eq!(path, &out.path().join("Sample [abc].mp4"));
                    assert_eq!(*size, 12);
                    assert!(path.exists());
                }
                other => panic!("unexpected terminal event: {:?}", other),
            }
            assert!(!utils::staging_dir(out.path(), "job-1").exists());
        }

        #[tokio::test]
        async fn failure_carries_stderr_diagnostics() {
            let bin = tempdir().unwrap();
            let out = tempdir().unwrap();
            let stub = install_stub(
                bin.path(),
                r#"echo "WARNING: retrying" >&2
echo "ERROR: unable to download video data: HTTP Error 403: Forbidden" >&2
exit 1"#,
            );
            let supervisor = supervisor_for(&stub);
            let (tx, rx) = mpsc::unbounded_channel();

            let _handle = supervisor.spawn(request(out.path()), tx).await.unwrap();
            let events = drain(rx).await;

            match &events.last().unwrap().kind {
                SupervisorEventKind::Failed { message, error_type } => {
                    assert!(message.contains("HTTP Error 403"));
                    assert!(!message.contains("WARNING"));
                    assert!(error_type.is_none());
                }
                other => panic!("unexpected terminal event: {:?}", other),
            }
        }

        #[tokio::test]
        async fn clean_exit_without_file_is_a_failure() {
            let bin = tempdir().unwrap();
            let out = tempdir().unwrap();
            let stub = install_stub(bin.path(), "exit 0");
            let supervisor = supervisor_for(&stub);
            let (tx, rx) = mpsc::unbounded_channel();

            let _handle = supervisor.spawn(request(out.path()), tx).await.unwrap();
            let events = drain(rx).await;

            assert!(matches!(
                events.last().unwrap().kind,
                SupervisorEventKind::Failed { .. }
            ));
        }

        #[tokio::test]
        async fn cancel_stops_process_and_removes_partial_output() {
            let bin = tempdir().unwrap();
            let out = tempdir().unwrap();
            let stub = install_stub(
                bin.path(),
                r#"echo "partial" > "$target.part"
echo "[progress]|  5.0%|1.00MiB/s|01:00"
exec sleep 30"#,
            );
            let supervisor = supervisor_for(&stub);
            let (tx, mut rx) = mpsc::unbounded_channel();

            let mut handle = supervisor.spawn(request(out.path()), tx).await.unwrap();
            let first = rx.recv().await.unwrap();
            assert!(matches!(first.kind, SupervisorEventKind::Progress(_)));

            tokio::time::timeout(Duration::from_secs(10), handle.cancel())
                .await
                .expect("cancel should be acknowledged")
                .unwrap();

            assert!(handle.is_finished());
            assert!(!utils::staging_dir(out.path(), "job-1").exists());
            // no terminal event after a cancel
            assert!(rx.try_recv().is_err());

            handle.cancel().await.unwrap();
        }

        #[tokio::test]
        async fn probe_reports_version() {
            let bin = tempdir().unwrap();
            let stub = install_stub(bin.path(), r#"echo "2025.01.01""#);
            let supervisor = supervisor_for(&stub);
            assert_eq!(supervisor.probe().await.unwrap(), "2025.01.01");
        }
    }
}
