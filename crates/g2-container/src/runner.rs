//! Process spawn, stdin secret injection, stdout marker-stream parsing, dual
//! idle/hard timeouts, graceful stop with force-kill fallback.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, Mutex},
};

use g2_core::util::iso_timestamp_utc;

use crate::marker::MarkerScanner;
use crate::types::{ContainerInput, ContainerOutcome, Secrets, TimeoutConfig, VolumeMount, SECRET_KEYS};
use crate::runtime::ContainerRuntime;
use crate::{ContainerError, Result};

/// A handle to a live container's stdin, owned by whichever component is currently
/// responsible for piping follow-up input (`GroupQueue` in production).
pub struct ContainerHandle {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
}

impl ContainerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write one line of input to the container's stdin. A no-op once stdin has
    /// been closed.
    pub async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            stdin.write_all(line.as_bytes()).await.map_err(ContainerError::Io)?;
            stdin.write_all(b"\n").await.map_err(ContainerError::Io)?;
            stdin.flush().await.map_err(ContainerError::Io)?;
        }
        Ok(())
    }

    /// Close stdin, signalling end-of-input. Dropping the write half sends EOF to
    /// the container without affecting its stdout/stderr.
    pub async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }
}

/// Returned immediately after spawn so the caller (`GroupQueue`) can register the
/// live process and start piping input, while the run continues to completion in
/// the background.
pub struct RunningContainer {
    pub handle: Arc<ContainerHandle>,
    pub join: tokio::task::JoinHandle<Result<ContainerOutcome>>,
}

#[derive(Clone)]
pub struct ContainerRunner {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    max_output_size: usize,
    log_dir: PathBuf,
    name_prefix: String,
    secrets_file: Option<PathBuf>,
    verbose: bool,
}

impl ContainerRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        image: String,
        max_output_size: u64,
        log_dir: PathBuf,
        name_prefix: String,
        secrets_file: Option<PathBuf>,
        verbose: bool,
    ) -> Self {
        Self {
            runtime,
            image,
            max_output_size: max_output_size as usize,
            log_dir,
            name_prefix,
            secrets_file,
            verbose,
        }
    }

    fn load_secrets(&self) -> Option<Secrets> {
        let path = self.secrets_file.as_ref()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let mut map = std::collections::HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            if SECRET_KEYS.contains(&k.trim()) {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        Some(Secrets(map))
    }

    /// Spawn the container, write the stdin payload, and return a handle plus a
    /// join future for the final outcome. `frame_tx`, when present, receives every
    /// parsed frame in emission order (streaming mode); absent, only the final
    /// frame (or fallback) is produced (batch mode).
    pub async fn spawn(
        &self,
        mounts: &[VolumeMount],
        mut input: ContainerInput,
        timeouts: TimeoutConfig,
        frame_tx: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<RunningContainer> {
        input.secrets = self.load_secrets();

        let container_name = format!(
            "{}{}-{}",
            self.name_prefix,
            input.group_folder,
            std::process::id()
        );

        let mut cmd = Command::new(self.runtime.binary());
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&container_name);
        for mount in mounts {
            for flag in self.runtime.mount_flags(mount) {
                cmd.arg(flag);
            }
        }
        cmd.arg(&self.image);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.verbose {
            tracing_log(&format!(
                "spawning container {container_name} image={} mounts={}",
                self.image,
                mounts.len()
            ));
        }

        let mut child = cmd.spawn().map_err(ContainerError::Io)?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            ContainerError::Spawn("container stdin was not captured".to_string())
        })?;

        let payload = serde_json::to_vec(&input).map_err(ContainerError::Parse)?;
        stdin.write_all(&payload).await.map_err(ContainerError::Io)?;
        stdin.write_all(b"\n").await.map_err(ContainerError::Io)?;
        stdin.flush().await.map_err(ContainerError::Io)?;

        let handle = Arc::new(ContainerHandle {
            name: container_name.clone(),
            stdin: Mutex::new(Some(stdin)),
        });

        let runner = self.clone();
        let handle_for_task = handle.clone();
        let join = tokio::spawn(async move {
            runner
                .drive(child, container_name, handle_for_task, timeouts, frame_tx)
                .await
        });

        Ok(RunningContainer { handle, join })
    }

    async fn drive(
        &self,
        mut child: Child,
        container_name: String,
        handle: Arc<ContainerHandle>,
        timeouts: TimeoutConfig,
        frame_tx: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<ContainerOutcome> {
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ContainerError::Spawn("container stdout was not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ContainerError::Spawn("container stderr was not captured".to_string()))?;

        let mut scanner = MarkerScanner::new();
        let mut stdout_log = String::new();
        let mut stderr_log = String::new();
        let mut stdout_truncated = false;
        let mut stderr_truncated = false;
        let mut last_frame: Option<Value> = None;
        let mut new_session_id: Option<String> = None;
        let mut saw_any_output = false;

        let hard_timeout = timeouts.hard_timeout();
        let deadline = tokio::time::sleep(hard_timeout);
        tokio::pin!(deadline);

        let mut stdout_buf = [0u8; 8192];
        let mut stderr_buf = [0u8; 8192];
        let mut stdout_open = true;
        let mut stderr_open = true;

        let exit_status = loop {
            tokio::select! {
                biased;

                _ = &mut deadline => {
                    let stopped = self.stop_or_kill(&container_name, &mut child).await;
                    let _ = stopped;
                    if saw_any_output {
                        return Ok(ContainerOutcome::success(None, new_session_id));
                    }
                    return Ok(ContainerOutcome::error(format!(
                        "timeout after {}ms",
                        hard_timeout.as_millis()
                    )));
                }

                n = stdout.read(&mut stdout_buf), if stdout_open => {
                    match n {
                        Ok(0) => stdout_open = false,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&stdout_buf[..n]);
                            append_capped(&mut stdout_log, &chunk, self.max_output_size, &mut stdout_truncated);
                            for payload in scanner.feed(&chunk) {
                                match serde_json::from_str::<Value>(&payload) {
                                    Ok(frame) => {
                                        saw_any_output = true;
                                        if let Some(sid) = frame.get("newSessionId").and_then(|v| v.as_str()) {
                                            new_session_id = Some(sid.to_string());
                                        }
                                        last_frame = Some(frame.clone());
                                        if let Some(tx) = &frame_tx {
                                            let _ = tx.send(frame);
                                        }
                                    }
                                    Err(e) => {
                                        tracing_log(&format!("malformed frame JSON, skipping: {e}"));
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            tracing_log(&format!("stdout read error: {e}"));
                            stdout_open = false;
                        }
                    }
                }

                n = stderr.read(&mut stderr_buf), if stderr_open => {
                    match n {
                        Ok(0) => stderr_open = false,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&stderr_buf[..n]);
                            append_capped(&mut stderr_log, &chunk, self.max_output_size, &mut stderr_truncated);
                        }
                        Err(e) => {
                            tracing_log(&format!("stderr read error: {e}"));
                            stderr_open = false;
                        }
                    }
                }

                status = child.wait(), if !stdout_open && !stderr_open => {
                    break status.map_err(ContainerError::Io)?;
                }
            }
        };

        self.write_log(&container_name, &stdout_log, &stderr_log, stdout_truncated, stderr_truncated);

        if !exit_status.success() {
            let tail = tail_bytes(&stderr_log, 200);
            return Ok(ContainerOutcome::error(format!(
                "exited code={}: {tail}",
                exit_status.code().unwrap_or(-1)
            )));
        }

        if frame_tx.is_some() {
            // Streaming mode: success once the process exits cleanly. Result stays
            // null — the frames themselves already delivered the output to the
            // caller's output chain, so it must not be echoed again here.
            return Ok(ContainerOutcome::success(None, new_session_id));
        }

        // Batch mode: parse only the last pair; fall back to the last non-empty
        // stdout line; parse failure yields a generic error outcome.
        if let Some(frame) = last_frame {
            let result = frame.get("result").and_then(|v| v.as_str()).map(str::to_string);
            let status_is_error = frame.get("status").and_then(|v| v.as_str()) == Some("error");
            if status_is_error {
                let err = frame
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("agent reported an error")
                    .to_string();
                return Ok(ContainerOutcome::error(err));
            }
            return Ok(ContainerOutcome::success(result, new_session_id));
        }

        if let Some(last_line) = stdout_log.lines().rev().find(|l| !l.trim().is_empty()) {
            if let Ok(frame) = serde_json::from_str::<Value>(last_line) {
                let result = frame.get("result").and_then(|v| v.as_str()).map(str::to_string);
                return Ok(ContainerOutcome::success(result, new_session_id));
            }
        }

        Ok(ContainerOutcome::error(
            "container produced no parsable output",
        ))
    }

    async fn stop_or_kill(&self, container_name: &str, child: &mut Child) -> bool {
        let (bin, args) = self.runtime.stop_command(container_name);
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let stop = tokio::time::timeout(
            Duration::from_secs(15),
            Command::new(&bin).args(&args_ref).output(),
        )
        .await;

        match stop {
            Ok(Ok(output)) if output.status.success() => true,
            _ => {
                let _ = child.start_kill();
                false
            }
        }
    }

    fn write_log(
        &self,
        container_name: &str,
        stdout_log: &str,
        stderr_log: &str,
        stdout_truncated: bool,
        stderr_truncated: bool,
    ) {
        let _ = std::fs::create_dir_all(&self.log_dir);
        let path = self.log_dir.join(format!("{container_name}.log"));
        let summary = format!("run {container_name} finished_at={}", iso_timestamp_utc());
        let body = if self.verbose {
            format!(
                "{summary}\n--- stdout{} ---\n{stdout_log}\n--- stderr{} ---\n{stderr_log}\n",
                if stdout_truncated { " [TRUNCATED]" } else { "" },
                if stderr_truncated { " [TRUNCATED]" } else { "" },
            )
        } else {
            format!(
                "{summary}\nstdout_bytes={} stderr_bytes={} truncated={}\n",
                stdout_log.len(),
                stderr_log.len(),
                stdout_truncated || stderr_truncated
            )
        };
        let _ = std::fs::write(path, body);
    }
}

fn append_capped(acc: &mut String, chunk: &str, cap: usize, truncated: &mut bool) {
    if acc.len() >= cap {
        *truncated = true;
        return;
    }
    let remaining = cap - acc.len();
    if chunk.len() <= remaining {
        acc.push_str(chunk);
    } else {
        acc.push_str(&chunk[..remaining]);
        *truncated = true;
    }
}

fn tail_bytes(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let start = s.len() - n;
    let boundary = (start..s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(s.len());
    s[boundary..].to_string()
}

fn tracing_log(msg: &str) {
    #[cfg(feature = "tracing")]
    tracing::warn!("{msg}");
    #[cfg(not(feature = "tracing"))]
    let _ = msg;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn append_capped_sets_truncated_flag_once_over_budget() {
        let mut acc = String::new();
        let mut truncated = false;
        append_capped(&mut acc, "hello", 3, &mut truncated);
        assert_eq!(acc, "hel");
        assert!(truncated);
    }

    #[test]
    fn tail_bytes_keeps_char_boundaries() {
        let s = "aé".repeat(5);
        let tail = tail_bytes(&s, 4);
        assert!(s.ends_with(&tail));
    }

    /// A fake `ContainerRuntime` whose "binary" is a shell script standing in
    /// for the container CLI: it ignores the docker-shaped args `spawn` passes
    /// it (`run --rm -i --name ... <image>`) and just runs `body`.
    struct ScriptRuntime {
        script: tempfile::TempPath,
        stop_ok: bool,
    }

    impl ScriptRuntime {
        fn new(body: &str, stop_ok: bool) -> Self {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            use std::io::Write;
            writeln!(file, "#!/bin/sh\n{body}").unwrap();
            let script = file.into_temp_path();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            Self { script, stop_ok }
        }
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for ScriptRuntime {
        fn binary(&self) -> &str {
            self.script.to_str().unwrap()
        }

        fn mount_flags(&self, _mount: &VolumeMount) -> Vec<String> {
            Vec::new()
        }

        fn stop_command(&self, _container_name: &str) -> (String, Vec<String>) {
            if self.stop_ok {
                ("true".to_string(), Vec::new())
            } else {
                ("false".to_string(), Vec::new())
            }
        }

        async fn ensure_running(&self) -> Result<()> {
            Ok(())
        }

        async fn cleanup_orphans(&self, _name_prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn is_running(&self, _container_name: &str) -> bool {
            false
        }
    }

    fn test_runner(runtime: ScriptRuntime, log_dir: &std::path::Path) -> ContainerRunner {
        ContainerRunner::new(
            Arc::new(runtime),
            "unused-image".to_string(),
            1_000_000,
            log_dir.to_path_buf(),
            "g2-test-".to_string(),
            None,
            false,
        )
    }

    fn test_input() -> ContainerInput {
        ContainerInput::new(
            "hi".to_string(),
            &g2_core::domain::GroupFolder("main".to_string()),
            &g2_core::domain::Jid("1@loop".to_string()),
            true,
        )
    }

    fn generous_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            container_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn batch_mode_relays_the_last_frames_result() {
        let log_dir = tempfile::tempdir().unwrap();
        let runtime = ScriptRuntime::new(
            r#"
cat >/dev/null
printf '%s\n' '---G2_OUTPUT_START---'
printf '%s\n' '{"status":"success","result":"hello from container","newSessionId":"sess-1"}'
printf '%s\n' '---G2_OUTPUT_END---'
"#,
            true,
        );
        let runner = test_runner(runtime, log_dir.path());

        let running = runner
            .spawn(&[], test_input(), generous_timeouts(), None)
            .await
            .unwrap();
        let outcome = running.join.await.unwrap().unwrap();

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.result.as_deref(), Some("hello from container"));
        assert_eq!(outcome.new_session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn streaming_mode_keeps_outcome_result_null_after_relaying_frames() {
        let log_dir = tempfile::tempdir().unwrap();
        let runtime = ScriptRuntime::new(
            r#"
cat >/dev/null
printf '%s\n' '---G2_OUTPUT_START---'
printf '%s\n' '{"status":"success","result":"hello from container","newSessionId":"sess-1"}'
printf '%s\n' '---G2_OUTPUT_END---'
"#,
            true,
        );
        let runner = test_runner(runtime, log_dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let running = runner
            .spawn(&[], test_input(), generous_timeouts(), Some(tx))
            .await
            .unwrap();

        let relayed = rx.recv().await.unwrap();
        assert_eq!(relayed.get("result").and_then(|v| v.as_str()), Some("hello from container"));

        let outcome = running.join.await.unwrap().unwrap();
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.result, None, "already relayed via the frame stream, must not echo again");
        assert_eq!(outcome.new_session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn stop_or_kill_force_kills_when_the_runtime_stop_command_fails() {
        let log_dir = tempfile::tempdir().unwrap();
        let runtime = ScriptRuntime::new("sleep 30", false);
        let runner = test_runner(runtime, log_dir.path());

        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let stopped_cleanly = runner.stop_or_kill("irrelevant-name", &mut child).await;
        assert!(!stopped_cleanly);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("force-killed process should exit promptly")
            .unwrap();
        assert!(!status.success());
    }
}
