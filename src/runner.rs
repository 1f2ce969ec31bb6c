#![forbid(unsafe_code)]

//! Supervises the external extractor process.
//!
//! Every invocation goes through an argument vector handed straight to the
//! OS; no shell ever sees the URL or the format selector. The ranked
//! candidate list comes from configuration and is fixed for the lifetime of a
//! [`ProcessRunner`]. Each job opens its own [`RunnerSession`], which
//! remembers the first candidate that actually started so later invocations
//! for the same job skip the probing.

use std::{
    path::Path,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output fragments that mean "this candidate is not installed here" rather
/// than "the tool ran and failed".
const NOT_FOUND_SIGNATURES: &[&str] = &[
    "command not found",
    "No such file or directory",
    "No module named",
    "is not recognized as an internal or external command",
];

/// Exit code shells use when the program itself could not be found.
const SHELL_NOT_FOUND_CODE: i32 = 127;

/// One way of launching the extractor: a program plus fixed leading
/// arguments (e.g. `python3 -m yt_dlp`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Candidate {
    pub program: String,
    #[serde(default)]
    pub prefix_args: Vec<String>,
}

impl Candidate {
    pub fn program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn module(interpreter: impl Into<String>, module: &str) -> Self {
        Self {
            program: interpreter.into(),
            prefix_args: vec!["-m".to_string(), module.to_string()],
        }
    }

    pub fn label(&self) -> String {
        if self.prefix_args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.prefix_args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Reported to the caller of [`RunnerSession::run_streaming`] while the
/// extractor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent<'a> {
    /// A candidate process was started.
    Spawned,
    Line(StreamKind, &'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { stdout: String },
    /// Every candidate failed to start.
    ToolUnavailable,
    /// The tool ran and reported failure.
    ProcessError {
        exit_code: Option<i32>,
        stderr: String,
    },
    /// The deadline passed; the child has been killed and reaped.
    TimedOut,
    /// The owning task asked for the child to be stopped.
    Cancelled,
}

#[derive(Clone)]
pub struct ProcessRunner {
    candidates: Arc<[Candidate]>,
}

impl ProcessRunner {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates: candidates.into(),
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn session(&self) -> RunnerSession {
        RunnerSession {
            candidates: self.candidates.clone(),
            resolved: None,
        }
    }
}

/// Per-job view of the runner that caches the resolved candidate.
pub struct RunnerSession {
    candidates: Arc<[Candidate]>,
    resolved: Option<usize>,
}

enum Attempt {
    NotFound,
    Finished(Outcome),
}

impl RunnerSession {
    pub fn resolved(&self) -> Option<&Candidate> {
        self.resolved.map(|index| &self.candidates[index])
    }

    /// Runs the tool and returns its captured output.
    pub async fn run(
        &mut self,
        args: &[String],
        working_dir: Option<&Path>,
        timeout: Duration,
    ) -> Outcome {
        self.run_streaming(args, working_dir, timeout, &CancellationToken::new(), |_| {})
            .await
    }

    /// Runs the tool, reporting the spawn and every output line to
    /// `on_event` as they happen. Stdout is still captured in full for the
    /// returned [`Outcome`].
    pub async fn run_streaming(
        &mut self,
        args: &[String],
        working_dir: Option<&Path>,
        timeout: Duration,
        cancel: &CancellationToken,
        mut on_event: impl FnMut(RunEvent<'_>),
    ) -> Outcome {
        let deadline = Instant::now() + timeout;
        let order: Vec<usize> = match self.resolved {
            Some(index) => vec![index],
            None => (0..self.candidates.len()).collect(),
        };

        for index in order {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            let candidate = &self.candidates[index];
            match attempt(candidate, args, working_dir, deadline, cancel, &mut on_event).await {
                Attempt::NotFound => {
                    debug!(candidate = %candidate.label(), "extractor candidate unavailable");
                }
                Attempt::Finished(outcome) => {
                    if self.resolved.is_none() {
                        debug!(candidate = %candidate.label(), "extractor candidate resolved");
                    }
                    self.resolved = Some(index);
                    return outcome;
                }
            }
        }

        warn!("no extractor candidate could be started");
        Outcome::ToolUnavailable
    }
}

async fn attempt(
    candidate: &Candidate,
    args: &[String],
    working_dir: Option<&Path>,
    deadline: Instant,
    cancel: &CancellationToken,
    on_event: &mut impl FnMut(RunEvent<'_>),
) -> Attempt {
    let mut command = Command::new(&candidate.program);
    command
        .args(&candidate.prefix_args)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            debug!(candidate = %candidate.label(), error = %err, "spawn failed");
            return Attempt::NotFound;
        }
    };
    on_event(RunEvent::Spawned);

    let mut stdout = String::new();
    let mut stderr = String::new();

    let finished = {
        let io = pump_output(&mut child, &mut stdout, &mut stderr, on_event);
        tokio::select! {
            result = tokio::time::timeout_at(deadline, io) => Some(result),
            _ = cancel.cancelled() => None,
        }
    };

    let status = match finished {
        Some(Ok(Ok(status))) => status,
        Some(Ok(Err(err))) => {
            stop_child(&mut child).await;
            return Attempt::Finished(Outcome::ProcessError {
                exit_code: None,
                stderr: format!("waiting for extractor failed: {err}"),
            });
        }
        Some(Err(_elapsed)) => {
            warn!(candidate = %candidate.label(), "extractor timed out; killing child");
            stop_child(&mut child).await;
            return Attempt::Finished(Outcome::TimedOut);
        }
        None => {
            debug!(candidate = %candidate.label(), "extractor cancelled; killing child");
            stop_child(&mut child).await;
            return Attempt::Finished(Outcome::Cancelled);
        }
    };

    if status.success() {
        return Attempt::Finished(Outcome::Success { stdout });
    }

    let exit_code = status.code();
    if looks_like_missing_tool(exit_code, &stdout, &stderr) {
        return Attempt::NotFound;
    }
    Attempt::Finished(Outcome::ProcessError { exit_code, stderr })
}

async fn pump_output(
    child: &mut Child,
    stdout_buf: &mut String,
    stderr_buf: &mut String,
    on_event: &mut impl FnMut(RunEvent<'_>),
) -> std::io::Result<std::process::ExitStatus> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut out_lines = stdout.map(|pipe| BufReader::new(pipe).split(b'\n'));
    let mut err_lines = stderr.map(|pipe| BufReader::new(pipe).split(b'\n'));

    loop {
        tokio::select! {
            segment = next_segment(&mut out_lines), if out_lines.is_some() => match segment {
                Some(raw) => {
                    let line = decode_line(&raw);
                    on_event(RunEvent::Line(StreamKind::Stdout, &line));
                    stdout_buf.push_str(&line);
                    stdout_buf.push('\n');
                }
                None => out_lines = None,
            },
            segment = next_segment(&mut err_lines), if err_lines.is_some() => match segment {
                Some(raw) => {
                    let line = decode_line(&raw);
                    on_event(RunEvent::Line(StreamKind::Stderr, &line));
                    stderr_buf.push_str(&line);
                    stderr_buf.push('\n');
                }
                None => err_lines = None,
            },
            else => break,
        }
    }

    child.wait().await
}

async fn next_segment<R>(reader: &mut Option<tokio::io::Split<R>>) -> Option<Vec<u8>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match reader {
        Some(split) => split.next_segment().await.ok().flatten(),
        None => None,
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches('\r').to_string()
}

/// Kills the child's whole process group, so helpers it started (ffmpeg,
/// a forked interpreter) go down with it, then reaps the child.
async fn stop_child(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok())
        && let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
    {
        debug!(pid, error = %err, "extractor process group already gone");
    }
    if let Err(err) = child.kill().await {
        debug!(error = %err, "child already exited");
    }
}

fn looks_like_missing_tool(exit_code: Option<i32>, stdout: &str, stderr: &str) -> bool {
    if exit_code == Some(SHELL_NOT_FOUND_CODE) {
        return true;
    }
    stdout.trim().is_empty()
        && NOT_FOUND_SIGNATURES
            .iter()
            .any(|signature| stderr.contains(signature))
}

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support {
    //! Helpers for tests that stand a bash script in for the extractor.

    use std::{fs, path::Path, path::PathBuf, time::Duration};

    /// Writes an executable bash script standing in for the extractor.
    pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/usr/bin/env bash\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    /// Waits up to two seconds for `pid` to disappear. Zombies awaiting
    /// their new parent's reap count as gone. Reads `/proc`, so only
    /// meaningful on Linux.
    pub async fn wait_for_exit(pid: &str) -> bool {
        let stat = Path::new("/proc").join(pid.trim()).join("stat");
        for _ in 0..100 {
            match fs::read_to_string(&stat) {
                Err(_) => return true,
                Ok(line) => {
                    let state = line
                        .rsplit_once(") ")
                        .and_then(|(_, rest)| rest.chars().next());
                    if matches!(state, Some('Z' | 'X')) {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{install_stub, wait_for_exit};
    use super::*;
    use tempfile::tempdir;

    fn runner_for(paths: &[&Path]) -> ProcessRunner {
        ProcessRunner::new(
            paths
                .iter()
                .map(|path| Candidate::program(path.to_string_lossy()))
                .collect(),
        )
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn success_captures_stdout() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", r#"echo '{"title":"x"}'"#);
        let mut session = runner_for(&[&stub]).session();
        let outcome = session
            .run(&args(&["-J", "https://example.test"]), None, Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            Outcome::Success {
                stdout: "{\"title\":\"x\"}\n".into()
            }
        );
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate_and_caches_it() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("not-installed");
        let stub = install_stub(dir.path(), "yt-dlp", "echo ok");
        let mut session = runner_for(&[&missing, &stub]).session();

        let outcome = session.run(&[], None, Duration::from_secs(5)).await;
        assert!(matches!(outcome, Outcome::Success { .. }));
        assert_eq!(session.resolved().unwrap().program, stub.to_string_lossy());

        let again = session.run(&[], None, Duration::from_secs(5)).await;
        assert!(matches!(again, Outcome::Success { .. }));
    }

    #[tokio::test]
    async fn missing_module_signature_is_treated_as_unavailable() {
        let dir = tempdir().unwrap();
        let broken = install_stub(
            dir.path(),
            "python3",
            "echo '/usr/bin/python3: No module named yt_dlp' >&2\nexit 1",
        );
        let shell_missing = install_stub(dir.path(), "wrapper", "exit 127");
        let mut session = runner_for(&[&broken, &shell_missing]).session();
        let outcome = session.run(&[], None, Duration::from_secs(5)).await;
        assert_eq!(outcome, Outcome::ToolUnavailable);
        assert!(session.resolved().is_none());
    }

    #[tokio::test]
    async fn every_candidate_missing_yields_tool_unavailable() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let mut session = runner_for(&[&a, &b]).session();
        assert_eq!(
            session.run(&[], None, Duration::from_secs(1)).await,
            Outcome::ToolUnavailable
        );
    }

    #[tokio::test]
    async fn non_zero_exit_reports_process_error() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            "echo 'ERROR: [youtube] abc: Video unavailable' >&2\nexit 2",
        );
        let mut session = runner_for(&[&stub]).session();
        match session.run(&[], None, Duration::from_secs(5)).await {
            Outcome::ProcessError { exit_code, stderr } => {
                assert_eq!(exit_code, Some(2));
                assert!(stderr.contains("Video unavailable"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(session.resolved().is_some());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_child() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            &format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()),
        );
        let mut session = runner_for(&[&stub]).session();
        let started = std::time::Instant::now();
        let outcome = session.run(&[], None, Duration::from_millis(500)).await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(wait_for_exit(&pid).await, "child {pid} still running");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_processes_the_child_started() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            &format!("sleep 30 &\necho $! > '{}'\nwait", pid_file.display()),
        );
        let mut session = runner_for(&[&stub]).session();
        let outcome = session.run(&[], None, Duration::from_millis(500)).await;
        assert_eq!(outcome, Outcome::TimedOut);

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(wait_for_exit(&pid).await, "helper {pid} outlived the extractor");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancellation_kills_processes_the_child_started() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("helper.pid");
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            &format!(
                "sleep 30 &\necho $! > '{}'\necho started\nwait",
                pid_file.display()
            ),
        );
        let mut session = runner_for(&[&stub]).session();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let outcome = session
            .run_streaming(&[], None, Duration::from_secs(30), &cancel, |event| {
                if event == RunEvent::Line(StreamKind::Stdout, "started") {
                    trigger.cancel();
                }
            })
            .await;
        assert_eq!(outcome, Outcome::Cancelled);

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        assert!(wait_for_exit(&pid).await, "helper {pid} outlived the extractor");
    }

    #[tokio::test]
    async fn cancelled_token_spawns_nothing() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let stub = install_stub(dir.path(), "yt-dlp", &format!("touch '{}'", marker.display()));
        let mut session = runner_for(&[&stub]).session();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut spawned = false;
        let outcome = session
            .run_streaming(&[], None, Duration::from_secs(5), &cancel, |event| {
                spawned |= event == RunEvent::Spawned;
            })
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(!spawned);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn cancellation_stops_child() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", "echo started\nexec sleep 30");
        let mut session = runner_for(&[&stub]).session();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let outcome = session
            .run_streaming(&[], None, Duration::from_secs(30), &cancel, |event| {
                if event == RunEvent::Line(StreamKind::Stdout, "started") {
                    trigger.cancel();
                }
            })
            .await;
        assert_eq!(outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn streaming_delivers_lines_in_order() {
        let dir = tempdir().unwrap();
        let stub = install_stub(
            dir.path(),
            "yt-dlp",
            "echo one\necho two\necho oops >&2\necho three",
        );
        let mut session = runner_for(&[&stub]).session();
        let mut spawns = 0;
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let outcome = session
            .run_streaming(
                &[],
                None,
                Duration::from_secs(5),
                &CancellationToken::new(),
                |event| match event {
                    RunEvent::Spawned => spawns += 1,
                    RunEvent::Line(StreamKind::Stdout, line) => stdout_lines.push(line.to_string()),
                    RunEvent::Line(StreamKind::Stderr, line) => stderr_lines.push(line.to_string()),
                },
            )
            .await;
        assert!(matches!(outcome, Outcome::Success { .. }));
        assert_eq!(stdout_lines, ["one", "two", "three"]);
        assert_eq!(stderr_lines, ["oops"]);
        assert_eq!(spawns, 1);
    }

    #[tokio::test]
    async fn arguments_reach_the_tool_verbatim() {
        let dir = tempdir().unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", r#"for arg in "$@"; do echo "$arg"; done"#);
        let hostile = "https://x.test/?v=1; touch pwned $(touch pwned2)";
        let mut session = runner_for(&[&stub]).session();
        let outcome = session
            .run(&args(&["-f", "best", hostile]), Some(dir.path()), Duration::from_secs(5))
            .await;
        let Outcome::Success { stdout } = outcome else {
            panic!("stub failed");
        };
        assert_eq!(stdout.lines().collect::<Vec<_>>(), ["-f", "best", hostile]);
        assert!(!dir.path().join("pwned").exists());
        assert!(!dir.path().join("pwned2").exists());
    }

    #[tokio::test]
    async fn runs_inside_working_directory() {
        let dir = tempdir().unwrap();
        let work = dir.path().join("job");
        std::fs::create_dir_all(&work).unwrap();
        let stub = install_stub(dir.path(), "yt-dlp", "echo data > artifact.mp4");
        let mut session = runner_for(&[&stub]).session();
        let outcome = session.run(&[], Some(&work), Duration::from_secs(5)).await;
        assert!(matches!(outcome, Outcome::Success { .. }));
        assert!(work.join("artifact.mp4").exists());
    }

    #[test]
    fn candidate_labels() {
        assert_eq!(Candidate::program("yt-dlp").label(), "yt-dlp");
        assert_eq!(
            Candidate::module("python3", "yt_dlp").label(),
            "python3 -m yt_dlp"
        );
    }
}
