use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::SandboxConfig;
use crate::error::{IoContext, JudgeError};
use crate::language::LanguageTemplate;

use super::workspace::remove_tree_reporting;
use super::{
    COMPILE_FILE_SIZE_KB, ExecutionOutcome, Limits, RUNTIME_FILE_SIZE_KB, RawRun, RuntimeOptions,
    SANDBOX_PATH, SandboxRuntime, Termination, Workspace,
};

// Sandbox configuration constants
const COMPILE_PROCESSES: u32 = 64;
const COMPILE_OPEN_FILES: u32 = 512;
const RUNTIME_PROCESSES: u32 = 32;
const RUNTIME_OPEN_FILES: u32 = 64;

/// Grace period before the outer watchdog gives up on `isolate` itself
const WATCHDOG_GRACE: Duration = Duration::from_secs(2);

// Runtime root directory permissions
const ROOT_DIR_PERMISSIONS: u32 = 0o700;

const STDIN_NAME: &str = "stdin.txt";
const STDOUT_NAME: &str = "stdout.txt";
const STDERR_NAME: &str = "stderr.txt";

/// Which step of an execution a sandboxed command belongs to
#[derive(Debug, Clone, Copy)]
enum Phase {
    Compile,
    Run,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Run => "run",
        }
    }
}

/// A sandbox backend built on the `isolate` tool
///
/// Every execution leases its own box id, initializes a fresh cgroup-backed
/// box, compiles and runs inside it, and cleans the box up when the lease is
/// dropped.
pub struct IsolateSandbox {
    options: RuntimeOptions,
    boxes: Arc<BoxPool>,
    extra_dirs: Vec<String>,
}

impl IsolateSandbox {
    pub fn build(options: RuntimeOptions, config: &SandboxConfig) -> Result<Self, JudgeError> {
        let version = std::process::Command::new("isolate")
            .arg("--version")
            .output()
            .map_err(|e| JudgeError::SandboxUnavailable(format!("Failed to spawn isolate: {e}")))?;
        if !version.status.success() {
            return Err(JudgeError::SandboxUnavailable(
                "isolate --version exited with non-zero status".to_string(),
            ));
        }

        let root = &options.workspace_root;
        fs::create_dir_all(root)
            .sandbox_context(|| format!("Failed to create workspace root {}", root.display()))?;
        fs::set_permissions(root, fs::Permissions::from_mode(ROOT_DIR_PERMISSIONS))
            .sandbox_context(|| format!("Failed to restrict workspace root {}", root.display()))?;

        log::info!(
            "IsolateSandbox initialized with boxes {}..{}",
            config.isolate_box_base,
            config.isolate_box_base + config.isolate_box_count
        );

        Ok(Self {
            options,
            boxes: Arc::new(BoxPool::new(config.isolate_box_base, config.isolate_box_count)),
            extra_dirs: config.isolate_dirs.clone(),
        })
    }

    /// Runs `command` inside an initialized box
    async fn run_in_box(
        &self,
        sandbox: &IsolateBox,
        workspace: &Workspace,
        command: &str,
        limits: &Limits,
        phase: Phase,
    ) -> Result<RawRun, JudgeError> {
        let box_id = sandbox.id().to_string();
        let meta_path = workspace.path().join(format!("{}.meta", phase.name()));
        let (processes, open_files, file_size) = match phase {
            Phase::Compile => (COMPILE_PROCESSES, COMPILE_OPEN_FILES, COMPILE_FILE_SIZE_KB),
            Phase::Run => (RUNTIME_PROCESSES, RUNTIME_OPEN_FILES, RUNTIME_FILE_SIZE_KB),
        };

        let wall_time_arg = format!("--wall-time={:.3}", limits.wall_clock.as_secs_f64());
        let cpu_time_arg = format!("--time={:.3}", limits.cpu_time_budget().as_secs_f64());
        let memory_arg = format!("--cg-mem={}", limits.memory_kb);
        let processes_arg = format!("--processes={processes}");
        let open_files_arg = format!("--open-files={open_files}");
        let fsize_arg = format!("--fsize={file_size}");
        let meta_arg = format!("--meta={}", meta_path.display());
        let dir_args = self
            .extra_dirs
            .iter()
            .filter(|dir| Path::new(dir).exists())
            .map(|dir| format!("--dir={dir}"));

        let mut cmd = Command::new("isolate");
        cmd.args(["-b", &box_id, "--cg", "--run"])
            .args(dir_args)
            .args([
                &wall_time_arg,
                &cpu_time_arg,
                &memory_arg,
                &processes_arg,
                &open_files_arg,
                &fsize_arg,
                &meta_arg,
            ])
            .args(["-E", &format!("PATH={SANDBOX_PATH}"), "-E", "HOME=/box"])
            .args(["-o", STDOUT_NAME, "-r", STDERR_NAME]);
        if matches!(phase, Phase::Run) {
            cmd.args(["-i", STDIN_NAME]);
        }
        cmd.args(["--silent", "--", "/bin/sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start_time = Instant::now();
        let watchdog = limits.wall_clock + WATCHDOG_GRACE;
        let output = match timeout(watchdog, cmd.output()).await {
            Ok(output) => output.sandbox_context(|| "Failed to spawn isolate --run".to_string())?,
            Err(_) => {
                log::warn!("isolate box {box_id} ignored its wall-time limit, killed");
                return Ok(RawRun {
                    termination: Termination::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: start_time.elapsed(),
                    memory_kb: 0,
                });
            }
        };
        let elapsed_time = start_time.elapsed();

        let meta_content = fs::read_to_string(&meta_path).map_err(|e| {
            JudgeError::SandboxUnavailable(format!(
                "isolate produced no meta file ({e}); stderr={}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        })?;
        let meta = IsolateMeta::parse(&meta_content);
        let termination = meta.termination(limits.memory_kb)?;

        let cap = self.options.output_limit;
        Ok(RawRun {
            termination,
            stdout: read_capped(&sandbox.box_dir.join(STDOUT_NAME), cap),
            stderr: read_capped(&sandbox.box_dir.join(STDERR_NAME), cap),
            duration: meta.wall_time.unwrap_or(elapsed_time),
            memory_kb: meta.memory_kb,
        })
    }
}

#[async_trait]
impl SandboxRuntime for IsolateSandbox {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn prepare(
        &self,
        code: &str,
        language: &LanguageTemplate,
    ) -> Result<Workspace, JudgeError> {
        Workspace::create(&self.options.workspace_root, language, code)
    }

    async fn execute(
        &self,
        workspace: Workspace,
        input: &str,
        limits: &Limits,
    ) -> Result<ExecutionOutcome, JudgeError> {
        let lease = self.boxes.lease().await?;
        let sandbox = IsolateBox::init(lease).await?;

        let language = workspace.language();
        fs::copy(
            workspace.source_path(),
            sandbox.box_dir.join(&language.file_name),
        )
        .sandbox_context(|| format!("Failed to copy source into box {}", sandbox.id()))?;

        if let Some(compile_command) = language.compile_command() {
            let compiled = self
                .run_in_box(
                    &sandbox,
                    &workspace,
                    &compile_command,
                    &self.options.compile_limits,
                    Phase::Compile,
                )
                .await?;
            if let Some(failure) = compiled.compile_failure() {
                return Ok(failure);
            }
        }

        fs::write(sandbox.box_dir.join(STDIN_NAME), input)
            .sandbox_context(|| format!("Failed to write input into box {}", sandbox.id()))?;

        let run = self
            .run_in_box(
                &sandbox,
                &workspace,
                &language.run_command(),
                limits,
                Phase::Run,
            )
            .await?;

        Ok(run.into_outcome())
    }

    fn shutdown(&self) {
        remove_tree_reporting(&self.options.workspace_root, "workspace root");
        log::info!("IsolateSandbox shut down");
    }
}

/// Fixed range of isolate box ids shared by concurrent executions
struct BoxPool {
    free: Mutex<Vec<u32>>,
    permits: Arc<Semaphore>,
}

impl BoxPool {
    fn new(base: u32, count: u32) -> Self {
        Self {
            free: Mutex::new((base..base + count).rev().collect()),
            permits: Arc::new(Semaphore::new(count as usize)),
        }
    }

    /// Waits until a box id is free and takes it
    async fn lease(self: &Arc<Self>) -> Result<BoxLease, JudgeError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JudgeError::SandboxUnavailable("box pool closed".to_string()))?;
        let id = self.free.lock().pop().ok_or_else(|| {
            JudgeError::SandboxUnavailable("box pool out of sync with its permits".to_string())
        })?;

        Ok(BoxLease {
            id,
            pool: self.clone(),
            _permit: permit,
        })
    }
}

struct BoxLease {
    id: u32,
    pool: Arc<BoxPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        // The id goes back before the permit is released
        self.pool.free.lock().push(self.id);
    }
}

/// An initialized isolate box, cleaned up on drop
///
/// Cleanup runs on the blocking pool and returns the box id only once
/// `isolate --cleanup` has finished.
struct IsolateBox {
    id: u32,
    lease: Option<BoxLease>,
    box_dir: PathBuf,
}

impl IsolateBox {
    async fn init(lease: BoxLease) -> Result<Self, JudgeError> {
        let box_id = lease.id.to_string();

        // Leftovers from a crashed run would make --init fail
        match Command::new("isolate")
            .args(["-b", &box_id, "--cg", "--cleanup"])
            .output()
            .await
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => log::debug!(
                "Pre-init cleanup of box {box_id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => log::debug!("Failed to spawn pre-init cleanup of box {box_id}: {e}"),
        }

        let output = Command::new("isolate")
            .args(["-b", &box_id, "--cg", "--init"])
            .output()
            .await
            .map_err(|e| {
                JudgeError::SandboxUnavailable(format!("Failed to spawn isolate --init: {e}"))
            })?;

        // Constructed before validation so a half-initialized box is cleaned
        let mut sandbox = Self {
            id: lease.id,
            lease: Some(lease),
            box_dir: PathBuf::new(),
        };

        if !output.status.success() {
            return Err(JudgeError::SandboxUnavailable(format!(
                "isolate --init exited with non-zero status; stderr={}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let root_dir = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if root_dir.is_empty() {
            return Err(JudgeError::SandboxUnavailable(
                "isolate --init produced empty stdout".to_string(),
            ));
        }

        sandbox.box_dir = PathBuf::from(root_dir).join("box");
        log::debug!("Isolate box {box_id} initialized");
        Ok(sandbox)
    }

    fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for IsolateBox {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || cleanup_box(lease));
            }
            Err(_) => cleanup_box(lease),
        }
    }
}

/// Runs `isolate --cleanup` and then gives the box id back
fn cleanup_box(lease: BoxLease) {
    let box_id = lease.id.to_string();
    match std::process::Command::new("isolate")
        .args(["-b", &box_id, "--cg", "--cleanup"])
        .output()
    {
        Ok(output) if output.status.success() => {
            log::debug!("Isolate box {box_id} cleaned up");
        }
        Ok(output) => log::warn!(
            "isolate --cleanup of box {box_id} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => log::warn!("Failed to spawn isolate --cleanup for box {box_id}: {e}"),
    }
    drop(lease);
}

/// Fields of an isolate meta file relevant to verdicts
#[derive(Debug, Default, PartialEq)]
struct IsolateMeta {
    status: Option<String>,
    oom_killed: bool,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
    memory_kb: u64,
    wall_time: Option<Duration>,
    message: Option<String>,
}

impl IsolateMeta {
    /// Parses `key:value` lines, ignoring unknown keys
    fn parse(meta_content: &str) -> Self {
        let mut meta = Self::default();
        for line in meta_content.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key {
                    "status" => meta.status = Some(value.to_string()),
                    "cg-oom-killed" => meta.oom_killed = value == "1",
                    "exitcode" => meta.exit_code = value.parse().ok(),
                    "exitsig" => meta.exit_signal = value.parse().ok(),
                    "cg-mem" => meta.memory_kb = value.parse().unwrap_or(0),
                    "time-wall" => {
                        meta.wall_time = value
                            .parse::<f64>()
                            .ok()
                            .filter(|secs| secs.is_finite() && *secs >= 0.0)
                            .map(Duration::from_secs_f64);
                    }
                    "message" => meta.message = Some(value.to_string()),
                    _ => {}
                }
            }
        }
        meta
    }

    fn termination(&self, memory_limit_kb: u64) -> Result<Termination, JudgeError> {
        if self.oom_killed {
            return Ok(Termination::OutOfMemory);
        }

        let termination = match self.status.as_deref() {
            None => Termination::Exited(self.exit_code.unwrap_or(0)),
            Some("RE") => Termination::Exited(self.exit_code.unwrap_or(1)),
            Some("SG") => Termination::Signaled(self.exit_signal.unwrap_or(0)),
            Some("TO") => Termination::TimedOut,
            Some(other) => {
                return Err(JudgeError::SandboxUnavailable(format!(
                    "isolate internal error ({other}): {}",
                    self.message.as_deref().unwrap_or("no message")
                )));
            }
        };

        // Near the ceiling a kill may be reported as a plain signal
        if self.memory_kb > memory_limit_kb && !matches!(termination, Termination::Exited(0)) {
            return Ok(Termination::OutOfMemory);
        }
        Ok(termination)
    }
}

/// Reads at most `cap` bytes of a captured output file
fn read_capped(path: &Path, cap: usize) -> String {
    let mut kept = Vec::new();
    if let Ok(file) = fs::File::open(path) {
        let _ = file.take(cap as u64).read_to_end(&mut kept);
    }
    String::from_utf8_lossy(&kept).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_parsing() {
        let meta = IsolateMeta::parse(
            "time:0.012\ntime-wall:0.503\nmax-rss:3400\ncg-mem:2048\nexitcode:0\n",
        );
        assert_eq!(meta.memory_kb, 2048);
        assert_eq!(meta.wall_time, Some(Duration::from_millis(503)));
        assert_eq!(meta.termination(262144).unwrap(), Termination::Exited(0));
    }

    #[test]
    fn test_meta_verdicts() {
        let timed_out =
            IsolateMeta::parse("status:TO\nkilled:1\nmessage:Time limit exceeded (wall clock)\n");
        assert_eq!(timed_out.termination(262144).unwrap(), Termination::TimedOut);

        let crashed = IsolateMeta::parse("status:RE\nexitcode:3\n");
        assert_eq!(crashed.termination(262144).unwrap(), Termination::Exited(3));

        let segfault = IsolateMeta::parse("status:SG\nexitsig:11\ncg-mem:100\n");
        assert_eq!(segfault.termination(262144).unwrap(), Termination::Signaled(11));

        let oom = IsolateMeta::parse("status:SG\nexitsig:9\ncg-oom-killed:1\n");
        assert_eq!(oom.termination(262144).unwrap(), Termination::OutOfMemory);

        let over = IsolateMeta::parse("status:SG\nexitsig:9\ncg-mem:300000\n");
        assert_eq!(over.termination(262144).unwrap(), Termination::OutOfMemory);
    }

    #[test]
    fn test_meta_internal_error() {
        let broken = IsolateMeta::parse("status:XX\nmessage:Cannot set up cgroup\n");
        let err = broken.termination(262144).unwrap_err();
        assert!(err.to_string().contains("Cannot set up cgroup"));
    }

    #[tokio::test]
    async fn test_box_pool_recycles_ids() {
        let pool = Arc::new(BoxPool::new(10, 2));
        let a = pool.lease().await.unwrap();
        let b = pool.lease().await.unwrap();
        assert_eq!((a.id, b.id), (10, 11));
        assert!(pool.permits.try_acquire().is_err());

        drop(a);
        let c = pool.lease().await.unwrap();
        assert_eq!(c.id, 10);
    }

    #[tokio::test]
    async fn test_dropped_box_returns_its_id_after_cleanup() {
        let pool = Arc::new(BoxPool::new(20, 1));
        let lease = pool.lease().await.unwrap();
        let sandbox = IsolateBox {
            id: lease.id,
            lease: Some(lease),
            box_dir: PathBuf::new(),
        };
        assert!(pool.permits.try_acquire().is_err());

        drop(sandbox);
        let again = timeout(Duration::from_secs(10), pool.lease())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, 20);
    }
}
