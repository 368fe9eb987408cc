use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{IoContext, JudgeError};
use crate::language::LanguageTemplate;

use super::workspace::remove_tree_reporting;
use super::{
    COMPILE_FILE_SIZE_KB, ExecutionOutcome, Limits, RUNTIME_FILE_SIZE_KB, RawRun, RuntimeOptions,
    SANDBOX_PATH, SandboxRuntime, Termination, Workspace,
};

// Runtime root directory permissions
const ROOT_DIR_PERMISSIONS: u32 = 0o700;
// Time left to collect output after the program exits on its wall clock
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// A runner that executes code as plain child processes
///
/// ProcessSandbox enforces the wall-clock limit with a hard kill of the whole
/// process group and applies rlimits (memory, CPU time, file size),
/// but provides no namespace or filesystem isolation. Memory usage is not
/// measured. This is intended for development/testing environments where
/// `isolate` is not available.
pub struct ProcessSandbox {
    options: RuntimeOptions,
}

impl ProcessSandbox {
    pub fn build(options: RuntimeOptions) -> Result<Self, JudgeError> {
        let root = &options.workspace_root;
        fs::create_dir_all(root)
            .sandbox_context(|| format!("Failed to create workspace root {}", root.display()))?;
        fs::set_permissions(root, fs::Permissions::from_mode(ROOT_DIR_PERMISSIONS))
            .sandbox_context(|| format!("Failed to restrict workspace root {}", root.display()))?;

        log::info!("ProcessSandbox initialized at {}", root.display());
        log::warn!("ProcessSandbox provides NO filesystem isolation - use only in trusted environments");

        Ok(Self { options })
    }

    /// Runs `command` through the shell inside the workspace
    async fn run_in(
        &self,
        workspace: &Workspace,
        command: &str,
        stdin_content: &[u8],
        limits: &Limits,
        file_size_kb: u64,
    ) -> Result<RawRun, JudgeError> {
        let rlimits = ResourceLimits::new(
            limits,
            workspace.language().limit_address_space,
            file_size_kb,
        );

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", workspace.path())
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        // SAFETY: the hook only calls setrlimit, which is async-signal-safe
        unsafe {
            cmd.pre_exec(move || rlimits.apply());
        }

        let start_time = Instant::now();
        let mut child = cmd
            .spawn()
            .sandbox_context(|| format!("Failed to spawn `{command}`"))?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let cap = self.options.output_limit;
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut stdout_reader =
            tokio::spawn(read_capped(child.stdout.take(), cap, stdout.clone()));
        let mut stderr_reader =
            tokio::spawn(read_capped(child.stderr.take(), cap, stderr.clone()));
        let stdin_content = stdin_content.to_vec();
        let stdin_writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // The program may exit without reading its input
                let _ = stdin.write_all(&stdin_content).await;
                let _ = stdin.shutdown().await;
            }
        });

        let execution_result = timeout(limits.wall_clock, child.wait()).await;
        let elapsed_time = start_time.elapsed();

        // Nothing the program started may outlive the execution
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        stdin_writer.abort();

        let status = match execution_result {
            Ok(status) => status,
            Err(_) => {
                log::debug!("`{command}` timed out after {elapsed_time:?}, killed");
                let _ = child.kill().await;
                stdout_reader.abort();
                stderr_reader.abort();
                return Ok(RawRun {
                    termination: Termination::TimedOut,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: elapsed_time,
                    memory_kb: 0,
                });
            }
        };
        // A process that left the group, e.g. through setsid, can hold the
        // pipes open forever; reading stops when the wall clock runs out
        let drain_budget = limits.wall_clock.saturating_sub(elapsed_time) + OUTPUT_DRAIN_GRACE;
        let drained = timeout(drain_budget, async {
            let _ = tokio::join!(&mut stdout_reader, &mut stderr_reader);
        })
        .await;
        if drained.is_err() {
            log::warn!("Output of `{command}` still open after the wall clock, truncated");
            stdout_reader.abort();
            stderr_reader.abort();
        }
        let stdout = std::mem::take(&mut *stdout.lock());
        let stderr = std::mem::take(&mut *stderr.lock());
        let status = status.sandbox_context(|| format!("Failed to wait for `{command}`"))?;

        let termination = match (status.code(), status.signal()) {
            (Some(code), _) => Termination::Exited(code),
            (None, Some(libc::SIGXCPU)) => Termination::TimedOut,
            (None, Some(signal)) => Termination::Signaled(signal),
            (None, None) => Termination::Signaled(0),
        };

        Ok(RawRun {
            termination,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: elapsed_time,
            memory_kb: 0,
        })
    }
}

#[async_trait]
impl SandboxRuntime for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
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
        if let Some(compile_command) = workspace.language().compile_command() {
            let compiled = self
                .run_in(
                    &workspace,
                    &compile_command,
                    b"",
                    &self.options.compile_limits,
                    COMPILE_FILE_SIZE_KB,
                )
                .await?;
            if let Some(failure) = compiled.compile_failure() {
                return Ok(failure);
            }
        }

        let run_command = workspace.language().run_command();
        let run = self
            .run_in(
                &workspace,
                &run_command,
                input.as_bytes(),
                limits,
                RUNTIME_FILE_SIZE_KB,
            )
            .await?;

        Ok(run.into_outcome())
    }

    fn shutdown(&self) {
        remove_tree_reporting(&self.options.workspace_root, "workspace root");
        log::info!("ProcessSandbox shut down");
    }
}

/// Reads a stream to its end into `kept`, keeping at most `cap` bytes
///
/// Excess output is drained and discarded so the writer never blocks.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    cap: usize,
    kept: Arc<Mutex<Vec<u8>>>,
) {
    let Some(mut reader) = reader else {
        return;
    };

    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut kept = kept.lock();
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

fn kill_process_group(pgid: u32) {
    // SAFETY: killpg has no memory-safety preconditions; ESRCH is expected
    // when the group is already gone
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

/// rlimits installed in the child between fork and exec
#[derive(Debug, Clone, Copy)]
struct ResourceLimits {
    address_space_bytes: Option<u64>,
    /// Heap ceiling for runtimes that reserve more address space than they use
    data_bytes: Option<u64>,
    cpu_seconds: u64,
    file_size_bytes: u64,
}

macro_rules! set_rlimit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let limit = libc::rlimit {
            rlim_cur: $soft as libc::rlim_t,
            rlim_max: $hard as libc::rlim_t,
        };
        // SAFETY: `limit` is a valid, initialized rlimit
        if unsafe { libc::setrlimit($resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }};
}

impl ResourceLimits {
    fn new(limits: &Limits, limit_address_space: bool, file_size_kb: u64) -> Self {
        let budget = limits.cpu_time_budget();
        let cpu_seconds = budget.as_secs() + u64::from(budget.subsec_nanos() > 0);

        let memory_bytes = limits.memory_kb.saturating_mul(1024);
        Self {
            address_space_bytes: limit_address_space.then_some(memory_bytes),
            data_bytes: (!limit_address_space).then_some(memory_bytes),
            cpu_seconds: cpu_seconds.max(1),
            file_size_bytes: file_size_kb.saturating_mul(1024),
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        if let Some(bytes) = self.address_space_bytes {
            set_rlimit!(libc::RLIMIT_AS, bytes, bytes);
        }
        if let Some(bytes) = self.data_bytes {
            set_rlimit!(libc::RLIMIT_DATA, bytes, bytes);
        }
        // SIGXCPU at the soft limit, SIGKILL one second later
        set_rlimit!(libc::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1);
        set_rlimit!(libc::RLIMIT_FSIZE, self.file_size_bytes, self.file_size_bytes);
        set_rlimit!(libc::RLIMIT_CORE, 0, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::CpuQuota;

    #[test]
    fn test_cpu_seconds_round_up() {
        let limits = Limits {
            wall_clock: Duration::from_millis(3000),
            memory_kb: 1024,
            cpu_quota: CpuQuota::default(),
        };
        let rlimits = ResourceLimits::new(&limits, true, 16);
        assert_eq!(rlimits.cpu_seconds, 2);
        assert_eq!(rlimits.address_space_bytes, Some(1024 * 1024));
        assert_eq!(rlimits.data_bytes, None);
        assert_eq!(rlimits.file_size_bytes, 16 * 1024);

        let tiny = Limits {
            wall_clock: Duration::from_millis(100),
            ..limits
        };
        assert_eq!(ResourceLimits::new(&tiny, false, 16).cpu_seconds, 1);
        let heap_only = ResourceLimits::new(&tiny, false, 16);
        assert_eq!(heap_only.address_space_bytes, None);
        assert_eq!(heap_only.data_bytes, Some(1024 * 1024));
    }

    #[tokio::test]
    async fn test_read_capped_drains_excess() {
        let data = vec![b'x'; 100_000];
        let kept = Arc::new(Mutex::new(Vec::new()));
        read_capped(Some(&data[..]), 10, kept.clone()).await;
        assert_eq!(*kept.lock(), b"xxxxxxxxxx");

        let nothing = Arc::new(Mutex::new(Vec::new()));
        read_capped(None::<&[u8]>, 10, nothing.clone()).await;
        assert!(nothing.lock().is_empty());
    }
}
