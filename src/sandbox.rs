mod isolate_runner;
mod process_runner;
mod workspace;

pub use isolate_runner::IsolateSandbox;
pub use process_runner::ProcessSandbox;
pub use workspace::Workspace;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{LimitsConfig, SandboxBackend, SandboxConfig};
use crate::error::JudgeError;
use crate::language::LanguageTemplate;

// Per-phase sandbox constants
const COMPILE_FILE_SIZE_KB: u64 = 65536;
const RUNTIME_FILE_SIZE_KB: u64 = 16384;

/// PATH visible to submitted programs and compilers
const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Share of one CPU a run may use, in the cgroup quota/period form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuQuota {
    pub quota_us: u64,
    pub period_us: u64,
}

impl CpuQuota {
    pub fn unrestricted() -> Self {
        Self {
            quota_us: 100_000,
            period_us: 100_000,
        }
    }
}

impl Default for CpuQuota {
    fn default() -> Self {
        Self {
            quota_us: 50_000,
            period_us: 100_000,
        }
    }
}

/// Resource limits for one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub wall_clock: Duration,
    pub memory_kb: u64,
    pub cpu_quota: CpuQuota,
}

impl Limits {
    /// CPU time a run may consume within its wall-clock window
    pub fn cpu_time_budget(&self) -> Duration {
        let period = self.cpu_quota.period_us.max(1) as u128;
        let quota = self.cpu_quota.quota_us.min(self.cpu_quota.period_us) as u128;
        let nanos = self.wall_clock.as_nanos() * quota / period;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(5),
            memory_kb: 262144,
            cpu_quota: CpuQuota::default(),
        }
    }
}

/// How a single execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// The program ran to completion with exit code 0
    Exited,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
}

/// Result of running one test case input through the sandbox
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    /// Peak memory, 0 when the backend cannot measure it
    pub memory_kb: u64,
    pub message: Option<String>,
}

impl ExecutionOutcome {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Isolated execution backend
///
/// `prepare` materializes the submission in a private workspace, `execute`
/// consumes it: compilation (if the language has a compile step) and the run
/// happen inside the sandbox, and the workspace plus any execution handle are
/// released before `execute` returns, whatever the outcome.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    async fn prepare(&self, code: &str, language: &LanguageTemplate)
    -> Result<Workspace, JudgeError>;

    async fn execute(
        &self,
        workspace: Workspace,
        input: &str,
        limits: &Limits,
    ) -> Result<ExecutionOutcome, JudgeError>;

    /// Releases runtime-wide resources; workspaces must all be gone
    fn shutdown(&self) {}
}

/// Settings shared by every backend
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Directory holding this runtime's workspaces
    pub workspace_root: PathBuf,
    pub compile_limits: Limits,
    /// Captured bytes kept per output stream
    pub output_limit: usize,
}

impl RuntimeOptions {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let limits = LimitsConfig::default();
        Self {
            workspace_root: workspace_root.into(),
            compile_limits: limits.compile_limits(),
            output_limit: limits.output_limit_bytes(),
        }
    }

    pub fn from_config(sandbox: &SandboxConfig, limits: &LimitsConfig) -> Self {
        let base = sandbox
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sandjudge"));
        Self {
            workspace_root: base.join(format!("runtime-{}", uuid::Uuid::new_v4())),
            compile_limits: limits.compile_limits(),
            output_limit: limits.output_limit_bytes(),
        }
    }
}

/// Creates a sandbox runtime based on configuration
///
/// With the `auto` backend an IsolateSandbox is used when the `isolate`
/// binary is installed. Otherwise a ProcessSandbox provides timeouts and
/// rlimits without namespace isolation.
pub fn create_sandbox_runtime(
    sandbox: &SandboxConfig,
    limits: &LimitsConfig,
) -> Result<Box<dyn SandboxRuntime>, JudgeError> {
    let options = RuntimeOptions::from_config(sandbox, limits);
    let use_isolate = match sandbox.backend {
        SandboxBackend::Auto => isolate_installed(),
        SandboxBackend::Isolate => true,
        SandboxBackend::Process => false,
    };

    if use_isolate {
        log::info!("Creating IsolateSandbox (full isolation mode)");
        Ok(Box::new(IsolateSandbox::build(options, sandbox)?))
    } else {
        log::info!("Creating ProcessSandbox (no isolate available)");
        Ok(Box::new(ProcessSandbox::build(options)?))
    }
}

fn isolate_installed() -> bool {
    std::process::Command::new("which")
        .arg("isolate")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// How a sandboxed command terminated, before verdict interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    OutOfMemory,
}

/// Raw result of one command inside a sandbox
#[derive(Debug)]
pub(crate) struct RawRun {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub memory_kb: u64,
}

impl RawRun {
    /// Interprets the run of a test case
    pub fn into_outcome(self) -> ExecutionOutcome {
        let (status, exit_code, message) = match self.termination {
            Termination::Exited(0) => (OutcomeStatus::Exited, Some(0), None),
            Termination::Exited(code) => (
                OutcomeStatus::RuntimeError,
                Some(code),
                Some(format!("Non-zero exit code: {code}")),
            ),
            Termination::Signaled(signal) => (
                OutcomeStatus::RuntimeError,
                None,
                Some(format!("Killed by signal {signal}")),
            ),
            Termination::TimedOut => (
                OutcomeStatus::TimeLimitExceeded,
                None,
                Some("Execution exceeded time limit".to_string()),
            ),
            Termination::OutOfMemory => (
                OutcomeStatus::MemoryLimitExceeded,
                None,
                Some("Execution exceeded memory limit".to_string()),
            ),
        };

        ExecutionOutcome {
            status,
            stdout: self.stdout,
            stderr: self.stderr,
            duration: self.duration,
            exit_code,
            memory_kb: self.memory_kb,
            message,
        }
    }

    /// Interprets the compile step; `None` means compilation succeeded
    pub fn compile_failure(self) -> Option<ExecutionOutcome> {
        let message = match self.termination {
            Termination::Exited(0) => return None,
            Termination::TimedOut => "Compilation exceeded time limit",
            Termination::OutOfMemory => "Compilation exceeded memory limit",
            Termination::Exited(_) | Termination::Signaled(_) => "Compilation failed",
        };
        let exit_code = match self.termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        };

        let mut compiler_output = self.stdout;
        compiler_output.push_str(&self.stderr);

        Some(ExecutionOutcome {
            status: OutcomeStatus::CompilationError,
            stdout: compiler_output,
            stderr: String::new(),
            duration: Duration::ZERO,
            exit_code,
            memory_kb: self.memory_kb,
            message: Some(message.to_string()),
        })
    }
}
