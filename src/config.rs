use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::sandbox::{CpuQuota, Limits};

#[derive(Parser)]
#[command(name = "sandjudge", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Judge a source file against a problem without recording a submission
    Run {
        #[arg(long)]
        problem: i64,
        #[arg(long)]
        language: String,
        source: PathBuf,
    },
    /// Record a submission, judge it and print the stored result
    Submit {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        problem: i64,
        #[arg(long)]
        contest: Option<i64>,
        #[arg(long)]
        language: String,
        source: PathBuf,
    },
    /// Judge pending submissions until interrupted
    Worker {
        /// Number of concurrent judging workers
        #[arg(long, short = 't', default_value_t = 2)]
        threads: u8,
        /// How often the store is scanned for pending submissions
        #[arg(long, default_value_t = 1000)]
        poll_interval_ms: u64,
        /// Claims older than this are taken as left behind by a dead process
        #[arg(long, default_value_t = 600)]
        claim_timeout_secs: u64,
    },
}

impl CliArgs {
    /// Load the configuration from the specified file, or the defaults
    pub fn to_config(&self) -> std::io::Result<Config> {
        match &self.config_path {
            Some(path) => Config::from_file(path),
            None => Ok(Config::default()),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
    pub languages: Vec<LanguageConfig>,
    pub problems: Vec<ProblemConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            sandbox: SandboxConfig::default(),
            limits: LimitsConfig::default(),
            languages: default_languages(),
            problems: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Overrides the per-user data directory
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackend {
    /// Isolate when installed, plain processes otherwise
    #[default]
    Auto,
    Isolate,
    Process,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Parent directory of the per-execution workspaces
    pub workspace_root: Option<PathBuf>,
    /// First isolate box id owned by this process
    pub isolate_box_base: u32,
    /// Number of isolate boxes that may be in use at once
    pub isolate_box_count: u32,
    /// Extra host directories made visible inside isolate boxes
    pub isolate_dirs: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            workspace_root: None,
            isolate_box_base: 100,
            isolate_box_count: 32,
            isolate_dirs: Vec::new(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KiloByte(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub wall_clock: MilliSecond,
    pub memory: KiloByte,
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub compile_time: MilliSecond,
    pub compile_memory: KiloByte,
    /// Captured bytes kept per output stream
    pub output_limit: KiloByte,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            wall_clock: MilliSecond(5000),
            memory: KiloByte(262144),
            cpu_quota_us: 50000,
            cpu_period_us: 100000,
            compile_time: MilliSecond(30000),
            compile_memory: KiloByte(524288),
            output_limit: KiloByte(1024),
        }
    }
}

impl LimitsConfig {
    pub fn cpu_quota(&self) -> CpuQuota {
        CpuQuota {
            quota_us: self.cpu_quota_us,
            period_us: self.cpu_period_us,
        }
    }

    /// Limits applied to every test case run
    pub fn run_limits(&self) -> Limits {
        Limits {
            wall_clock: self.wall_clock.into(),
            memory_kb: self.memory.0,
            cpu_quota: self.cpu_quota(),
        }
    }

    /// Limits applied to the compile step; the compiler gets the full CPU
    pub fn compile_limits(&self) -> Limits {
        Limits {
            wall_clock: self.compile_time.into(),
            memory_kb: self.compile_memory.0,
            cpu_quota: CpuQuota::unrestricted(),
        }
    }

    pub fn output_limit_bytes(&self) -> usize {
        (self.output_limit.0 as usize).saturating_mul(1024)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub name: String,
    pub file_name: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    /// Managed runtimes reserve far more address space than they touch; when
    /// unset only their data segment is limited
    #[serde(default = "default_true")]
    pub limit_address_space: bool,
}

fn default_true() -> bool {
    true
}

fn words(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn default_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: "JAVA".to_string(),
            file_name: "Solution.java".to_string(),
            compile: Some(words(&["javac", "%INPUT%"])),
            run: words(&["java", "-Xss64m", "-cp", ".", "Solution"]),
            limit_address_space: false,
        },
        LanguageConfig {
            name: "PYTHON".to_string(),
            file_name: "solution.py".to_string(),
            compile: None,
            run: words(&["python3", "%INPUT%"]),
            limit_address_space: true,
        },
        LanguageConfig {
            name: "JAVASCRIPT".to_string(),
            file_name: "solution.js".to_string(),
            compile: None,
            run: words(&["node", "%INPUT%"]),
            limit_address_space: false,
        },
        LanguageConfig {
            name: "CPP".to_string(),
            file_name: "main.cpp".to_string(),
            compile: Some(words(&[
                "g++", "-O2", "-std=c++17", "-o", "%OUTPUT%", "%INPUT%",
            ])),
            run: words(&["./%OUTPUT%"]),
            limit_address_space: true,
        },
    ]
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemConfig {
    pub id: i64,
    pub title: String,
    #[serde(default = "default_base_score")]
    pub base_score: u32,
    pub cases: Vec<ProblemCaseConfig>,
}

fn default_base_score() -> u32 {
    100
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProblemCaseConfig {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub hidden: bool,
    /// Defaults to the position in `cases`
    pub order_index: Option<i32>,
}
