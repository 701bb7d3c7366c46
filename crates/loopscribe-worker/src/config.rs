use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::python_runtime;

pub const DATA_DIR_ENV: &str = "LOOPSCRIBE_DATA_DIR";
pub const REPO_ROOT_ENV: &str = "LOOPSCRIBE_REPO_ROOT";
pub const WORKER_SCRIPT_ENV: &str = "LOOPSCRIBE_WORKER_SCRIPT";

pub const DEVICE_ENV: &str = "WHISPER_DEVICE";
pub const MODEL_ENV: &str = "WHISPER_MODEL";
pub const PRECISION_ENV: &str = "WHISPER_PRECISION";
pub const CACHE_DIR_ENV: &str = "WHISPER_CACHE_DIR";

const DEFAULT_WORKER_SCRIPT: &str = "worker-script/python/loopback_transcribe.py";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Exponential restart backoff: attempt `n` waits `base_delay * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RestartPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }

    /// Attempt number and delay for the restart following `retry_count`
    /// consecutive failures, or `None` once the budget is spent.
    pub fn next_attempt(&self, retry_count: u32) -> Option<(u32, Duration)> {
        if retry_count >= self.max_retries {
            return None;
        }
        let attempt = retry_count + 1;
        Some((attempt, self.delay_for(attempt)))
    }
}

/// Environment handed to the worker untouched. The core never interprets
/// these values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEnv {
    pub device: Option<String>,
    pub model: Option<String>,
    pub precision: Option<String>,
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl EngineEnv {
    pub fn vars(&self) -> Vec<(String, String)> {
        let named = [
            (DEVICE_ENV, self.device.clone()),
            (MODEL_ENV, self.model.clone()),
            (PRECISION_ENV, self.precision.clone()),
            (
                CACHE_DIR_ENV,
                self.cache_dir.as_ref().map(|p| p.display().to_string()),
            ),
        ];
        named
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k.to_string(), v)))
            .chain(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }

    fn override_from_process_env(&mut self) {
        let read = |k: &str| {
            std::env::var(k)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        if let Some(v) = read(DEVICE_ENV) {
            self.device = Some(v);
        }
        if let Some(v) = read(MODEL_ENV) {
            self.model = Some(v);
        }
        if let Some(v) = read(PRECISION_ENV) {
            self.precision = Some(v);
        }
        if let Some(v) = read(CACHE_DIR_ENV) {
            self.cache_dir = Some(PathBuf::from(v));
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: EngineEnv,
    pub restart: RestartPolicy,
    /// A worker that has not sent `ready` by then is killed.
    pub ready_timeout: Option<Duration>,
    /// Per-request deadline; `None` waits until the worker answers or dies.
    pub request_timeout: Option<Duration>,
    pub keepalive_interval: Option<Duration>,
    /// Where `trace.jsonl` is written.
    pub data_dir: PathBuf,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: EngineEnv::default(),
            restart: RestartPolicy::default(),
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
            request_timeout: None,
            keepalive_interval: None,
            data_dir: data_dir.into(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Python worker configured from `settings.json` in `data_dir`, then the
    /// process environment.
    pub fn python_worker(data_dir: &Path, repo_root: &Path) -> Result<Self> {
        let settings = load_settings(data_dir)?;
        let python = python_runtime::resolve_python_binary(repo_root, settings.python.as_deref())?;

        let script = std::env::var(WORKER_SCRIPT_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or(settings.worker_script.clone())
            .map(PathBuf::from)
            .unwrap_or_else(|| repo_root.join(DEFAULT_WORKER_SCRIPT));
        if !script.exists() {
            return Err(anyhow!(
                "E_WORKER_SCRIPT_MISSING: worker script not found: {}",
                script.display()
            ));
        }

        let mut env = EngineEnv {
            device: settings.device.clone(),
            model: settings.model.clone(),
            precision: settings.precision.clone(),
            cache_dir: settings.cache_dir.clone(),
            extra: settings.extra_env.clone(),
        };
        env.override_from_process_env();
        // Frames must reach us line by line, not when Python's block buffer fills.
        env.extra
            .entry("PYTHONUNBUFFERED".to_string())
            .or_insert_with(|| "1".to_string());

        let mut cfg = Self::new(python, data_dir).with_args([
            "-u".to_string(),
            script.display().to_string(),
        ]);
        cfg.working_dir = Some(repo_root.to_path_buf());
        cfg.env = env;
        settings.apply_limits(&mut cfg);
        Ok(cfg)
    }
}

/// Optional `settings.json` in the data dir. Every field falls back to the
/// built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    pub python: Option<String>,
    pub worker_script: Option<String>,
    pub device: Option<String>,
    pub model: Option<String>,
    pub precision: Option<String>,
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    pub max_retries: Option<u32>,
    pub restart_base_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub keepalive_ms: Option<u64>,
}

impl Settings {
    fn apply_limits(&self, cfg: &mut WorkerConfig) {
        if let Some(n) = self.max_retries {
            cfg.restart.max_retries = n;
        }
        if let Some(ms) = self.restart_base_ms {
            cfg.restart.base_delay = Duration::from_millis(ms);
        }
        // 0 disables the timer.
        let opt = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        if let Some(ms) = self.ready_timeout_ms {
            cfg.ready_timeout = opt(ms);
        }
        if let Some(ms) = self.request_timeout_ms {
            cfg.request_timeout = opt(ms);
        }
        if let Some(ms) = self.keepalive_ms {
            cfg.keepalive_interval = opt(ms);
        }
    }
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn load_settings(data_dir: &Path) -> Result<Settings> {
    let p = settings_path(data_dir);
    if !p.exists() {
        return Ok(Settings::default());
    }
    let s = fs::read_to_string(&p).context("read settings.json failed")?;
    serde_json::from_str(&s).context("parse settings.json failed")
}

pub fn save_settings(data_dir: &Path, settings: &Settings) -> Result<()> {
    fs::create_dir_all(data_dir).context("create data dir failed")?;
    let s = serde_json::to_string_pretty(settings).context("serialize settings failed")?;
    fs::write(settings_path(data_dir), s).context("write settings.json failed")
}

pub fn repo_root() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(REPO_ROOT_ENV) {
        return Ok(PathBuf::from(p));
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("failed to locate repo root from CARGO_MANIFEST_DIR"))
}

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(p) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(p));
    }
    // Dev default: repo-root/tmp/loopscribe-data
    Ok(repo_root()?.join("tmp").join("loopscribe-data"))
}
