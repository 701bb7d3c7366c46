use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use loopscribe_observability::trace;

pub const PYTHON_ENV: &str = "LOOPSCRIBE_PYTHON";

#[derive(Debug, Clone, Serialize)]
pub struct PythonStatus {
    pub ready: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub python_path: Option<String>,
    pub python_version: Option<String>,
}

impl PythonStatus {
    fn not_ready(message: String, python_path: Option<String>) -> Self {
        Self {
            ready: false,
            code: Some("E_PYTHON_NOT_READY".to_string()),
            message: Some(message),
            python_path,
            python_version: None,
        }
    }
}

pub fn venv_python_path(repo_root: &Path) -> PathBuf {
    if cfg!(windows) {
        repo_root.join(".venv").join("Scripts").join("python.exe")
    } else {
        repo_root.join(".venv").join("bin").join("python")
    }
}

/// Interpreter for the worker script: `explicit` (settings), then
/// `LOOPSCRIBE_PYTHON`, then the repo-local virtualenv.
pub fn resolve_python_binary(repo_root: &Path, explicit: Option<&str>) -> Result<PathBuf> {
    let from_env = std::env::var(PYTHON_ENV).ok();
    for (source, raw) in [("env", from_env.as_deref()), ("settings", explicit)] {
        let Some(t) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
            continue;
        };
        let p = PathBuf::from(t);
        if p.exists() {
            return Ok(p);
        }
        return Err(anyhow!(
            "E_PYTHON_NOT_READY: {source} python points to missing file: {}",
            p.display()
        ));
    }

    let p = venv_python_path(repo_root);
    if p.exists() {
        return Ok(p);
    }
    Err(anyhow!(
        "E_PYTHON_NOT_READY: missing python interpreter at {} (set {PYTHON_ENV} or create repo-local .venv)",
        p.display()
    ))
}

fn python_version(python: &Path) -> Result<String> {
    let out = Command::new(python)
        .arg("--version")
        .output()
        .with_context(|| format!("run python --version failed: {}", python.display()))?;
    if !out.status.success() {
        return Err(anyhow!(
            "E_PYTHON_NOT_READY: python --version exited with {} ({})",
            out.status,
            python.display()
        ));
    }
    // Python 2 printed its version on stderr.
    let text = if out.stdout.iter().all(u8::is_ascii_whitespace) {
        out.stderr
    } else {
        out.stdout
    };
    String::from_utf8_lossy(&text)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .ok_or_else(|| {
            anyhow!(
                "E_PYTHON_NOT_READY: python --version returned empty output ({})",
                python.display()
            )
        })
}

/// Resolves and runs the interpreter once, recording the outcome in the trace.
pub fn verify(data_dir: &Path, repo_root: &Path, explicit: Option<&str>) -> PythonStatus {
    let resolved = match resolve_python_binary(repo_root, explicit) {
        Ok(p) => p,
        Err(e) => {
            let msg = e.to_string();
            trace::event(
                data_dir,
                None,
                "Python",
                "PY.verify",
                "err",
                Some(serde_json::json!({ "code": "E_PYTHON_NOT_READY", "message": msg })),
            );
            return PythonStatus::not_ready(msg, None);
        }
    };
    let shown = resolved.display().to_string();

    match python_version(&resolved) {
        Ok(version) => {
            trace::event(
                data_dir,
                None,
                "Python",
                "PY.verify",
                "ok",
                Some(serde_json::json!({ "python": shown, "version": version })),
            );
            PythonStatus {
                ready: true,
                code: None,
                message: None,
                python_path: Some(shown),
                python_version: Some(version),
            }
        }
        Err(e) => {
            let msg = e.to_string();
            trace::event(
                data_dir,
                None,
                "Python",
                "PY.verify",
                "err",
                Some(serde_json::json!({
                    "code": "E_PYTHON_NOT_READY",
                    "message": msg,
                    "python": shown,
                })),
            );
            PythonStatus::not_ready(msg, Some(shown))
        }
    }
}
