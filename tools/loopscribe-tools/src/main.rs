use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::task::JoinSet;

use loopscribe_observability::{safe_eprintln, Span};
use loopscribe_worker::{config, python_runtime, Transcript, TranscriptionSession, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "loopscribe", about = "Drive the persistent transcription worker")]
struct Cli {
    /// Directory holding settings.json and trace.jsonl
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Resolve the Python interpreter and print its version
    CheckPython,
    /// Transcribe WAV files through a single worker process
    Transcribe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Seconds to wait for the worker to load its model
        #[arg(long, default_value_t = 120)]
        ready_timeout_secs: u64,
        /// Print plain text instead of JSON lines
        #[arg(long)]
        text: bool,
    },
}

#[derive(Serialize)]
struct FileResult<'a> {
    file: String,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    transcript: Option<&'a Transcript>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<FileError>,
}

#[derive(Serialize)]
struct FileError {
    code: &'static str,
    message: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            safe_eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let data_dir = match cli.data_dir {
        Some(p) => p,
        None => config::data_dir()?,
    };
    let repo_root = config::repo_root()?;

    match cli.command {
        Cmd::CheckPython => {
            let settings = config::load_settings(&data_dir)?;
            let status = python_runtime::verify(&data_dir, &repo_root, settings.python.as_deref());
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(if status.ready {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Cmd::Transcribe {
            files,
            ready_timeout_secs,
            text,
        } => {
            let cfg = WorkerConfig::python_worker(&data_dir, &repo_root)?;
            let span = Span::start(
                &data_dir,
                None,
                "Cli",
                "CLI.transcribe",
                Some(serde_json::json!({ "files": files.len() })),
            );
            let session = TranscriptionSession::new(cfg);
            let res = transcribe_all(
                &session,
                files,
                Duration::from_secs(ready_timeout_secs),
                text,
            )
            .await;
            session.stop().await;
            match &res {
                Ok(failed) => span.ok(Some(serde_json::json!({ "failed": failed }))),
                Err(e) => span.err_anyhow("cli", "E_CLI_TRANSCRIBE", e, None),
            }
            Ok(if res? == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

/// Submits every file concurrently and prints results in argument order.
/// Returns how many files failed.
async fn transcribe_all(
    session: &TranscriptionSession,
    files: Vec<PathBuf>,
    ready_timeout: Duration,
    text_only: bool,
) -> Result<usize> {
    session.start().await.context("start worker failed")?;
    session
        .wait_ready(ready_timeout)
        .await
        .context("worker never became ready")?;

    let mut set = JoinSet::new();
    for (idx, file) in files.iter().enumerate() {
        let audio = read_audio(file)?;
        let id = uuid::Uuid::new_v4().to_string();
        let session = session.clone();
        set.spawn(async move {
            let res = session.submit(id.clone(), &audio).await;
            (idx, id, res)
        });
    }

    let mut done = Vec::with_capacity(files.len());
    while let Some(joined) = set.join_next().await {
        done.push(joined.context("transcription task panicked")?);
    }
    done.sort_by_key(|(idx, _, _)| *idx);

    let mut failed = 0;
    for (idx, id, res) in &done {
        let file = files[*idx].display().to_string();
        if res.is_err() {
            failed += 1;
        }
        if text_only {
            match res {
                Ok(t) => println!("{}", t.text),
                Err(e) => safe_eprintln!("{file}: {e} ({})", e.code()),
            }
            continue;
        }
        let line = FileResult {
            file,
            id,
            transcript: res.as_ref().ok(),
            error: res.as_ref().err().map(|e| FileError {
                code: e.code(),
                message: e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(failed)
}

fn read_audio(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read audio failed: {}", path.display()))
}
