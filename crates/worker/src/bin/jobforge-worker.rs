//! Worker process with the built-in handlers.
//!
//! - `echo`: returns the payload
//! - `sleep`: waits `{"ms": n}` milliseconds, reporting progress
//! - `fail`: errors with `{"message": "..."}`
//! - `crash`: exits the process with `{"code": n}` (default 101)

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use jobforge_worker::{HandlerError, HandlerRegistry, JobContext, WorkerRuntime, handler_fn};

#[derive(Debug, Deserialize)]
struct SleepArgs {
    ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct FailArgs {
    message: String,
}

impl Default for FailArgs {
    fn default() -> Self {
        Self {
            message: "job failed".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CrashArgs {
    code: i32,
}

impl Default for CrashArgs {
    fn default() -> Self {
        Self { code: 101 }
    }
}

async fn echo(ctx: JobContext) -> Result<Value, HandlerError> {
    Ok(ctx.payload().clone())
}

async fn sleep(ctx: JobContext) -> Result<Value, HandlerError> {
    let args: SleepArgs = ctx.decode_payload()?;
    let steps = 4u64;
    for step in 1..=steps {
        tokio::time::sleep(Duration::from_millis(args.ms / steps)).await;
        ctx.progress(json!(step * 100 / steps));
    }
    Ok(json!({"slept_ms": args.ms}))
}

async fn fail(ctx: JobContext) -> Result<Value, HandlerError> {
    let args = ctx.decode_payload::<Option<FailArgs>>()?.unwrap_or_default();
    Err(HandlerError::new(args.message))
}

async fn crash(ctx: JobContext) -> Result<Value, HandlerError> {
    let args = ctx.decode_payload::<Option<CrashArgs>>()?.unwrap_or_default();
    tracing::error!(code = args.code, job_id = %ctx.job_id(), "crashing on request");
    std::process::exit(args.code)
}

fn registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .register("echo", handler_fn(echo))
        .register("sleep", handler_fn(sleep))
        .register("fail", handler_fn(fail))
        .register("crash", handler_fn(crash))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init_for_worker();

    let runtime = WorkerRuntime::new(registry());
    runtime.run(tokio::io::stdin(), tokio::io::stdout()).await?;
    Ok(())
}
