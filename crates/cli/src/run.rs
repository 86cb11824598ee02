use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dx_core::Lifecycle;
use dx_exec::{CommandSpec, ExecResult};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::plan::Stages;
use crate::{App, Output};

/// Outcome of one service step, as printed by `-o json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub service: String,
    pub success: bool,
    pub code: i32,
    pub timed_out: bool,
    pub duration_ms: u128,
}

impl RunRow {
    pub fn from_exec(service: &str, r: &ExecResult) -> Self {
        Self {
            service: service.to_string(),
            success: r.success,
            code: r.code,
            timed_out: r.timed_out,
            duration_ms: r.duration.as_millis(),
        }
    }

    pub fn from_outcome(service: &str, ok: bool, duration: Duration) -> Self {
        Self { service: service.to_string(), success: ok, code: if ok { 0 } else { 1 }, timed_out: false, duration_ms: duration.as_millis() }
    }
}

/// Run stages in order; a stage of more than one service goes through the worker pool.
/// Without keep-going, the first stage with a failure is the last one started.
pub async fn run_stages(app: &App, stages: &Stages<'_>, lc: Lifecycle, vars: &BTreeMap<String, String>) -> Vec<RunRow> {
    let mut rows = Vec::new();
    let limit = app.settings.execution.parallel_limit;
    for (depth, stage) in stages.iter().enumerate() {
        let named: Vec<(&str, CommandSpec)> = stage
            .iter()
            .filter_map(|svc| svc.command(lc).map(|cmd| (svc.name.as_str(), app.service_spec(svc, cmd, vars))))
            .collect();
        let specs: Vec<CommandSpec> = named.iter().map(|(_, s)| s.clone()).collect();
        info!(stage = depth, services = named.len(), "{} stage starting", lc);
        let results = if specs.len() == 1 {
            vec![app.executor.run_streaming(&specs[0]).await]
        } else {
            app.executor.run_parallel(&specs, limit).await
        };
        let mut failed = false;
        for ((name, _), r) in named.iter().zip(results.iter()) {
            if !r.success {
                failed = true;
                error!(service = %name, code = r.code, timed_out = r.timed_out, "{} failed", lc);
            }
            rows.push(RunRow::from_exec(name, r));
        }
        if failed && !app.keep_going {
            warn!("stopping after failed stage {}", depth);
            break;
        }
    }
    rows
}

/// Print the outcome and turn any failure into an error (exit code 1).
pub fn report(app: &App, what: &str, rows: &[RunRow]) -> Result<()> {
    let failed: Vec<&str> = rows.iter().filter(|r| !r.success).map(|r| r.service.as_str()).collect();
    match app.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        Output::Human => {
            let passed = rows.len() - failed.len();
            if failed.is_empty() {
                println!("✓ {}: {} passed", what, passed);
            } else {
                println!("✗ {}: {} passed, {} failed ({})", what, passed, failed.len(), failed.join(", "));
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("{} failed for {} service(s)", what, failed.len()))
    }
}
