//! `dx env list|use|current|clear`.

use anyhow::Result;
use dx_env::{format_environment, StateOutcome};
use serde::Serialize;
use tracing::warn;

use crate::{App, Output};

#[derive(Serialize)]
struct EnvRow<'a> {
    name: &'a str,
    kind: &'a str,
    kube_context: &'a str,
    namespace_strategy: String,
    description: Option<&'a str>,
    active: bool,
}

pub fn list(app: &App) -> Result<()> {
    let manifest = app.cluster_manifest()?;
    let active = app.state_store(&manifest).read_active()?;
    let rows: Vec<EnvRow<'_>> = manifest
        .environments
        .iter()
        .map(|(name, cfg)| EnvRow {
            name,
            kind: &cfg.kind,
            kube_context: &cfg.kube_context,
            namespace_strategy: cfg.namespace_strategy.to_string(),
            description: cfg.description.as_deref(),
            active: active.as_deref() == Some(name.as_str()),
        })
        .collect();
    match app.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        Output::Human => {
            for r in &rows {
                let marker = if r.active { "*" } else { " " };
                println!(
                    "{} {:<12} {:<24} {:<9} {}",
                    marker,
                    r.name,
                    r.kube_context,
                    r.namespace_strategy,
                    r.description.unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

pub fn use_env(app: &App, name: &str) -> Result<()> {
    let manifest = app.cluster_manifest()?;
    let env = app.resolve_env(&manifest, name)?;
    if !dx_kubehub::context_exists(&env.kube_context) {
        warn!(context = %env.kube_context, "kube context not found in kubeconfig; {}", dx_kubehub::remediation(&env));
    }
    match app.state_store(&manifest).write_active(name)? {
        StateOutcome::ExportRequired { command } => {
            println!("State backend is 'env'. Run:\n  {}", command);
        }
        _ => println!("✓ Switched to environment '{}'", name),
    }
    match app.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&env)?),
        Output::Human => println!("{}", format_environment(&env)),
    }
    Ok(())
}

pub fn current(app: &App) -> Result<()> {
    let manifest = app.cluster_manifest()?;
    let Some(name) = app.state_store(&manifest).read_active()? else {
        println!("No active environment. Run: dx env use <name>");
        return Ok(());
    };
    let env = app.resolve_env(&manifest, &name)?;
    match app.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&env)?),
        Output::Human => println!("{}", format_environment(&env)),
    }
    Ok(())
}

pub fn clear(app: &App) -> Result<()> {
    let manifest = app.cluster_manifest()?;
    match app.state_store(&manifest).clear_active()? {
        StateOutcome::ExportRequired { command } => println!("State backend is 'env'. Run:\n  {}", command),
        _ => println!("✓ Active environment cleared"),
    }
    Ok(())
}
