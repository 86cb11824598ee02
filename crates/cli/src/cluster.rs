//! Commands that talk to a cluster: deploy, logs, shell, open, k8s init-local.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use dx_apply::ApplyTarget;
use dx_core::{K8sEnvironment, Lifecycle, ServiceDefinition};
use dx_exec::CommandSpec;
use dx_manifest::{ImageRegistry, ResourceProfileConfig};
use dx_ops::{ClusterOps, ForwardEvent, KubeOps, LogOptions, StreamHandle};
use tracing::{debug, error, info, warn};

use crate::plan::{self, PlanFlags};
use crate::run::{self, RunRow};
use crate::{env_vars, App};

fn namespace_labels(env: &K8sEnvironment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), "dx".to_string()),
        ("dx.dev/environment".to_string(), env.name.clone()),
    ])
}

async fn connect(env: &K8sEnvironment) -> Result<kube::Client> {
    let client = dx_kubehub::client_for(env).await?;
    if !dx_kubehub::is_reachable(&client).await {
        bail!("cluster for context '{}' is not reachable; {}", env.kube_context, dx_kubehub::remediation(env));
    }
    Ok(client)
}

/// Services in deploy order: their own `deploy` command when they have one,
/// otherwise the rendered Deployment/Service pair.
pub async fn deploy(app: &App, env_name: &str, service: Option<String>) -> Result<()> {
    let catalog = app.registry.discover();
    app.check_graph(&catalog)?;
    let manifest = app.cluster_manifest()?;
    let env = app.resolve_env(&manifest, env_name)?;
    let selection = app.selection(service)?;
    let stages = plan::plan(&catalog, Lifecycle::Deploy, &selection, PlanFlags::default())
        .map_err(|e| app.graph_error(&catalog, e))?;

    let client = connect(&env).await?;
    let ops = KubeOps::new(client.clone(), env.namespace.clone(), env.name.clone());
    if ops.ensure_namespace(namespace_labels(&env)).await? {
        println!("✓ Created namespace '{}'", env.namespace);
    }

    let profile = match manifest.resource_profile(env.resources_profile.as_str()) {
        Ok(p) => Some(p),
        Err(e) => {
            warn!(error = %e, "deploying with default resources");
            None
        }
    };
    let vars = env_vars(&env);
    let mut rows = Vec::new();
    for svc in stages.into_iter().flatten() {
        let row = match svc.command(Lifecycle::Deploy) {
            Some(cmd) => {
                let r = app.executor.run_streaming(&app.service_spec(svc, cmd, &vars)).await;
                RunRow::from_exec(&svc.name, &r)
            }
            None => {
                let started = Instant::now();
                let targets = deploy_targets(app, svc, &env, manifest.image_registry.as_ref(), profile);
                let applied = match targets {
                    Ok(targets) => dx_apply::apply_targets(&client, &targets, &env.namespace).await,
                    Err(e) => Err(e),
                };
                match applied {
                    Ok(objs) => {
                        for o in &objs {
                            let verb = if o.created { "created" } else { "configured" };
                            info!(service = %svc.name, kind = %o.kind, name = %o.name, "{}", verb);
                        }
                        RunRow::from_outcome(&svc.name, true, started.elapsed())
                    }
                    Err(e) => {
                        error!(service = %svc.name, error = %format!("{:#}", e), "apply failed");
                        RunRow::from_outcome(&svc.name, false, started.elapsed())
                    }
                }
            }
        };
        let failed = !row.success;
        rows.push(row);
        if failed && !app.keep_going {
            break;
        }
    }
    run::report(app, &format!("deploy to {}", env.name), &rows)
}

/// Manifests under `<service>/k8s/` when there are any, else the rendered pair.
fn deploy_targets(
    app: &App,
    svc: &ServiceDefinition,
    env: &K8sEnvironment,
    registry: Option<&ImageRegistry>,
    profile: Option<&ResourceProfileConfig>,
) -> Result<Vec<ApplyTarget>> {
    let files = dx_apply::manifest_files(&app.root.join(&svc.path).join(dx_apply::MANIFEST_DIR))?;
    if !files.is_empty() {
        debug!(service = %svc.name, files = files.len(), "applying service manifests");
        return dx_apply::load_targets(&files);
    }
    let image = dx_apply::image_for(svc, registry);
    dx_apply::render_service_pair(svc, env, profile, &image)
}

pub async fn logs(
    app: &App,
    service: &str,
    follow: bool,
    lines: i64,
    container: Option<String>,
    env: Option<&str>,
) -> Result<()> {
    let (_, env) = app.active_environment(env)?;
    let ops = KubeOps::for_environment(&env).await?;
    let pod = ops.newest_pod(service).await?;
    info!(service = %service, pod = %pod, ns = %env.namespace, "streaming logs");
    let handle = ops.logs(&pod, LogOptions { follow, tail_lines: Some(lines), container }).await?;
    tokio::select! {
        _ = dx_ops::print_lines(handle) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received; stopping log stream");
        }
    }
    Ok(())
}

pub async fn shell(app: &App, service: &str, cmd: &str, container: Option<&str>, env: Option<&str>) -> Result<()> {
    let (_, env) = app.active_environment(env)?;
    let ops = KubeOps::for_environment(&env).await?;
    let pod = ops.newest_pod(service).await?;
    let tty = std::io::stdin().is_terminal();
    info!(service = %service, pod = %pod, tty, "opening shell");
    ops.exec(&pod, container, &shell_argv(cmd), tty).await
}

/// `--cmd` is a command line, so it goes through the pod's shell.
fn shell_argv(cmd: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), cmd.to_string()]
}

/// Ingress URL for remote environments with a domain, otherwise a port-forward to the newest pod.
pub async fn open(app: &App, service: &str, port: u16, no_open: bool, port_forward: bool, env: Option<&str>) -> Result<()> {
    let (_, env) = app.active_environment(env)?;
    if let (false, Some(domain), false) = (env.is_local, env.domain.as_deref(), port_forward) {
        let url = format!("http://{}.{}", service, domain);
        println!("Service URL: {}", url);
        if !no_open {
            open_browser(app, &url);
        }
        return Ok(());
    }

    let ops = KubeOps::for_environment(&env).await?;
    let remote = ops
        .service_port(service)
        .await?
        .ok_or_else(|| anyhow!("Service '{}' not found in namespace '{}'", service, env.namespace))?;
    let pod = ops.newest_pod(service).await?;
    info!(service = %service, pod = %pod, local = port, remote, "setting up port-forward");
    let StreamHandle { mut rx, cancel } = ops.port_forward(&pod, port, remote).await?;
    loop {
        tokio::select! {
            ev = rx.recv() => match ev {
                Some(ForwardEvent::Ready(addr)) => {
                    let url = format!("http://{}", addr);
                    println!("Service URL: {} (Ctrl-C to stop)", url);
                    if !no_open {
                        open_browser(app, &url);
                    }
                }
                Some(ForwardEvent::Connected(peer)) => debug!(peer = %peer, "connection forwarded"),
                Some(ForwardEvent::Error(e)) => warn!(error = %e, "port-forward error"),
                Some(ForwardEvent::Closed) | None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received; closing port-forward");
                break;
            }
        }
    }
    cancel.cancel();
    Ok(())
}

fn open_browser(app: &App, url: &str) {
    for opener in ["open", "xdg-open"] {
        let r = app.executor.run_blocking(&CommandSpec::new(opener, [url]).quiet().ignore_errors(true));
        if r.success {
            return;
        }
    }
    println!("Could not open a browser. Visit: {}", url);
}

fn tool_available(app: &App, program: &str, args: &[&str]) -> bool {
    let spec = CommandSpec::new(program, args.iter().copied()).quiet().ignore_errors(true);
    app.executor.run_blocking(&spec).success
}

/// Create the kind cluster for the local environment if needed, then make sure
/// the context answers and the namespace exists.
pub async fn init_local(app: &App) -> Result<()> {
    let manifest = app.cluster_manifest()?;
    let name = match app.state_store(&manifest).read_active()? {
        Some(n) => n,
        None if manifest.environment_exists(dx_core::LOCAL_ENV) => dx_core::LOCAL_ENV.to_string(),
        None => bail!("No '{}' environment found in .dx/config.yaml", dx_core::LOCAL_ENV),
    };
    let env = app.resolve_env(&manifest, &name)?;
    if !env.is_local {
        bail!("dx k8s init-local only works with the '{}' environment; active environment is '{}'", dx_core::LOCAL_ENV, name);
    }
    let Some(kind) = env.kind_cluster.clone() else {
        bail!("Environment '{}' is not configured for kind. Add kindCluster to .dx/config.yaml", name);
    };

    println!("Checking prerequisites:");
    let tools: [(&str, &[&str], &str); 3] = [
        ("kind", &["version"], "https://kind.sigs.k8s.io/docs/user/quick-start/"),
        ("kubectl", &["version", "--client"], "https://kubernetes.io/docs/tasks/tools/"),
        ("docker", &["info"], "https://docs.docker.com/get-docker/"),
    ];
    for (tool, args, install) in tools {
        if !tool_available(app, tool, args) {
            bail!("'{}' is not available (install from {})", tool, install);
        }
        println!("  ✓ {}", tool);
    }

    let clusters = app.executor.run_blocking(&CommandSpec::new("kind", ["get", "clusters"]).quiet().ignore_errors(true));
    let exists = clusters.success && clusters.stdout.lines().any(|l| l.trim() == kind.name);
    if exists {
        println!("✓ Kind cluster '{}' already exists", kind.name);
    } else {
        let mut args = vec!["create".to_string(), "cluster".into(), "--name".into(), kind.name.clone()];
        let config = app.root.join(dx_core::paths::DX_DIR).join(kind.config.as_deref().unwrap_or("kind-config.yaml"));
        if config.is_file() {
            args.push("--config".into());
            args.push(config.display().to_string());
        } else {
            warn!(path = %config.display(), "kind config not found; creating cluster with defaults");
        }
        println!("Creating kind cluster '{}'...", kind.name);
        let r = app.executor.run_streaming(&CommandSpec::new("kind", args).service("kind")).await;
        if !r.success {
            bail!("kind create cluster exited with code {}", r.code);
        }
        println!("✓ Kind cluster '{}' created", kind.name);
    }

    if !dx_kubehub::context_exists(&env.kube_context) {
        warn!(context = %env.kube_context, "context not found in kubeconfig after cluster setup");
    }
    let client = connect(&env).await?;
    println!("✓ Cluster is reachable");

    let ops = KubeOps::new(client, env.namespace.clone(), env.name.clone());
    let labels = BTreeMap::from([("kind".to_string(), "local".to_string()), ("purpose".to_string(), "development".to_string())]);
    if ops.ensure_namespace(labels).await? {
        println!("✓ Namespace '{}' created", env.namespace);
    } else {
        println!("✓ Namespace '{}' already exists", env.namespace);
    }

    println!("\nNext steps:\n  dx deploy {} <service>\n  dx logs <service> -f\n  dx open <service>", name);
    Ok(())
}
