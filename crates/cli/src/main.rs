use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use dx_core::{K8sEnvironment, Lifecycle, ServiceDefinition, ServiceKind};
use dx_env::{EnvironmentResolver, StateStore, SystemIdentity};
use dx_exec::{shell, CommandSpec, Executor};
use dx_graph::{GraphError, GraphValidator};
use dx_manifest::{ClusterManifest, Settings};
use dx_registry::{Catalog, ServiceRegistry};
use tracing::{error, info, warn};

mod cluster;
mod envs;
mod plan;
mod run;

use plan::{PlanFlags, Selection};

#[derive(Parser, Debug)]
#[command(name = "dx", version, about = "Service lifecycle and Kubernetes environments for the monorepo")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Continue past failures and report pass/fail counts
    #[arg(long = "keep-going", global = true, action = ArgAction::SetTrue)]
    keep_going: bool,

    /// Run a single target's dependency levels with bounded parallelism
    #[arg(long = "parallel", global = true, action = ArgAction::SetTrue)]
    parallel: bool,

    /// Restrict to a service group from dx.config.yml
    #[arg(long = "group", global = true)]
    group: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Args, Debug)]
struct LifecycleArgs {
    /// Service name (omit for all)
    service: Option<String>,
    /// Run only this service, skip dependencies
    #[arg(long = "single", action = ArgAction::SetTrue)]
    single: bool,
}

#[derive(Args, Debug)]
struct EnvLifecycleArgs {
    /// Service name (omit for all)
    service: Option<String>,
    /// Environment whose context and namespace are passed to the command
    #[arg(long = "env")]
    env: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check manifests and the dependency graph
    Validate,
    /// List discovered services
    Ls {
        #[arg(long = "kind")]
        kind: Option<String>,
        #[arg(long = "tag")]
        tag: Option<String>,
    },
    /// Start development for service(s)
    Dev(LifecycleArgs),
    Build(LifecycleArgs),
    Test(LifecycleArgs),
    Lint(LifecycleArgs),
    /// Run database migrations against an environment
    Migrate(EnvLifecycleArgs),
    /// Seed data into an environment
    Seed(EnvLifecycleArgs),
    /// Deploy service(s) into an environment
    Deploy {
        env: String,
        service: Option<String>,
    },
    /// Stream logs from a service's newest pod
    Logs {
        service: String,
        #[arg(short = 'f', long = "follow", action = ArgAction::SetTrue)]
        follow: bool,
        #[arg(short = 'n', long = "lines", default_value_t = 100)]
        lines: i64,
        #[arg(long = "container")]
        container: Option<String>,
        #[arg(long = "env")]
        env: Option<String>,
    },
    /// Open a shell in a service's newest pod
    Shell {
        service: String,
        #[arg(long = "cmd", default_value = "sh")]
        cmd: String,
        #[arg(long = "container")]
        container: Option<String>,
        #[arg(long = "env")]
        env: Option<String>,
    },
    /// Open a service in the browser, through ingress or a port-forward
    Open {
        service: String,
        /// Local port for port-forward
        #[arg(long = "port", default_value_t = 8080)]
        port: u16,
        /// Print the URL instead of opening a browser
        #[arg(long = "no-open", action = ArgAction::SetTrue)]
        no_open: bool,
        /// Port-forward even when the environment has a domain
        #[arg(long = "port-forward", action = ArgAction::SetTrue)]
        port_forward: bool,
        #[arg(long = "env")]
        env: Option<String>,
    },
    /// Manage the active environment
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },
    /// Cluster infrastructure
    K8s {
        #[command(subcommand)]
        command: K8sCommand,
    },
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    /// List configured environments
    List,
    /// Make an environment active
    Use { name: String },
    /// Show the active environment
    Current,
    /// Forget the active environment
    Clear,
}

#[derive(Subcommand, Debug)]
enum K8sCommand {
    /// Bootstrap the local kind cluster
    InitLocal,
}

fn init_tracing() {
    let env = std::env::var("DX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("DX_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid DX_METRICS_ADDR; expected host:port");
        }
    }
}

/// Everything one invocation shares: repo root, settings, the registry and the executor.
pub(crate) struct App {
    root: PathBuf,
    settings: Settings,
    registry: ServiceRegistry,
    executor: Executor,
    output: Output,
    keep_going: bool,
    parallel: bool,
    group: Option<String>,
}

impl App {
    fn load(cli: &Cli) -> Result<Self> {
        let root = dx_core::paths::repo_root();
        let settings = Settings::load(&root)?;
        let registry = ServiceRegistry::new(root.clone(), settings.service_discovery.clone());
        info!(root = %root.display(), "repository root");
        Ok(Self {
            keep_going: cli.keep_going || !settings.execution.exit_on_error,
            root,
            settings,
            registry,
            executor: Executor::new(),
            output: cli.output,
            parallel: cli.parallel,
            group: cli.group.clone(),
        })
    }

    fn json(&self) -> bool {
        self.output == Output::Json
    }

    /// Shell command for a service, run from its directory.
    fn service_spec(&self, svc: &ServiceDefinition, command: &str, vars: &BTreeMap<String, String>) -> CommandSpec {
        let mut spec = shell(command)
            .cwd(self.root.join(&svc.path))
            .service(svc.name.clone())
            .mise(self.settings.mise.enabled)
            .timeout(self.settings.execution.timeout());
        for (k, v) in vars {
            spec = spec.env(k.clone(), v.clone());
        }
        if !self.settings.execution.stream_logs {
            spec = spec.quiet();
        }
        spec
    }

    /// Manifest and graph validation. Nothing runs unless this passes.
    fn check_graph(&self, catalog: &Catalog) -> Result<()> {
        let problems = diagnostics(catalog);
        if problems.is_empty() {
            return Ok(());
        }
        for p in &problems {
            error!("{}", p);
        }
        bail!("{} validation problem(s); fix them and re-run `dx validate`", problems.len())
    }

    fn selection(&self, service: Option<String>) -> Result<Selection> {
        if let Some(name) = service {
            return Ok(Selection::One(name));
        }
        match &self.group {
            None => Ok(Selection::All),
            Some(g) => match self.settings.service_group(g) {
                Some(members) => Ok(Selection::Group(members.to_vec())),
                None => {
                    let known: Vec<&str> = self.settings.service_groups.keys().map(|k| k.as_str()).collect();
                    bail!("unknown service group '{}' (known: {})", g, known.join(", "))
                }
            },
        }
    }

    /// Graph errors with a "did you mean" hint for unknown names.
    fn graph_error(&self, catalog: &Catalog, err: GraphError) -> anyhow::Error {
        match &err {
            GraphError::ServiceNotFound { name } => {
                let hints = catalog.suggest(name, 3);
                if hints.is_empty() {
                    anyhow!("Service '{}' not found", name)
                } else {
                    anyhow!("Service '{}' not found. Did you mean: {}?", name, hints.join(", "))
                }
            }
            GraphError::Cycle { .. } => anyhow!(err),
        }
    }

    fn cluster_manifest(&self) -> Result<ClusterManifest> {
        Ok(ClusterManifest::load(&self.root)?)
    }

    fn state_store(&self, manifest: &ClusterManifest) -> StateStore {
        StateStore::from_config(&self.root, &manifest.state_config())
    }

    fn resolve_env(&self, manifest: &ClusterManifest, name: &str) -> Result<K8sEnvironment> {
        let identity = SystemIdentity::new(&self.executor).in_dir(&self.root);
        Ok(EnvironmentResolver::new(manifest, &identity).resolve(name)?)
    }

    /// `explicit` if given, otherwise the active environment.
    fn active_environment(&self, explicit: Option<&str>) -> Result<(ClusterManifest, K8sEnvironment)> {
        let manifest = self.cluster_manifest()?;
        let name = match explicit {
            Some(n) => n.to_string(),
            None => self
                .state_store(&manifest)
                .read_active()?
                .ok_or_else(|| anyhow!("No active Kubernetes environment set.\nRun: dx env use <name>"))?,
        };
        let env = self.resolve_env(&manifest, &name)?;
        Ok((manifest, env))
    }

    /// Like `active_environment`, but having none is fine.
    fn optional_environment(&self, explicit: Option<&str>) -> Result<Option<K8sEnvironment>> {
        if explicit.is_some() {
            return self.active_environment(explicit).map(|(_, env)| Some(env));
        }
        if !self.root.join(dx_core::paths::CLUSTER_MANIFEST).is_file() {
            return Ok(None);
        }
        let manifest = self.cluster_manifest()?;
        match self.state_store(&manifest).read_active()? {
            Some(name) => Ok(Some(self.resolve_env(&manifest, &name)?)),
            None => Ok(None),
        }
    }
}

/// Variables every environment-scoped service command receives.
pub(crate) fn env_vars(env: &K8sEnvironment) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("DX_ENV".to_string(), env.name.clone()),
        ("DX_KUBE_CONTEXT".to_string(), env.kube_context.clone()),
        ("DX_NAMESPACE".to_string(), env.namespace.clone()),
    ])
}

/// Registry problems as `<service>: <message>`, then graph problems.
fn diagnostics(catalog: &Catalog) -> Vec<String> {
    let mut out: Vec<String> = catalog
        .validate()
        .into_iter()
        .flat_map(|(svc, msgs)| msgs.into_iter().map(move |m| format!("{}: {}", svc, m)))
        .collect();
    out.extend(GraphValidator::new(catalog).validate());
    out
}

async fn validate(app: &App) -> Result<()> {
    let catalog = app.registry.discover();
    let problems = diagnostics(&catalog);
    if app.json() {
        #[derive(serde::Serialize)]
        struct Report<'a> {
            services: usize,
            errors: &'a [String],
        }
        println!("{}", serde_json::to_string_pretty(&Report { services: catalog.len(), errors: &problems })?);
    } else if problems.is_empty() {
        println!("✓ {} service(s), dependency graph is valid", catalog.len());
    } else {
        for p in &problems {
            println!("✗ {}", p);
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("validation failed with {} problem(s)", problems.len()))
    }
}

fn list(app: &App, kind: Option<&str>, tag: Option<&str>) -> Result<()> {
    let catalog = app.registry.discover();
    let mut services: Vec<&ServiceDefinition> = match kind {
        Some(k) => catalog.by_kind(ServiceKind::from_str(k).map_err(|e| anyhow!(e))?),
        None => catalog.all().collect(),
    };
    if let Some(t) = tag {
        services.retain(|s| s.tags.iter().any(|x| x == t));
    }
    match app.output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&services)?),
        Output::Human => {
            println!("{:<28} {:<8} {:<36} DESCRIPTION", "NAME", "KIND", "PATH");
            for s in services {
                println!("{:<28} {:<8} {:<36} {}", s.name, s.kind, s.path, s.description.as_deref().unwrap_or("-"));
            }
        }
    }
    Ok(())
}

async fn lifecycle(app: &App, lc: Lifecycle, service: Option<String>, single: bool, env: Option<&K8sEnvironment>) -> Result<()> {
    let catalog = app.registry.discover();
    app.check_graph(&catalog)?;
    let selection = app.selection(service)?;
    let flags = PlanFlags { single, parallel: app.parallel };
    let stages = plan::plan(&catalog, lc, &selection, flags).map_err(|e| app.graph_error(&catalog, e))?;
    let stages = plan::runnable(stages, lc);
    if stages.is_empty() {
        warn!("no services with a {} command", lc);
        return Ok(());
    }
    if let Some(env) = env {
        info!(env = %env.name, ns = %env.namespace, "running {} against environment", lc);
    }
    let vars = env.map(env_vars).unwrap_or_default();
    let rows = run::run_stages(app, &stages, lc, &vars).await;
    run::report(app, lc.as_str(), &rows)
}

async fn dispatch(cli: Cli) -> Result<()> {
    let app = App::load(&cli)?;
    match cli.command {
        Commands::Validate => validate(&app).await,
        Commands::Ls { kind, tag } => list(&app, kind.as_deref(), tag.as_deref()),
        Commands::Dev(a) => lifecycle(&app, Lifecycle::Dev, a.service, a.single, None).await,
        Commands::Build(a) => lifecycle(&app, Lifecycle::Build, a.service, a.single, None).await,
        Commands::Test(a) => lifecycle(&app, Lifecycle::Test, a.service, a.single, None).await,
        Commands::Lint(a) => lifecycle(&app, Lifecycle::Lint, a.service, a.single, None).await,
        Commands::Migrate(a) => {
            let env = app.optional_environment(a.env.as_deref())?;
            lifecycle(&app, Lifecycle::Migrate, a.service, false, env.as_ref()).await
        }
        Commands::Seed(a) => {
            let env = app.optional_environment(a.env.as_deref())?;
            lifecycle(&app, Lifecycle::Seed, a.service, false, env.as_ref()).await
        }
        Commands::Deploy { env, service } => cluster::deploy(&app, &env, service).await,
        Commands::Logs { service, follow, lines, container, env } => {
            cluster::logs(&app, &service, follow, lines, container, env.as_deref()).await
        }
        Commands::Shell { service, cmd, container, env } => {
            cluster::shell(&app, &service, &cmd, container.as_deref(), env.as_deref()).await
        }
        Commands::Open { service, port, no_open, port_forward, env } => {
            cluster::open(&app, &service, port, no_open, port_forward, env.as_deref()).await
        }
        Commands::Env { command } => match command {
            EnvCommand::List => envs::list(&app),
            EnvCommand::Use { name } => envs::use_env(&app, &name),
            EnvCommand::Current => envs::current(&app),
            EnvCommand::Clear => envs::clear(&app),
        },
        Commands::K8s { command } => match command {
            K8sCommand::InitLocal => cluster::init_local(&app).await.context("failed to initialize local cluster"),
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_core::{NamespaceStrategy, ResourceProfile};

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["dx", "build", "api", "--single", "-o", "json", "--keep-going"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(cli.keep_going);
        match cli.command {
            Commands::Build(a) => {
                assert_eq!(a.service.as_deref(), Some("api"));
                assert!(a.single);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn cli_parses_env_and_cluster_commands() {
        let cli = Cli::try_parse_from(["dx", "env", "use", "dev"]).unwrap();
        assert!(matches!(cli.command, Commands::Env { command: EnvCommand::Use { ref name } } if name == "dev"));
        let cli = Cli::try_parse_from(["dx", "logs", "api", "-f", "--lines", "20"]).unwrap();
        assert!(matches!(cli.command, Commands::Logs { follow: true, lines: 20, .. }));
        let cli = Cli::try_parse_from(["dx", "k8s", "init-local"]).unwrap();
        assert!(matches!(cli.command, Commands::K8s { command: K8sCommand::InitLocal }));
        assert!(Cli::try_parse_from(["dx", "deploy"]).is_err());
    }

    #[test]
    fn env_vars_carry_context_and_namespace() {
        let env = K8sEnvironment {
            name: "dev".into(),
            kube_context: "gke-dev".into(),
            namespace_strategy: NamespaceStrategy::PerUser,
            default_namespace: None,
            domain: None,
            resources_profile: ResourceProfile::Dev,
            description: None,
            kind_cluster: None,
            namespace: "dev-alice".into(),
            is_local: false,
        };
        let vars = env_vars(&env);
        assert_eq!(vars["DX_ENV"], "dev");
        assert_eq!(vars["DX_KUBE_CONTEXT"], "gke-dev");
        assert_eq!(vars["DX_NAMESPACE"], "dev-alice");
    }

    #[test]
    fn diagnostics_combine_registry_and_graph_problems() {
        let mut a = ServiceDefinition::new("a", ServiceKind::Api);
        a.dependencies.test.push("b".into());
        let mut b = ServiceDefinition::new("b", ServiceKind::Api);
        b.dependencies.test.push("a".into());
        b.infra.requires.push("mainframe".into());
        let problems = diagnostics(&Catalog::from_services(vec![a, b]));
        assert!(problems.iter().any(|p| p == "b: Unknown infra requirement: mainframe"), "{:?}", problems);
        assert!(problems.iter().any(|p| p.starts_with("Dependency cycle detected:")), "{:?}", problems);
    }
}
