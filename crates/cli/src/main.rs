use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use keel_api::builder::parse_manifests;
use keel_api::{Distribution, ResourceGroup};
use keel_apply::{ApplyEngine, EngineOptions};
use keel_artifact::RegistryResolver;
use keel_controller::runtime::{self, RuntimeConfig};
use keel_core::{BuildInputs, ChangeEntry, Inventory, ManagedObject, OwnerSelector, ResourceRef};
use keel_schema::parse_duration;
use keel_store::MemStore;
use serde::Serialize;
use serde_json::{json, Value as Json};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel declarative convergence engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers against the current cluster
    Run(RunArgs),
    /// Print the custom resource definitions as YAML
    Crds,
    /// Render managed objects offline and print the resulting resources
    Build(FileArgs),
    /// Apply rendered resources to an in-memory cluster and print the change set
    Plan(FileArgs),
    /// Run admission validation on managed objects
    Validate {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, env = "KEEL_CONCURRENCY", default_value_t = 4)]
    concurrency: u16,
    /// Default reconcile interval
    #[arg(long, env = "KEEL_DEFAULT_INTERVAL", default_value = "60m", value_parser = parse_duration)]
    interval: Duration,
    /// Default artifact check interval
    #[arg(long = "artifact-interval", env = "KEEL_ARTIFACT_INTERVAL", default_value = "10m", value_parser = parse_duration)]
    artifact_interval: Duration,
    #[arg(long = "field-manager", env = "KEEL_FIELD_MANAGER", default_value = keel_core::FIELD_MANAGER)]
    field_manager: String,
    /// Watch only this namespace (default: all namespaces)
    #[arg(long, env = "KEEL_WATCH_NAMESPACE")]
    namespace: Option<String>,
    #[arg(long = "backoff-base", env = "KEEL_BACKOFF_BASE", default_value = "5s", value_parser = parse_duration)]
    backoff_base: Duration,
    #[arg(long = "backoff-max", env = "KEEL_BACKOFF_MAX", default_value = "5m", value_parser = parse_duration)]
    backoff_max: Duration,
    /// Registry request timeout
    #[arg(long = "registry-timeout", env = "KEEL_REGISTRY_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    registry_timeout: Duration,
}

#[derive(Args, Debug)]
struct FileArgs {
    /// Multi-document YAML with ResourceGroup and Distribution objects
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
    /// Artifact digest to render Distributions with, instead of asking the registry
    #[arg(long)]
    digest: Option<String>,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// A managed object of any supported kind, read from a document.
fn managed(mut doc: Json) -> Result<Box<dyn ManagedObject>> {
    if doc.pointer("/metadata/namespace").is_none() {
        keel_core::json::set_namespace(&mut doc, "default");
    }
    let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
    Ok(match kind.as_str() {
        "ResourceGroup" => Box::new(serde_json::from_value::<ResourceGroup>(doc).context("decoding ResourceGroup")?),
        "Distribution" => Box::new(serde_json::from_value::<Distribution>(doc).context("decoding Distribution")?),
        other => bail!("unsupported kind {:?}; expected ResourceGroup or Distribution", other),
    })
}

fn read_documents(path: &Path) -> Result<Vec<Json>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_manifests(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn read_objects(args: &FileArgs) -> Result<Vec<Box<dyn ManagedObject>>> {
    read_documents(&args.file)?.into_iter().map(managed).collect()
}

fn inputs_for(obj: &dyn ManagedObject, digest: Option<&str>) -> Result<BuildInputs> {
    if obj.artifact().is_some() && digest.is_none() {
        bail!("{} tracks an artifact; pass --digest to render it offline", obj.identity());
    }
    Ok(BuildInputs { artifact_digest: digest.map(|d| d.to_string()) })
}

fn print_yaml_stream(docs: &[Json]) -> Result<()> {
    for doc in docs {
        println!("---");
        print!("{}", serde_yaml::to_string(doc)?);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanReport {
    object: ResourceRef,
    revision: String,
    changes: Vec<ChangeEntry>,
    inventory: Inventory,
}

async fn plan(obj: &dyn ManagedObject, digest: Option<&str>) -> Result<PlanReport> {
    let id = obj.identity();
    let resources = obj.render(&inputs_for(obj, digest)?).with_context(|| format!("rendering {}", id))?;
    let revision = keel_api::revision(&resources);

    let store = Arc::new(MemStore::new());
    let target = obj.target_namespace();
    let ns_ref = ResourceRef::new("v1", "Namespace", None, &target);
    if !target.is_empty() && !store.contains(&ns_ref) {
        store.insert(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": target } }))?;
    }
    let engine = ApplyEngine::new(store.clone());
    let opts = EngineOptions {
        default_namespace: Some(target).filter(|ns| !ns.is_empty()),
        skip_kinds: obj.prune_skip_kinds(),
        ..EngineOptions::default()
    };
    let owner = OwnerSelector::of(&id);
    let outcome = engine.apply(&owner, resources, &Inventory::new(), &opts).await.with_context(|| format!("planning {}", id))?;
    Ok(PlanReport { object: id, revision, changes: outcome.change_set.entries, inventory: outcome.inventory })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            let client = keel_kubehub::get_kube_client().await.context("connecting to the cluster")?;
            let resolver = Arc::new(RegistryResolver::new(args.registry_timeout).context("building registry client")?);
            let config = RuntimeConfig {
                concurrency: args.concurrency,
                default_interval: args.interval,
                artifact_interval: args.artifact_interval,
                field_manager: args.field_manager,
                namespace: args.namespace,
                backoff_base: args.backoff_base,
                backoff_max: args.backoff_max,
            };
            info!(?config, "starting keel");
            runtime::run(client, config, resolver).await;
        }
        Commands::Crds => print!("{}", keel_api::crds_yaml()?),
        Commands::Build(args) => {
            let mut rendered = Vec::new();
            for obj in read_objects(&args)? {
                let inputs = inputs_for(obj.as_ref(), args.digest.as_deref())?;
                rendered.extend(obj.render(&inputs).with_context(|| format!("rendering {}", obj.identity()))?);
            }
            match cli.output {
                Output::Human => print_yaml_stream(&rendered)?,
                Output::Json => println!("{}", serde_json::to_string_pretty(&rendered)?),
            }
        }
        Commands::Plan(args) => {
            let mut reports = Vec::new();
            for obj in read_objects(&args)? {
                reports.push(plan(obj.as_ref(), args.digest.as_deref()).await?);
            }
            match cli.output {
                Output::Human => {
                    for r in &reports {
                        println!("{} ({})", r.object, r.revision);
                        for e in &r.changes {
                            println!("  {} {}", e.object, e.action);
                        }
                        println!("  inventory: {} object(s)", r.inventory.len());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
            }
        }
        Commands::Validate { file } => {
            let mut failed = 0usize;
            for doc in read_documents(&file)? {
                let id = ResourceRef::from_object(&doc).map(|r| r.to_string()).unwrap_or_else(|_| "<unnamed>".into());
                match keel_schema::validate_object(&doc) {
                    Ok(()) => println!("{}: ok", id),
                    Err(errors) => {
                        failed += 1;
                        for e in errors {
                            println!("{}: {}", id, e);
                        }
                    }
                }
            }
            if failed > 0 {
                bail!("{} object(s) failed validation", failed);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_defaults() {
        let cli = Cli::try_parse_from(["keelctl", "run"]).unwrap();
        let Commands::Run(args) = cli.command else { panic!("expected run") };
        assert_eq!(args.interval, Duration::from_secs(3600));
        assert_eq!(args.backoff_max, Duration::from_secs(300));
        assert_eq!(args.field_manager, "keel");
    }

    #[test]
    fn managed_defaults_namespace_and_rejects_unknown_kinds() {
        let doc = json!({ "apiVersion": "keel.dev/v1", "kind": "ResourceGroup", "metadata": { "name": "apps" }, "spec": {} });
        let obj = managed(doc).unwrap();
        assert_eq!(obj.identity().to_string(), "ResourceGroup/default/apps");
        assert!(managed(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" } })).is_err());
    }

    #[tokio::test]
    async fn plan_applies_into_memory() {
        let doc = json!({
            "apiVersion": "keel.dev/v1", "kind": "ResourceGroup",
            "metadata": { "name": "apps", "namespace": "team" },
            "spec": { "resources": [{ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cfg" } }] }
        });
        let report = plan(managed(doc).unwrap().as_ref(), None).await.unwrap();
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.inventory.list()[0].namespace.as_deref(), Some("team"));
        assert!(report.revision.starts_with("blake3:"));
    }
}
