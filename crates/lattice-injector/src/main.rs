//! Lattice sidecar injector - render and publish injection templates

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lattice_common::crd::MeshConfig;
use lattice_common::kube_utils::create_client;
use lattice_injector::publisher::{self, FIELD_MANAGER};
use lattice_injector::{build_config_map, rbac, synthesize};

/// Render and publish sidecar injection templates for a Lattice mesh
#[derive(Parser, Debug)]
#[command(name = "lattice-injector", version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the injector ConfigMap as YAML
    Render {
        /// MeshConfig manifest
        #[arg(long, env = "LATTICE_MESH_CONFIG")]
        config: PathBuf,
    },

    /// Print only the injection template
    Template {
        /// MeshConfig manifest
        #[arg(long, env = "LATTICE_MESH_CONFIG")]
        config: PathBuf,
    },

    /// Server-side apply the injector ConfigMap to the current cluster
    Apply {
        /// MeshConfig manifest
        #[arg(long, env = "LATTICE_MESH_CONFIG")]
        config: PathBuf,

        /// Field manager used for server-side apply
        #[arg(long, env = "LATTICE_INJECTOR_FIELD_MANAGER", default_value = FIELD_MANAGER)]
        field_manager: String,

        /// Kubeconfig to use instead of the inferred configuration
        #[arg(long)]
        kubeconfig: Option<PathBuf>,

        /// Also apply the injector service account and cluster role
        #[arg(long)]
        with_rbac: bool,
    },

    /// Print the MeshConfig CRD
    Crd,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_mesh(path: &Path) -> anyhow::Result<MeshConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Render { config } => {
            let mesh = load_mesh(&config)?;
            let artifact = synthesize(&mesh)?;
            let config_map = build_config_map(&mesh, &artifact)?;
            print!("{}", serde_yaml::to_string(&config_map)?);
        }
        Commands::Template { config } => {
            let mesh = load_mesh(&config)?;
            print!("{}", synthesize(&mesh)?.template());
        }
        Commands::Apply {
            config,
            field_manager,
            kubeconfig,
            with_rbac,
        } => {
            let mesh = load_mesh(&config)?;
            let client = create_client(kubeconfig.as_deref()).await?;
            if with_rbac {
                rbac::apply_rbac(&client, &mesh, &field_manager).await?;
            }
            publisher::publish(&client, &mesh, &field_manager).await?;
        }
        Commands::Crd => {
            let crd = serde_yaml::to_string(&MeshConfig::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            print!("{crd}");
        }
    }

    Ok(())
}
