//! Klaxon Operator
//!
//! Kubernetes operator for clustered notification pools. Compiles
//! RoutingFragment CRDs into per-Notifier configuration artifacts and
//! rolls the replica pools to match.

use clap::{Parser, Subcommand};
use klaxon_operator::{
    admission,
    controllers::{Context, NotifierController},
    crds::{Notifier, RoutingFragment},
};
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "klaxon-operator")]
#[command(about = "Kubernetes operator for klaxon notification clusters")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print CRD manifests to stdout
    Crds,
    /// Run the operator
    Run {
        /// Bind address for the validating admission webhook
        #[arg(long, env = "ADMISSION_ADDR", default_value = "0.0.0.0:8443")]
        admission_addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => {
            print_crds();
            Ok(())
        }
        Commands::Run { admission_addr } => run_operator(admission_addr).await,
    }
}

fn print_crds() {
    println!("---");
    println!(
        "{}",
        serde_yaml::to_string(&Notifier::crd()).expect("Failed to serialize Notifier CRD")
    );
    println!("---");
    println!(
        "{}",
        serde_yaml::to_string(&RoutingFragment::crd())
            .expect("Failed to serialize RoutingFragment CRD")
    );
}

async fn run_operator(admission_addr: SocketAddr) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    info!("Starting klaxon-operator");

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes");

    let ctx = Arc::new(Context::new(client.clone()));

    tokio::select! {
        _ = NotifierController::run(client, ctx) => {}
        res = admission::serve(admission_addr) => {
            if let Err(e) = res {
                error!(error = %e, "Admission webhook exited");
                return Err(e);
            }
        }
    }

    Ok(())
}
