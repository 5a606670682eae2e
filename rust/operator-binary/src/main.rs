mod conditions;
mod config;
mod controller;
mod crd;
mod janitor;
mod platform;
mod rollout;
mod token;

use std::sync::Arc;

use clap::Parser;
use futures::stream::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client, CustomResourceExt};

use crate::crd::NodePool;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Prints the NodePool CustomResourceDefinition as YAML.
    Crd,
    /// Runs the operator.
    Run(RunArguments),
}

#[derive(clap::Args)]
struct RunArguments {
    /// Namespace to restrict the NodePool watch to. Defaults to watching every
    /// namespace when unset.
    #[clap(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&NodePool::crd())?);
        }
        Command::Run(RunArguments { watch_namespace }) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_env("NODEPOOL_OPERATOR_LOG")
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                )
                .init();

            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            let client = Client::try_default().await?;
            let runtime_config = config::RuntimeConfig::from_env();

            let node_pool_api: Api<NodePool> = match &watch_namespace {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            };

            let node_pool_controller = Controller::new(node_pool_api, watcher::Config::default())
                .shutdown_on_signal()
                .run(
                    controller::reconcile,
                    controller::error_policy,
                    Arc::new(controller::Ctx {
                        client: client.clone(),
                        runtime_config,
                    }),
                )
                .for_each_concurrent(16, |result| async move {
                    match result {
                        Ok((object_ref, _)) => {
                            tracing::debug!(nodepool = ?object_ref, "reconciled");
                        }
                        Err(error) => {
                            tracing::warn!(%error, "nodepool reconcile failed");
                        }
                    }
                });

            let secret_janitor = janitor::controller(client.clone())
                .shutdown_on_signal()
                .run(
                    janitor::reconcile,
                    janitor::error_policy,
                    Arc::new(janitor::Ctx {
                        client: client.clone(),
                    }),
                )
                .for_each_concurrent(16, |result| async move {
                    if let Err(error) = result {
                        tracing::warn!(%error, "secret janitor reconcile failed");
                    }
                });

            tokio::join!(node_pool_controller, secret_janitor);
        }
    }

    Ok(())
}
