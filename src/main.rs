#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use nodecidr_controller::k8s::{NodeClient, NodeEvents};
use nodecidr_controller::{admin, labels, lease, taints, Controller};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LEASE_NAME: &str = "nodecidr-controller";
const DEFAULT_NAMESPACE: &str = "kube-system";

#[derive(Debug, StructOpt)]
#[structopt(
    name = "nodecidr-controller",
    about = "Assigns pod CIDRs to matching nodes and strips configured taints"
)]
struct Args {
    #[structopt(long, default_value = "info")]
    log_level: String,

    /// Supernet that node pod CIDRs are carved out of.
    #[structopt(long)]
    cluster_cidr: Ipv4Net,

    /// Prefix length of each node's pod CIDR.
    #[structopt(long, default_value = "24")]
    node_cidr_mask_size: u8,

    /// JSON array of label expressions selecting the nodes to assign.
    #[structopt(long, default_value = "")]
    node_selector: String,

    /// Comma-separated taints to strip (key, key:Effect, key=value:Effect).
    #[structopt(long, default_value = "")]
    remove_taints: String,

    #[structopt(long, parse(try_from_str), default_value = "true")]
    leader_elect: bool,

    #[structopt(long, parse(try_from_str = humantime::parse_duration), default_value = "15s")]
    leader_elect_lease_duration: Duration,

    #[structopt(long, parse(try_from_str = humantime::parse_duration), default_value = "10s")]
    renew_deadline: Duration,

    #[structopt(long, parse(try_from_str = humantime::parse_duration), default_value = "2s")]
    retry_period: Duration,

    #[structopt(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    #[structopt(long, default_value = "2")]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let selector =
        labels::Selector::parse(&args.node_selector).context("invalid --node-selector")?;
    let taint_remover =
        taints::TaintRemover::parse(&args.remove_taints).context("invalid --remove-taints")?;

    let client = kube::Client::try_default()
        .await
        .context("failed to configure the cluster client")?;

    let (store, events) = NodeEvents::with_store(client.clone());
    let controller = Arc::new(Controller::new(
        NodeClient::new(client.clone()),
        store,
        args.cluster_cidr,
        args.node_cidr_mask_size,
        selector,
        taint_remover,
    )?);

    let (ready_tx, ready_rx) = watch::channel(false);
    let admin_addr = args.admin_addr;
    tokio::spawn(async move {
        if let Err(error) = admin::serve(admin_addr, ready_rx).await {
            warn!(%error, "Admin server failed");
        }
    });

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    };
    let run = controller.run(events, ready_tx, args.workers, shutdown);

    if args.leader_elect {
        let elector = lease::Elector::new(
            client,
            &pod_namespace(),
            LEASE_NAME,
            identity(),
            args.leader_elect_lease_duration,
            args.renew_deadline,
            args.retry_period,
        );
        elector.run(run).await
    } else {
        run.await
    }
}

/// The namespace holding the leadership lease.
fn pod_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string())
}

/// The instance's identity for leader election: the pod's host name, with a
/// process-unique fallback for odd environments.
fn identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("nodecidr-{}", std::process::id()))
}
