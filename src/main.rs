use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use skipguard::{
    ExperimentPlan, GuardPolicy, IssuerNode, Node, NumId, SkipGraphConfig, SystemParameters,
    run_experiment,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GuardPolicyArg {
    Single,
    EveryLevel,
}

impl From<GuardPolicyArg> for GuardPolicy {
    fn from(arg: GuardPolicyArg) -> Self {
        match arg {
            GuardPolicyArg::Single => GuardPolicy::Single,
            GuardPolicyArg::EveryLevel => GuardPolicy::EveryLevel,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "skipguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the identifier and key issuer.
    Issuer {
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        #[arg(short, long, default_value = "1024")]
        capacity: u64,

        /// Seed for identifier assignment and the master key.
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value = "10")]
        rounds: u32,

        /// Upper bound of the pause between experiment rounds, in seconds.
        #[arg(long, default_value = "0")]
        wait_time: u64,
    },
    /// Register with an issuer and join the overlay.
    Node {
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,

        #[arg(short, long)]
        issuer: SocketAddr,

        /// Any live member. Without one the node starts a new overlay.
        #[arg(short, long)]
        entry: Option<SocketAddr>,

        #[arg(long, value_enum, default_value = "single")]
        guard_policy: GuardPolicyArg,

        /// Look up these numerical ids after joining.
        #[arg(short, long = "search", value_name = "NUM_ID")]
        search: Vec<NumId>,

        #[arg(short, long)]
        authenticated: bool,

        /// Run the issuer's experiment rounds after joining.
        #[arg(long)]
        experiment: bool,

        /// Seed for experiment targets and pauses.
        #[arg(long)]
        experiment_seed: Option<u64>,

        #[arg(long, default_value = "60")]
        status_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Issuer {
            bind,
            capacity,
            seed,
            rounds,
            wait_time,
        } => {
            let mut params = SystemParameters::with_capacity(capacity)?;
            params.round_count = rounds;
            params.wait_time_secs = wait_time;
            run_issuer(bind, params, seed).await
        }
        Command::Node {
            bind,
            issuer,
            entry,
            guard_policy,
            search,
            authenticated,
            experiment,
            experiment_seed,
            status_interval,
        } => {
            let config = SkipGraphConfig {
                guard_policy: guard_policy.into(),
                ..SkipGraphConfig::default()
            };
            let node = Node::register(&bind.to_string(), &issuer.to_string(), config).await?;
            let result = run_node(
                &node,
                entry,
                &search,
                authenticated,
                experiment.then_some(experiment_seed),
                status_interval,
            )
            .await;
            if let Err(e) = node.terminate().await {
                warn!(error = %e, "termination incomplete");
            }
            result
        }
    }
}

async fn run_issuer(bind: SocketAddr, params: SystemParameters, seed: Option<u64>) -> Result<()> {
    let issuer = IssuerNode::bind(&bind.to_string(), params, seed).await?;
    info!("Issuer listening on {}", issuer.local_addr()?);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(
        registered = issuer.issuer().registered().len(),
        "Received shutdown signal, exiting gracefully"
    );
    issuer.shutdown().await;
    Ok(())
}

async fn run_node(
    node: &Node,
    entry: Option<SocketAddr>,
    search: &[NumId],
    authenticated: bool,
    experiment: Option<Option<u64>>,
    status_interval: u64,
) -> Result<()> {
    info!("Node {} listening on {}", node.info(), node.local_addr()?);

    let report = match entry {
        Some(entry) => node.join_address(&entry.to_string()).await,
        None => node.join(None).await,
    }
    .context("join failed")?;
    info!(levels = report.levels_linked, "Join complete");

    match node.initialize_guards().await {
        Ok(guards) => info!(guards = guards.len(), "Guards initialized"),
        Err(e) => warn!(error = %e, "Guard initialization failed"),
    }

    for &target in search {
        if authenticated {
            match node.authenticated_search(target).await {
                Ok((found, transcript)) => info!(
                    target,
                    found = %found,
                    hops = transcript.transcript().len(),
                    guards = transcript.guard_signatures().len(),
                    "Authenticated search verified"
                ),
                Err(e) => warn!(target, error = %e, "Authenticated search failed"),
            }
        } else {
            match node.search(target).await {
                Ok(found) => info!(target, found = %found, "Search complete"),
                Err(e) => warn!(target, error = %e, "Search failed"),
            }
        }
    }

    if let Some(seed) = experiment {
        let plan = ExperimentPlan::from_parameters(&node.registration().system_parameters);
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cancel = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        match run_experiment(node.skipnode(), &plan, &mut rng, cancel).await {
            Ok(report) => info!(
                rounds = report.records.len(),
                found = report.found(),
                absent = report.absent(),
                mismatches = report.mismatches(),
                "Experiment complete"
            ),
            Err(e) => warn!(error = %e, "Experiment aborted"),
        }
    }

    let mut interval = time::interval(Duration::from_secs(status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let status = node.status().await;
                info!(
                    num_id = status.node.num_id,
                    levels = status.levels.len(),
                    guards = ?status.guards.iter().map(|g| g.num_id).collect::<Vec<_>>(),
                    "status snapshot"
                );
            }
        }
    }

    Ok(())
}
