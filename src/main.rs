use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use namespace_sharding::config::ControllerConfig;
use namespace_sharding::coordination::{CoordinationClient, CreateMode, MemoryCoordinator};
use namespace_sharding::paths::NamespacePaths;
use namespace_sharding::sharding::{JobAssignment, JobConfig};
use namespace_sharding::shutdown::install_shutdown_handler;
use namespace_sharding::ShardingController;

#[derive(Parser, Debug)]
#[command(name = "namespace-sharding")]
#[command(version)]
#[command(about = "Namespace-scoped sharding coordination against an in-process coordination service")]
struct Args {
    /// Host value this process contends for leadership with
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Namespaces to run a controller for (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "default")]
    namespaces: Vec<String>,

    /// Jobs to create in every namespace, as "name:shards" (comma-separated)
    /// Example: "billing:4,reports:2"
    #[arg(long, value_delimiter = ',')]
    seed_jobs: Vec<String>,

    /// Executors to bring online in every namespace (comma-separated)
    #[arg(long, value_delimiter = ',')]
    seed_executors: Vec<String>,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Capacity of each controller's sharding event queue
    #[arg(long, default_value = "256")]
    sharding_queue_capacity: usize,
}

#[derive(Debug, Serialize)]
struct NamespaceSummary {
    namespace: String,
    leader: Option<String>,
    assignments: Vec<JobAssignment>,
}

fn parse_seed_job(value: &str) -> Result<(String, JobConfig), String> {
    let (name, shards) = value
        .split_once(':')
        .ok_or_else(|| format!("invalid job '{}', expected name:shards", value))?;
    let shards: u32 = shards
        .parse()
        .map_err(|e| format!("invalid shard count in '{}': {}", value, e))?;
    if name.is_empty() {
        return Err(format!("invalid job '{}', empty name", value));
    }
    Ok((name.to_string(), JobConfig::new(shards)))
}

async fn seed(
    client: &dyn CoordinationClient,
    namespace: &str,
    jobs: &[(String, JobConfig)],
    executors: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let paths = NamespacePaths::new(namespace);
    for (name, config) in jobs {
        let path = paths.job_config(name);
        if !client.exists(&path).await? {
            client
                .create(&path, serde_json::to_vec(config)?, CreateMode::Persistent)
                .await?;
        }
    }
    for executor in executors {
        client
            .create(
                &paths.executor_ip(executor),
                executor.as_bytes().to_vec(),
                CreateMode::Ephemeral,
            )
            .await?;
    }
    tracing::info!(namespace, jobs = jobs.len(), executors = executors.len(), "Seeded namespace");
    Ok(())
}

async fn summarize(
    client: &dyn CoordinationClient,
    namespace: &str,
) -> Result<NamespaceSummary, Box<dyn std::error::Error>> {
    let paths = NamespacePaths::new(namespace);
    let leader = client
        .get_data(&paths.leader_host())
        .await?
        .map(|d| String::from_utf8_lossy(&d).into_owned());

    let mut assignments = Vec::new();
    let jobs = if client.exists(&paths.jobs_root()).await? {
        client.children(&paths.jobs_root()).await?
    } else {
        Vec::new()
    };
    for job in jobs {
        if let Some(data) = client.get_data(&paths.job_assignment(&job)).await? {
            assignments.push(serde_json::from_slice(&data)?);
        }
    }

    Ok(NamespaceSummary {
        namespace: namespace.to_string(),
        leader,
        assignments,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let seed_jobs = args
        .seed_jobs
        .iter()
        .map(|s| parse_seed_job(s))
        .collect::<Result<Vec<_>, _>>()?;

    let coordinator = MemoryCoordinator::new();
    // Seeded executors live on their own session, like real executor processes
    let executor_session = coordinator.connect();

    let config = ControllerConfig::new(&args.host)
        .with_sharding_queue_capacity(args.sharding_queue_capacity);

    let mut controllers = Vec::new();
    for namespace in &args.namespaces {
        let controller = ShardingController::with_config(
            coordinator.connect(),
            namespace.clone(),
            config.clone(),
        );
        controller.start().await?;
        controllers.push(controller);
    }

    for namespace in &args.namespaces {
        seed(
            executor_session.as_ref(),
            namespace,
            &seed_jobs,
            &args.seed_executors,
        )
        .await?;
    }

    let shutdown_token = install_shutdown_handler()?;
    tracing::info!(
        host = %args.host,
        namespaces = ?args.namespaces,
        "Controllers running"
    );

    match args.run_for_secs {
        Some(secs) => {
            tokio::select! {
                _ = shutdown_token.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!(secs, "Run time elapsed, stopping controllers");
                }
            }
        }
        None => shutdown_token.cancelled().await,
    }

    let mut summaries = Vec::new();
    for controller in &controllers {
        summaries.push(summarize(executor_session.as_ref(), controller.namespace()).await?);
    }

    for controller in &controllers {
        controller.stop().await;
    }
    shutdown_token.cancel();
    executor_session.close();

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
