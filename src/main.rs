use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use hc_case_scout::core::config::load_scout_config;
use hc_case_scout::core::types::{SearchRequest, SearchRequestSpec};
use hc_case_scout::core::types::CaseStatusFilter;
use hc_case_scout::features::extract::ResultExtractor;
use hc_case_scout::features::sweep::parse_court_list;
use hc_case_scout::{
    ArtifactWriter, BatchRunner, CaptchaResolver, CaseStore, PortalConfig, SearchOrchestrator, SessionFactory,
    SessionPool, SqliteCaseStore, SweepPlan, Topology,
};

const USAGE: &str = "\
case-scout: batch case-status searches against the eCourts High Court portal

USAGE:
    case-scout --requests <file.json> [--config <path>]
    case-scout --sweep [--courts 26,3] [--party kumar] [--year <yyyy>] [--status both]
    case-scout --discover [--config <path>]
    case-scout --stats [--config <path>]

OPTIONS:
    --requests <file>   JSON array of search requests to run
    --sweep             party-name search on every bench of the target courts
      --courts <ids>    comma-separated court values (default: 26,3)
      --party <name>    party name to search for (default: kumar)
      --year <yyyy>     registration year filter
      --status <s>      pending, disposed or both (default: both)
    --discover          print every High Court and its benches
    --stats             print search and case statistics from the store
    --config <path>     case-scout.json to load (default: $CASE_SCOUT_CONFIG,
                        ./case-scout.json, ~/.case-scout/case-scout.json)
    --version           print version
    --help              print this message

Environment variables (HEADLESS, MAX_RESULTS, WORKERS, DATABASE_PATH, ...)
fill in anything the config file leaves out.";

#[derive(Debug, Default)]
struct Args {
    requests: Option<PathBuf>,
    sweep: Option<SweepPlan>,
    config: Option<PathBuf>,
    discover: bool,
    stats: bool,
    version: bool,
    help: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut sweep = false;
    let mut plan = SweepPlan::default();
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| anyhow::anyhow!("{} needs a value", flag));
        match a.as_str() {
            "--sweep" => sweep = true,
            "--courts" => {
                plan.court_ids = parse_court_list(&value("--courts")?);
                if plan.court_ids.is_empty() {
                    anyhow::bail!("--courts needs at least one court value");
                }
            }
            "--party" => plan.party = value("--party")?,
            "--year" => {
                let y = value("--year")?;
                plan.year = Some(y.parse().map_err(|_| anyhow::anyhow!("invalid --year '{}'", y))?);
            }
            "--status" => {
                plan.status = value("--status")?
                    .parse::<CaseStatusFilter>()
                    .map_err(|e| anyhow::anyhow!(e))?;
            }
            "--requests" => out.requests = Some(PathBuf::from(value("--requests")?)),
            "--config" => out.config = Some(PathBuf::from(value("--config")?)),
            "--discover" => out.discover = true,
            "--stats" => out.stats = true,
            "--version" | "-V" => out.version = true,
            "--help" | "-h" => out.help = true,
            other => {
                if let Some(v) = other.strip_prefix("--requests=") {
                    out.requests = Some(PathBuf::from(v));
                } else if let Some(v) = other.strip_prefix("--config=") {
                    out.config = Some(PathBuf::from(v));
                } else {
                    anyhow::bail!("unknown argument: {}", other);
                }
            }
        }
    }
    if sweep {
        out.sweep = Some(plan);
    }
    Ok(out)
}

fn load_requests(path: &Path, cfg: &PortalConfig) -> anyhow::Result<Vec<SearchRequest>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    let specs: Vec<SearchRequestSpec> = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("invalid request file {}: {}", path.display(), e))?;
    Ok(specs
        .into_iter()
        .map(|s| s.into_request(cfg.max_results))
        .collect())
}

async fn print_stats(store: &SqliteCaseStore) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn discover(pool: &Arc<SessionPool>, topology: &Topology) -> anyhow::Result<()> {
    let mut session = pool.open().await?;
    let listing = topology.discover_all(session.driver()).await;
    session.release().await;

    for (court, benches) in listing? {
        println!("{}\t{}", court.id, court.name);
        for bench in benches.iter() {
            println!("    {}\t{}", bench.id, bench.name);
        }
    }
    Ok(())
}

/// Build the sweep's requests from the live court/bench listing.
async fn sweep_requests(
    pool: &Arc<SessionPool>,
    topology: &Topology,
    plan: &SweepPlan,
    cfg: &PortalConfig,
) -> anyhow::Result<Vec<SearchRequest>> {
    let mut session = pool.open().await?;
    let listing = plan.listing(topology, session.driver()).await;
    session.release().await;

    let requests = plan.requests(&listing?, cfg.max_results);
    info!(
        courts = plan.court_ids.len(),
        party = %plan.party,
        "🧹 Sweep planned: {} bench searches",
        requests.len()
    );
    Ok(requests)
}

async fn run_batch(
    cfg: Arc<PortalConfig>,
    pool: &Arc<SessionPool>,
    topology: Arc<Topology>,
    store: Arc<SqliteCaseStore>,
    requests: Vec<SearchRequest>,
) -> anyhow::Result<()> {
    let extractor = Arc::new(ResultExtractor::new(&cfg.selectors)?);
    let resolver = CaptchaResolver::from_config(&cfg);
    let orchestrator = Arc::new(SearchOrchestrator::new(Arc::clone(&cfg), topology, resolver, extractor));

    let run_id = uuid::Uuid::new_v4().to_string();
    let artifacts = Arc::new(ArtifactWriter::new(&cfg.artifacts_dir, &run_id));
    let sessions: Arc<dyn SessionFactory> = Arc::new(Arc::clone(pool));
    let runner = BatchRunner::new(run_id, orchestrator, sessions, store.clone(), cfg.workers)
        .with_artifacts(Arc::clone(&artifacts));

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C received; cancelling remaining searches");
            cancel.cancel();
        }
    });

    let summary = runner.run(requests).await;
    for outcome in &summary.outcomes {
        println!("{}", serde_json::to_string(outcome)?);
    }
    info!("📁 Run artifacts in {}", artifacts.run_dir().display());
    print_stats(&store).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chromiumoxide=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };
    if args.version {
        println!("case-scout {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.help || (args.requests.is_none() && args.sweep.is_none() && !args.discover && !args.stats) {
        println!("{}", USAGE);
        return Ok(());
    }

    let cfg = Arc::new(load_scout_config(args.config.as_deref()).resolve());
    url::Url::parse(&cfg.base_url).map_err(|e| anyhow::anyhow!("invalid base_url '{}': {}", cfg.base_url, e))?;
    info!(
        headless = cfg.headless,
        workers = cfg.workers,
        captcha_max_attempts = cfg.captcha_max_attempts,
        "Starting case-scout against {}",
        cfg.base_url
    );

    let store = Arc::new(SqliteCaseStore::open(&cfg.database_path)?);
    if args.stats && args.requests.is_none() && args.sweep.is_none() && !args.discover {
        return print_stats(&store).await;
    }

    let pool = SessionPool::from_config(&cfg)?;
    let topology = Arc::new(Topology::new(Arc::clone(&cfg)));

    let result = async {
        if args.discover {
            discover(&pool, &topology).await?;
        }
        let mut requests = Vec::new();
        if let Some(path) = &args.requests {
            requests.extend(load_requests(path, &cfg)?);
        }
        if let Some(plan) = &args.sweep {
            requests.extend(sweep_requests(&pool, &topology, plan, &cfg).await?);
        }
        if args.requests.is_some() || args.sweep.is_some() {
            run_batch(Arc::clone(&cfg), &pool, Arc::clone(&topology), store.clone(), requests).await?;
        } else if args.stats {
            print_stats(&store).await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    pool.shutdown().await;
    if let Err(e) = &result {
        error!("case-scout failed: {:#}", e);
    }
    result
}
