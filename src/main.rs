//! CLI entry point for muxfetch.

use std::io::{self, IsTerminal, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use muxfetch::fetch::{PageRules, fetch_page};
use muxfetch::http::{
    Attempt, Engine, FetchError, Method, RequestOptions, RetryPolicy, Session, SessionConfig,
    constants::{DEFAULT_RETRY_COUNT, PROXY_CYCLE_WAIT},
    with_failover,
};
use tokio::task::LocalSet;
use tracing::{debug, error, info};

mod app_config;
mod cli;

use app_config::FileConfig;
use cli::Args;

/// Everything a fetch task needs, resolved from CLI flags over file config.
#[derive(Debug, Clone)]
struct Settings {
    session: SessionConfig,
    policy: RetryPolicy,
    page: bool,
}

impl Settings {
    fn resolve(args: &Args, file: &FileConfig) -> Result<Self> {
        let mut defaults = RequestOptions::default();
        if let Some(secs) = args.connect_timeout.or(file.connect_timeout_secs) {
            defaults.connect_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(bytes) = args.max_size.or(file.max_response_size) {
            let limit = usize::try_from(bytes).context("max response size does not fit in memory")?;
            defaults.max_response_size = Some(limit);
        }
        if let Some(agent) = &file.user_agent {
            defaults = defaults.header("User-Agent", agent.as_str());
        }
        defaults.verbose = args.verbose >= 2;

        let proxies = if args.proxies.is_empty() {
            file.proxies.clone().unwrap_or_default()
        } else {
            args.proxies.clone()
        };
        let cycle_wait = args
            .cycle_wait
            .or(file.proxy_cycle_wait_secs)
            .map_or(PROXY_CYCLE_WAIT, Duration::from_secs);

        let policy = RetryPolicy::default()
            .with_retries_per_proxy(
                args.retries
                    .or(file.retry_count)
                    .unwrap_or(DEFAULT_RETRY_COUNT),
            )
            .with_wait_on_cycle(Some(cycle_wait))
            .with_deadline(args.deadline.or(file.deadline_secs).map(Duration::from_secs));

        Ok(Self {
            session: SessionConfig {
                defaults,
                proxies,
                proxy_cycle_wait: cycle_wait,
            },
            policy,
            page: args.page,
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_config(args.config.as_deref())?;
    if let Some(path) = &loaded.path {
        debug!(path = %path.display(), loaded = loaded.config.is_some(), "config file");
    }
    let file = loaded.config.unwrap_or_default();
    let settings = Settings::resolve(&args, &file)?;

    let urls = read_urls(&args.urls)?;
    if urls.is_empty() {
        info!("No input provided. Pass URLs as arguments or pipe them via stdin.");
        return Ok(());
    }
    info!(
        urls = urls.len(),
        proxies = settings.session.proxies.len(),
        "muxfetch starting"
    );

    let local = LocalSet::new();
    let results = local.run_until(fetch_all(urls, settings)).await?;

    let total = results.len();
    let mut failed = 0;
    let mut stdout = io::stdout().lock();
    for (url, outcome) in results {
        match outcome {
            Ok(fetched) => {
                info!(
                    url = %url,
                    status = fetched.status,
                    bytes = fetched.body.len(),
                    effective_url = %fetched.effective_url,
                    "fetched"
                );
                if args.output {
                    stdout.write_all(&fetched.body)?;
                }
            }
            Err(err) => {
                failed += 1;
                error!(url = %url, error = %err, "fetch failed");
            }
        }
    }
    stdout.flush()?;

    if failed > 0 {
        bail!("{failed} of {total} URLs failed");
    }
    Ok(())
}

fn read_urls(args: &[String]) -> Result<Vec<String>> {
    let input = if !args.is_empty() {
        args.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        String::new()
    };
    Ok(input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// What gets reported for one URL.
struct Fetched {
    status: u16,
    effective_url: String,
    body: Vec<u8>,
}

/// Fetches every URL concurrently through one shared session, so proxy
/// rotation and cycle waits carry over from one URL to the next.
async fn fetch_all(
    urls: Vec<String>,
    settings: Settings,
) -> Result<Vec<(String, Result<Fetched, FetchError>)>> {
    let engine = Engine::new().context("failed to create transfer engine")?;
    let session = Session::new(engine.clone(), settings.session.clone());

    let tasks: Vec<_> = urls
        .into_iter()
        .map(|url| {
            let mut session = session.clone();
            let settings = settings.clone();
            tokio::task::spawn_local(async move {
                let outcome = fetch_one(&mut session, &settings, &url).await;
                (url, outcome)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.context("fetch task panicked")?);
    }
    let stats = engine.pool_stats();
    debug!(created = stats.created, idle = stats.idle, "handle pool");
    Ok(results)
}

async fn fetch_one(
    session: &mut Session,
    settings: &Settings,
    url: &str,
) -> Result<Fetched, FetchError> {
    if settings.page {
        let page = fetch_page(
            session,
            &settings.policy,
            &PageRules::default(),
            url,
            &RequestOptions::default(),
        )
        .await?;
        return Ok(Fetched {
            status: 200,
            effective_url: page.effective_url,
            body: page.text.into_bytes(),
        });
    }

    let options = RequestOptions::default();
    with_failover(session, &settings.policy, url, |client| {
        let options = &options;
        async move {
            let response = client.fetch(Method::Get, url, options).await?;
            if !response.is_ok() {
                return Ok(Attempt::Rotate(format!("status {}", response.status)));
            }
            Ok(Attempt::Done(Fetched {
                status: response.status,
                effective_url: response.effective_url,
                body: response.body,
            }))
        }
    })
    .await
}
