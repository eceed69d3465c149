use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gd_config::DispatchConfig;
use gd_health::CredentialHealthTracker;
use gd_worker::{DispatchEngine, LogSink, MemorySink, configured_credential_ids, connect_store};
use tracing::info;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = DispatchConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run { status_interval } => run(config, status_interval).await,
        Commands::Grade {
            file,
            rubric,
            session,
            user,
            preference,
        } => grade(config, file, rubric, session, user, preference).await,
        Commands::Health => health(config).await,
        Commands::Check => check(config).await,
    }
}

async fn run(config: DispatchConfig, status_interval: u64) -> Result<()> {
    let store = connect_store(&config).await?;
    let engine = DispatchEngine::start(&config, store, Arc::new(LogSink)).await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = engine.queue_status();
                info!(
                    waiting = status.waiting,
                    active = status.active,
                    delayed = status.delayed,
                    completed = status.completed,
                    failed = status.failed,
                    rate_limited = status.is_rate_limited,
                    "queue status"
                );
            }
        }
    }

    info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

async fn grade(
    config: DispatchConfig,
    file: std::path::PathBuf,
    rubric: std::path::PathBuf,
    session: String,
    user: String,
    preference: Option<gd_core::ModelPreference>,
) -> Result<()> {
    let file_text = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read submission file: {}", file.display()))?;
    let rubric_text = std::fs::read_to_string(&rubric)
        .with_context(|| format!("Failed to read rubric file: {}", rubric.display()))?;
    let rubric_json: serde_json::Value = serde_json::from_str(&rubric_text)
        .with_context(|| format!("Rubric is not valid JSON: {}", rubric.display()))?;

    let store = connect_store(&config).await?;
    let sink = Arc::new(MemorySink::new());
    let engine = DispatchEngine::start(&config, store, sink.clone()).await?;

    let job_id = engine.create_job(session, user, file_text, rubric_json, preference);
    let result = loop {
        if let Some(result) = sink.result_for(job_id) {
            break result;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };
    engine.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Probe each configured provider endpoint and report reachability.
async fn check(config: DispatchConfig) -> Result<()> {
    use gd_core::ProviderId;
    use gd_provider::{Credential, GeminiProvider, HttpProvider, ProviderClient};

    let timeout = config.probe_timeout();
    let mut unreachable = 0usize;
    let mut report = |name: &str, ok: bool| {
        println!("{name}: {}", if ok { "reachable" } else { "UNREACHABLE" });
        if !ok {
            unreachable += 1;
        }
    };

    if let Some(local) = &config.providers.local {
        let provider = HttpProvider::new(
            ProviderId::Local,
            &local.base_url,
            &local.model,
            vec![Credential {
                id: "local-key-1".to_string(),
                api_key: local.api_key.clone().unwrap_or_default(),
            }],
            config.provider_timeout(),
        )?;
        report("local", provider.probe(timeout).await);
    }

    if let Some(primary) = &config.providers.primary {
        let credentials: Vec<Credential> = primary
            .api_keys
            .iter()
            .enumerate()
            .map(|(index, api_key)| Credential {
                id: format!("primary-key-{}", index + 1),
                api_key: api_key.clone(),
            })
            .collect();
        let provider = GeminiProvider::new(
            &primary.base_url,
            &primary.model,
            credentials,
            config.provider_timeout(),
        )?;
        report("primary-cloud", provider.probe(timeout).await);
    }

    if let Some(secondary) = &config.providers.secondary {
        let provider = HttpProvider::new(
            ProviderId::SecondaryCloud,
            &secondary.base_url,
            &secondary.model,
            vec![Credential {
                id: "secondary-key-1".to_string(),
                api_key: secondary.api_key.clone().unwrap_or_default(),
            }],
            config.provider_timeout(),
        )?;
        report("secondary-cloud", provider.probe(timeout).await);
    }

    if unreachable > 0 {
        anyhow::bail!("{unreachable} provider endpoint(s) unreachable");
    }
    println!("all configured providers reachable");
    Ok(())
}

async fn health(config: DispatchConfig) -> Result<()> {
    let store = connect_store(&config).await?;
    let tracker = CredentialHealthTracker::new(store);
    let credential_ids = configured_credential_ids(&config);
    let snapshot = tracker.snapshot(&credential_ids).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
