mod cli;
mod report;

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use tracing::info;

use kbisect_config::BisectConfig;
use kbisect_core::{BlobId, HostVerdict, MetadataId};
use kbisect_engine::{
    build_coordinator, build_remote, power_settings, run_checks, CheckStatus, Coordinator,
    EngineError, HostAgent, RunOutcome,
};
use kbisect_power::{build_controller, PowerController};
use kbisect_remote::RemoteExec;
use kbisect_store::Store;

const EXIT_OK: i32 = 0;
const EXIT_HALTED_OR_ERROR: i32 = 1;
const EXIT_USER_ABORT: i32 = 2;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            EXIT_HALTED_OR_ERROR
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let matches = cli::build_cli().get_matches();
    let config_path = matches.get_one::<String>("config").cloned();

    match matches.subcommand() {
        Some(("init", sub)) => cmd_init(config_path, sub).await,
        Some(("start", _)) => cmd_start(config_path).await,
        Some(("status", _)) => cmd_status(config_path),
        Some(("report", sub)) => cmd_report(config_path, sub),
        Some(("build", sub)) => cmd_build(config_path, sub).await,
        Some(("check", _)) => cmd_check(config_path).await,
        Some(("ipmi", sub)) => cmd_ipmi(config_path, sub).await,
        Some(("kernels", _)) => cmd_kernels(config_path).await,
        Some(("monitor", sub)) => cmd_monitor(config_path, sub).await,
        Some(("logs", sub)) => cmd_logs(config_path, sub),
        Some(("metadata", sub)) => cmd_metadata(config_path, sub),
        Some(("init-config", sub)) => cmd_init_config(sub),
        _ => unreachable!("subcommand is required"),
    }
}

fn load_config(path: Option<String>) -> Result<BisectConfig> {
    let config = match path {
        Some(path) => kbisect_config::load_from_path(path)?,
        None => kbisect_config::load_from_env()?,
    };
    Ok(config)
}

fn open_store(config: &BisectConfig) -> Result<Arc<Store>> {
    Ok(Arc::new(Store::open(&config.bisect.db_path)?))
}

fn compose(config: &BisectConfig) -> Result<(Coordinator, Arc<Store>)> {
    let store = open_store(config)?;
    let coordinator = build_coordinator(config, Arc::clone(&store))?;
    Ok((coordinator, store))
}

async fn cmd_init(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let good = sub.get_one::<String>("good").expect("required arg");
    let bad = sub.get_one::<String>("bad").expect("required arg");
    let config = load_config(config_path)?;
    let (coordinator, _store) = compose(&config)?;

    let session = coordinator.init(good, bad).await?;
    println!("session {session} initialized; run `kbisect start` to begin");
    Ok(EXIT_OK)
}

async fn cmd_start(config_path: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    let (coordinator, _store) = compose(&config)?;

    let outcome = tokio::select! {
        outcome = coordinator.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            eprintln!(
                "interrupted; no verdict was recorded for the in-flight iteration. \
                 rerun `kbisect start` to resume"
            );
            return Ok(EXIT_USER_ABORT);
        }
    };

    match outcome {
        Ok(RunOutcome::Completed { first_bad: Some(sha) }) => {
            println!("bisection complete");
            println!("first bad commit: {sha}");
            Ok(EXIT_OK)
        }
        Ok(RunOutcome::Completed { first_bad: None }) => {
            println!("bisection complete: inconclusive (only skipped candidates remained)");
            Ok(EXIT_OK)
        }
        Ok(RunOutcome::Halted(report)) => {
            eprintln!("{report}");
            Ok(EXIT_HALTED_OR_ERROR)
        }
        Err(EngineError::HostsUnreachable(hosts)) => {
            eprintln!(
                "cannot resume: hosts still unreachable: {}",
                hosts.join(", ")
            );
            eprintln!("restore the hosts, confirm with `kbisect check`, then rerun `kbisect start`");
            Ok(EXIT_HALTED_OR_ERROR)
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_status(config_path: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let Some(session) = store.latest_session()? else {
        println!("no sessions");
        return Ok(EXIT_OK);
    };
    let summary = store.summary(session.session_id)?;
    println!(
        "session {}: {} ({} -> {})",
        summary.session_id, summary.status, summary.good_ref, summary.bad_ref
    );
    println!(
        "iterations: {} ({} good, {} bad, {} skip, {} pending)",
        summary.iteration_count,
        summary.good_count,
        summary.bad_count,
        summary.skip_count,
        summary.pending_count
    );
    if let Some(first_bad) = &summary.result_commit {
        println!("first bad commit: {first_bad}");
    }
    Ok(EXIT_OK)
}

fn cmd_report(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let session = store
        .latest_session()?
        .ok_or_else(|| anyhow!("no sessions to report on"))?;

    match sub.get_one::<String>("format").map(String::as_str) {
        Some("json") => {
            let rendered = report::render_json(&store, &session)?;
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
        _ => print!("{}", report::render_text(&store, &session)?),
    }
    Ok(EXIT_OK)
}

async fn cmd_build(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let reference = sub.get_one::<String>("ref").expect("required arg");
    let config = load_config(config_path)?;
    let (coordinator, _store) = compose(&config)?;

    let outcomes = coordinator.build_only(reference).await?;
    let mut failed = false;
    for outcome in &outcomes {
        match outcome.verdict {
            HostVerdict::Pass => println!(
                "[{}] build ok{}",
                outcome.host,
                outcome
                    .observed_kernel
                    .as_deref()
                    .map(|version| format!(" ({version})"))
                    .unwrap_or_default()
            ),
            _ => {
                failed = true;
                println!(
                    "[{}] build failed: {}",
                    outcome.host,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    Ok(if failed { EXIT_HALTED_OR_ERROR } else { EXIT_OK })
}

async fn cmd_check(config_path: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    let results = run_checks(&config).await;

    let mut failed = false;
    for result in &results {
        let tag = match result.status {
            CheckStatus::Pass => "ok  ",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => {
                failed = true;
                "FAIL"
            }
        };
        println!("[{tag}] {:30} {}", result.name, result.detail);
    }
    Ok(if failed { EXIT_HALTED_OR_ERROR } else { EXIT_OK })
}

async fn cmd_ipmi(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let action = sub.get_one::<String>("action").expect("required arg");
    let config = load_config(config_path)?;

    let host = match sub.get_one::<String>("host") {
        Some(name) => config
            .hosts
            .iter()
            .find(|host| host.hostname == *name)
            .ok_or_else(|| anyhow!("host '{name}' is not configured"))?,
        None => config
            .hosts
            .first()
            .ok_or_else(|| anyhow!("no hosts configured"))?,
    };

    let remote = build_remote(&config, host);
    let controller = build_controller(&power_settings(host), remote)?;
    match action.as_str() {
        "status" => {
            let state = controller.status().await?;
            println!("{}: power {}", host.hostname, state.as_key());
        }
        "on" => controller.on().await?,
        "off" => controller.off().await?,
        "reset" => controller.reset().await?,
        "cycle" => controller.cycle().await?,
        _ => unreachable!("validated by clap"),
    }
    if action != "status" {
        println!("{}: {action} accepted", host.hostname);
    }
    Ok(EXIT_OK)
}

async fn cmd_kernels(config_path: Option<String>) -> Result<i32> {
    let config = load_config(config_path)?;
    for host in &config.hosts {
        let remote = build_remote(&config, host);
        println!("{}:", host.hostname);
        match remote
            .call_op("list_kernels", &[], Some(std::time::Duration::from_secs(30)))
            .await
        {
            Ok(output) if output.success() => {
                for line in output.stdout.lines() {
                    println!("  {line}");
                }
            }
            Ok(output) => println!("  list_kernels exited {}", output.exit_code),
            Err(err) => println!("  unreachable: {err}"),
        }
    }
    Ok(EXIT_OK)
}

async fn cmd_monitor(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let config = load_config(config_path)?;
    let (coordinator, _store) = compose(&config)?;
    let once = sub.get_flag("once");

    loop {
        for agent in coordinator.agents() {
            let alive = agent.probe().await;
            println!(
                "{}: {}",
                agent.host(),
                if alive { "alive" } else { "unreachable" }
            );
        }
        if once {
            return Ok(EXIT_OK);
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(10)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(EXIT_OK),
        }
        println!("---");
    }
}

fn cmd_logs(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    match sub.subcommand() {
        Some(("list", _)) => {
            let session = store
                .latest_session()?
                .ok_or_else(|| anyhow!("no sessions"))?;
            for blob in store.session_log_blobs(session.session_id)? {
                println!(
                    "{:5}  iter {:4}  {:8}  {:7}  {:>10} bytes  exit {}",
                    blob.blob_id,
                    blob.iteration_id,
                    blob.host,
                    blob.kind.as_key(),
                    blob.size_bytes,
                    blob.exit_code
                        .map(|code| code.to_string())
                        .unwrap_or_else(|| "-".to_owned()),
                );
            }
        }
        Some(("show", args)) => {
            let id = *args.get_one::<i64>("id").expect("required arg");
            let (_, content) = store.log_blob(BlobId::new(id))?;
            let mut stdout = std::io::stdout().lock();
            std::io::Write::write_all(&mut stdout, &content)?;
        }
        Some(("export", args)) => {
            let id = *args.get_one::<i64>("id").expect("required arg");
            let path = args.get_one::<String>("path").expect("required arg");
            let (record, content) = store.log_blob(BlobId::new(id))?;
            std::fs::write(path, &content)
                .with_context(|| format!("failed to write {path}"))?;
            info!(
                blob = %record.blob_id,
                bytes = content.len(),
                path = %path,
                "log exported"
            );
            println!("wrote {} bytes to {path}", content.len());
        }
        _ => unreachable!("subcommand is required"),
    }
    Ok(EXIT_OK)
}

fn cmd_metadata(config_path: Option<String>, sub: &ArgMatches) -> Result<i32> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let session = store
        .latest_session()?
        .ok_or_else(|| anyhow!("no sessions"))?;

    match sub.subcommand() {
        Some(("list", _)) => {
            for record in store.metadata_for_session(session.session_id)? {
                println!(
                    "{:5}  {}  {}  {} bytes",
                    record.metadata_id,
                    record
                        .iteration_id
                        .map(|id| format!("iter {id}"))
                        .unwrap_or_else(|| "baseline".to_owned()),
                    &record.content_sha256[..12],
                    record.payload.len(),
                );
            }
        }
        Some(("show", args)) => {
            let id = *args.get_one::<i64>("id").expect("required arg");
            let record = store.metadata(MetadataId::new(id))?;
            let payload: serde_json::Value = serde_json::from_str(&record.payload)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Some(("export", args)) => {
            let path = args.get_one::<String>("path").expect("required arg");
            let records = store.metadata_for_session(session.session_id)?;
            let mut payloads = Vec::with_capacity(records.len());
            for record in records {
                payloads.push(serde_json::json!({
                    "metadata_id": record.metadata_id.value(),
                    "iteration_id": record.iteration_id.map(|id| id.value()),
                    "sha256": record.content_sha256,
                    "payload": serde_json::from_str::<serde_json::Value>(&record.payload)?,
                }));
            }
            std::fs::write(path, serde_json::to_string_pretty(&payloads)?)
                .with_context(|| format!("failed to write {path}"))?;
            println!("wrote {} records to {path}", payloads.len());
        }
        _ => unreachable!("subcommand is required"),
    }
    Ok(EXIT_OK)
}

fn cmd_init_config(sub: &ArgMatches) -> Result<i32> {
    let path = sub.get_one::<String>("path").expect("has default");
    if std::path::Path::new(path).exists() {
        bail!("{path} already exists; refusing to overwrite");
    }
    std::fs::write(path, kbisect_config::sample_config())
        .with_context(|| format!("failed to write {path}"))?;
    println!("wrote sample configuration to {path}");
    Ok(EXIT_OK)
}
