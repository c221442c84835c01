//! ChaosTrace binary: load configuration, run one harness session,
//! emit the report.

use chaostrace_chaos::ChaosScript;
use chaostrace_core::{ChaosTraceError, ChaosTraceResult, RunContext};
use chaostrace_policy::PolicyDocument;
use chaostrace_proxy::{ProxyConfig, ProxyServer, RunHandle};
use chaostrace_report::{Report, ScoreConfig};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> ChaosTraceResult<()> {
    let config = ProxyConfig::from_env().map_err(ChaosTraceError::from)?;

    let policy_yaml = std::fs::read_to_string(&config.policy_path).map_err(|err| {
        chaostrace_core::PolicyError::ParseFailed {
            reason: format!("{}: {}", config.policy_path.display(), err),
        }
    })?;
    let policy = PolicyDocument::from_yaml(&policy_yaml)?;

    let chaos_yaml = std::fs::read_to_string(&config.chaos_path).map_err(|err| {
        chaostrace_core::ChaosError::ParseFailed {
            reason: format!("{}: {}", config.chaos_path.display(), err),
        }
    })?;
    let script = ChaosScript::from_yaml(&chaos_yaml)?;
    let script_name = script.name.clone();
    let policy_name = policy.name().to_string();

    let ctx = RunContext::new(config.scenario.clone(), config.run_timeout);
    tracing::info!(
        run_id = %ctx.run_id,
        scenario = %ctx.scenario,
        policy = %policy_name,
        chaos = %script_name,
        "starting run"
    );

    let handle = RunHandle::new(ctx, policy, script);
    handle.record_started(&policy_name, &script_name);

    let listener = TcpListener::bind(&config.listen_addr).await.map_err(|err| {
        chaostrace_core::ProxyError::Io {
            peer: config.listen_addr.clone(),
            reason: err.to_string(),
        }
    })?;
    tracing::info!(listen = %config.listen_addr, upstream = %config.upstream_addr, "proxy listening");

    let ticker = tokio::spawn(handle.clone().run_ticker());
    let server = ProxyServer::new(handle.clone(), config.clone());

    tokio::select! {
        _ = server.serve(listener) => {}
        _ = tokio::time::sleep(handle.ctx.timeout) => {
            handle.terminate("run timeout reached");
        }
        _ = tokio::signal::ctrl_c() => {
            handle.terminate("interrupted");
        }
    }
    handle.terminate("run ended");
    let _ = ticker.await;

    let events = handle.bus.snapshot();
    let report = Report::from_events(&events, &ScoreConfig::default());
    tracing::info!(
        score = report.score.final_score,
        grade = %report.score.grade,
        statements = report.statements.total,
        "run scored"
    );

    let json = report
        .to_json()
        .unwrap_or_else(|err| format!("{{\"error\":\"{}\"}}", err));
    match &config.report_path {
        Some(path) => {
            if let Err(err) = std::fs::write(path, &json) {
                tracing::error!(path = %path.display(), error = %err, "report write failed");
                println!("{}", json);
            } else {
                tracing::info!(path = %path.display(), "report written");
            }
        }
        None => println!("{}", json),
    }
    eprintln!("{}", report.to_markdown());
    Ok(())
}
