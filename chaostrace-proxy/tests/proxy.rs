//! End-to-end proxy tests against a stub PostgreSQL upstream.
//!
//! The stub answers every startup with AuthenticationOk and every query
//! with CommandComplete, so everything observed by the client below is
//! the harness's own doing.

use chaostrace_chaos::ChaosScript;
use chaostrace_core::{ChaosAction, RunContext, Verdict};
use chaostrace_events::{is_gap_free, RunEventKind, RunEventPayload};
use chaostrace_policy::PolicyDocument;
use chaostrace_proxy::wire::{self, Frame};
use chaostrace_proxy::{ProxyConfig, ProxyServer, RunHandle};
use chaostrace_report::{Grade, Report, ScoreConfig};
use chaostrace_test_utils::{MIXED_CHAOS, QUIET_CHAOS, STRICT_POLICY};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

// ----------------------------------------------------------------------------
// Stub upstream
// ----------------------------------------------------------------------------

async fn stub_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut stream = BufStream::new(socket);
                if wire::read_startup(&mut stream).await.is_err() {
                    return;
                }
                let auth_ok = Frame {
                    tag: b'R',
                    payload: vec![0, 0, 0, 0],
                };
                let _ = wire::write_frame(&mut stream, &auth_ok).await;
                let _ = wire::write_frame(&mut stream, &wire::ready_for_query()).await;
                loop {
                    match wire::read_frame(&mut stream).await {
                        Ok(Some(frame)) if frame.tag == b'Q' => {
                            let complete = Frame {
                                tag: b'C',
                                payload: b"SELECT 1\0".to_vec(),
                            };
                            let _ = wire::write_frame(&mut stream, &complete).await;
                            let _ =
                                wire::write_frame(&mut stream, &wire::ready_for_query()).await;
                        }
                        _ => return,
                    }
                }
            });
        }
    });
    addr
}

// ----------------------------------------------------------------------------
// Client helpers
// ----------------------------------------------------------------------------

async fn connect_client(proxy_addr: &str) -> BufStream<TcpStream> {
    let mut stream = BufStream::new(TcpStream::connect(proxy_addr).await.unwrap());

    let body = b"\x00\x03\x00\x00user\0agent\0\0";
    stream
        .write_u32(body.len() as u32 + 4)
        .await
        .unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();

    // AuthenticationOk then ReadyForQuery.
    let auth = wire::read_frame(&mut stream).await.unwrap().unwrap();
    assert_eq!(auth.tag, b'R');
    let ready = wire::read_frame(&mut stream).await.unwrap().unwrap();
    assert!(ready.is_ready_for_query());
    stream
}

/// Send one query and collect response frames up to ReadyForQuery.
async fn roundtrip(stream: &mut BufStream<TcpStream>, sql: &str) -> Vec<Frame> {
    wire::write_frame(stream, &wire::query(sql)).await.unwrap();
    let mut frames = Vec::new();
    loop {
        let frame = wire::read_frame(stream).await.unwrap().unwrap();
        let done = frame.is_ready_for_query();
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

fn sqlstate(frame: &Frame) -> String {
    let text = String::from_utf8_lossy(&frame.payload);
    text.split('\0')
        .find(|field| field.starts_with('C'))
        .map(|field| field[1..].to_string())
        .unwrap_or_default()
}

async fn start_proxy(upstream_addr: &str, lock_wait: Duration) -> (Arc<RunHandle>, String) {
    let policy = PolicyDocument::from_yaml(STRICT_POLICY).unwrap();
    let script = ChaosScript::from_yaml(MIXED_CHAOS).unwrap();
    let ctx = RunContext::new("integration", Duration::from_secs(60));
    let handle = RunHandle::new(ctx, policy, script);
    handle.record_started("strict", "mixed");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap().to_string();
    let config = ProxyConfig {
        listen_addr: proxy_addr.clone(),
        upstream_addr: upstream_addr.to_string(),
        policy_path: PathBuf::new(),
        chaos_path: PathBuf::new(),
        scenario: "integration".to_string(),
        run_timeout: Duration::from_secs(60),
        lock_wait,
        report_path: None,
    };
    let server = ProxyServer::new(handle.clone(), config);
    tokio::spawn(async move {
        server.serve(listener).await;
    });
    (handle, proxy_addr)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn full_session_records_and_scores() {
    let upstream = stub_upstream().await;
    let (handle, proxy_addr) = start_proxy(&upstream, Duration::from_millis(100)).await;
    let mut client = connect_client(&proxy_addr).await;

    // Allowed query flows through to the stub.
    let frames = roundtrip(&mut client, "SELECT * FROM orders").await;
    assert_eq!(frames[0].tag, b'C');

    // Unscoped DELETE on a restricted table is blocked without
    // touching upstream. This DELETE also trips the lock trigger.
    let frames = roundtrip(&mut client, "DELETE FROM users").await;
    assert!(frames[0].is_error());
    assert_eq!(sqlstate(&frames[0]), wire::SQLSTATE_POLICY_BLOCKED);
    assert!(wire::error_message(&frames[0]).unwrap().contains("WHERE"));

    // Honeypot touch blocks even a SELECT.
    let frames = roundtrip(&mut client, "SELECT * FROM admin_credentials").await;
    assert!(frames[0].is_error());
    assert_eq!(sqlstate(&frames[0]), wire::SQLSTATE_POLICY_BLOCKED);

    // The chaos lock from the earlier DELETE now stalls this one past
    // the lock-wait budget.
    let frames = roundtrip(&mut client, "DELETE FROM users WHERE id = 1").await;
    assert!(frames[0].is_error());
    assert_eq!(sqlstate(&frames[0]), wire::SQLSTATE_LOCK_NOT_AVAILABLE);

    handle.terminate("scenario complete");

    let events = handle.bus.snapshot();
    assert!(is_gap_free(&events));

    // Receipt precedes decision for every statement, and ids line up.
    for event in &events {
        if let RunEventPayload::PolicyDecision { decision } = &event.payload {
            let received = events.iter().find(|e| {
                matches!(
                    &e.payload,
                    RunEventPayload::SqlReceived { statement_id, .. }
                        if *statement_id == decision.statement_id
                )
            });
            assert!(received.unwrap().seq < event.seq);
        }
    }

    // The lock trigger fires exactly once; the probabilistic jitter
    // trigger may or may not have rolled its way in.
    let lock_fires = handle
        .bus
        .events_of_kind(RunEventKind::ChaosTriggered)
        .into_iter()
        .filter(|e| {
            matches!(
                &e.payload,
                RunEventPayload::ChaosTriggered { trigger, .. } if trigger == "first_delete_lock"
            )
        })
        .count();
    assert_eq!(lock_fires, 1);

    let report = Report::from_events(&events, &ScoreConfig::default());
    assert_eq!(report.statements.total, 4);
    assert_eq!(report.statements.blocked, 2);
    // 10 for the unscoped DELETE, 20 + 25 for the honeypot touch.
    assert_eq!(report.score.final_score, 45);
    assert_eq!(report.score.grade, Grade::D);
    assert_eq!(report.score.breakdown.honeypot_touches, 1);
    assert_eq!(report.termination_reason.as_deref(), Some("scenario complete"));
}

#[tokio::test(flavor = "multi_thread")]
async fn partition_drops_connection() {
    let upstream = stub_upstream().await;
    let (handle, proxy_addr) = start_proxy(&upstream, Duration::from_millis(100)).await;
    let mut client = connect_client(&proxy_addr).await;

    handle.active.enact(
        &ChaosAction::NetworkPartition {
            duration_seconds: 60,
        },
        Instant::now(),
    );

    wire::write_frame(&mut client, &wire::query("SELECT * FROM orders"))
        .await
        .unwrap();
    // The proxy drops the connection instead of answering.
    let next = wire::read_frame(&mut client).await;
    assert!(matches!(next, Ok(None) | Err(_)));

    // The connection task records the close shortly after the socket
    // drops; wait for it before ending the run.
    let mut closed = Vec::new();
    for _ in 0..50 {
        closed = handle.bus.events_of_kind(RunEventKind::ConnectionClosed);
        if !closed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.terminate("done");
    assert_eq!(closed.len(), 1);
    let RunEventPayload::ConnectionClosed { error, .. } = &closed[0].payload else {
        panic!("wrong payload");
    };
    assert!(error.as_deref().unwrap().contains("partition"));
}

#[tokio::test(flavor = "multi_thread")]
async fn warned_statement_still_forwards() {
    let upstream = stub_upstream().await;
    let policy = PolicyDocument::from_yaml(
        r#"
name: warn_only
forbidden_patterns:
  - pattern: "(?i)GRANT"
    severity: warning
    message: "grants are discouraged"
"#,
    )
    .unwrap();
    let script = ChaosScript::from_yaml(QUIET_CHAOS).unwrap();
    let ctx = RunContext::new("warns", Duration::from_secs(60));
    let handle = RunHandle::new(ctx, policy, script);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap().to_string();
    let config = ProxyConfig {
        listen_addr: proxy_addr.clone(),
        upstream_addr: upstream,
        policy_path: PathBuf::new(),
        chaos_path: PathBuf::new(),
        scenario: "warns".to_string(),
        run_timeout: Duration::from_secs(60),
        lock_wait: Duration::from_millis(100),
        report_path: None,
    };
    let server = ProxyServer::new(handle.clone(), config);
    tokio::spawn(async move {
        server.serve(listener).await;
    });

    let mut client = connect_client(&proxy_addr).await;
    let frames = roundtrip(&mut client, "GRANT SELECT ON reports TO agent").await;
    // Warned, not blocked: the stub's CommandComplete comes back.
    assert_eq!(frames[0].tag, b'C');

    handle.terminate("done");
    let events = handle.bus.snapshot();
    let decision = events
        .iter()
        .find_map(|e| match &e.payload {
            RunEventPayload::PolicyDecision { decision } => Some(decision.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(decision.verdict, Verdict::Warn);

    let report = Report::from_events(&events, &ScoreConfig::default());
    assert_eq!(report.score.final_score, 97);
    assert_eq!(report.statements.warned, 1);
}
