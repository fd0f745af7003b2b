//! End-to-end tests against the `fake-engine` binary.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engine::{
    AnalysisOptions, AnalysisQuery, Engine, EngineCommand, EngineConfig, EngineError,
    EngineFamily, Position, RequestState,
};
use goban_common::{BoardMove, Color, Point};

const FAKE_ENGINE: &str = env!("CARGO_BIN_EXE_fake-engine");
const PATIENCE: Duration = Duration::from_secs(10);

fn fake(family: EngineFamily, args: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::new(family, FAKE_ENGINE)
        .with_label("fake")
        .with_args(args.iter().copied());
    config.shutdown_grace_ms = 500;
    config.pipe_close_grace_ms = 200;
    config
}

fn position_with_moves(n: usize) -> Position {
    let mut position = Position::empty(19);
    for i in 0..n {
        let color = if i % 2 == 0 { Color::Black } else { Color::White };
        position = position.with_move(color, BoardMove::Play(Point::new(i as u8, 10)));
    }
    position
}

fn budget(visits: u32) -> AnalysisOptions {
    AnalysisOptions {
        max_visits: Some(visits),
        report_interval: Some(Duration::from_millis(20)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_concurrent_json_requests_answered_in_reverse() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--reverse-batch", "4"]))
        .await
        .unwrap();

    let tickets: Vec<_> = (0..4)
        .map(|n| {
            let query = AnalysisQuery::new(position_with_moves(n));
            (n, engine.submit(query).unwrap())
        })
        .collect();

    for (moves, ticket) in tickets {
        let id = ticket.id();
        let result = tokio::time::timeout(PATIENCE, ticket.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.id, Some(id));
        assert_eq!(result.turn_number, Some(moves as u32));
        assert!(result.is_terminal);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_json_result_is_normalized() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &[]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(Position::empty(19)).with_options(AnalysisOptions {
        max_visits: Some(400),
        max_candidates: Some(2),
        ..Default::default()
    });
    let result = engine.analyze(query).await.unwrap();

    assert_eq!(result.candidates.len(), 2);
    let best = result.best().unwrap();
    assert_eq!(best.mv, BoardMove::Play(Point::new(3, 4)));
    assert_eq!(best.visits, 200);
    assert_eq!(best.points_lost, Some(0.0));
    assert_eq!(result.candidates[1].points_lost, Some(1.5));
    assert_eq!(result.visits, Some(400));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_resolves_while_engine_hangs() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--hang"]))
        .await
        .unwrap();

    let ticket = engine.submit(AnalysisQuery::new(Position::empty(19))).unwrap();
    engine.cancel(ticket.id()).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(1), ticket.wait())
        .await
        .unwrap();
    assert!(matches!(outcome, Err(EngineError::Cancelled)));
    assert!(engine.is_running());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_twice_is_noop() {
    let engine = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &[]))
        .await
        .unwrap();
    assert!(engine.is_running());
    assert!(engine.pid().is_some());

    engine.shutdown().await;
    engine.shutdown().await;
    assert!(!engine.is_running());
    assert!(matches!(
        engine.submit(AnalysisQuery::new(Position::empty(19))),
        Err(EngineError::Stopped)
    ));
}

#[tokio::test]
async fn test_engine_exit_fails_every_pending_request() {
    let engine = Engine::spawn(fake(
        EngineFamily::KatagoAnalysis,
        &["--reverse-batch", "10", "--exit-after", "3"],
    ))
    .await
    .unwrap();

    let tickets: Vec<_> = (0..3)
        .map(|_| engine.submit(AnalysisQuery::new(Position::empty(19))).unwrap())
        .collect();

    for ticket in tickets {
        let outcome = tokio::time::timeout(PATIENCE, ticket.wait()).await.unwrap();
        assert!(matches!(outcome, Err(EngineError::ProcessDied(_))));
    }
    assert!(!engine.is_running());
    assert!(matches!(
        engine.submit(AnalysisQuery::new(Position::empty(19))),
        Err(EngineError::Stopped)
    ));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_missing_executable() {
    let config = EngineConfig::new(EngineFamily::KatagoAnalysis, "/nonexistent/katago");
    match Engine::spawn(config).await {
        Err(EngineError::ProcessStart { program, .. }) => assert_eq!(program, "/nonexistent/katago"),
        Err(other) => panic!("expected ProcessStart, got {}", other),
        Ok(_) => panic!("engine should not start"),
    }
}

#[tokio::test]
async fn test_start_twice_is_refused() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &[]))
        .await
        .unwrap();
    assert!(matches!(engine.start().await, Err(EngineError::AlreadyRunning)));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_keeps_engine_alive() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--hang"]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(Position::empty(19)).with_options(AnalysisOptions {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    });
    let outcome = tokio::time::timeout(PATIENCE, engine.analyze(query))
        .await
        .unwrap();
    assert!(matches!(outcome, Err(EngineError::Timeout(_))));
    assert!(engine.is_running());
    assert_eq!(engine.pending_count(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_gtp_visit_budget_ends_request() {
    let engine = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &[]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(position_with_moves(2)).with_options(budget(40));
    let mut ticket = engine.submit(query).unwrap();

    let first = tokio::time::timeout(PATIENCE, ticket.next_progress())
        .await
        .unwrap()
        .unwrap();
    assert!(!first.is_terminal);

    let result = tokio::time::timeout(PATIENCE, ticket.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_terminal);
    assert!(result.total_visits() >= 40);
    let best = result.best().unwrap();
    assert_eq!(best.mv, BoardMove::Play(Point::new(3, 4)));
    assert_eq!(best.winrate, Some(0.51));
    assert_eq!(best.pv.len(), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_kata_gtp_scores() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoGtp, &[]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(Position::empty(19)).with_options(budget(30));
    let result = tokio::time::timeout(PATIENCE, engine.analyze(query))
        .await
        .unwrap()
        .unwrap();
    let best = result.best().unwrap();
    assert_eq!(best.winrate, Some(0.51));
    assert_eq!(best.score_lead, Some(1.2));
    assert_eq!(result.score_lead, Some(1.2));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_gtp_requests_run_one_at_a_time() {
    let engine = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &[]))
        .await
        .unwrap();

    let first = engine
        .submit(AnalysisQuery::new(Position::empty(19)).with_options(budget(30)))
        .unwrap();
    let second = engine
        .submit(AnalysisQuery::new(Position::empty(9)).with_options(budget(60)))
        .unwrap();
    assert_eq!(engine.request_state(second.id()), Some(RequestState::Queued));

    let second_id = second.id();
    let a = tokio::time::timeout(PATIENCE, first.wait()).await.unwrap().unwrap();
    let b = tokio::time::timeout(PATIENCE, second.wait()).await.unwrap().unwrap();
    assert!(a.total_visits() >= 30);
    assert!(b.total_visits() >= 60);
    assert_eq!(b.id, Some(second_id));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_stragglers_are_not_attributed_to_next_request() {
    let engine = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &["--straggle"]))
        .await
        .unwrap();

    // Ponder until some output arrives, then interrupt
    let ponder = AnalysisOptions {
        report_interval: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let mut pondering = engine
        .submit(AnalysisQuery::new(Position::empty(19)).with_options(ponder))
        .unwrap();
    tokio::time::timeout(PATIENCE, pondering.next_progress())
        .await
        .unwrap()
        .unwrap();
    engine.cancel_all().unwrap();
    assert!(matches!(pondering.wait().await, Err(EngineError::Cancelled)));

    let query = AnalysisQuery::new(Position::empty(19)).with_options(budget(30));
    let result = tokio::time::timeout(PATIENCE, engine.analyze(query))
        .await
        .unwrap()
        .unwrap();
    assert!(result.candidates.iter().all(|c| c.visits < 99999));
    assert_ne!(result.best().unwrap().mv, BoardMove::Play(Point::new(0, 1)));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_rejected_setup_fails_request_and_engine_recovers() {
    let engine = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &["--reject-play"]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(position_with_moves(1)).with_options(budget(30));
    let outcome = tokio::time::timeout(PATIENCE, engine.analyze(query))
        .await
        .unwrap();
    assert!(matches!(outcome, Err(EngineError::Rejected(_))));

    let query = AnalysisQuery::new(Position::empty(19)).with_options(budget(30));
    let result = tokio::time::timeout(PATIENCE, engine.analyze(query))
        .await
        .unwrap();
    assert!(result.is_ok());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_json_error_record_rejects_request() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--error-on-id", "1"]))
        .await
        .unwrap();

    let outcome = engine.analyze(AnalysisQuery::new(Position::empty(19))).await;
    match outcome {
        Err(EngineError::Rejected(message)) => assert_eq!(message, "Illegal move"),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(engine.analyze(AnalysisQuery::new(Position::empty(19))).await.is_ok());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_panicking_callback_is_contained() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &[]))
        .await
        .unwrap();

    engine
        .submit_with_callback(AnalysisQuery::new(Position::empty(19)), |_| {
            panic!("callback bug")
        })
        .unwrap();

    let seen = Arc::new(Mutex::new(None));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let slot = seen.clone();
    engine
        .submit_with_callback(AnalysisQuery::new(Position::empty(19)), move |outcome| {
            *slot.lock().unwrap() = Some(outcome.is_ok());
            let _ = tx.send(());
        })
        .unwrap();
    tokio::time::timeout(PATIENCE, rx).await.unwrap().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(true));
    assert!(engine.is_running());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_resolves_pending_as_terminated() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--hang"]))
        .await
        .unwrap();

    let a = engine.submit(AnalysisQuery::new(Position::empty(19))).unwrap();
    let b = engine.submit(AnalysisQuery::new(Position::empty(19))).unwrap();
    engine.shutdown().await;

    assert!(matches!(a.wait().await, Err(EngineError::Terminated)));
    assert!(matches!(b.wait().await, Err(EngineError::Terminated)));
}

#[tokio::test]
async fn test_stubborn_engine_is_killed() {
    let engine = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &["--stubborn"]))
        .await
        .unwrap();

    let started = Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() < PATIENCE);
    assert!(!engine.is_running());
}

#[tokio::test]
async fn test_progress_records_before_final() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--progress", "2"]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(Position::empty(19)).with_options(AnalysisOptions {
        max_visits: Some(300),
        report_interval: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let mut ticket = engine.submit(query).unwrap();

    let mut updates = Vec::new();
    while let Some(update) = tokio::time::timeout(PATIENCE, ticket.next_progress())
        .await
        .unwrap()
    {
        updates.push(update);
    }
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|u| !u.is_terminal));
    assert!(updates[0].total_visits() < updates[1].total_visits());

    let result = ticket.wait().await.unwrap();
    assert_eq!(result.visits, Some(300));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_analyze_skips_progress_and_returns_final() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &["--progress", "3"]))
        .await
        .unwrap();

    let query = AnalysisQuery::new(Position::empty(19)).with_options(AnalysisOptions {
        max_visits: Some(300),
        report_interval: Some(Duration::from_millis(20)),
        ..Default::default()
    });
    let result = tokio::time::timeout(PATIENCE, engine.analyze(query))
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_terminal);
    assert_eq!(result.visits, Some(300));
    assert_eq!(engine.pending_count(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_launch_details() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fake(EngineFamily::KatagoAnalysis, &["--hang"]);
    config.working_dir = Some(dir.path().to_path_buf());
    let before = std::time::SystemTime::now();
    let engine = Engine::spawn(config).await.unwrap();

    let status = engine.status().unwrap();
    assert_eq!(status.label, "fake");
    assert_eq!(status.program, std::path::PathBuf::from(FAKE_ENGINE));
    assert!(status.args.iter().any(|arg| arg == "--hang"));
    assert_eq!(status.working_dir.as_deref(), Some(dir.path()));
    assert_eq!(status.pid, engine.pid());
    assert!(status.started_at >= before);
    assert!(status.alive);

    engine.shutdown().await;
    assert!(!engine.status().unwrap().alive);
}

#[tokio::test]
async fn test_noise_on_both_pipes_is_tolerated() {
    let engine = Engine::spawn(fake(
        EngineFamily::KatagoAnalysis,
        &["--garbage", "--stderr-chatter"],
    ))
    .await
    .unwrap();

    let result = tokio::time::timeout(
        PATIENCE,
        engine.analyze(AnalysisQuery::new(Position::empty(19))),
    )
    .await
    .unwrap();
    assert!(result.is_ok());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_blocking_wait_from_sync_code() {
    let engine = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &[]))
        .await
        .unwrap();

    let ticket = engine.submit(AnalysisQuery::new(Position::empty(13))).unwrap();
    let result = tokio::task::spawn_blocking(move || ticket.blocking_wait())
        .await
        .unwrap();
    assert!(result.is_ok());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_raw_commands() {
    let gtp = Engine::spawn(fake(EngineFamily::LeelaZeroGtp, &[]))
        .await
        .unwrap();
    gtp.send_command(EngineCommand::SetOption {
        name: "visits".into(),
        value: "100".into(),
    })
    .unwrap();
    gtp.send_command(EngineCommand::ClearCache).unwrap();
    gtp.shutdown().await;

    let json = Engine::spawn(fake(EngineFamily::KatagoAnalysis, &[]))
        .await
        .unwrap();
    assert!(matches!(
        json.send_command(EngineCommand::SetOption {
            name: "maxVisits".into(),
            value: "10".into(),
        }),
        Err(EngineError::Encoding(_))
    ));
    json.send_command(EngineCommand::ClearCache).unwrap();
    json.shutdown().await;
}
