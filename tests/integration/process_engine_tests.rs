//! Sessions backed by real child processes
//!
//! Runs `/bin/sh` in place of the interpreter, so the code travels through
//! the same environment variable the container command reads.

#![cfg(unix)]

use assert_matches::assert_matches;
use coderun_common::{AppConfig, EngineKind, SOURCE_ENV_VAR};
use coderun_sandbox::{engine_from_config, SessionError, SessionService};
use coderun_tests::common::setup_test_logging;
use std::time::Duration;

fn shell_service() -> SessionService {
    setup_test_logging();

    let mut config = AppConfig::default();
    config.sandbox.engine = EngineKind::Process;
    config.sandbox.command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("eval \"${}\"", SOURCE_ENV_VAR),
    ];
    config.session.initial_output_window = Duration::from_secs(3);
    config.session.continue_output_window = Duration::from_secs(3);

    let engine = engine_from_config(&config.sandbox).expect("process engine");
    SessionService::new(engine, &config)
}

#[tokio::test]
async fn test_shell_program_output() {
    let service = shell_service();

    let turn = service.run("echo hello; echo oops >&2").await.unwrap();
    assert!(turn.output.contains("hello\n"));
    assert!(turn.output.contains("oops\n"));
    assert!(!turn.requires_input);
    assert!(!turn.live);
    assert!(service.registry().is_empty().await);
}

#[tokio::test]
async fn test_code_is_not_reinterpreted_by_the_command_line() {
    let service = shell_service();

    // Quotes and semicolons reach the program untouched
    let turn = service
        .run("printf '%s\\n' \"a'b;c\"")
        .await
        .unwrap();
    assert_eq!(turn.output, "a'b;c\n");
}

#[tokio::test]
async fn test_shell_prompt_round_trip() {
    let service = shell_service();

    let first = service
        .run("printf 'Enter first number: '; read a; echo \"Result: $((a * 2))\"")
        .await
        .unwrap();
    assert_eq!(first.output, "Enter first number: ");
    assert!(first.requires_input);
    assert!(first.live);

    let id = first.session_id.to_string();
    let second = service.resume(&id, Some("21")).await.unwrap();
    assert!(second.output.contains("Result: 42"));
    assert!(!second.requires_input);

    for _ in 0..200 {
        if service.registry().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(service.registry().is_empty().await);
    assert_matches!(
        service.resume(&id, Some("1")).await,
        Err(SessionError::SessionNotFound(_))
    );
}

#[tokio::test]
async fn test_shutdown_kills_running_process() {
    let service = shell_service();

    let turn = service.run("echo started; sleep 60").await.unwrap();
    assert_eq!(turn.output, "started\n");
    assert!(turn.live);

    tokio::time::timeout(Duration::from_secs(10), service.shutdown())
        .await
        .expect("shutdown finished");
    assert!(service.registry().is_empty().await);
}
