//! End-to-end tests over HTTP
//!
//! A real axum server on an ephemeral port, driven with reqwest, backed by the
//! scripted engine:
//! - Simple run that prints and exits
//! - Interactive calculator across several requests
//! - Unknown and ended sessions

use coderun_common::RunRequest;
use coderun_sandbox::testing::{EngineOp, Script, ScriptedEngine};
use coderun_tests::common::{container_id, TestApp};
use std::time::Duration;

fn resolver(code: &str) -> Script {
    if code.contains("input(") {
        Script::calculator()
    } else if code.contains("while True") {
        Script::new().stdout("tick\n").hang()
    } else {
        Script::prints("hi\n")
    }
}

const CALCULATOR: &str = r#"
a = float(input("Enter first number: "))
b = float(input("Enter second number: "))
op = input("Enter operation (+, -, *, /): ")
print("Result:", a * b if op == "*" else a + b)
"#;

#[tokio::test]
async fn test_simple_run() {
    let app = TestApp::spawn(ScriptedEngine::new(resolver)).await;

    let (status, body) = app.run(&RunRequest::new("print('hi')")).await;
    assert_eq!(status, 200);
    assert_eq!(body["output"], "hi\n");
    assert_eq!(body["requiresInput"], false);
    assert_eq!(container_id(&body), None);

    assert!(app.service.registry().is_empty().await);
    assert!(app.engine.live_sandboxes().await.is_empty());
}

#[tokio::test]
async fn test_interactive_calculator() {
    let app = TestApp::spawn(ScriptedEngine::new(resolver)).await;

    let (status, body) = app.run(&RunRequest::new(CALCULATOR)).await;
    assert_eq!(status, 200);
    assert!(body["output"]
        .as_str()
        .unwrap()
        .contains("Enter first number:"));
    assert_eq!(body["requiresInput"], true);
    let id = container_id(&body).unwrap().to_string();

    let (_, body) = app.run(&RunRequest::resume(&id, "6")).await;
    assert!(body["output"]
        .as_str()
        .unwrap()
        .contains("Enter second number:"));
    assert_eq!(body["requiresInput"], true);
    assert_eq!(container_id(&body), Some(id.as_str()));

    let (_, body) = app.run(&RunRequest::resume(&id, "7")).await;
    assert!(body["output"].as_str().unwrap().contains("Enter operation"));
    assert_eq!(body["requiresInput"], true);

    let (status, body) = app.run(&RunRequest::resume(&id, "*")).await;
    assert_eq!(status, 200);
    assert_eq!(body["output"], "Result: 42\n");
    assert_eq!(body["requiresInput"], false);

    app.wait_until_idle().await;
    assert_eq!(app.engine.removals(&format!("code-runner-{id}")), 1);

    let (status, body) = app.run(&RunRequest::resume(&id, "1")).await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let app = TestApp::spawn(ScriptedEngine::new(resolver)).await;

    let (status, body) = app
        .run(&RunRequest::resume("does-not-exist", "1"))
        .await;
    assert_eq!(status, 404);
    assert!(body.get("error").is_some());
    assert_eq!(app.engine.calls(EngineOp::Create), 0);
}

#[tokio::test]
async fn test_concurrent_continuations_run_in_order() {
    let app = TestApp::spawn(ScriptedEngine::new(resolver)).await;

    let (_, body) = app.run(&RunRequest::new(CALCULATOR)).await;
    let id = container_id(&body).unwrap().to_string();

    let first = RunRequest::resume(&id, "2");
    let second = RunRequest::resume(&id, "3");
    let ((s1, b1), (s2, b2)) = tokio::join!(app.run(&first), app.run(&second));
    assert_eq!((s1, s2), (200, 200));

    let mut outputs = vec![
        b1["output"].as_str().unwrap().to_string(),
        b2["output"].as_str().unwrap().to_string(),
    ];
    outputs.sort();
    assert!(outputs[0].starts_with("Enter operation"));
    assert!(outputs[1].starts_with("Enter second number"));

    let mut inputs = app.engine.inputs(&format!("code-runner-{id}"));
    inputs.sort();
    assert_eq!(inputs, vec!["2", "3"]);
}

#[tokio::test]
async fn test_quiet_program_returns_after_window() {
    let app = TestApp::spawn_with(ScriptedEngine::new(resolver), |config| {
        config.session.initial_output_window = Duration::from_millis(300);
    })
    .await;

    let (status, body) = app.run(&RunRequest::new("while True: pass")).await;
    assert_eq!(status, 200);
    assert_eq!(body["output"], "tick\n");
    assert_eq!(body["requiresInput"], false);
    let id = container_id(&body).unwrap().to_string();

    let health = app.health().await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["activeSessions"], 1);

    // Poll: no input, same session
    let (status, body) = app
        .run(&RunRequest {
            container_id: Some(id.clone()),
            ..RunRequest::default()
        })
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["output"], "");
    assert_eq!(container_id(&body), Some(id.as_str()));

    app.service.shutdown().await;
    assert!(app.engine.live_sandboxes().await.is_empty());
}

#[tokio::test]
async fn test_engine_failure_is_500_and_cleaned_up() {
    let engine = ScriptedEngine::new(resolver);
    engine.fail_on(EngineOp::Attach);
    let app = TestApp::spawn(engine).await;

    let (status, body) = app.run(&RunRequest::new("print('hi')")).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"], "Failed to process the request.");
    assert!(body["details"].as_str().unwrap().contains("attach"));

    assert!(app.service.registry().is_empty().await);
    assert!(app.engine.live_sandboxes().await.is_empty());
}

#[tokio::test]
async fn test_empty_code_is_400() {
    let app = TestApp::spawn(ScriptedEngine::new(resolver)).await;

    let (status, body) = app.run(&RunRequest::new("   ")).await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("empty"));
}
