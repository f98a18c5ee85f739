#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hangar_core::{ReleaseRef, Stages};
use hangar_flight::{EvalConfig, EvalError, Evaluator, Flight, Module, ProcessEvaluator};

fn script(dir: &Path, name: &str, body: &str) -> String {
    let p = dir.join(name);
    std::fs::write(&p, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
    p.to_str().unwrap().to_string()
}

async fn flight(path: &str) -> Flight {
    let module = Arc::new(Module::load(path).await.unwrap());
    Flight::new(module, ReleaseRef::new("web", "apps"))
}

#[tokio::test]
async fn passes_release_env_args_and_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(
        dir.path(),
        "echo.sh",
        r#"input=$(cat)
printf '{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"%s","namespace":"%s"},"data":{"input":"%s","arg":"%s","extra":"%s"}}' "$HANGAR_RELEASE" "$HANGAR_NAMESPACE" "$input" "$1" "$EXTRA""#,
    );
    let f = flight(&path).await.with_input("hello").with_args(["--first"]).with_env("EXTRA", "x");
    let eval = ProcessEvaluator::default().evaluate(&f).await.unwrap();

    let stages = Stages::parse(&eval.output).unwrap();
    let cm = stages.flatten().next().unwrap();
    assert_eq!(cm.name(), "web");
    assert_eq!(cm.namespace(), Some("apps"));
    assert_eq!(cm.as_value()["data"]["input"], "hello");
    assert_eq!(cm.as_value()["data"]["arg"], "--first");
    assert_eq!(cm.as_value()["data"]["extra"], "x");
    assert_eq!(eval.source.checksum, f.module.checksum);
    assert!(eval.source.reference.starts_with("file://"));
}

#[tokio::test]
async fn failures_carry_exit_code_and_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(dir.path(), "fail.sh", "echo 'bad input' >&2\nexit 3");
    let err = ProcessEvaluator::default().evaluate(&flight(&path).await).await.unwrap_err();
    match &err {
        EvalError::Failed { code, stderr } => {
            assert_eq!(*code, Some(3));
            assert_eq!(stderr, "bad input");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.to_string(), "flight exited with code 3: bad input");
}

#[tokio::test]
async fn empty_and_oversized_output_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let empty = script(dir.path(), "empty.sh", "echo '  '");
    let err = ProcessEvaluator::default().evaluate(&flight(&empty).await).await.unwrap_err();
    assert!(matches!(err, EvalError::EmptyOutput), "{err}");

    let big = script(dir.path(), "big.sh", "printf '0123456789abcdef'");
    let small = ProcessEvaluator::new(EvalConfig { max_output_bytes: 8, ..EvalConfig::default() });
    let err = small.evaluate(&flight(&big).await).await.unwrap_err();
    assert!(matches!(err, EvalError::OutputTooLarge(8)), "{err}");
}

#[tokio::test]
async fn slow_flights_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(dir.path(), "slow.sh", "sleep 5\necho '{}'");
    let eval = ProcessEvaluator::new(EvalConfig { timeout: Some(Duration::from_millis(200)), ..EvalConfig::default() });
    let started = std::time::Instant::now();
    let err = eval.evaluate(&flight(&path).await).await.unwrap_err();
    assert!(matches!(err, EvalError::Timeout(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn flight_that_ignores_stdin_still_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(dir.path(), "noread.sh", r#"echo '[{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"n"}}]'"#);
    let f = flight(&path).await.with_input(vec![b'x'; 1 << 20]);
    let eval = ProcessEvaluator::default().evaluate(&f).await.unwrap();
    assert_eq!(Stages::parse(&eval.output).unwrap().resource_count(), 1);
}

#[tokio::test]
async fn endless_output_is_cut_off_at_the_cap() {
    let dir = tempfile::tempdir().unwrap();
    let path = script(dir.path(), "endless.sh", "exec yes hangar");
    let eval = ProcessEvaluator::new(EvalConfig { timeout: Some(Duration::from_secs(10)), max_output_bytes: 1024 });
    let started = std::time::Instant::now();
    let err = eval.evaluate(&flight(&path).await).await.unwrap_err();
    assert!(matches!(err, EvalError::OutputTooLarge(1024)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5), "stopped reading at the cap, not at the deadline");
}
