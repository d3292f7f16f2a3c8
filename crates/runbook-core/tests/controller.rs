use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use runbook_core::*;
use runbook_exec::{Secret, SecretStore};
use tempfile::TempDir;
use tokio::runtime::Handle;

fn controller(dir: &TempDir) -> ExecutionController {
    ExecutionController::with_runtime(RunConfig::default(), Handle::current()).with_cwd(dir.path())
}

fn start(controller: &ExecutionController, code: &str, entries: &[&str]) -> RunHandle {
    controller
        .start(
            ScriptSource::inline(code),
            SecretStore::new(),
            entries.iter().map(ToString::to_string).collect(),
        )
        .unwrap()
}

async fn finish(handle: &RunHandle) -> RunReport {
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("run did not finish in time")
}

async fn wait_until_running(handle: &RunHandle) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() == RunState::Created {
        assert!(Instant::now() < deadline, "run never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_main_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let handle = start(
        &controller,
        r#"
        let greeting = "top-level";
        fn main() { fs_write("done.txt", "ok"); }
        "#,
        &[],
    );
    let report = finish(&handle).await;

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.run_id, handle.id());
    assert_eq!(handle.state(), RunState::Completed);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("done.txt")).unwrap(),
        "ok"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_entry_points_run_in_order_and_stop_on_error() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let handle = start(
        &controller,
        r#"
        fn first() { fs_write("first.txt", "1"); throw "boom"; }
        fn second() { fs_write("second.txt", "2"); }
        "#,
        &["first", "second"],
    );
    let report = finish(&handle).await;

    assert_eq!(report.state, RunState::Failed);
    match report.error {
        Some(RunError::Execution(message)) => assert!(message.contains("boom"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(dir.path().join("first.txt").exists());
    assert!(!dir.path().join("second.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_entry_point_fails_before_top_level_code() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let handle = start(
        &controller,
        r#"
        fs_write("marker.txt", "top-level ran");
        fn main() {}
        "#,
        &["main", "deploy"],
    );
    let report = finish(&handle).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.error.as_ref().map(RunError::kind), Some(ErrorKind::NotFound));
    assert!(!dir.path().join("marker.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let report = finish(&start(&controller, "fn main( {", &[])).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.error.as_ref().map(RunError::kind), Some(ErrorKind::Compile));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_script_file() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let handle = controller
        .start(
            ScriptSource::default_in(dir.path()),
            SecretStore::new(),
            Vec::new(),
        )
        .unwrap();
    let report = finish(&handle).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.error.as_ref().map(RunError::kind), Some(ErrorKind::NotFound));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fallback_script_name() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("Runbook.rhai"),
        r#"fn main() { fs_write("fallback.txt", "yes"); }"#,
    )
    .unwrap();
    let controller = controller(&dir);

    let handle = controller
        .start(
            ScriptSource::default_in(dir.path()),
            SecretStore::new(),
            Vec::new(),
        )
        .unwrap();
    let report = finish(&handle).await;

    assert!(report.success(), "{:?}", report.error);
    assert!(dir.path().join("fallback.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thrown_error_map_keeps_kind() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let report = finish(&start(
        &controller,
        r#"fn main() { throw #{ kind: "timeout", message: "deploy took too long" }; }"#,
        &[],
    ))
    .await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.error,
        Some(RunError::Timeout("deploy took too long".to_string()))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_uncaught_bridge_error_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let report = finish(&start(
        &controller,
        r#"fn main() { get_text_secret("missing"); }"#,
        &[],
    ))
    .await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.error.as_ref().map(RunError::kind), Some(ErrorKind::NotFound));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_infinite_loop() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let controller = controller(&dir).on_done(move |report| {
        assert_eq!(report.state, RunState::Aborted);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let handle = start(&controller, "fn main() { loop { } }", &[]);
    wait_until_running(&handle).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    controller.abort(&handle);
    let report = finish(&handle).await;

    assert_eq!(report.state, RunState::Aborted);
    assert_eq!(report.error, Some(RunError::Aborted));
    assert_eq!(handle.state(), RunState::Aborted);

    // A second abort after completion changes nothing
    handle.abort();
    assert_eq!(handle.state(), RunState::Aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_abort_interrupts_running_command() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);

    let handle = start(
        &controller,
        r#"
        fn main() {
            try {
                sh("sleep 30");
            } catch (e) {
                fs_write("caught.txt", "swallowed");
            }
        }
        "#,
        &[],
    );
    wait_until_running(&handle).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let begin = Instant::now();
    handle.abort_handle().abort();
    let report = finish(&handle).await;

    assert_eq!(report.state, RunState::Aborted);
    assert!(begin.elapsed() < Duration::from_secs(5));
    assert!(!dir.path().join("caught.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ssh_key_files_removed_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let controller = controller(&dir);
    let secrets = SecretStore::new();
    secrets
        .add("deploy", Secret::ssh_identity("git", "KEY", None))
        .unwrap();

    let handle = controller
        .start(
            ScriptSource::inline(
                r#"fn main() { fs_write("key-path.txt", get_ssh_secret("deploy").private_key_file); }"#,
            ),
            secrets,
            Vec::new(),
        )
        .unwrap();
    let report = finish(&handle).await;
    assert!(report.success(), "{:?}", report.error);

    let key_path = std::fs::read_to_string(dir.path().join("key-path.txt")).unwrap();
    assert!(!key_path.is_empty());
    assert!(!std::path::Path::new(&key_path).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operation_limit_fails_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        max_operations: 1_000,
        ..RunConfig::default()
    };
    let controller =
        ExecutionController::with_runtime(config, Handle::current()).with_cwd(dir.path());

    let report = finish(&start(&controller, "fn main() { loop { } }", &[])).await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.error.as_ref().map(RunError::kind), Some(ErrorKind::Execution));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_runs_keep_separate_directories() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();
    std::fs::create_dir(first.path().join("sub")).unwrap();
    let a = controller(&first);
    let b = controller(&second);

    let code = r#"fn main() { if fs_list("", "d").len() > 0 { cd("sub"); } fs_write("here.txt", pwd()); }"#;
    let ha = start(&a, code, &[]);
    let hb = start(&b, code, &[]);
    assert!(finish(&ha).await.success());
    assert!(finish(&hb).await.success());

    assert!(first.path().join("sub/here.txt").exists());
    assert!(second.path().join("here.txt").exists());
}

#[test]
fn test_owned_runtime_wait_blocking() {
    let dir = tempfile::tempdir().unwrap();
    let controller = ExecutionController::new(RunConfig::default())
        .unwrap()
        .with_cwd(dir.path());

    let handle = controller
        .start(
            ScriptSource::inline(r#"fn main() { if sh("echo hi").out != "hi\n" { throw "bad output"; } }"#),
            SecretStore::new(),
            vec!["main".to_string()],
        )
        .unwrap();
    let report = handle.wait_blocking();

    assert!(report.success(), "{:?}", report.error);
    assert_eq!(handle.try_report(), Some(report));
}
