//! End-to-end driver scenarios against real worker subprocesses.
//!
//! Each test installs a small shell script as the worker command; the script
//! reads its prompt from stdin and acts on the walk directory the way a real
//! LLM worker would.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use walker::core::types::WalkStatus;
use walker::driver::{DriveOutcome, ShutdownFlags, drive};
use walker::io::worker::CommandWorker;
use walker::test_support::TestWalk;

fn install_worker_script(walk: &TestWalk, body: &str) -> String {
    let path = walk.store().paths().walk_dir.join("mock-worker.sh");
    let script = format!("#!/bin/sh\nset -eu\ncat >/dev/null\n{body}");
    fs::write(&path, script).expect("write worker script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path.display().to_string()
}

fn drive_walk(walk: &TestWalk) -> DriveOutcome {
    let config = walk.walk_doc().config;
    let worker = Arc::new(CommandWorker::new(config.worker_command.clone()));
    drive(
        &walk.store().paths().walk_dir,
        worker,
        &ShutdownFlags::manual(),
    )
    .expect("drive")
}

#[test]
fn mock_worker_closes_issue_and_planner_completes() {
    let walk = TestWalk::new().expect("walk");
    let script = install_worker_script(
        &walk,
        r#"if [ -n "${WALK_PLANNING:-}" ]; then
  printf -- '---\noutcome: completed\nreason: Goal met\n---\n' > "$WALK_DIR/_planning_result.md"
else
  printf 'Done.\n' > "$WALK_DIR/open/$WALK_ISSUE/result"
fi
"#,
    );
    walk.set_config(|config| {
        config.sleep_secs = 0;
        config.worker_command = script.split_whitespace().map(str::to_string).collect();
    })
    .expect("config");
    walk.create_issue("alpha", 1).expect("seed");

    let outcome = drive_walk(&walk);
    assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));

    let store = walk.store();
    assert!(!store.paths().open_issue_dir("alpha").exists());
    let alpha = store.show("alpha").expect("show");
    assert_eq!(alpha.closure.expect("closed").reason, "Done.");

    let runs = store.runs("alpha").expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].meta.exit_code, Some(0));

    let doc = store.load_walk().expect("doc");
    assert_eq!(doc.status, WalkStatus::Completed);
    assert_eq!(doc.finish_reason.as_deref(), Some("Goal met"));
    assert!(store.paths().summary_path.exists());
    assert!(!store.paths().planning_result_path.exists());
}

#[test]
fn failing_worker_is_blocked_then_walk_stalls() {
    let walk = TestWalk::new().expect("walk");
    let script = install_worker_script(
        &walk,
        r#"if [ -n "${WALK_PLANNING:-}" ]; then
  printf -- '---\noutcome: no_work_found\nreason: nothing left\n---\n' > "$WALK_DIR/_planning_result.md"
else
  exit 1
fi
"#,
    );
    walk.set_config(|config| {
        config.sleep_secs = 0;
        config.worker_command = script.split_whitespace().map(str::to_string).collect();
    })
    .expect("config");
    walk.create_issue("buggy", 1).expect("seed");

    let outcome = drive_walk(&walk);
    assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Stalled));

    let store = walk.store();
    let buggy = store.show("buggy").expect("show");
    assert!(buggy.blocked_by_driver);
    assert_eq!(store.runs("buggy").expect("runs").len(), 3);
    let comments = store.comments("buggy").expect("comments").expect("present");
    assert!(comments.contains("consecutive failures"));
}

#[test]
fn stream_digest_lifts_cost_and_tokens_into_run_meta() {
    let walk = TestWalk::new().expect("walk");
    let script = install_worker_script(
        &walk,
        r#"if [ -n "${WALK_PLANNING:-}" ]; then
  printf -- '---\noutcome: completed\nreason: done\n---\n' > "$WALK_DIR/_planning_result.md"
else
  printf 'Done.\n' > "$WALK_DIR/open/$WALK_ISSUE/result"
  echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"walker comment x y"}}]}}'
  echo '{"type":"result","subtype":"success","duration_ms":900,"num_turns":3,"result":"ok","total_cost_usd":0.12,"usage":{"input_tokens":40,"output_tokens":9,"cache_creation_input_tokens":0,"cache_read_input_tokens":2}}'
fi
"#,
    );
    walk.set_config(|config| {
        config.sleep_secs = 0;
        config.worker_command = script.split_whitespace().map(str::to_string).collect();
    })
    .expect("config");
    walk.create_issue("alpha", 1).expect("seed");

    let outcome = drive_walk(&walk);
    assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Completed));

    let store = walk.store();
    let runs = store.runs("alpha").expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].meta.cost_usd, Some(0.12));
    let usage = runs[0].meta.token_usage.expect("usage");
    assert_eq!(usage.input_tokens, 40);
    assert_eq!(usage.cache_read_input_tokens, 2);

    // the streaming log was preserved as the run's output artifact
    let (dir, _) = store.issue_location("alpha").expect("location");
    let output = fs::read_to_string(
        dir.join("runs").join(&runs[0].id).join("output"),
    )
    .expect("output log");
    assert!(output.contains("total_cost_usd"));

    let comments = store.comments("alpha").expect("comments").expect("present");
    assert!(comments.contains("Run stats: status success"));
    assert!(comments.contains("3 turns"));
    assert!(comments.contains("$0.12"));
}

#[test]
fn capture_mode_appends_did_not_close_comment() {
    let walk = TestWalk::new().expect("walk");
    let script = install_worker_script(
        &walk,
        r#"if [ -n "${WALK_PLANNING:-}" ]; then
  printf -- '---\noutcome: no_work_found\nreason: idle\n---\n' > "$WALK_DIR/_planning_result.md"
else
  echo 'I looked around but changed nothing.'
  exit 1
fi
"#,
    );
    walk.set_config(|config| {
        config.sleep_secs = 0;
        config.max_failures = 1;
        config.worker_mode = walker::io::walk_meta::WorkerMode::Capture;
        config.worker_command = script.split_whitespace().map(str::to_string).collect();
    })
    .expect("config");
    walk.create_issue("idle-issue", 1).expect("seed");

    // the failed run blocks the issue (max_failures = 1), the queue drains,
    // and fruitless planning rounds stall the walk
    let outcome = drive_walk(&walk);
    assert_eq!(outcome, DriveOutcome::Finished(WalkStatus::Stalled));

    let store = walk.store();
    let comments = store
        .comments("idle-issue")
        .expect("comments")
        .expect("present");
    assert!(comments.contains("Worker exited without closing"));
    assert!(comments.contains("I looked around but changed nothing."));
}
