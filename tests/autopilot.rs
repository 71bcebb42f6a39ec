//! End-to-end autopilot scenarios driven through the engine with a scripted
//! chat provider.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use stepwise::chat::{ChatProvider, ChatRequest, ChatResponse, ChatRouter};
use stepwise::config::Config;
use stepwise::embedding::HashingEmbedder;
use stepwise::engine::{ApproveRequest, Engine, StartRequest};
use stepwise::indexer::rebuild_index;
use stepwise::models::{Job, JobState, StepStatus};
use stepwise::runner::AppliedFiles;
use stepwise::stager;

/// Replays canned replies in order. An optional delay is applied to the
/// first reply only.
struct Scripted {
    replies: Mutex<VecDeque<String>>,
    first_delay: Mutex<Option<Duration>>,
    seen: Mutex<Vec<ChatRequest>>,
}

impl Scripted {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            first_delay: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn delayed(replies: &[&str], delay: Duration) -> Arc<Self> {
        let s = Self::new(replies);
        *s.first_delay.lock().unwrap() = Some(delay);
        s
    }
}

#[async_trait]
impl ChatProvider for Scripted {
    fn id(&self) -> &str {
        "scripted"
    }
    fn available(&self) -> bool {
        true
    }
    fn supports(&self, _model: &str) -> bool {
        true
    }
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        self.seen.lock().unwrap().push(request.clone());
        let delay = self.first_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let content = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| r#"{"patches": []}"#.to_string());
        Ok(ChatResponse {
            provider: "scripted".into(),
            model: request.model.clone(),
            content,
            usage: None,
            warn: None,
        })
    }
}

fn engine_with(config: Config, provider: Arc<Scripted>) -> Engine {
    let mut chat = ChatRouter::new();
    chat.register(provider);
    Engine::new(config, chat, Arc::new(HashingEmbedder::new(64)))
}

fn start(root: &Path, goal: &str) -> StartRequest {
    StartRequest {
        workspace_root: root.to_string_lossy().into_owned(),
        goal_prompt: goal.to_string(),
        provider: Some("scripted".into()),
        model: Some("test-model".into()),
    }
}

fn approve_all() -> ApproveRequest {
    ApproveRequest {
        selected_files: None,
        approve_all: true,
    }
}

/// A job is awaiting approval exactly when it names a staged waiting step.
fn assert_waiting_invariant(job: &Job) {
    match job.state {
        JobState::AwaitingApproval => {
            let step = job.waiting_step().expect("waiting step must exist");
            assert_eq!(step.status, StepStatus::Staged);
        }
        _ => assert!(job.waiting_step_id.is_none(), "{:?} with waiting step", job.state),
    }
}

const TWO_FILES_PLAN: &str = r#"{"steps": [
    {"title": "Write notes", "rationale": "docs", "targetFiles": ["a.txt", "b.txt"]}
]}"#;

const TWO_FILES_PATCH: &str = r#"{"patches": [
    {"targetFile": "a.txt", "mode": "whole-file", "newContent": "alpha\n", "explanation": "new a"},
    {"targetFile": "b.txt", "mode": "whole-file", "newContent": "beta\n"}
]}"#;

#[tokio::test]
async fn test_zero_step_plan_is_done() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(Config::minimal(), Scripted::new(&[r#"{"steps": []}"#]));

    let job = engine.start(start(tmp.path(), "Nothing to do here")).await.unwrap();
    assert_eq!(job.state, JobState::Done);
    assert!(job.steps.is_empty());
    assert_waiting_invariant(&job);
}

#[tokio::test]
async fn test_unparsable_patch_response_stages_nothing() {
    let tmp = TempDir::new().unwrap();
    let plan = r#"{"steps": [{"title": "Edit"}]}"#;
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[plan, "Sorry, I can't produce JSON today."]),
    );

    let job = engine.start(start(tmp.path(), "Edit something")).await.unwrap();
    assert_eq!(job.state, JobState::AwaitingApproval);
    assert_waiting_invariant(&job);
    assert_eq!(job.steps[0].patches.as_deref().map(|p| p.len()), Some(0));
    assert!(job
        .log
        .iter()
        .any(|l| l.message.starts_with("Patch parsing failed")));

    let outcome = engine.approve(&job.id, approve_all()).await.unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.state, JobState::Done);
}

#[tokio::test]
async fn test_selective_approval_leaves_rest_staged() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[TWO_FILES_PLAN, TWO_FILES_PATCH]),
    );
    let job = engine.start(start(tmp.path(), "Write two notes")).await.unwrap();
    assert_eq!(job.steps[0].patch_files(), vec!["a.txt", "b.txt"]);

    let outcome = engine
        .approve(
            &job.id,
            ApproveRequest {
                selected_files: Some(vec!["./a.txt".into()]),
                approve_all: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.applied_files, AppliedFiles::Only(vec!["a.txt".into()]));
    assert_eq!(fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "alpha\n");
    assert!(!tmp.path().join("b.txt").exists());

    let config = engine.config();
    assert_eq!(
        stager::list_staged(config, tmp.path()).unwrap(),
        vec!["b.txt".to_string()]
    );

    let job = engine.status(&job.id).await.unwrap();
    let patches = job.steps[0].patches.as_ref().unwrap();
    assert!(patches.iter().find(|p| p.target_file == "a.txt").unwrap().approved);
    assert!(!patches.iter().find(|p| p.target_file == "b.txt").unwrap().approved);
}

#[tokio::test]
async fn test_full_approval_applies_everything() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[TWO_FILES_PLAN, TWO_FILES_PATCH]),
    );
    let job = engine.start(start(tmp.path(), "Write two notes")).await.unwrap();

    // A selection is ignored when approveAll is set.
    let outcome = engine
        .approve(
            &job.id,
            ApproveRequest {
                selected_files: Some(vec!["a.txt".into()]),
                approve_all: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(outcome.applied_files, AppliedFiles::All);
    assert!(tmp.path().join("b.txt").exists());
    assert!(stager::list_staged(engine.config(), tmp.path()).unwrap().is_empty());
}

#[tokio::test]
async fn test_paths_outside_root_never_promoted() {
    let tmp = TempDir::new().unwrap();
    let workspace = tmp.path().join("ws");
    fs::create_dir(&workspace).unwrap();

    let patch = r#"{"patches": [
        {"targetFile": "../evil.txt", "mode": "whole-file", "newContent": "x"},
        {"targetFile": "C:/evil.txt", "mode": "whole-file", "newContent": "x"},
        {"targetFile": ".stepwise/jobs/x.json", "mode": "whole-file", "newContent": "x"},
        {"targetFile": "ok.txt", "mode": "whole-file", "newContent": "ok"}
    ]}"#;
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[r#"{"steps": [{"title": "Sneak"}]}"#, patch]),
    );

    let job = engine.start(start(&workspace, "Try to escape")).await.unwrap();
    assert_eq!(job.steps[0].patch_files(), vec!["ok.txt"]);
    assert_eq!(
        job.log.iter().filter(|l| l.message.starts_with("Skipping invalid path")).count(),
        3
    );

    engine.approve(&job.id, approve_all()).await.unwrap();
    assert!(!tmp.path().join("evil.txt").exists());
    assert!(workspace.join("ok.txt").exists());
}

#[tokio::test]
async fn test_diff_hunks_patch_applies_to_existing_file() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("lib.rs"), "fn a() {}\nfn b() {}\nfn c() {}\n").unwrap();
    let patch = r#"{"patches": [{"targetFile": "lib.rs", "mode": "diff-hunks",
        "unifiedDiff": "--- a/lib.rs\n+++ b/lib.rs\n@@ -1,3 +1,3 @@\n fn a() {}\n-fn b() {}\n+fn b() { todo!() }\n fn c() {}\n"}]}"#;
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[r#"{"steps": [{"title": "Stub b"}]}"#, patch]),
    );

    let job = engine.start(start(tmp.path(), "Stub out b")).await.unwrap();
    engine.approve(&job.id, approve_all()).await.unwrap();
    assert_eq!(
        fs::read_to_string(tmp.path().join("lib.rs")).unwrap(),
        "fn a() {}\nfn b() { todo!() }\nfn c() {}\n"
    );
}

#[tokio::test]
async fn test_no_test_command_skips_and_continues() {
    let tmp = TempDir::new().unwrap();
    let plan = r#"{"steps": [{"title": "One"}, {"title": "Two"}]}"#;
    let one = r#"{"patches": [{"targetFile": "one.txt", "newContent": "1"}]}"#;
    let two = r#"{"patches": [{"targetFile": "two.txt", "newContent": "2"}]}"#;
    let engine = engine_with(Config::minimal(), Scripted::new(&[plan, one, two]));

    let job = engine.start(start(tmp.path(), "Two steps")).await.unwrap();
    let first = job.steps[0].id.clone();

    let outcome = engine.approve(&job.id, approve_all()).await.unwrap();
    assert_eq!(outcome.state, JobState::AwaitingApproval);
    assert_eq!(outcome.current_step, 1);
    assert_eq!(outcome.total_steps, 2);

    let job = engine.status(&job.id).await.unwrap();
    assert_waiting_invariant(&job);
    let tested = job.step(&first).unwrap();
    assert_eq!(tested.status, StepStatus::Tested);
    let result = tested.test_result.as_ref().unwrap();
    assert!(result.passed);
    assert_eq!(result.output, "No test command configured; skipping tests.");
    assert_eq!(job.waiting_step_id.as_deref(), Some(job.steps[1].id.as_str()));

    let outcome = engine.approve(&job.id, approve_all()).await.unwrap();
    assert_eq!(outcome.state, JobState::Done);
    assert_eq!(outcome.current_step, 2);
    let job = engine.status(&job.id).await.unwrap();
    assert!(job.log.iter().any(|l| l.message == "All steps completed."));
    assert_waiting_invariant(&job);
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_and_timed_out_tests_are_data() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal();
    config.tests.command = Some("echo started; sleep 5".into());
    config.tests.timeout_secs = 1;

    let plan = r#"{"steps": [{"title": "One"}, {"title": "Two"}]}"#;
    let one = r#"{"patches": [{"targetFile": "one.txt", "newContent": "1"}]}"#;
    let engine = engine_with(config, Scripted::new(&[plan, one]));

    let job = engine.start(start(tmp.path(), "Slow tests")).await.unwrap();
    let outcome = engine.approve(&job.id, approve_all()).await.unwrap();
    assert_eq!(outcome.state, JobState::AwaitingApproval);

    let job = engine.status(&job.id).await.unwrap();
    let result = job.steps[0].test_result.as_ref().unwrap();
    assert!(!result.passed);
    assert!(result.output.contains("started"));
    assert!(result.output.ends_with("[timeout after 1s]"));
    assert!(job.log.iter().any(|l| l.message == "Tests failed."));
}

#[tokio::test]
async fn test_persisted_record_matches_live_job() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[TWO_FILES_PLAN, TWO_FILES_PATCH]),
    );
    let job = engine.start(start(tmp.path(), "Write two notes")).await.unwrap();

    let live = engine.status(&job.id).await.unwrap();
    let stored = engine.store().load(tmp.path(), &job.id).unwrap();
    assert_eq!(stored, live);

    engine.approve(&job.id, approve_all()).await.unwrap();
    let live = engine.status(&job.id).await.unwrap();
    let stored = engine.store().load(tmp.path(), &job.id).unwrap();
    assert_eq!(stored, live);
    assert_eq!(stored.state, JobState::Done);
}

#[tokio::test]
async fn test_recover_after_restart_and_continue() {
    let tmp = TempDir::new().unwrap();
    let plan = r#"{"steps": [{"title": "One"}]}"#;
    let one = r#"{"patches": [{"targetFile": "one.txt", "newContent": "1"}]}"#;

    let id = {
        let engine = engine_with(Config::minimal(), Scripted::new(&[plan, one]));
        let job = engine.start(start(tmp.path(), "Survive restart")).await.unwrap();
        assert_eq!(job.state, JobState::AwaitingApproval);
        job.id
    };

    let engine = engine_with(Config::minimal(), Scripted::new(&[]));
    assert_eq!(engine.status(&id).await.unwrap_err().code(), "not_found");

    let job = engine.recover(tmp.path(), &id).await.unwrap();
    assert_eq!(job.state, JobState::AwaitingApproval);
    assert_waiting_invariant(&job);
    assert_eq!(engine.list().len(), 1);

    let outcome = engine.approve(&id, approve_all()).await.unwrap();
    assert_eq!(outcome.state, JobState::Done);
    assert_eq!(fs::read_to_string(tmp.path().join("one.txt")).unwrap(), "1");

    let missing = engine.recover(tmp.path(), "no-such-job").await.unwrap_err();
    assert_eq!(missing.code(), "not_found");
}

#[tokio::test]
async fn test_abort_rejects_further_approval() {
    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        Config::minimal(),
        Scripted::new(&[TWO_FILES_PLAN, TWO_FILES_PATCH]),
    );
    let job = engine.start(start(tmp.path(), "Write two notes")).await.unwrap();

    let aborted = engine.abort(&job.id).await.unwrap();
    assert_eq!(aborted.state, JobState::Aborted);
    assert_waiting_invariant(&aborted);
    assert_eq!(aborted.log.last().unwrap().message, "Job aborted by user.");

    assert_eq!(engine.abort(&job.id).await.unwrap_err().code(), "conflict");
    assert_eq!(
        engine.approve(&job.id, approve_all()).await.unwrap_err().code(),
        "conflict"
    );
    assert!(!tmp.path().join("a.txt").exists());
    // Staged files of an aborted job are left for the operator.
    assert_eq!(stager::list_staged(engine.config(), tmp.path()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_abort_lands_while_planning_is_in_flight() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(engine_with(
        Config::minimal(),
        Scripted::delayed(&[TWO_FILES_PLAN, TWO_FILES_PATCH], Duration::from_millis(500)),
    ));

    let runner = engine.clone();
    let req = start(tmp.path(), "Write two notes");
    let handle = tokio::spawn(async move { runner.start(req).await });

    let id = loop {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let Some(id) = engine.list().first().map(|s| s.id.clone()) else {
            continue;
        };
        if engine.status(&id).await.is_ok() {
            break id;
        }
    };
    let aborted = engine.abort(&id).await.unwrap();
    assert_eq!(aborted.state, JobState::Aborted);

    let finished = handle.await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Aborted);
    assert!(finished.steps.is_empty());
    assert!(stager::list_staged(engine.config(), tmp.path()).unwrap().is_empty());
}

#[tokio::test]
async fn test_steering_and_targets_reach_patch_request() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join(".steering.md"), "Keep functions short.\n").unwrap();
    let provider = Scripted::new(&[
        r#"{"steps": [{"title": "Edit", "targetFiles": ["src\\main.rs", "../x"]}]}"#,
        r#"{"patches": []}"#,
    ]);
    let engine = engine_with(Config::minimal(), provider.clone());

    let job = engine.start(start(tmp.path(), "Tidy main")).await.unwrap();
    assert_eq!(
        job.steps[0].target_files.as_deref(),
        Some(&["src/main.rs".to_string()][..])
    );

    let seen = provider.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    let user = &seen[1].messages[1].content;
    assert!(user.contains("TARGET FILES: src/main.rs"));
    assert!(user.contains("STEERING:\nKeep functions short."));
    assert_eq!(seen[1].model, "test-model");
}

#[tokio::test]
async fn test_index_context_reaches_plan_and_patch_requests() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    fs::write(
        root.join("calc.ts"),
        "export function add(a: number, b: number) { return a + b; }\n",
    )
    .unwrap();
    let provider = Scripted::new(&[
        r#"{"steps": [{"title": "Fix add", "rationale": "add returns wrong sum", "targetFiles": ["calc.ts"]}]}"#,
        r#"{"patches": []}"#,
    ]);
    let engine = engine_with(Config::minimal(), provider.clone());
    let status = rebuild_index(engine.config(), &root, engine.embedder())
        .await
        .unwrap();
    assert_eq!(status.items, 1);

    engine.start(start(&root, "Fix the add function")).await.unwrap();

    let seen = provider.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for request in seen.iter() {
        let user = &request.messages[1].content;
        assert!(user.contains("### Project Context (top matches)"), "{}", user);
        assert!(user.contains("[calc.ts:1-1]"), "{}", user);
        assert!(user.contains("return a + b;"));
    }
}

#[tokio::test]
async fn test_recover_resumes_job_saved_mid_run() {
    let tmp = TempDir::new().unwrap();
    let plan = r#"{"steps": [{"title": "One"}, {"title": "Two"}]}"#;
    let one = r#"{"patches": [{"targetFile": "one.txt", "newContent": "1"}]}"#;
    let two = r#"{"patches": [{"targetFile": "two.txt", "newContent": "2"}]}"#;

    let id = {
        let engine = engine_with(Config::minimal(), Scripted::new(&[plan, one]));
        let job = engine.start(start(tmp.path(), "Two steps")).await.unwrap();
        assert_eq!(job.state, JobState::AwaitingApproval);

        // Simulate a crash after step one finished but before step two ran.
        let mut saved = engine.store().load(tmp.path(), &job.id).unwrap();
        saved.state = JobState::Running;
        saved.waiting_step_id = None;
        saved.steps[0].status = StepStatus::Tested;
        engine.store().save(&saved).unwrap();
        job.id
    };

    let engine = engine_with(Config::minimal(), Scripted::new(&[two]));
    let job = engine.recover(tmp.path(), &id).await.unwrap();
    assert_eq!(job.state, JobState::AwaitingApproval);
    assert_waiting_invariant(&job);
    assert_eq!(job.waiting_step_id.as_deref(), Some(job.steps[1].id.as_str()));
    assert!(job
        .log
        .iter()
        .any(|l| l.message == "Resuming running job after restart."));

    let outcome = engine.approve(&id, approve_all()).await.unwrap();
    assert_eq!(outcome.state, JobState::Done);
    assert_eq!(fs::read_to_string(tmp.path().join("two.txt")).unwrap(), "2");
}
