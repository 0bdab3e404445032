use super::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::execution::Execution;
use keel_core::domain::source::SourceRef;
use keel_core::dto::notification::{Notification, state_topic};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::notify::{BroadcastNotifier, Published};
use crate::store::InMemoryExecutionStore;

const REPO: &str = "https://github.com/acme/shop.git";

#[derive(Default)]
struct FakeFetcher {
    fail: bool,
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, _repo_url: &str, _branch: &str, dest: &Path) -> Result<()> {
        if self.fail {
            return Err(PipelineError::SourceFetch("repository not found".into()));
        }
        tokio::fs::create_dir_all(dest).await?;
        tokio::fs::write(dest.join("pom.xml"), "<project/>").await?;
        Ok(())
    }
}

struct FakeGate {
    pass: bool,
    checked: Mutex<Vec<String>>,
}

impl FakeGate {
    fn new(pass: bool) -> Arc<Self> {
        Arc::new(Self {
            pass,
            checked: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl QualityGate for FakeGate {
    async fn verify(&self, project_key: &str) -> Result<()> {
        self.checked.lock().unwrap().push(project_key.to_string());
        if self.pass {
            Ok(())
        } else {
            Err(PipelineError::QualityGate {
                project_key: project_key.to_string(),
                status: "ERROR".to_string(),
            })
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DeployBehavior {
    Succeed,
    Fail,
    Panic,
}

struct FakeTarget {
    deploy: DeployBehavior,
    rollback_fails: bool,
    delivered: Mutex<Vec<ImageRef>>,
    deployed: Mutex<Vec<ImageRef>>,
    rolled_back_to: Mutex<Vec<Uuid>>,
    rollback_delay: Duration,
    rolled_back_at: Mutex<Option<DateTime<Utc>>>,
}

impl FakeTarget {
    fn new(deploy: DeployBehavior, rollback_fails: bool) -> Arc<Self> {
        Arc::new(Self {
            deploy,
            rollback_fails,
            delivered: Mutex::new(Vec::new()),
            deployed: Mutex::new(Vec::new()),
            rolled_back_to: Mutex::new(Vec::new()),
            rollback_delay: Duration::ZERO,
            rolled_back_at: Mutex::new(None),
        })
    }

    fn with_slow_rollback(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            deploy: DeployBehavior::Fail,
            rollback_fails: false,
            delivered: Mutex::new(Vec::new()),
            deployed: Mutex::new(Vec::new()),
            rolled_back_to: Mutex::new(Vec::new()),
            rollback_delay: delay,
            rolled_back_at: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DeploymentTarget for FakeTarget {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn deliver(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<()> {
        ctx.log(&format!("delivering {}", image)).await;
        self.delivered.lock().unwrap().push(image.clone());
        Ok(())
    }

    async fn deploy(&self, ctx: &ExecutionContext, image: &ImageRef) -> Result<String> {
        self.deployed.lock().unwrap().push(image.clone());
        match self.deploy {
            DeployBehavior::Succeed => {
                ctx.log("Replicas ready: 1/1").await;
                Ok("http://shop.keel-shop.svc.cluster.local:8080".to_string())
            }
            DeployBehavior::Fail => Err(PipelineError::DeploymentNotReady {
                deployment: "keel-shop/shop".into(),
                timeout: Duration::from_secs(900),
                diagnostics: vec!["Event [Warning] BackOff: crash loop".into()],
            }),
            DeployBehavior::Panic => panic!("deploy exploded"),
        }
    }

    async fn rollback(&self, ctx: &ExecutionContext, previous: &Execution) -> Result<ImageRef> {
        tokio::time::sleep(self.rollback_delay).await;
        ctx.log("Replicas ready: 1/1").await;
        *self.rolled_back_at.lock().unwrap() = Some(Utc::now());
        self.rolled_back_to.lock().unwrap().push(previous.id);
        if self.rollback_fails {
            return Err(PipelineError::ResourceMissing("deployment keel-shop/shop".into()));
        }
        Ok(ImageRef::new("shop", previous.id.to_string()))
    }
}

struct Harness {
    orchestrator: Arc<PipelineOrchestrator>,
    store: Arc<InMemoryExecutionStore>,
    notifier: BroadcastNotifier,
    target: Arc<FakeTarget>,
    workspace: tempfile::TempDir,
}

fn config(workspace: &Path) -> Config {
    let mut config = Config::default();
    config.workspace_base = workspace.to_path_buf();
    config.build.command = "echo '[INFO] BUILD SUCCESS'".to_string();
    config.build.image_command = "echo building {image} {latest}".to_string();
    config.log_flush_interval = Duration::from_millis(20);
    config
}

fn harness(
    fetcher: FakeFetcher,
    gate: Option<Arc<FakeGate>>,
    target: Arc<FakeTarget>,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let mut config = config(workspace.path());
    tweak(&mut config);

    let store = Arc::new(InMemoryExecutionStore::new());
    let notifier = BroadcastNotifier::new(4096);
    let mut orchestrator = PipelineOrchestrator::new(
        Arc::new(config),
        store.clone(),
        Arc::new(notifier.clone()),
        Arc::new(fetcher),
        target.clone(),
    );
    if let Some(gate) = gate {
        orchestrator = orchestrator.with_quality_gate(gate);
    }

    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        notifier,
        target,
        workspace,
    }
}

async fn previous_success(store: &InMemoryExecutionStore) -> Execution {
    let mut execution = store.create(SourceRef::new(REPO, "main")).await.unwrap();
    execution.start().unwrap();
    execution.finish(ExecutionStatus::Success).unwrap();
    execution.close().unwrap();
    store.save(&execution).await.unwrap();
    execution
}

async fn run(h: &Harness) -> Execution {
    let execution = h.store.create(SourceRef::new(REPO, "main")).await.unwrap();
    h.orchestrator.run(execution.id).await;
    h.store.get(execution.id).await.unwrap().unwrap()
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Published>) -> Vec<Published> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn position(logs: &str, needle: &str) -> usize {
    logs.find(needle)
        .unwrap_or_else(|| panic!("missing log line: {needle}\n{logs}"))
}

#[tokio::test]
async fn successful_run_passes_every_stage() {
    let gate = FakeGate::new(true);
    let h = harness(
        FakeFetcher::default(),
        Some(gate.clone()),
        FakeTarget::new(DeployBehavior::Succeed, false),
        |_| {},
    );
    let mut rx = h.notifier.subscribe();

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Success);
    let start = execution.start_time.unwrap();
    assert!(execution.end_time.unwrap() >= start);

    let logs = &execution.logs;
    let banners: Vec<usize> = ["FETCH", "BUILD", "QUALITY", "CONTAINERIZE", "DELIVER", "DEPLOY"]
        .iter()
        .enumerate()
        .map(|(i, name)| position(logs, &format!("--- STAGE {}: {} ---", i + 1, name)))
        .collect();
    assert!(banners.windows(2).all(|w| w[0] < w[1]));
    assert!(!logs.contains("STAGE 7"));
    assert!(logs.contains("[INFO] BUILD SUCCESS"));
    assert!(logs.contains("Replicas ready: 1/1"));
    assert!(!logs.contains("ROLLBACK"));

    assert_eq!(gate.checked.lock().unwrap().as_slice(), ["shop"]);
    let image = ImageRef::new("shop", execution.id.to_string());
    assert_eq!(h.target.delivered.lock().unwrap().as_slice(), [image.clone()]);
    assert_eq!(h.target.deployed.lock().unwrap().as_slice(), [image]);
    assert!(!h.workspace.path().join(execution.id.to_string()).exists());

    let messages = drain(&mut rx);
    let last_state = messages
        .iter()
        .rev()
        .find(|m| m.topic == state_topic(execution.id))
        .unwrap();
    assert!(matches!(
        &last_state.notification,
        Notification::State(e) if e.status == ExecutionStatus::Success
    ));

    let seqs: Vec<u64> = messages
        .iter()
        .filter_map(|m| match &m.notification {
            Notification::Log(line) => Some(line.seq),
            _ => None,
        })
        .collect();
    assert!(!seqs.is_empty());
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn failing_quality_gate_rolls_back_to_last_success() {
    let h = harness(
        FakeFetcher::default(),
        Some(FakeGate::new(false)),
        FakeTarget::new(DeployBehavior::Succeed, false),
        |_| {},
    );
    let previous = previous_success(&h.store).await;

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.end_time.is_some());
    assert!(h.target.delivered.lock().unwrap().is_empty());
    assert!(h.target.deployed.lock().unwrap().is_empty());
    assert!(!execution.logs.contains("STAGE 4"));

    let logs = &execution.logs;
    let error = position(logs, "ERROR: Quality gate failed");
    let attempt = position(logs, "--- ATTEMPTING ROLLBACK ---");
    let done = position(logs, &format!("Rollback succeeded to version {}", previous.id));
    assert!(error < attempt && attempt < done);
    assert_eq!(h.target.rolled_back_to.lock().unwrap().as_slice(), [previous.id]);
}

#[tokio::test]
async fn end_time_covers_the_rollback() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::with_slow_rollback(Duration::from_millis(50)),
        |_| {},
    );
    previous_success(&h.store).await;
    let mut rx = h.notifier.subscribe();

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let rolled_back_at = h.target.rolled_back_at.lock().unwrap().unwrap();
    assert!(execution.end_time.unwrap() >= rolled_back_at);

    // FAILED is visible before the rollback, with the end time still open.
    let first_failed = drain(&mut rx)
        .into_iter()
        .find_map(|m| match m.notification {
            Notification::State(e) if e.status == ExecutionStatus::Failed => Some(e),
            _ => None,
        })
        .unwrap();
    assert!(first_failed.end_time.is_none());
}

#[tokio::test]
async fn deploy_failure_without_history_skips_rollback() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::new(DeployBehavior::Fail, false),
        |_| {},
    );

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.logs.contains("Quality gate disabled; skipping"));
    assert!(execution.logs.contains("ERROR: Deployment keel-shop/shop not ready"));
    assert!(execution.logs.contains("No stable version found; rollback skipped"));
    assert!(h.target.rolled_back_to.lock().unwrap().is_empty());
    assert!(!h.workspace.path().join(execution.id.to_string()).exists());
}

#[tokio::test]
async fn build_failure_reports_exit_code_and_failed_rollback() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::new(DeployBehavior::Succeed, true),
        |config| config.build.command = "echo '[ERROR] compilation failed'; exit 1".to_string(),
    );
    let previous = previous_success(&h.store).await;

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.logs.contains("[ERROR] compilation failed"));
    assert!(execution.logs.contains("exit code 1"));
    assert!(execution.logs.contains("Rollback failed: Resource not found"));
    assert_eq!(h.target.rolled_back_to.lock().unwrap().as_slice(), [previous.id]);
}

#[tokio::test]
async fn fetch_failure_fails_the_run() {
    let h = harness(
        FakeFetcher { fail: true },
        None,
        FakeTarget::new(DeployBehavior::Succeed, false),
        |_| {},
    );

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.logs.contains("ERROR: Failed to fetch source: repository not found"));
    assert!(!execution.logs.contains("STAGE 2"));
}

#[tokio::test]
async fn stage_panic_still_finalizes() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::new(DeployBehavior::Panic, false),
        |_| {},
    );

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.end_time.is_some());
    assert!(execution.logs.contains("stage panicked"));
    assert!(execution.logs.contains("Pipeline finished with status FAILED"));
    assert!(!h.workspace.path().join(execution.id.to_string()).exists());
}

#[tokio::test]
async fn scan_runs_against_the_deployed_endpoint() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::new(DeployBehavior::Succeed, false),
        |config| {
            config.scan = Some(crate::config::ScanConfig {
                command: "echo scanning {url}".to_string(),
                delay: Duration::ZERO,
            })
        },
    );

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Success);
    assert!(execution.logs.contains("--- STAGE 7: VERIFY ---"));
    assert!(
        execution
            .logs
            .contains("scanning http://shop.keel-shop.svc.cluster.local:8080")
    );
}

#[tokio::test]
async fn failing_scan_triggers_rollback() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::new(DeployBehavior::Succeed, false),
        |config| {
            config.scan = Some(crate::config::ScanConfig {
                command: "echo 'FAILED: 2 high findings'; exit 2".to_string(),
                delay: Duration::ZERO,
            })
        },
    );
    let previous = previous_success(&h.store).await;

    let execution = run(&h).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.target.rolled_back_to.lock().unwrap().as_slice(), [previous.id]);
}

#[tokio::test]
async fn only_pending_executions_run() {
    let h = harness(
        FakeFetcher::default(),
        None,
        FakeTarget::new(DeployBehavior::Succeed, false),
        |_| {},
    );
    let finished = previous_success(&h.store).await;

    h.orchestrator.run(finished.id).await;
    h.orchestrator.run(Uuid::new_v4()).await;

    let reloaded = h.store.get(finished.id).await.unwrap().unwrap();
    assert_eq!(reloaded, finished);
    assert!(h.target.deployed.lock().unwrap().is_empty());
}
