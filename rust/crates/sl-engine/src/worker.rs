//! Worker pool
//!
//! A bounded set of stateless workers pulls substep tasks from a shared FIFO
//! queue. Each worker takes the signature store's per-key lock before
//! executing, so at most one execution per substep key is in flight even when
//! the scheduler is racing ahead. Cancellation drains queued tasks without
//! starting them; running tasks finish and their outputs are cleaned up by
//! the scheduler.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sl_core::{Config, Result};
use sl_sig::SignatureStore;
use sl_target::{Resolution, Target, TargetEntry};
use sl_workflow::{Action, ActionKind};

use crate::actions::{ActionBackend, ActionOutcome};
use crate::eval::{expand_text, is_truthy, Env, Evaluator};

/// Everything a worker needs to execute one substep group
#[derive(Debug, Clone)]
pub struct SubstepTask {
    pub node_id: String,
    pub step: String,
    pub index: usize,
    pub key: String,
    pub inputs: Vec<TargetEntry>,
    pub declared_outputs: Vec<Target>,
    /// Glob run after completion for outputs unknowable in advance
    pub dynamic_output: Option<String>,
    pub actions: Vec<Action>,
    pub env: Env,
}

/// Terminal state of one substep execution
#[derive(Debug)]
pub enum SubstepStatus {
    Completed {
        outputs: Vec<Target>,
        env_delta: Env,
        /// Files created by dry-run touch, removed at workflow end
        placeholders: Vec<PathBuf>,
    },
    /// `stop_if` held: succeeded but contributes no outputs downstream
    Stopped,
    Failed {
        diagnostic: String,
    },
    /// Drained from the queue after a failure elsewhere, never started
    Cancelled,
}

#[derive(Debug)]
pub struct SubstepResult {
    pub node_id: String,
    pub index: usize,
    pub key: String,
    pub status: SubstepStatus,
}

struct WorkerContext {
    backend: Arc<dyn ActionBackend>,
    evaluator: Arc<dyn Evaluator>,
    store: Arc<SignatureStore>,
    dry_run: bool,
    timeout: Option<std::time::Duration>,
    max_digest_size: u64,
}

/// Bounded worker pool with a shared ready queue
pub struct WorkerPool {
    task_tx: mpsc::Sender<SubstepTask>,
    result_rx: mpsc::UnboundedReceiver<SubstepResult>,
    cancelled: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        config: &Config,
        backend: Arc<dyn ActionBackend>,
        evaluator: Arc<dyn Evaluator>,
        store: Arc<SignatureStore>,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel::<SubstepTask>(config.queue_capacity.max(1));
        // results are never back-pressured: the scheduler is the only
        // consumer, and a bounded result lane can deadlock against a full
        // task queue
        let (result_tx, result_rx) = mpsc::unbounded_channel::<SubstepResult>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let cancelled = Arc::new(AtomicBool::new(false));

        let context = Arc::new(WorkerContext {
            backend,
            evaluator,
            store,
            dry_run: config.dry_run,
            timeout: config.substep_timeout_ms.map(std::time::Duration::from_millis),
            max_digest_size: config.max_digest_size,
        });

        let mut handles = Vec::with_capacity(config.effective_jobs());
        for worker in 0..config.effective_jobs() {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let cancelled = cancelled.clone();
            let context = context.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker, task_rx, result_tx, cancelled, context).await;
            }));
        }

        Self {
            task_tx,
            result_rx,
            cancelled,
            handles,
        }
    }

    /// Queue a task; fails only when the pool has shut down
    pub async fn submit(&self, task: SubstepTask) -> Result<()> {
        self.task_tx
            .send(task)
            .await
            .map_err(|_| sl_core::Error::Cancelled)
    }

    pub async fn next_result(&mut self) -> Option<SubstepResult> {
        self.result_rx.recv().await
    }

    /// Queued tasks that have not started report back as cancelled
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub async fn shutdown(self) {
        drop(self.task_tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker: usize,
    task_rx: Arc<Mutex<mpsc::Receiver<SubstepTask>>>,
    result_tx: mpsc::UnboundedSender<SubstepResult>,
    cancelled: Arc<AtomicBool>,
    context: Arc<WorkerContext>,
) {
    loop {
        let task = {
            let mut rx = task_rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            debug!(worker, "Worker shutting down");
            return;
        };

        let status = if cancelled.load(Ordering::SeqCst) {
            SubstepStatus::Cancelled
        } else {
            let _guard = context.store.lock_key(&task.key).await;
            run_substep(&task, &context).await
        };

        let result = SubstepResult {
            node_id: task.node_id,
            index: task.index,
            key: task.key,
            status,
        };
        if result_tx.send(result).is_err() {
            return;
        }
    }
}

async fn run_substep(task: &SubstepTask, context: &WorkerContext) -> SubstepStatus {
    if context.dry_run {
        return dry_run_substep(task);
    }

    let mut env = task.env.clone();
    let mut env_delta = Env::new();

    for action in &task.actions {
        let outcome = run_action(task, action, &mut env, &mut env_delta, context).await;
        match outcome {
            Ok(ActionOutcome::Ok) => {}
            Ok(ActionOutcome::Failed { diagnostic }) if action.allow_error => {
                warn!(step = %task.step, index = task.index, diagnostic = %diagnostic, "Action failed (allowed)");
            }
            Ok(ActionOutcome::Failed { diagnostic }) => {
                return SubstepStatus::Failed { diagnostic };
            }
            Err(StopRequested) => return SubstepStatus::Stopped,
        }
    }

    // declared outputs must exist after the actions ran
    for output in &task.declared_outputs {
        if output.resolution() == Resolution::Missing {
            return SubstepStatus::Failed {
                diagnostic: format!("declared output {} was not produced", output),
            };
        }
    }

    let mut outputs = task.declared_outputs.clone();
    if let Some(pattern) = &task.dynamic_output {
        match collect_dynamic_outputs(pattern, &env, context) {
            Ok(found) => outputs.extend(found),
            Err(diagnostic) => return SubstepStatus::Failed { diagnostic },
        }
    }

    SubstepStatus::Completed {
        outputs,
        env_delta,
        placeholders: Vec::new(),
    }
}

/// Marker error: `stop_if` condition held
struct StopRequested;

async fn run_action(
    task: &SubstepTask,
    action: &Action,
    env: &mut Env,
    env_delta: &mut Env,
    context: &WorkerContext,
) -> std::result::Result<ActionOutcome, StopRequested> {
    match &action.kind {
        ActionKind::StopIf { cond } => match context.evaluator.eval(cond, env) {
            Ok(value) if is_truthy(&value) => {
                debug!(step = %task.step, index = task.index, cond, "Substep stopped");
                Err(StopRequested)
            }
            Ok(_) => Ok(ActionOutcome::Ok),
            Err(e) => Ok(ActionOutcome::Failed {
                diagnostic: format!("stop_if condition: {}", e),
            }),
        },
        ActionKind::Eval { code } => match context.evaluator.exec_body(code, env) {
            Ok(delta) => {
                for (name, value) in delta {
                    env.insert(name.clone(), value.clone());
                    env_delta.insert(name, value);
                }
                Ok(ActionOutcome::Ok)
            }
            Err(e) => Ok(ActionOutcome::Failed {
                diagnostic: e.to_string(),
            }),
        },
        ActionKind::Shell { script } => {
            let expanded = match expand_text(script, env, context.evaluator.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    return Ok(ActionOutcome::Failed {
                        diagnostic: e.to_string(),
                    })
                }
            };
            let run = context.backend.run_shell(&expanded);
            let outcome = match context.timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        return Ok(ActionOutcome::Failed {
                            diagnostic: format!("timed out after {}ms", limit.as_millis()),
                        })
                    }
                },
                None => run.await,
            };
            match outcome {
                Ok(outcome) => Ok(outcome),
                Err(e) => Ok(ActionOutcome::Failed {
                    diagnostic: e.to_string(),
                }),
            }
        }
        ActionKind::ZapInputs {} => {
            for entry in &task.inputs {
                if let Err(e) = entry.target.zap(context.max_digest_size) {
                    return Ok(ActionOutcome::Failed {
                        diagnostic: format!("zap {}: {}", entry.target, e),
                    });
                }
            }
            Ok(ActionOutcome::Ok)
        }
    }
}

/// Dry run: touch declared outputs so resolution can proceed, remember which
/// files were created so the workflow end can remove them
fn dry_run_substep(task: &SubstepTask) -> SubstepStatus {
    let mut placeholders = Vec::new();
    for output in &task.declared_outputs {
        let Some(path) = output.path() else { continue };
        if !path.exists() {
            placeholders.push(path.to_path_buf());
        }
        if let Err(e) = output.touch() {
            return SubstepStatus::Failed {
                diagnostic: format!("dry-run touch {}: {}", output, e),
            };
        }
    }
    // dynamic output globs intentionally yield nothing in dry-run
    SubstepStatus::Completed {
        outputs: task.declared_outputs.clone(),
        env_delta: Env::new(),
        placeholders,
    }
}

fn collect_dynamic_outputs(
    pattern: &str,
    env: &Env,
    context: &WorkerContext,
) -> std::result::Result<Vec<Target>, String> {
    let expanded = expand_text(pattern, env, context.evaluator.as_ref())
        .map_err(|e| format!("dynamic output pattern: {}", e))?;
    let walker = glob::glob(&expanded).map_err(|e| format!("dynamic output glob: {}", e))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in walker {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => return Err(format!("dynamic output glob: {}", e)),
        }
    }
    paths.sort();
    Ok(paths.into_iter().map(Target::file).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ShellBackend;
    use crate::eval::SimpleEvaluator;
    use serde_json::json;
    use sl_core::SigMode;

    fn pool_in(dir: &std::path::Path, config: Config) -> WorkerPool {
        let store =
            Arc::new(SignatureStore::open(dir, SigMode::Default, 1 << 20).unwrap());
        WorkerPool::spawn(
            &config,
            Arc::new(ShellBackend::new()),
            Arc::new(SimpleEvaluator::new()),
            store,
        )
    }

    fn shell_task(dir: &std::path::Path, index: usize, script: &str, output: &str) -> SubstepTask {
        let out_path = dir.join(output);
        let mut env = Env::new();
        env.insert("_output".to_string(), json!([out_path.display().to_string()]));
        SubstepTask {
            node_id: "s".to_string(),
            step: "s".to_string(),
            index,
            key: format!("key-{}", index),
            inputs: Vec::new(),
            declared_outputs: vec![Target::file(&out_path)],
            dynamic_output: None,
            actions: vec![Action::shell(script)],
            env,
        }
    }

    #[tokio::test]
    async fn test_pool_runs_tasks_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool_in(dir.path(), Config::default());

        pool.submit(shell_task(dir.path(), 0, "echo one > {_output}", "one.txt"))
            .await
            .unwrap();
        pool.submit(shell_task(dir.path(), 1, "echo two > {_output}", "two.txt"))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let result = pool.next_result().await.unwrap();
            assert!(matches!(result.status, SubstepStatus::Completed { .. }));
            seen.push(result.index);
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
        assert!(dir.path().join("one.txt").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_declared_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool_in(dir.path(), Config::default());

        pool.submit(shell_task(dir.path(), 0, "true", "never_made.txt"))
            .await
            .unwrap();
        let result = pool.next_result().await.unwrap();
        match result.status {
            SubstepStatus::Failed { diagnostic } => {
                assert!(diagnostic.contains("not produced"))
            }
            other => panic!("expected failure, got {:?}", other),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_tasks_never_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            jobs: 1,
            ..Config::default()
        };
        let mut pool = pool_in(dir.path(), config);
        pool.cancel();

        pool.submit(shell_task(dir.path(), 0, "touch {_output}", "x.txt"))
            .await
            .unwrap();
        let result = pool.next_result().await.unwrap();
        assert!(matches!(result.status, SubstepStatus::Cancelled));
        assert!(!dir.path().join("x.txt").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_if_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool_in(dir.path(), Config::default());

        let mut task = shell_task(dir.path(), 0, "touch {_output}", "stopped.txt");
        task.actions.insert(0, Action::stop_if("1 == 1"));
        pool.submit(task).await.unwrap();

        let result = pool.next_result().await.unwrap();
        assert!(matches!(result.status, SubstepStatus::Stopped));
        assert!(!dir.path().join("stopped.txt").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_allow_error_downgrades_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool_in(dir.path(), Config::default());

        let mut task = shell_task(dir.path(), 0, "touch {_output}", "kept.txt");
        let mut failing = Action::shell("false");
        failing.allow_error = true;
        task.actions.insert(0, failing);
        pool.submit(task).await.unwrap();

        let result = pool.next_result().await.unwrap();
        assert!(matches!(result.status, SubstepStatus::Completed { .. }));
        assert!(dir.path().join("kept.txt").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_dry_run_touches_and_reports_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dry_run: true,
            ..Config::default()
        };
        let mut pool = pool_in(dir.path(), config);

        pool.submit(shell_task(dir.path(), 0, "echo real > {_output}", "ph.txt"))
            .await
            .unwrap();
        let result = pool.next_result().await.unwrap();
        match result.status {
            SubstepStatus::Completed { placeholders, .. } => {
                assert_eq!(placeholders.len(), 1);
                // touched, not built
                let content = std::fs::read_to_string(dir.path().join("ph.txt")).unwrap();
                assert!(content.is_empty());
            }
            other => panic!("expected completion, got {:?}", other),
        }
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_eval_action_feeds_env_delta() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = pool_in(dir.path(), Config::default());

        let mut task = shell_task(dir.path(), 0, "echo {result} > {_output}", "v.txt");
        task.actions.insert(
            0,
            Action {
                kind: ActionKind::Eval {
                    code: "result = 'computed'".to_string(),
                },
                allow_error: false,
            },
        );
        pool.submit(task).await.unwrap();

        let result = pool.next_result().await.unwrap();
        match result.status {
            SubstepStatus::Completed { env_delta, .. } => {
                assert_eq!(env_delta.get("result"), Some(&json!("computed")));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        let content = std::fs::read_to_string(dir.path().join("v.txt")).unwrap();
        assert_eq!(content.trim(), "computed");
        pool.shutdown().await;
    }
}
