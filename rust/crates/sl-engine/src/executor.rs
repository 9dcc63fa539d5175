//! The scheduler/executor
//!
//! A single-threaded scheduling loop owns the DAG; only substep execution is
//! parallel. The loop advances pending nodes (resolving their dependencies,
//! growing the DAG where the resolver discovers producers), expands ready
//! nodes into substep groups, consults the signature store, dispatches misses
//! to the worker pool and folds completions back into targets until the DAG
//! drains or a failure aborts the run.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use sl_core::time::Timestamp;
use sl_core::{Config, Error, Result, RunId, SigMode};
use sl_dag::{ExecutionDag, Node, NodeState, Production, Resolver};
use sl_sig::{substep_key, Lookup, RecordedFile, SignatureRecord, SignatureStore, WorkspaceLock};
use sl_target::{Resolution, Target, TargetEntry};
use sl_workflow::{ActionKind, DependsSpec, Script, SourceTerm, Step, StepRef};

use crate::actions::{ActionBackend, ShellBackend};
use crate::eval::{expand_text, Env, Evaluator, SimpleEvaluator};
use crate::expander::{expand_step, TermInputs};
use crate::report::{ExecutionReport, FailureInfo, RunStatus, StepSummary};
use crate::worker::{SubstepResult, SubstepStatus, SubstepTask, WorkerPool};

/// One produced artifact with the label its output directive gave it
#[derive(Debug, Clone)]
struct OutputEntry {
    target: Target,
    label: Option<String>,
}

/// Outputs of one substep group, in substep-index order
#[derive(Debug, Clone)]
struct GroupOutputs {
    entries: Vec<OutputEntry>,
    stopped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    /// Not yet submitted (sequential steps submit one at a time)
    Waiting,
    Dispatched,
    /// Satisfied from the signature store
    SkippedHit,
    Succeeded,
    Stopped,
    Failed,
    Cancelled,
}

struct GroupRun {
    key: String,
    inputs: Vec<TargetEntry>,
    bound: Env,
    declared: Vec<OutputEntry>,
    outputs: Vec<OutputEntry>,
    env_delta: Env,
    state: GroupState,
    diagnostic: Option<String>,
}

struct NodeRun {
    sequential: bool,
    env: Env,
    groups: Vec<GroupRun>,
}

enum Prep {
    /// Waiting on producers; `added` reports whether the DAG grew
    Blocked { added: bool },
    Ready,
}

struct RunState {
    dag: ExecutionDag,
    runs: HashMap<String, NodeRun>,
    /// Settled outputs of successful nodes
    outputs: HashMap<String, Vec<GroupOutputs>>,
    shared_env: Env,
    /// Declared output path -> (node, substep index), for duplicate detection
    declared_paths: HashMap<PathBuf, (String, usize)>,
    submitted_keys: HashSet<String>,
    placeholders: Vec<PathBuf>,
    failures: Vec<FailureInfo>,
    failing: bool,
    workflow_steps: Vec<String>,
    workflow_positions: HashMap<String, usize>,
    running: usize,
}

impl RunState {
    fn new() -> Self {
        Self {
            dag: ExecutionDag::new(),
            runs: HashMap::new(),
            outputs: HashMap::new(),
            shared_env: Env::new(),
            declared_paths: HashMap::new(),
            submitted_keys: HashSet::new(),
            placeholders: Vec::new(),
            failures: Vec::new(),
            failing: false,
            workflow_steps: Vec::new(),
            workflow_positions: HashMap::new(),
            running: 0,
        }
    }
}

/// Append-only per-run execution log under the workspace directory
struct RunLog {
    file: std::fs::File,
}

impl RunLog {
    fn open(workspace_dir: &std::path::Path, run_id: RunId) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(workspace_dir.join("run.log"))?;
        writeln!(file, "{} === {} ===", Timestamp::now(), run_id)?;
        Ok(Self { file })
    }

    fn line(&mut self, message: &str) {
        let _ = writeln!(self.file, "{} {}", Timestamp::now(), message);
    }
}

/// The engine entry point: builds the DAG for a selected workflow and runs it
pub struct Executor {
    script: Script,
    config: Config,
    backend: Arc<dyn ActionBackend>,
    evaluator: Arc<dyn Evaluator>,
}

impl Executor {
    pub fn new(script: Script, config: Config) -> Self {
        Self {
            script,
            config,
            backend: Arc::new(ShellBackend::new()),
            evaluator: Arc::new(SimpleEvaluator::new()),
        }
    }

    /// Replace the shell back-end (tests, remote dispatch)
    pub fn with_backend(mut self, backend: Arc<dyn ActionBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the expression evaluator
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Execute a workflow to completion and return the structured report.
    ///
    /// Static errors (unknown targets, cycles, duplicate outputs) surface as
    /// `Err`; substep failures produce an `Ok` report with `RunStatus::Failed`
    /// listing every failure together.
    #[instrument(skip(self))]
    pub async fn execute(&self, workflow: Option<&str>) -> Result<ExecutionReport> {
        let started = Timestamp::now();
        let run_id = RunId::new();
        let wf = self.script.workflow(workflow)?;
        info!(run_id = %run_id, workflow = %wf.name, steps = wf.steps.len(), "Starting run");

        let _lock = WorkspaceLock::acquire(&self.config.workspace_dir)?;
        let mut log = RunLog::open(&self.config.workspace_dir, run_id)?;
        let store = Arc::new(SignatureStore::open(
            &self.config.workspace_dir,
            self.config.sig_mode,
            self.config.max_digest_size,
        )?);
        let mut pool = WorkerPool::spawn(
            &self.config,
            self.backend.clone(),
            self.evaluator.clone(),
            store.clone(),
        );

        let mut rs = RunState::new();
        for (position, step) in wf.steps.iter().enumerate() {
            let node = Node::forward(step.clone());
            let id = node.id.clone();
            rs.dag.add_node(node);
            rs.workflow_positions.insert(id.clone(), position);
            rs.workflow_steps.push(id.clone());
            if position > 0 {
                let previous = rs.workflow_steps[position - 1].clone();
                rs.dag.add_edge(&previous, &id).map_err(Error::from)?;
            }
        }

        let outcome = self.run_loop(&mut rs, &store, &mut pool, &mut log).await;
        pool.shutdown().await;

        // dry-run leaves the filesystem as it found it
        if self.config.dry_run {
            for placeholder in &rs.placeholders {
                let _ = std::fs::remove_file(placeholder);
            }
        }

        outcome?;
        let report = self.build_report(&rs, run_id, &wf.name, started);
        log.line(&format!(
            "run finished: {:?}, {} failures",
            report.status,
            report.failures.len()
        ));
        info!(run_id = %run_id, status = ?report.status, "Run finished");
        Ok(report)
    }

    async fn run_loop(
        &self,
        rs: &mut RunState,
        store: &Arc<SignatureStore>,
        pool: &mut WorkerPool,
        log: &mut RunLog,
    ) -> Result<()> {
        loop {
            // advance everything that can advance before waiting
            loop {
                let mut progressed = false;
                for id in rs.dag.node_ids().to_vec() {
                    if rs.failing {
                        break;
                    }
                    if rs.dag.state(&id) != Some(NodeState::Pending) {
                        continue;
                    }
                    if !self.parents_successful(rs, &id) {
                        continue;
                    }
                    rs.dag.set_state(&id, NodeState::Resolving).map_err(Error::from)?;
                    match self.prepare_node(rs, &id) {
                        Ok(Prep::Ready) => {
                            log.line(&format!("start {}", id));
                            self.start_node(rs, store, pool, &id).await?;
                            progressed = true;
                        }
                        Ok(Prep::Blocked { added }) => {
                            rs.dag.set_state(&id, NodeState::Pending).map_err(Error::from)?;
                            progressed |= added;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if !progressed {
                    break;
                }
            }

            if rs.dag.is_complete() {
                return Ok(());
            }
            if rs.running == 0 {
                // nothing in flight: either drain after a failure or a stall
                for id in rs.dag.node_ids().to_vec() {
                    if !rs.dag.state(&id).is_some_and(|s| s.is_terminal()) {
                        rs.dag.set_state(&id, NodeState::Skipped).map_err(Error::from)?;
                    }
                }
                if !rs.failing {
                    warn!("Scheduler stalled with unresolved nodes");
                    rs.failing = true;
                }
                return Ok(());
            }

            let Some(result) = pool.next_result().await else {
                return Err(Error::Cancelled);
            };
            self.handle_result(rs, store, pool, result, log).await?;
        }
    }

    fn parents_successful(&self, rs: &RunState, id: &str) -> bool {
        rs.dag
            .parents(id)
            .iter()
            .all(|p| rs.dag.state(p).is_some_and(|s| s.is_successful()))
    }

    /// Environment a node's expressions evaluate in: the accumulated shared
    /// scope plus the node's bound parameters
    fn node_env(&self, rs: &RunState, node: &Node) -> Env {
        let mut env = rs.shared_env.clone();
        for (name, value) in &node.bound {
            env.insert(name.clone(), Value::String(value.clone()));
        }
        env
    }

    /// Resolve a node's `depends` and input references, growing the DAG with
    /// any producers the resolver discovers
    fn prepare_node(&self, rs: &mut RunState, id: &str) -> Result<Prep> {
        let node = rs
            .dag
            .node(id)
            .cloned()
            .ok_or_else(|| Error::validation(id, "node vanished during preparation"))?;
        let env = self.node_env(rs, &node);
        let resolver = Resolver::new(&self.script);
        let mut added = false;
        let mut blocked = false;

        for dep in &node.step.depends {
            let target = match dep {
                DependsSpec::File(template) => {
                    Target::file(expand_text(template, &env, self.evaluator.as_ref())?)
                }
                DependsSpec::Step(name) => Target::step_completion(name.clone()),
                DependsSpec::Variable(name) => {
                    if rs.shared_env.contains_key(name) {
                        continue;
                    }
                    Target::variable(name.clone())
                }
                DependsSpec::Executable(name) => Target::executable(name.clone()),
            };
            self.ensure_producers(rs, id, &target, &resolver, &mut added, &mut blocked)?;
        }
        if blocked {
            // input templates may reference variables the depends provide
            return Ok(Prep::Blocked { added });
        }

        for term in &node.step.input.terms {
            match term {
                SourceTerm::Paths { paths, .. } => {
                    for template in paths {
                        let target =
                            Target::file(expand_text(template, &env, self.evaluator.as_ref())?);
                        self.ensure_producers(
                            rs, id, &target, &resolver, &mut added, &mut blocked,
                        )?;
                    }
                }
                // globs match whatever exists when the step starts
                SourceTerm::Glob { .. } => {}
                SourceTerm::OutputFrom { output_from, .. } => {
                    for pid in self.resolve_refs(rs, id, output_from)? {
                        self.ensure_step_node(rs, id, &pid, &mut added, &mut blocked)?;
                    }
                }
                SourceTerm::NamedOutput { named_output, .. } => {
                    let step = self.script.step_with_label(named_output).ok_or_else(|| {
                        Error::unknown_target(Target::named_output(named_output.clone()))
                    })?;
                    let pid = step.display_name();
                    self.ensure_step_node(rs, id, &pid, &mut added, &mut blocked)?;
                }
            }
        }

        if blocked {
            Ok(Prep::Blocked { added })
        } else {
            Ok(Prep::Ready)
        }
    }

    fn ensure_producers(
        &self,
        rs: &mut RunState,
        consumer: &str,
        target: &Target,
        resolver: &Resolver<'_>,
        added: &mut bool,
        blocked: &mut bool,
    ) -> Result<()> {
        match resolver.resolve(target)? {
            Production::Leaf => Ok(()),
            Production::Nodes(nodes) => {
                for node in nodes {
                    let pid = node.id.clone();
                    if rs.dag.add_node(node) {
                        *added = true;
                    }
                    rs.dag.add_edge(&pid, consumer).map_err(Error::from)?;
                    if !rs.dag.state(&pid).is_some_and(|s| s.is_successful()) {
                        *blocked = true;
                    }
                }
                Ok(())
            }
        }
    }

    fn ensure_step_node(
        &self,
        rs: &mut RunState,
        consumer: &str,
        pid: &str,
        added: &mut bool,
        blocked: &mut bool,
    ) -> Result<()> {
        if !rs.dag.contains(pid) {
            let step = self
                .script
                .find_step(pid)
                .ok_or_else(|| Error::unknown_target(format!("step '{}'", pid)))?;
            rs.dag.add_node(Node::forward(step.clone()));
            *added = true;
        }
        rs.dag.add_edge(pid, consumer).map_err(Error::from)?;
        if !rs.dag.state(pid).is_some_and(|s| s.is_successful()) {
            *blocked = true;
        }
        Ok(())
    }

    /// Step references inside `output_from`, resolved against the script and
    /// the consumer's position in the selected workflow
    fn resolve_refs(&self, rs: &RunState, consumer: &str, refs: &[StepRef]) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for reference in refs {
            match reference {
                StepRef::Name(name) => {
                    let instances = self.script.instances_of(name);
                    if instances.is_empty() {
                        return Err(Error::unknown_target(format!("output_from({})", name)));
                    }
                    for step in instances {
                        ids.push(step.display_name());
                    }
                }
                StepRef::Relative(offset) => {
                    let position = rs.workflow_positions.get(consumer).ok_or_else(|| {
                        Error::validation(consumer, "relative step reference outside a workflow")
                    })?;
                    let index = *position as i64 + *offset as i64;
                    if index < 0 || index as usize >= rs.workflow_steps.len() {
                        return Err(Error::validation(
                            consumer,
                            format!("relative step reference {} out of range", offset),
                        ));
                    }
                    ids.push(rs.workflow_steps[index as usize].clone());
                }
            }
        }
        Ok(ids)
    }

    /// Concrete input targets contributed by each source term
    fn assemble_terms(&self, rs: &RunState, node: &Node, env: &Env) -> Result<Vec<TermInputs>> {
        let own_name = node.step.display_name();
        let mut terms = Vec::with_capacity(node.step.input.terms.len());
        for term in &node.step.input.terms {
            match term {
                SourceTerm::Paths { paths, alias } => {
                    let mut entries = Vec::new();
                    for template in paths {
                        let path = expand_text(template, env, self.evaluator.as_ref())?;
                        let source = alias.clone().unwrap_or_else(|| own_name.clone());
                        entries.push(TargetEntry::with_source(Target::file(path), source));
                    }
                    terms.push(TermInputs {
                        entries,
                        group_by: None,
                    });
                }
                SourceTerm::Glob {
                    glob: pattern,
                    alias,
                    ..
                } => {
                    let expanded = expand_text(pattern, env, self.evaluator.as_ref())?;
                    let walker = glob::glob(&expanded)
                        .map_err(|e| Error::validation(own_name.clone(), e.to_string()))?;
                    let mut paths: Vec<PathBuf> = walker.filter_map(|entry| entry.ok()).collect();
                    paths.sort();
                    let entries = paths
                        .into_iter()
                        .map(|p| {
                            let source = alias.clone().unwrap_or_else(|| own_name.clone());
                            TargetEntry::with_source(Target::file(p), source)
                        })
                        .collect();
                    terms.push(TermInputs {
                        entries,
                        group_by: None,
                    });
                }
                SourceTerm::OutputFrom {
                    output_from,
                    group_by,
                    label,
                    alias,
                } => {
                    let mut entries = Vec::new();
                    for pid in self.resolve_refs(rs, &node.id, output_from)? {
                        let base = rs
                            .dag
                            .node(&pid)
                            .map(|n| n.step.name.clone())
                            .unwrap_or_else(|| pid.clone());
                        let groups = rs.outputs.get(&pid).ok_or_else(|| {
                            Error::validation(
                                node.id.clone(),
                                format!("outputs of '{}' are not available", pid),
                            )
                        })?;
                        collect_outputs(groups, label.as_deref(), alias.as_deref(), &base, &mut entries);
                    }
                    terms.push(TermInputs {
                        entries,
                        group_by: group_by.clone(),
                    });
                }
                SourceTerm::NamedOutput {
                    named_output,
                    group_by,
                    alias,
                } => {
                    let step = self.script.step_with_label(named_output).ok_or_else(|| {
                        Error::unknown_target(Target::named_output(named_output.clone()))
                    })?;
                    let pid = step.display_name();
                    let groups = rs.outputs.get(&pid).ok_or_else(|| {
                        Error::validation(
                            node.id.clone(),
                            format!("outputs of '{}' are not available", pid),
                        )
                    })?;
                    let mut entries = Vec::new();
                    collect_outputs(
                        groups,
                        Some(named_output.as_str()),
                        alias.as_deref().or(Some(named_output.as_str())),
                        &pid,
                        &mut entries,
                    );
                    terms.push(TermInputs {
                        entries,
                        group_by: group_by.clone(),
                    });
                }
            }
        }
        Ok(terms)
    }

    /// Expand, consult signatures, dispatch
    async fn start_node(
        &self,
        rs: &mut RunState,
        store: &Arc<SignatureStore>,
        pool: &WorkerPool,
        id: &str,
    ) -> Result<()> {
        let node = rs
            .dag
            .node(id)
            .cloned()
            .ok_or_else(|| Error::validation(id, "node vanished before start"))?;
        let env = self.node_env(rs, &node);
        let terms = self.assemble_terms(rs, &node, &env)?;
        let groups = expand_step(&node.step, terms, &env, self.evaluator.as_ref())?;

        if groups.is_empty() {
            // legal noop: grouping over an empty input list
            rs.outputs.insert(id.to_string(), Vec::new());
            rs.dag.set_state(id, NodeState::Succeeded).map_err(Error::from)?;
            return Ok(());
        }

        let atext = action_text(&node.step);
        let mut runs = Vec::with_capacity(groups.len());
        for group in groups {
            let declared = self.declare_outputs(rs, &node, &env, &group.bound, &group.inputs)?;
            let input_ids: Vec<String> = group
                .inputs
                .iter()
                .map(|e| e.target.to_string())
                .collect();
            let key = substep_key(&node.id, group.index, &input_ids, &group.bound, &atext);
            if !rs.submitted_keys.insert(key.clone()) {
                return Err(Error::validation(
                    node.id.clone(),
                    format!("substep key for index {} already scheduled", group.index),
                ));
            }
            runs.push(GroupRun {
                key,
                inputs: group.inputs,
                bound: group.bound,
                declared,
                outputs: Vec::new(),
                env_delta: Env::new(),
                state: GroupState::Waiting,
                diagnostic: None,
            });
        }

        for (index, run) in runs.iter_mut().enumerate() {
            match self.config.sig_mode {
                SigMode::Build => {
                    self.construct_signature(store, &node, index, run, &atext).await?;
                }
                mode => match store.lookup(&run.key).await {
                    Lookup::Hit(paths) => {
                        debug!(node = %node.id, index, "Signature hit, skipping substep");
                        run.outputs = match_outputs(&run.declared, paths.into_iter().map(Target::file));
                        run.state = GroupState::SkippedHit;
                    }
                    Lookup::Miss if mode == SigMode::Assert => {
                        return Err(Error::validation(
                            node.id.clone(),
                            format!("no valid signature for substep {}", index),
                        ));
                    }
                    Lookup::Miss => {}
                },
            }
        }

        rs.runs.insert(
            id.to_string(),
            NodeRun {
                sequential: !node.step.input.concurrent,
                env,
                groups: runs,
            },
        );
        rs.dag.set_state(id, NodeState::Running).map_err(Error::from)?;
        self.dispatch_waiting(rs, pool, id).await?;
        self.settle_if_done(rs, store, id).await?;
        Ok(())
    }

    /// Evaluate the output directive for one group and register the declared
    /// paths for duplicate detection
    fn declare_outputs(
        &self,
        rs: &mut RunState,
        node: &Node,
        env: &Env,
        bound: &Env,
        inputs: &[TargetEntry],
    ) -> Result<Vec<OutputEntry>> {
        let mut scoped = env.clone();
        for (name, value) in bound {
            scoped.insert(name.clone(), value.clone());
        }
        scoped.insert(
            "_input".to_string(),
            Value::Array(
                inputs
                    .iter()
                    .map(|e| Value::String(e.target.to_string()))
                    .collect(),
            ),
        );

        let mut declared = Vec::new();
        for spec in &node.step.output.entries {
            let path = expand_text(&spec.path, &scoped, self.evaluator.as_ref())?;
            declared.push(OutputEntry {
                target: Target::file(path),
                label: spec.label.clone(),
            });
        }
        // an auxiliary rule with no output directive produces exactly the
        // target it was instantiated for
        if declared.is_empty() {
            if let Some(target_name) = &node.aux_target {
                declared.push(OutputEntry {
                    target: Target::file(target_name),
                    label: None,
                });
            }
        }

        let index = bound
            .get("_index")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        for entry in &declared {
            let Some(path) = entry.target.path() else { continue };
            let claim = (node.id.clone(), index);
            if let Some(previous) = rs.declared_paths.get(path) {
                // the same substep may declare one file several times
                if *previous != claim {
                    return Err(Error::DuplicateOutput {
                        output: path.display().to_string(),
                        step: node.id.clone(),
                    });
                }
            } else {
                rs.declared_paths.insert(path.to_path_buf(), claim);
            }
        }
        Ok(declared)
    }

    /// `build` mode: record a signature from existing outputs without running
    async fn construct_signature(
        &self,
        store: &Arc<SignatureStore>,
        node: &Node,
        index: usize,
        run: &mut GroupRun,
        atext: &str,
    ) -> Result<()> {
        for entry in &run.declared {
            if entry.target.resolution() == Resolution::Missing {
                run.state = GroupState::Failed;
                run.diagnostic = Some(format!(
                    "cannot construct signature: {} does not exist",
                    entry.target
                ));
                return Ok(());
            }
        }
        if let Some(record) =
            self.make_record(&node.id, index, &run.key, &run.inputs, &run.declared, atext)
        {
            store.record(record).await?;
        }
        run.outputs = run.declared.clone();
        run.state = GroupState::SkippedHit;
        Ok(())
    }

    async fn dispatch_waiting(&self, rs: &mut RunState, pool: &WorkerPool, id: &str) -> Result<()> {
        if rs.failing {
            return Ok(());
        }
        let node = rs
            .dag
            .node(id)
            .cloned()
            .ok_or_else(|| Error::validation(id, "node vanished before dispatch"))?;
        let mut tasks = Vec::new();
        if let Some(run) = rs.runs.get_mut(id) {
            let sequential = run.sequential;
            let in_flight = run
                .groups
                .iter()
                .any(|g| g.state == GroupState::Dispatched);
            let env = run.env.clone();
            for (index, group) in run.groups.iter_mut().enumerate() {
                if group.state != GroupState::Waiting {
                    continue;
                }
                if sequential && (in_flight || !tasks.is_empty()) {
                    break;
                }
                group.state = GroupState::Dispatched;
                tasks.push(build_task(&node, &env, group, index));
            }
        }
        for task in tasks {
            pool.submit(task).await?;
            rs.running += 1;
        }
        Ok(())
    }

    async fn handle_result(
        &self,
        rs: &mut RunState,
        store: &Arc<SignatureStore>,
        pool: &WorkerPool,
        result: SubstepResult,
        log: &mut RunLog,
    ) -> Result<()> {
        rs.running = rs.running.saturating_sub(1);
        let node_id = result.node_id.clone();
        let Some(node) = rs.dag.node(&node_id).cloned() else {
            return Ok(());
        };
        let atext = action_text(&node.step);
        let mut new_failure = false;
        let mut completed: Option<(String, Vec<TargetEntry>, Vec<OutputEntry>)> = None;
        let mut new_placeholders = Vec::new();

        {
            let Some(run) = rs.runs.get_mut(&node_id) else {
                return Ok(());
            };
            let Some(group) = run.groups.get_mut(result.index) else {
                return Ok(());
            };
            match result.status {
                SubstepStatus::Completed {
                    outputs,
                    env_delta,
                    placeholders,
                } => {
                    group.outputs = match_outputs(&group.declared, outputs.into_iter());
                    group.env_delta = env_delta;
                    group.state = GroupState::Succeeded;
                    new_placeholders = placeholders;
                    completed = Some((
                        group.key.clone(),
                        group.inputs.clone(),
                        group.outputs.clone(),
                    ));
                }
                SubstepStatus::Stopped => {
                    group.state = GroupState::Stopped;
                }
                SubstepStatus::Failed { diagnostic } => {
                    warn!(node = %node_id, index = result.index, diagnostic = %diagnostic, "Substep failed");
                    group.state = GroupState::Failed;
                    group.diagnostic = Some(diagnostic);
                    // remove whatever the failed substep left behind
                    for entry in &group.declared {
                        if let Some(path) = entry.target.path() {
                            let _ = std::fs::remove_file(path);
                        }
                    }
                    new_failure = true;
                }
                SubstepStatus::Cancelled => {
                    group.state = GroupState::Cancelled;
                }
            }
        }

        rs.placeholders.extend(new_placeholders);
        if let Some((key, inputs, outputs)) = completed {
            if !self.config.dry_run && self.config.sig_mode != SigMode::Ignore {
                if let Some(record) =
                    self.make_record(&node_id, result.index, &key, &inputs, &outputs, &atext)
                {
                    store.record(record).await?;
                }
            }
        }
        if new_failure {
            log.line(&format!("substep failed: {} [{}]", node_id, result.index));
            rs.failing = true;
            pool.cancel();
        }
        self.dispatch_waiting(rs, pool, &node_id).await?;
        self.settle_if_done(rs, store, &node_id).await?;
        Ok(())
    }

    /// When every group of a node has settled, fold the node's result back
    /// into the DAG and the shared environment
    async fn settle_if_done(
        &self,
        rs: &mut RunState,
        store: &Arc<SignatureStore>,
        id: &str,
    ) -> Result<()> {
        let failing = rs.failing;
        let Some(run) = rs.runs.get_mut(id) else {
            return Ok(());
        };
        let all_settled = run.groups.iter().all(|g| {
            !matches!(g.state, GroupState::Dispatched)
                && (g.state != GroupState::Waiting || failing)
        });
        if !all_settled {
            return Ok(());
        }
        for group in run.groups.iter_mut() {
            if group.state == GroupState::Waiting {
                group.state = GroupState::Cancelled;
            }
        }

        let node = rs
            .dag
            .node(id)
            .cloned()
            .ok_or_else(|| Error::validation(id, "node vanished before settling"))?;
        let Some(run) = rs.runs.get(id) else {
            return Ok(());
        };
        let any_failed = run.groups.iter().any(|g| g.state == GroupState::Failed);
        let any_cancelled = run.groups.iter().any(|g| g.state == GroupState::Cancelled);

        if !any_failed && any_cancelled {
            // starved by a failure elsewhere; never completed, never failed
            rs.dag.set_state(id, NodeState::Skipped).map_err(Error::from)?;
            return Ok(());
        }
        if any_failed {
            // report the batch together, clean up poisoned outputs
            let mut stale_targets = Vec::new();
            let mut failures = Vec::new();
            for (index, group) in run.groups.iter().enumerate() {
                if group.state == GroupState::Failed {
                    failures.push(FailureInfo {
                        step: id.to_string(),
                        index,
                        diagnostic: group
                            .diagnostic
                            .clone()
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    });
                    for entry in &group.declared {
                        stale_targets.push(entry.target.clone());
                    }
                }
            }
            // a failed auxiliary rule must not leave any of its instance's
            // outputs behind
            if node.step.is_auxiliary() {
                for group in &run.groups {
                    for entry in &group.declared {
                        if let Some(path) = entry.target.path() {
                            let _ = std::fs::remove_file(path);
                        }
                        stale_targets.push(entry.target.clone());
                    }
                }
            }
            rs.failures.extend(failures);
            store.invalidate(&stale_targets).await?;
            rs.dag.set_state(id, NodeState::Failed).map_err(Error::from)?;
            rs.dag.skip_dependents(id);
            rs.failing = true;
            return Ok(());
        }

        let mut outputs = Vec::with_capacity(run.groups.len());
        for group in &run.groups {
            outputs.push(GroupOutputs {
                entries: if group.state == GroupState::Stopped {
                    Vec::new()
                } else {
                    group.outputs.clone()
                },
                stopped: group.state == GroupState::Stopped,
            });
        }
        let mut shared_updates = Vec::new();
        for name in &node.step.shared {
            // in index order: the last group that bound the name wins
            let mut value = None;
            for group in &run.groups {
                if let Some(v) = group.env_delta.get(name) {
                    value = Some(v.clone());
                }
            }
            if let Some(v) = value {
                shared_updates.push((name.clone(), v));
            }
        }
        let all_hits = run.groups.iter().all(|g| g.state == GroupState::SkippedHit);

        rs.outputs.insert(id.to_string(), outputs);
        for (name, value) in shared_updates {
            rs.shared_env.insert(name, value);
        }
        rs.dag
            .set_state(
                id,
                if all_hits {
                    NodeState::Skipped
                } else {
                    NodeState::Succeeded
                },
            )
            .map_err(Error::from)?;
        debug!(node = %id, all_hits, "Node settled");
        Ok(())
    }

    fn make_record(
        &self,
        node_id: &str,
        index: usize,
        key: &str,
        inputs: &[TargetEntry],
        outputs: &[OutputEntry],
        atext: &str,
    ) -> Option<SignatureRecord> {
        let mut recorded_inputs = Vec::new();
        for entry in inputs {
            let Some(path) = entry.target.path() else { continue };
            match entry.target.digest(self.config.max_digest_size) {
                Ok(digest) => recorded_inputs.push(RecordedFile {
                    path: path.to_path_buf(),
                    digest,
                }),
                Err(e) => {
                    warn!(input = %entry.target, error = %e, "Skipping signature record");
                    return None;
                }
            }
        }
        let mut recorded_outputs = Vec::new();
        for entry in outputs {
            let Some(path) = entry.target.path() else { continue };
            match entry.target.digest(self.config.max_digest_size) {
                Ok(digest) => recorded_outputs.push(RecordedFile {
                    path: path.to_path_buf(),
                    digest,
                }),
                Err(e) => {
                    warn!(output = %entry.target, error = %e, "Skipping signature record");
                    return None;
                }
            }
        }
        Some(SignatureRecord {
            key: key.to_string(),
            step: node_id.to_string(),
            index,
            inputs: recorded_inputs,
            outputs: recorded_outputs,
            action_digest: sl_sig::action_digest(atext),
            completed_at: Timestamp::now(),
        })
    }

    fn build_report(
        &self,
        rs: &RunState,
        run_id: RunId,
        workflow: &str,
        started: Timestamp,
    ) -> ExecutionReport {
        let mut steps = Vec::new();
        let mut unresolved = Vec::new();
        for id in rs.dag.node_ids() {
            let state = rs.dag.state(id).unwrap_or(NodeState::Pending);
            let (groups, skipped, failed) = rs
                .runs
                .get(id)
                .map(|r| {
                    (
                        r.groups.len(),
                        r.groups
                            .iter()
                            .filter(|g| g.state == GroupState::SkippedHit)
                            .count(),
                        r.groups
                            .iter()
                            .filter(|g| g.state == GroupState::Failed)
                            .count(),
                    )
                })
                .unwrap_or((0, 0, 0));
            steps.push(StepSummary {
                node: id.clone(),
                state,
                groups,
                skipped,
                failed,
            });
            // a node that never started was starved by an upstream failure
            if state == NodeState::Skipped && !rs.runs.contains_key(id) && rs.failing {
                let name = rs
                    .dag
                    .node(id)
                    .and_then(|n| n.aux_target.clone())
                    .unwrap_or_else(|| id.clone());
                unresolved.push(name);
            }
        }
        let status = if rs.failing || rs.dag.has_failed() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        ExecutionReport {
            run_id,
            workflow: workflow.to_string(),
            status,
            steps,
            failures: rs.failures.clone(),
            unresolved,
            started_at: started,
            finished_at: Timestamp::now(),
            elapsed_ms: started.elapsed_ms(),
        }
    }
}

/// The normalized action text a step's substep keys are derived from
fn action_text(step: &Step) -> String {
    step.actions
        .iter()
        .map(|a| match &a.kind {
            ActionKind::Shell { script } => script.as_str(),
            ActionKind::Eval { code } => code.as_str(),
            ActionKind::StopIf { cond } => cond.as_str(),
            ActionKind::ZapInputs {} => "zap_inputs",
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pair produced targets with the labels their declarations carried
fn match_outputs(
    declared: &[OutputEntry],
    produced: impl Iterator<Item = Target>,
) -> Vec<OutputEntry> {
    produced
        .map(|target| {
            let label = declared
                .iter()
                .find(|d| d.target == target)
                .and_then(|d| d.label.clone());
            OutputEntry { target, label }
        })
        .collect()
}

fn collect_outputs(
    groups: &[GroupOutputs],
    label: Option<&str>,
    alias: Option<&str>,
    producer: &str,
    entries: &mut Vec<TargetEntry>,
) {
    for group in groups {
        if group.stopped {
            continue;
        }
        for entry in &group.entries {
            if let Some(want) = label {
                if entry.label.as_deref() != Some(want) {
                    continue;
                }
            }
            let source = alias
                .map(str::to_string)
                .or_else(|| entry.label.clone())
                .unwrap_or_else(|| producer.to_string());
            entries.push(TargetEntry::with_source(entry.target.clone(), source));
        }
    }
}

fn build_task(node: &Node, env: &Env, group: &GroupRun, index: usize) -> SubstepTask {
    let mut task_env = env.clone();
    for (name, value) in &group.bound {
        task_env.insert(name.clone(), value.clone());
    }
    task_env.insert(
        "_input".to_string(),
        Value::Array(
            group
                .inputs
                .iter()
                .map(|e| Value::String(e.target.to_string()))
                .collect(),
        ),
    );
    task_env.insert(
        "_source".to_string(),
        Value::Array(
            group
                .inputs
                .iter()
                .map(|e| Value::String(e.source.clone().unwrap_or_default()))
                .collect(),
        ),
    );
    task_env.insert(
        "_output".to_string(),
        Value::Array(
            group
                .declared
                .iter()
                .map(|e| Value::String(e.target.to_string()))
                .collect(),
        ),
    );
    SubstepTask {
        node_id: node.id.clone(),
        step: node.step.display_name(),
        index,
        key: group.key.clone(),
        inputs: group.inputs.clone(),
        declared_outputs: group.declared.iter().map(|e| e.target.clone()).collect(),
        dynamic_output: node.step.output.dynamic.clone(),
        actions: node.step.actions.clone(),
        env: task_env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sl_workflow::Action;

    #[test]
    fn test_action_text_covers_every_kind() {
        let mut step = Step::new("s");
        step.actions = vec![
            Action::shell("cp {_input} {_output}"),
            Action::stop_if("len(_input) == 0"),
            Action {
                kind: ActionKind::ZapInputs {},
                allow_error: false,
            },
        ];
        let text = action_text(&step);
        assert!(text.contains("cp {_input} {_output}"));
        assert!(text.contains("len(_input) == 0"));
        assert!(text.contains("zap_inputs"));
    }

    #[test]
    fn test_match_outputs_carries_labels() {
        let declared = vec![
            OutputEntry {
                target: Target::file("a.txt"),
                label: Some("aa".to_string()),
            },
            OutputEntry {
                target: Target::file("b.txt"),
                label: None,
            },
        ];
        let produced = vec![
            Target::file("a.txt"),
            Target::file("b.txt"),
            Target::file("extra.txt"),
        ];
        let matched = match_outputs(&declared, produced.into_iter());
        assert_eq!(matched[0].label.as_deref(), Some("aa"));
        assert_eq!(matched[1].label, None);
        // dynamic extras carry no label
        assert_eq!(matched[2].label, None);
    }

    #[test]
    fn test_collect_outputs_source_precedence() {
        let groups = vec![GroupOutputs {
            entries: vec![
                OutputEntry {
                    target: Target::file("a.txt"),
                    label: Some("aa".to_string()),
                },
                OutputEntry {
                    target: Target::file("p.txt"),
                    label: None,
                },
            ],
            stopped: false,
        }];

        // alias wins over label and producer
        let mut entries = Vec::new();
        collect_outputs(&groups, None, Some("K"), "A", &mut entries);
        assert_eq!(entries[0].source.as_deref(), Some("K"));
        assert_eq!(entries[1].source.as_deref(), Some("K"));

        // without an alias, labelled entries surface their label
        let mut entries = Vec::new();
        collect_outputs(&groups, None, None, "A", &mut entries);
        assert_eq!(entries[0].source.as_deref(), Some("aa"));
        assert_eq!(entries[1].source.as_deref(), Some("A"));

        // label slicing keeps only matching entries
        let mut entries = Vec::new();
        collect_outputs(&groups, Some("aa"), None, "A", &mut entries);
        assert_eq!(entries.len(), 1);

        // stopped groups contribute nothing
        let stopped = vec![GroupOutputs {
            entries: vec![OutputEntry {
                target: Target::file("s.txt"),
                label: None,
            }],
            stopped: true,
        }];
        let mut entries = Vec::new();
        collect_outputs(&stopped, None, None, "A", &mut entries);
        assert!(entries.is_empty());
    }
}
