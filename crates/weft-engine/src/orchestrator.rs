//! Sequential workflow orchestration.
//!
//! Items run in definition order. Critical failures halt the run, optional
//! ones degrade it to partial; both are captured on the aggregate result
//! rather than surfaced as errors. `run` itself only fails on
//! configuration problems and the wall-clock total timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use weft_pool::build_pool;
use weft_protocols::{
    AgentRegistry, ApprovalStore, EngineConfig, ErrorInfo, Notifier, StepResult, Usage,
    WorkflowError, WorkflowResult, WorkflowStatus,
};
use weft_reliability::{BreakerConfig, BreakerRegistry, RateLimiter, ReliabilityPipeline, Throttle};

use crate::definition::{ParallelGroupDef, WorkflowDefinition, WorkflowItem};
use crate::state::{Control, RunState, WorkflowContext};
use crate::step::{execute_step, StepExecution, StepRuntime};
use crate::wait::execute_wait;

const GROUP_ABORT_REASON: &str = "aborted by fail-fast group";

/// Drives one workflow definition.
pub struct Orchestrator {
    definition: Arc<WorkflowDefinition>,
    runtime: StepRuntime,
}

impl Orchestrator {
    pub fn new(definition: WorkflowDefinition, registry: AgentRegistry) -> Self {
        let config = EngineConfig::default();
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::default()));
        let runtime = StepRuntime {
            workflow: definition.name.clone(),
            registry,
            pipeline: ReliabilityPipeline::new(breakers, config.clone()),
            throttle: Arc::new(Throttle::new()),
            limiter: Arc::new(RateLimiter::new()),
            config,
            approvals: None,
            notifier: None,
        };
        Self {
            definition: Arc::new(definition),
            runtime,
        }
    }

    /// Child orchestrator sharing the parent's collaborators.
    pub(crate) fn from_runtime(definition: Arc<WorkflowDefinition>, mut runtime: StepRuntime) -> Self {
        runtime.workflow = definition.name.clone();
        Self {
            definition,
            runtime,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.runtime.pipeline =
            ReliabilityPipeline::new(Arc::clone(self.runtime.pipeline.breakers()), config.clone());
        self.runtime.config = config;
        self
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config));
        self.runtime.pipeline = ReliabilityPipeline::new(breakers, self.runtime.config.clone());
        self
    }

    pub fn with_approval_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.runtime.approvals = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.runtime.notifier = Some(notifier);
        self
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.runtime.registry
    }

    /// Circuit breaker registry, exposed for inspection and resets.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.runtime.pipeline.breakers()
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.runtime.throttle
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.runtime.limiter
    }

    /// Run the workflow to completion.
    ///
    /// Step failures are folded into the aggregate result; only
    /// configuration errors and the total timeout escape as `Err`.
    pub async fn run(&self, input: Value) -> Result<WorkflowResult, WorkflowError> {
        self.definition.validate()?;

        let started_at = Utc::now();
        let t0 = Instant::now();
        info!(
            "Starting workflow '{}' with {} item(s)",
            self.definition.name,
            self.definition.items.len()
        );

        let mut ctx = WorkflowContext::new(input);
        let mut state = RunState::new();
        let mut skip_reason: Option<String> = None;

        for item in &self.definition.items {
            if state.halted {
                break;
            }
            if let Some(reason) = skip_reason.take() {
                debug!("Skipping '{}': {}", item.name(), reason);
                ctx.results
                    .insert(item.name().to_string(), StepResult::skipped(reason));
                continue;
            }

            match item {
                WorkflowItem::Step(def) => {
                    let exec = execute_step(&self.runtime, def, &ctx).await?;
                    apply_execution(&mut ctx, &mut state, &def.name, exec);
                }
                WorkflowItem::Parallel(group) => {
                    self.run_group(group, &mut ctx, &mut state).await?;
                }
                WorkflowItem::Wait(def) => {
                    let outcome = execute_wait(&self.runtime, def, &ctx).await;
                    match outcome.control {
                        Control::Continue => {
                            ctx.results.insert(def.name.clone(), outcome.result);
                        }
                        Control::SkipNext(reason) => {
                            ctx.results.insert(def.name.clone(), outcome.result);
                            skip_reason = Some(reason);
                        }
                        Control::Halt => {
                            let info = outcome
                                .result
                                .error()
                                .unwrap_or_else(|| ErrorInfo::new("wait", "wait halted"));
                            ctx.results.insert(def.name.clone(), outcome.result);
                            state.record_error(&def.name, info, true);
                        }
                    }
                }
            }
        }

        let final_output = final_output(&self.definition, &ctx.results);
        let completed_at = Utc::now();
        let result = WorkflowResult {
            workflow: self.definition.name.clone(),
            status: state.status,
            results: ctx.results,
            errors: state.errors,
            usage: state.usage,
            final_output,
            duration_ms: t0.elapsed().as_millis() as u64,
            started_at,
            completed_at,
        };
        info!(
            "Workflow '{}' finished with status '{}' in {}ms",
            result.workflow, result.status, result.duration_ms
        );
        Ok(result)
    }

    async fn run_group(
        &self,
        group: &ParallelGroupDef,
        ctx: &mut WorkflowContext,
        state: &mut RunState,
    ) -> Result<(), WorkflowError> {
        let size = group
            .concurrency
            .unwrap_or(self.runtime.config.default_pool_size)
            .clamp(1, group.members.len().max(1));
        info!(
            "Running parallel group '{}': {} member(s), pool size {}",
            group.name,
            group.members.len(),
            size
        );

        let pool = build_pool(self.runtime.config.pool_backend, size);
        let snapshot = Arc::new(ctx.clone());
        let outcomes: Arc<Mutex<HashMap<String, Result<StepExecution, WorkflowError>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        for member in &group.members {
            let member = member.clone();
            let rt = self.runtime.clone();
            let snapshot = Arc::clone(&snapshot);
            let outcomes = Arc::clone(&outcomes);
            let pool_handle = Arc::clone(&pool);
            let fail_fast = group.fail_fast;

            pool.post(Box::pin(async move {
                if pool_handle.is_aborted() {
                    return;
                }
                let outcome = execute_step(&rt, &member, &snapshot).await;
                let fatal = match &outcome {
                    Ok(exec) => exec.halt,
                    Err(_) => true,
                };
                outcomes.lock().insert(member.name.clone(), outcome);
                if fail_fast && fatal {
                    debug!("Aborting group: member '{}' failed", member.name);
                    pool_handle.abort();
                }
            }));
        }

        pool.wait_for_completion(None).await;
        pool.shutdown().await;

        let mut taken = outcomes.lock();
        let mut contents = serde_json::Map::new();
        let mut usage = Usage::default();
        let mut success = true;
        let mut halt = false;

        for member in &group.members {
            match taken.remove(&member.name) {
                Some(Ok(exec)) => {
                    usage.add(&exec.result.usage());
                    contents.insert(member.name.clone(), exec.result.content());
                    if let Some(info) = exec.error {
                        success = false;
                        if exec.halt {
                            halt = true;
                        }
                        state.record_error(&member.name, info, false);
                    }
                    ctx.results.insert(member.name.clone(), exec.result);
                }
                Some(Err(err)) => return Err(err),
                None => {
                    // Never started: aborted while still queued.
                    contents.insert(member.name.clone(), Value::Null);
                    ctx.results.insert(
                        member.name.clone(),
                        StepResult::skipped(GROUP_ABORT_REASON),
                    );
                }
            }
        }

        // The bundle alone feeds the run total; member usage is already
        // summed into it.
        state.usage.add(&usage);
        ctx.results.insert(
            group.name.clone(),
            StepResult::Value {
                content: Value::Object(contents),
                success,
                usage,
            },
        );
        if halt {
            state.status.degrade_to(WorkflowStatus::Error);
            state.halted = true;
        }
        Ok(())
    }
}

fn apply_execution(
    ctx: &mut WorkflowContext,
    state: &mut RunState,
    name: &str,
    exec: StepExecution,
) {
    state.usage.add(&exec.result.usage());
    if let Some(info) = exec.error {
        state.record_error(name, info, exec.halt);
    }
    ctx.results.insert(name.to_string(), exec.result);
}

/// Content of the last non-skipped, non-error item in definition order.
fn final_output(
    definition: &WorkflowDefinition,
    results: &HashMap<String, StepResult>,
) -> Value {
    for item in definition.items.iter().rev() {
        if let Some(result) = results.get(item.name()) {
            if !result.is_skipped() && !result.is_error() {
                return result.content();
            }
        }
    }
    Value::Null
}
