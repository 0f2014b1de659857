//! Single-step execution.
//!
//! A step resolves its target chain (routing included), applies pacing,
//! runs through the reliability pipeline or one of the composite modes
//! (iteration, sub-workflow), and reduces the outcome to a result plus
//! criticality-aware error handling.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use weft_protocols::{
    Agent, AgentRegistry, ApprovalStore, EngineConfig, ErrorInfo, Notifier, StepResult, Usage,
    WorkflowError, WorkflowResult, WorkflowStatus,
};
use weft_reliability::{PipelineError, RateLimiter, ReliabilityPipeline, Throttle};

use crate::definition::{StepDef, WorkflowDefinition};
use crate::iteration::run_iteration;
use crate::orchestrator::Orchestrator;
use crate::state::WorkflowContext;

/// Shared collaborators threaded through every executing item.
#[derive(Clone)]
pub(crate) struct StepRuntime {
    pub workflow: String,
    pub registry: AgentRegistry,
    pub pipeline: ReliabilityPipeline,
    pub throttle: Arc<Throttle>,
    pub limiter: Arc<RateLimiter>,
    pub config: EngineConfig,
    pub approvals: Option<Arc<dyn ApprovalStore>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

/// A completed step, reduced for the orchestrator.
#[derive(Debug)]
pub(crate) struct StepExecution {
    pub result: StepResult,
    pub error: Option<ErrorInfo>,
    /// Whether the failure halts the workflow.
    pub halt: bool,
}

impl StepExecution {
    pub fn success(result: StepResult) -> Self {
        Self {
            result,
            error: None,
            halt: false,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self::success(StepResult::skipped(reason))
    }
}

/// Raw outcome of a step body before criticality is applied.
pub(crate) enum BodyOutcome {
    Success(StepResult),
    /// Partial failure that records an error but never halts, regardless
    /// of criticality (continue-on-error iteration, partial sub-workflow).
    Degraded(StepResult, ErrorInfo),
    /// Whole-step failure, subject to on-error recovery, default values
    /// and the critical flag.
    Failed(StepResult, ErrorInfo),
}

pub(crate) async fn execute_step(
    rt: &StepRuntime,
    def: &StepDef,
    ctx: &WorkflowContext,
) -> Result<StepExecution, WorkflowError> {
    if let Some(condition) = &def.options.condition {
        if let Some(reason) = condition.skip_reason(ctx) {
            debug!("Skipping step '{}': {}", def.name, reason);
            return Ok(StepExecution::skipped(reason));
        }
    }

    if let Some(throttle) = &def.options.throttle {
        rt.throttle.throttle(&throttle.key, throttle.min_interval).await;
    }
    if let Some(limit) = &def.options.rate_limit {
        rt.limiter.acquire(&limit.key, limit.calls, limit.per).await;
    }

    info!("Executing step '{}'", def.name);
    let body = step_body(rt, def, ctx);
    let outcome = match def.options.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, body).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                let info = ErrorInfo::new(
                    "timeout",
                    format!("step '{}' timed out after {:?}", def.name, timeout),
                );
                BodyOutcome::Failed(
                    StepResult::failure(info.class.clone(), info.message.clone()),
                    info,
                )
            }
        },
        None => body.await?,
    };

    Ok(match outcome {
        BodyOutcome::Success(result) => StepExecution::success(result),
        BodyOutcome::Degraded(result, info) => {
            warn!("Step '{}' completed with errors: {}", def.name, info.message);
            StepExecution {
                result,
                error: Some(info),
                halt: false,
            }
        }
        BodyOutcome::Failed(result, info) => resolve_failure(def, result, info, ctx),
    })
}

async fn step_body(
    rt: &StepRuntime,
    def: &StepDef,
    ctx: &WorkflowContext,
) -> Result<BodyOutcome, WorkflowError> {
    if let Some(sub) = &def.options.sub_workflow {
        return run_sub_workflow(rt, def, sub, ctx).await;
    }

    let targets = resolve_targets(rt, def, ctx)?;
    if let Some(iteration) = &def.options.iteration {
        return Ok(run_iteration(rt, def, iteration, &targets, ctx).await);
    }

    let input = ctx.step_input();
    match rt
        .pipeline
        .execute(
            &def.name,
            &targets,
            &input,
            &def.options.retry,
            def.options.total_timeout,
        )
        .await
    {
        Ok((output, attempts)) => {
            debug!(
                "Step '{}' succeeded after {} attempt(s)",
                def.name,
                attempts.len()
            );
            Ok(BodyOutcome::Success(StepResult::Value {
                content: output.content,
                success: true,
                usage: output.usage,
            }))
        }
        Err(PipelineError::TotalTimeout { timeout, .. }) => {
            Err(WorkflowError::TotalTimeout(timeout))
        }
        Err(err) => {
            let info = err.error_info();
            Ok(BodyOutcome::Failed(
                StepResult::failure(info.class.clone(), info.message.clone()),
                info,
            ))
        }
    }
}

/// Resolve the ordered target chain: the routed or declared primary,
/// followed by the configured fallbacks.
pub(crate) fn resolve_targets(
    rt: &StepRuntime,
    def: &StepDef,
    ctx: &WorkflowContext,
) -> Result<Vec<Arc<dyn Agent>>, WorkflowError> {
    let primary = match &def.options.router {
        Some(router) => {
            let value = (router.selector)(ctx);
            let target = router
                .routes
                .get(&value)
                .or(router.default.as_ref())
                .ok_or_else(|| WorkflowError::NoRouteMatched {
                    step: def.name.clone(),
                    value: value.clone(),
                })?;
            debug!("Routed step '{}' to '{}' on '{}'", def.name, target, value);
            target.clone()
        }
        None => def.target.clone(),
    };

    std::iter::once(&primary)
        .chain(def.options.fallback_targets.iter())
        .map(|id| {
            rt.registry
                .get(id)
                .ok_or_else(|| WorkflowError::UnknownAgent(id.clone()))
        })
        .collect()
}

/// Apply on-error recovery, default values and the critical flag.
fn resolve_failure(
    def: &StepDef,
    result: StepResult,
    info: ErrorInfo,
    ctx: &WorkflowContext,
) -> StepExecution {
    if let Some(handler) = &def.options.on_error {
        if let Some(recovery) = handler(&info, ctx) {
            info!("Step '{}' recovered by its error handler", def.name);
            return StepExecution::success(StepResult::Value {
                content: recovery,
                success: true,
                usage: Usage::default(),
            });
        }
    }

    if def.options.critical {
        error!("Critical step '{}' failed: {}", def.name, info.message);
        StepExecution {
            result,
            error: Some(info),
            halt: true,
        }
    } else {
        warn!("Optional step '{}' failed: {}", def.name, info.message);
        let result = match &def.options.default_value {
            Some(value) => StepResult::Value {
                content: value.clone(),
                success: false,
                usage: Usage::default(),
            },
            None => result,
        };
        StepExecution {
            result,
            error: Some(info),
            halt: false,
        }
    }
}

/// Boxed for async recursion: the nested run re-enters `execute_step`.
fn run_sub_workflow<'a>(
    rt: &'a StepRuntime,
    def: &'a StepDef,
    sub: &'a Arc<WorkflowDefinition>,
    ctx: &'a WorkflowContext,
) -> BoxFuture<'a, Result<BodyOutcome, WorkflowError>> {
    Box::pin(async move {
        debug!(
            "Entering sub-workflow '{}' for step '{}'",
            sub.name, def.name
        );
        let child = Orchestrator::from_runtime(Arc::clone(sub), rt.clone());
        let inner: WorkflowResult = child.run(ctx.step_input()).await?;

        let status = inner.status;
        let summary = inner.errors.values().next().cloned();
        let result = StepResult::SubWorkflow {
            result: Box::new(inner),
        };
        Ok(match status {
            WorkflowStatus::Success => BodyOutcome::Success(result),
            WorkflowStatus::Partial => BodyOutcome::Degraded(
                result,
                summary.unwrap_or_else(|| {
                    ErrorInfo::new(
                        "sub_workflow",
                        format!("sub-workflow '{}' completed partially", sub.name),
                    )
                }),
            ),
            WorkflowStatus::Error => BodyOutcome::Failed(
                result,
                summary.unwrap_or_else(|| {
                    ErrorInfo::new(
                        "sub_workflow",
                        format!("sub-workflow '{}' failed", sub.name),
                    )
                }),
            ),
        })
    })
}
