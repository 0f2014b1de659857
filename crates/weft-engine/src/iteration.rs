//! Item-wise fan-out for a single step.
//!
//! Each item runs through the full reliability pipeline under the step's
//! breaker scope. Results stay order-stable by index whatever the
//! completion order; aborted slots are recorded as skipped.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use weft_pool::build_pool;
use weft_protocols::{Agent, ErrorInfo, StepResult};

use crate::definition::{IterationDef, StepDef};
use crate::state::WorkflowContext;
use crate::step::{BodyOutcome, StepRuntime};

const ABORTED_REASON: &str = "aborted by fail-fast iteration";

pub(crate) async fn run_iteration(
    rt: &StepRuntime,
    def: &StepDef,
    iteration: &IterationDef,
    targets: &[Arc<dyn Agent>],
    ctx: &WorkflowContext,
) -> BodyOutcome {
    let items = (iteration.source)(ctx);
    if items.is_empty() {
        debug!("Step '{}' has no items to iterate", def.name);
        return BodyOutcome::Success(StepResult::Iteration {
            items: Vec::new(),
            errors: BTreeMap::new(),
        });
    }

    let concurrency = iteration.concurrency.max(1).min(items.len());
    info!(
        "Iterating step '{}' over {} item(s) with concurrency {}",
        def.name,
        items.len(),
        concurrency
    );

    let total = items.len();
    let (results, errors) = if concurrency == 1 {
        run_sequential(rt, def, iteration, targets, ctx, items).await
    } else {
        run_concurrent(rt, def, iteration, targets, ctx, items, concurrency).await
    };

    let failed = errors.len();
    let result = StepResult::Iteration {
        items: results,
        errors: errors.clone(),
    };
    if errors.is_empty() {
        return BodyOutcome::Success(result);
    }

    let first = errors
        .values()
        .next()
        .map(|info| info.message.clone())
        .unwrap_or_default();
    let summary = ErrorInfo::new(
        "iteration_failed",
        format!("{}/{} item(s) failed; first: {}", failed, total, first),
    );
    if iteration.fail_fast {
        BodyOutcome::Failed(result, summary)
    } else {
        BodyOutcome::Degraded(result, summary)
    }
}

async fn run_sequential(
    rt: &StepRuntime,
    def: &StepDef,
    iteration: &IterationDef,
    targets: &[Arc<dyn Agent>],
    ctx: &WorkflowContext,
    items: Vec<Value>,
) -> (Vec<StepResult>, BTreeMap<usize, ErrorInfo>) {
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut errors = BTreeMap::new();

    for (index, item) in items.into_iter().enumerate() {
        let input = ctx.item_input(&item, index);
        match rt
            .pipeline
            .execute(
                &def.name,
                targets,
                &input,
                &def.options.retry,
                def.options.total_timeout,
            )
            .await
        {
            Ok((output, _)) => results.push(StepResult::Value {
                content: output.content,
                success: true,
                usage: output.usage,
            }),
            Err(err) => {
                let info = err.error_info();
                warn!(
                    "Item {} of step '{}' failed: {}",
                    index, def.name, info.message
                );
                results.push(StepResult::failure(info.class.clone(), info.message.clone()));
                errors.insert(index, info);
                if iteration.fail_fast {
                    for _ in index + 1..total {
                        results.push(StepResult::skipped(ABORTED_REASON));
                    }
                    break;
                }
            }
        }
    }
    (results, errors)
}

async fn run_concurrent(
    rt: &StepRuntime,
    def: &StepDef,
    iteration: &IterationDef,
    targets: &[Arc<dyn Agent>],
    ctx: &WorkflowContext,
    items: Vec<Value>,
    concurrency: usize,
) -> (Vec<StepResult>, BTreeMap<usize, ErrorInfo>) {
    let pool = build_pool(rt.config.pool_backend, concurrency);
    let slots: Arc<Mutex<Vec<Option<StepResult>>>> = Arc::new(Mutex::new(vec![None; items.len()]));
    let errors: Arc<Mutex<BTreeMap<usize, ErrorInfo>>> = Arc::new(Mutex::new(BTreeMap::new()));

    for (index, item) in items.into_iter().enumerate() {
        let pipeline = rt.pipeline.clone();
        let targets = targets.to_vec();
        let policy = def.options.retry.clone();
        let total_timeout = def.options.total_timeout;
        let scope = def.name.clone();
        let input = ctx.item_input(&item, index);
        let slots = Arc::clone(&slots);
        let errors = Arc::clone(&errors);
        let pool_handle = Arc::clone(&pool);
        let fail_fast = iteration.fail_fast;

        pool.post(Box::pin(async move {
            if pool_handle.is_aborted() {
                return;
            }
            match pipeline
                .execute(&scope, &targets, &input, &policy, total_timeout)
                .await
            {
                Ok((output, _)) => {
                    slots.lock()[index] = Some(StepResult::Value {
                        content: output.content,
                        success: true,
                        usage: output.usage,
                    });
                }
                Err(err) => {
                    let info = err.error_info();
                    warn!("Item {} of step '{}' failed: {}", index, scope, info.message);
                    slots.lock()[index] =
                        Some(StepResult::failure(info.class.clone(), info.message.clone()));
                    errors.lock().insert(index, info);
                    if fail_fast {
                        pool_handle.abort();
                    }
                }
            }
        }));
    }

    pool.wait_for_completion(None).await;
    pool.shutdown().await;

    let results = slots
        .lock()
        .drain(..)
        .map(|slot| slot.unwrap_or_else(|| StepResult::skipped(ABORTED_REASON)))
        .collect();
    let errors = std::mem::take(&mut *errors.lock());
    (results, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use weft_protocols::{
        AgentRegistry, EngineConfig, ExecutionError, StepOutput, Usage,
    };
    use weft_reliability::{
        BreakerConfig, BreakerRegistry, RateLimiter, ReliabilityPipeline, RetryPolicy, Throttle,
    };

    use crate::definition::ItemSource;

    /// Fails on items whose "n" field is in `fail_on`.
    struct ItemAgent {
        id: String,
        fail_on: Vec<i64>,
        running: AtomicU32,
        peak: AtomicU32,
    }

    impl ItemAgent {
        fn new(id: &str, fail_on: Vec<i64>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail_on,
                running: AtomicU32::new(0),
                peak: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Agent for ItemAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn invoke(&self, input: Value) -> Result<StepOutput, ExecutionError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let n = input["item"]["n"].as_i64().unwrap_or(-1);
            if self.fail_on.contains(&n) {
                Err(ExecutionError::Api {
                    status: 400,
                    message: format!("item {} rejected", n),
                })
            } else {
                Ok(StepOutput::new(json!({ "processed": n })).with_usage(Usage::new(1, 1)))
            }
        }
    }

    fn runtime() -> StepRuntime {
        let config = EngineConfig::default();
        StepRuntime {
            workflow: "wf".to_string(),
            registry: AgentRegistry::new(),
            pipeline: ReliabilityPipeline::new(
                Arc::new(BreakerRegistry::new(BreakerConfig::default())),
                config.clone(),
            ),
            throttle: Arc::new(Throttle::new()),
            limiter: Arc::new(RateLimiter::new()),
            config,
            approvals: None,
            notifier: None,
        }
    }

    fn five_items() -> ItemSource {
        Arc::new(|_: &WorkflowContext| (0..5).map(|n| json!({ "n": n })).collect())
    }

    fn step(iteration: IterationDef) -> StepDef {
        StepDef::new("fanout", "worker")
            .with_retry(RetryPolicy::none())
            .with_iteration(iteration)
    }

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(Value::Null)
    }

    #[tokio::test]
    async fn test_empty_source_yields_empty_iteration() {
        let rt = runtime();
        let agent = ItemAgent::new("worker", vec![]);
        let source: ItemSource = Arc::new(|_| Vec::new());
        let def = step(IterationDef::new(source));
        let iteration = def.options.iteration.clone().unwrap();

        let outcome = run_iteration(&rt, &def, &iteration, &[agent], &ctx()).await;
        match outcome {
            BodyOutcome::Success(StepResult::Iteration { items, errors }) => {
                assert!(items.is_empty());
                assert!(errors.is_empty());
            }
            _ => panic!("expected empty iteration"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_iteration_bounded_and_order_stable() {
        let rt = runtime();
        let agent = ItemAgent::new("worker", vec![]);
        let def = step(IterationDef::new(five_items()).with_concurrency(3));
        let iteration = def.options.iteration.clone().unwrap();

        let targets: Vec<Arc<dyn Agent>> = vec![agent.clone()];
        let outcome = run_iteration(&rt, &def, &iteration, &targets, &ctx()).await;
        match outcome {
            BodyOutcome::Success(result) => {
                assert_eq!(
                    result.content(),
                    json!([
                        {"processed": 0},
                        {"processed": 1},
                        {"processed": 2},
                        {"processed": 3},
                        {"processed": 4}
                    ])
                );
                assert_eq!(result.usage().total_tokens, 10);
            }
            _ => panic!("expected success"),
        }
        assert!(agent.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_continue_on_error_records_failures_in_place() {
        let rt = runtime();
        let agent = ItemAgent::new("worker", vec![2]);
        let def = step(
            IterationDef::new(five_items())
                .with_concurrency(3)
                .continue_on_error(),
        );
        let iteration = def.options.iteration.clone().unwrap();

        let targets: Vec<Arc<dyn Agent>> = vec![agent];
        let outcome = run_iteration(&rt, &def, &iteration, &targets, &ctx()).await;
        match outcome {
            BodyOutcome::Degraded(StepResult::Iteration { items, errors }, summary) => {
                assert_eq!(items.len(), 5);
                assert!(items[2].is_error());
                assert!(items[0].is_success() && items[4].is_success());
                assert_eq!(errors.len(), 1);
                assert!(errors.contains_key(&2));
                assert_eq!(summary.class, "iteration_failed");
            }
            _ => panic!("expected degraded iteration"),
        }
    }

    #[tokio::test]
    async fn test_sequential_fail_fast_skips_remaining() {
        let rt = runtime();
        let agent = ItemAgent::new("worker", vec![1]);
        let def = step(IterationDef::new(five_items()));
        let iteration = def.options.iteration.clone().unwrap();

        let targets: Vec<Arc<dyn Agent>> = vec![agent];
        let outcome = run_iteration(&rt, &def, &iteration, &targets, &ctx()).await;
        match outcome {
            BodyOutcome::Failed(StepResult::Iteration { items, errors }, _) => {
                assert_eq!(items.len(), 5);
                assert!(items[0].is_success());
                assert!(items[1].is_error());
                assert!(items[2].is_skipped() && items[4].is_skipped());
                assert_eq!(errors.len(), 1);
            }
            _ => panic!("expected failed iteration"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_fail_fast_aborts_queued_items() {
        let rt = runtime();
        // Every item fails; with concurrency 2 the first failures abort
        // the still-queued rest.
        let agent = ItemAgent::new("worker", vec![0, 1, 2, 3, 4]);
        let def = step(IterationDef::new(five_items()).with_concurrency(2));
        let iteration = def.options.iteration.clone().unwrap();

        let targets: Vec<Arc<dyn Agent>> = vec![agent];
        let outcome = run_iteration(&rt, &def, &iteration, &targets, &ctx()).await;
        match outcome {
            BodyOutcome::Failed(StepResult::Iteration { items, errors }, _) => {
                assert_eq!(items.len(), 5);
                assert!(!errors.is_empty());
                assert!(items.iter().any(|r| r.is_skipped() || r.is_error()));
            }
            _ => panic!("expected failed iteration"),
        }
    }
}
