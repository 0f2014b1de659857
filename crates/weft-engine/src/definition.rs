//! Workflow definitions.
//!
//! A definition is an ordered list of items: steps, parallel groups and
//! wait points. Definitions are inert data plus closures; nothing here
//! executes anything. Builders are consuming (`with_*`) and validation is
//! a separate explicit pass run once at the start of `Orchestrator::run`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use weft_protocols::{ErrorInfo, WorkflowError};
use weft_reliability::RetryPolicy;

use crate::state::WorkflowContext;
use crate::wait::{TimeoutAction, WaitKind, DEFAULT_APPROVAL_POLL, DEFAULT_CONDITION_POLL};

/// Predicate over the accumulated context.
pub type Condition = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// Produces the routing value a router matches against.
pub type RouteSelector = Arc<dyn Fn(&WorkflowContext) -> String + Send + Sync>;

/// Produces the items an iteration fans out over.
pub type ItemSource = Arc<dyn Fn(&WorkflowContext) -> Vec<Value> + Send + Sync>;

/// Produces the absolute time an until-time wait resumes at.
pub type TimeSource = Arc<dyn Fn(&WorkflowContext) -> DateTime<Utc> + Send + Sync>;

/// Inspects a step failure and optionally produces a recovery value.
pub type ErrorHandler = Arc<dyn Fn(&ErrorInfo, &WorkflowContext) -> Option<Value> + Send + Sync>;

/// An ordered workflow definition.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub name: String,
    pub items: Vec<WorkflowItem>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
        }
    }

    pub fn step(mut self, step: StepDef) -> Self {
        self.items.push(WorkflowItem::Step(step));
        self
    }

    pub fn parallel(mut self, group: ParallelGroupDef) -> Self {
        self.items.push(WorkflowItem::Parallel(group));
        self
    }

    pub fn wait(mut self, wait: WaitDef) -> Self {
        self.items.push(WorkflowItem::Wait(wait));
        self
    }

    /// Structural validation: non-empty, unique names (members included),
    /// well-formed routers and sub-workflows.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.items.is_empty() {
            return Err(WorkflowError::InvalidDefinition(format!(
                "workflow '{}' has no items",
                self.name
            )));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for item in &self.items {
            if !seen.insert(item.name()) {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "duplicate item name '{}'",
                    item.name()
                )));
            }
            match item {
                WorkflowItem::Step(step) => step.validate()?,
                WorkflowItem::Parallel(group) => {
                    if group.members.is_empty() {
                        return Err(WorkflowError::InvalidDefinition(format!(
                            "parallel group '{}' has no members",
                            group.name
                        )));
                    }
                    for member in &group.members {
                        if !seen.insert(&member.name) {
                            return Err(WorkflowError::InvalidDefinition(format!(
                                "duplicate item name '{}'",
                                member.name
                            )));
                        }
                        member.validate()?;
                    }
                }
                WorkflowItem::Wait(_) => {}
            }
        }
        Ok(())
    }
}

/// One ordered entry of a workflow.
#[derive(Clone)]
pub enum WorkflowItem {
    Step(StepDef),
    Parallel(ParallelGroupDef),
    Wait(WaitDef),
}

impl WorkflowItem {
    pub fn name(&self) -> &str {
        match self {
            WorkflowItem::Step(step) => &step.name,
            WorkflowItem::Parallel(group) => &group.name,
            WorkflowItem::Wait(wait) => &wait.name,
        }
    }
}

/// Conditional gate attached to a step.
#[derive(Clone)]
pub enum StepCondition {
    /// Run only when the predicate holds.
    If(Condition),
    /// Run only when the predicate does not hold.
    Unless(Condition),
}

impl StepCondition {
    /// The skip reason when the gate is not satisfied.
    pub(crate) fn skip_reason(&self, ctx: &WorkflowContext) -> Option<&'static str> {
        match self {
            StepCondition::If(cond) => (!cond(ctx)).then_some("condition not satisfied"),
            StepCondition::Unless(cond) => cond(ctx).then_some("unless condition matched"),
        }
    }
}

/// Value-based routing table for a step.
#[derive(Clone)]
pub struct RouterDef {
    pub selector: RouteSelector,
    pub routes: HashMap<String, String>,
    pub default: Option<String>,
}

impl RouterDef {
    pub fn new(selector: RouteSelector) -> Self {
        Self {
            selector,
            routes: HashMap::new(),
            default: None,
        }
    }

    pub fn route(mut self, value: impl Into<String>, target: impl Into<String>) -> Self {
        self.routes.insert(value.into(), target.into());
        self
    }

    pub fn default_route(mut self, target: impl Into<String>) -> Self {
        self.default = Some(target.into());
        self
    }
}

/// Item-wise fan-out for a step.
#[derive(Clone)]
pub struct IterationDef {
    pub source: ItemSource,
    pub concurrency: usize,
    /// Abort remaining items on the first failure. When disabled, failed
    /// items are recorded in place and the rest still run.
    pub fail_fast: bool,
}

impl IterationDef {
    pub fn new(source: ItemSource) -> Self {
        Self {
            source,
            concurrency: 1,
            fail_fast: true,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.fail_fast = false;
        self
    }
}

/// Minimum-interval pacing attached to a step.
#[derive(Clone)]
pub struct ThrottleSpec {
    pub key: String,
    pub min_interval: Duration,
}

/// Token-bucket budget attached to a step.
#[derive(Clone)]
pub struct RateLimitSpec {
    pub key: String,
    pub calls: u32,
    pub per: Duration,
}

/// Everything optional about a step.
#[derive(Clone)]
pub struct StepOptions {
    /// A failing critical step halts the workflow; an optional one only
    /// degrades the run to partial.
    pub critical: bool,
    /// Bound on one whole execution of this step, retries included.
    pub timeout: Option<Duration>,
    /// Wall-clock bound across the step's retry/fallback sequence. Unlike
    /// `timeout` this aborts the entire run when exceeded.
    pub total_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Targets tried in order after the primary fails.
    pub fallback_targets: Vec<String>,
    pub router: Option<RouterDef>,
    pub iteration: Option<IterationDef>,
    pub sub_workflow: Option<Arc<WorkflowDefinition>>,
    pub condition: Option<StepCondition>,
    pub on_error: Option<ErrorHandler>,
    /// Substitute content for a failed optional step.
    pub default_value: Option<Value>,
    pub throttle: Option<ThrottleSpec>,
    pub rate_limit: Option<RateLimitSpec>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            critical: true,
            timeout: None,
            total_timeout: None,
            retry: RetryPolicy::default(),
            fallback_targets: Vec::new(),
            router: None,
            iteration: None,
            sub_workflow: None,
            condition: None,
            on_error: None,
            default_value: None,
            throttle: None,
            rate_limit: None,
        }
    }
}

/// A single unit-of-work step.
#[derive(Clone)]
pub struct StepDef {
    pub name: String,
    /// Primary target id; ignored for sub-workflow steps.
    pub target: String,
    pub options: StepOptions,
}

impl StepDef {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            options: StepOptions::default(),
        }
    }

    /// A step that runs a nested workflow instead of invoking a target.
    pub fn sub_workflow(name: impl Into<String>, definition: Arc<WorkflowDefinition>) -> Self {
        let mut step = Self::new(name, "");
        step.options.sub_workflow = Some(definition);
        step
    }

    /// Mark the step as non-critical: a failure degrades instead of halting.
    pub fn optional(mut self) -> Self {
        self.options.critical = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.options.total_timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = policy;
        self
    }

    pub fn with_fallbacks(mut self, targets: Vec<String>) -> Self {
        self.options.fallback_targets = targets;
        self
    }

    pub fn with_router(mut self, router: RouterDef) -> Self {
        self.options.router = Some(router);
        self
    }

    pub fn with_iteration(mut self, iteration: IterationDef) -> Self {
        self.options.iteration = Some(iteration);
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.options.condition = Some(StepCondition::If(condition));
        self
    }

    pub fn unless(mut self, condition: Condition) -> Self {
        self.options.condition = Some(StepCondition::Unless(condition));
        self
    }

    pub fn with_on_error(mut self, handler: ErrorHandler) -> Self {
        self.options.on_error = Some(handler);
        self
    }

    pub fn with_default_value(mut self, value: Value) -> Self {
        self.options.default_value = Some(value);
        self
    }

    pub fn with_throttle(mut self, key: impl Into<String>, min_interval: Duration) -> Self {
        self.options.throttle = Some(ThrottleSpec {
            key: key.into(),
            min_interval,
        });
        self
    }

    pub fn with_rate_limit(mut self, key: impl Into<String>, calls: u32, per: Duration) -> Self {
        self.options.rate_limit = Some(RateLimitSpec {
            key: key.into(),
            calls,
            per,
        });
        self
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        match &self.options.sub_workflow {
            Some(sub) => {
                if self.options.router.is_some() || self.options.iteration.is_some() {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "sub-workflow step '{}' cannot also route or iterate",
                        self.name
                    )));
                }
                sub.validate()?;
            }
            None => {
                if self.target.is_empty() && self.options.router.is_none() {
                    return Err(WorkflowError::InvalidDefinition(format!(
                        "step '{}' has no target",
                        self.name
                    )));
                }
            }
        }
        if let Some(router) = &self.options.router {
            if router.routes.is_empty() && router.default.is_none() {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "router for step '{}' has no routes",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// A named group of steps run concurrently on a worker pool.
#[derive(Clone)]
pub struct ParallelGroupDef {
    pub name: String,
    pub members: Vec<StepDef>,
    /// Abort still-queued members once a critical member fails.
    pub fail_fast: bool,
    /// Pool size cap; defaults to the member count.
    pub concurrency: Option<usize>,
}

impl ParallelGroupDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            fail_fast: false,
            concurrency: None,
        }
    }

    pub fn member(mut self, step: StepDef) -> Self {
        self.members.push(step);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }
}

/// A wait point between items.
#[derive(Clone)]
pub struct WaitDef {
    pub name: String,
    pub kind: WaitKind,
    /// Bound on the wait itself. Ignored for fixed delays.
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutAction,
    /// Identity notified when a timeout escalates.
    pub escalate_to: Option<String>,
}

impl WaitDef {
    /// Fixed delay.
    pub fn delay(name: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            kind: WaitKind::Delay { duration },
            timeout: None,
            on_timeout: TimeoutAction::default(),
            escalate_to: None,
        }
    }

    /// Poll a predicate until it holds.
    pub fn until(name: impl Into<String>, condition: Condition) -> Self {
        Self {
            name: name.into(),
            kind: WaitKind::UntilCondition {
                condition,
                poll_interval: DEFAULT_CONDITION_POLL,
                backoff_multiplier: 1.0,
                max_interval: None,
            },
            timeout: None,
            on_timeout: TimeoutAction::default(),
            escalate_to: None,
        }
    }

    /// Sleep until an absolute time.
    pub fn until_time(name: impl Into<String>, time: TimeSource) -> Self {
        Self {
            name: name.into(),
            kind: WaitKind::UntilTime { time },
            timeout: None,
            on_timeout: TimeoutAction::default(),
            escalate_to: None,
        }
    }

    /// Block on a human approval decision.
    pub fn approval(
        name: impl Into<String>,
        message: impl Into<String>,
        approvers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: WaitKind::Approval {
                message: message.into(),
                approvers,
                channels: Vec::new(),
                poll_interval: DEFAULT_APPROVAL_POLL,
                reminder_after: None,
                reminder_interval: None,
            },
            timeout: None,
            on_timeout: TimeoutAction::default(),
            escalate_to: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_timeout(mut self, action: TimeoutAction) -> Self {
        self.on_timeout = action;
        self
    }

    pub fn escalate_to(mut self, target: impl Into<String>) -> Self {
        self.on_timeout = TimeoutAction::Escalate;
        self.escalate_to = Some(target.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        match &mut self.kind {
            WaitKind::UntilCondition { poll_interval, .. } => *poll_interval = interval,
            WaitKind::Approval { poll_interval, .. } => *poll_interval = interval,
            _ => {}
        }
        self
    }

    /// Grow the poll interval by `multiplier` after each miss, up to `max`.
    pub fn with_poll_backoff(mut self, multiplier: f64, max: Duration) -> Self {
        if let WaitKind::UntilCondition {
            backoff_multiplier,
            max_interval,
            ..
        } = &mut self.kind
        {
            *backoff_multiplier = multiplier.max(1.0);
            *max_interval = Some(max);
        }
        self
    }

    pub fn with_channels(mut self, value: Vec<String>) -> Self {
        if let WaitKind::Approval { channels, .. } = &mut self.kind {
            *channels = value;
        }
        self
    }

    pub fn with_reminder_after(mut self, after: Duration) -> Self {
        if let WaitKind::Approval { reminder_after, .. } = &mut self.kind {
            *reminder_after = Some(after);
        }
        self
    }

    pub fn with_reminder_interval(mut self, interval: Duration) -> Self {
        if let WaitKind::Approval {
            reminder_interval, ..
        } = &mut self.kind
        {
            *reminder_interval = Some(interval);
        }
        self
    }
}
