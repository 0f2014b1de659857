//! Wait points: delays, polled conditions, absolute times and approvals.
//!
//! Every wait resolves to a result plus a control decision. Timeouts never
//! panic the run; they map through the wait's configured timeout action.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use weft_protocols::{ApprovalRecord, ApprovalStatus, StepResult, Usage};

use crate::definition::{Condition, WaitDef};
use crate::state::{Control, WorkflowContext};
use crate::step::StepRuntime;

pub(crate) const DEFAULT_CONDITION_POLL: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_APPROVAL_POLL: Duration = Duration::from_secs(5);

/// What a wait point blocks on.
#[derive(Clone)]
pub enum WaitKind {
    /// Fixed delay; the wait timeout does not apply.
    Delay { duration: Duration },
    /// Poll a predicate until it holds, optionally growing the interval.
    UntilCondition {
        condition: Condition,
        poll_interval: Duration,
        backoff_multiplier: f64,
        max_interval: Option<Duration>,
    },
    /// Sleep until an absolute time.
    UntilTime { time: crate::definition::TimeSource },
    /// Block until an approval record resolves.
    Approval {
        message: String,
        approvers: Vec<String>,
        channels: Vec<String>,
        poll_interval: Duration,
        reminder_after: Option<Duration>,
        reminder_interval: Option<Duration>,
    },
}

/// What to do when a wait times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Halt the workflow with a failure.
    #[default]
    Fail,
    /// Record the timeout and move on.
    Continue,
    /// Record the timeout and skip the next item.
    SkipNext,
    /// Tag and notify the escalation target, then halt.
    Escalate,
}

pub(crate) struct WaitOutcome {
    pub result: StepResult,
    pub control: Control,
}

fn resolved(content: Value) -> WaitOutcome {
    WaitOutcome {
        result: StepResult::value(content, Usage::default()),
        control: Control::Continue,
    }
}

pub(crate) async fn execute_wait(
    rt: &StepRuntime,
    def: &WaitDef,
    ctx: &WorkflowContext,
) -> WaitOutcome {
    info!("Waiting at '{}'", def.name);
    match &def.kind {
        WaitKind::Delay { duration } => {
            sleep(*duration).await;
            resolved(json!({ "waited_ms": duration.as_millis() as u64 }))
        }
        WaitKind::UntilCondition {
            condition,
            poll_interval,
            backoff_multiplier,
            max_interval,
        } => {
            wait_for_condition(
                rt,
                def,
                ctx,
                condition,
                *poll_interval,
                *backoff_multiplier,
                *max_interval,
            )
            .await
        }
        WaitKind::UntilTime { time } => wait_until_time(rt, def, time(ctx)).await,
        WaitKind::Approval {
            message,
            approvers,
            channels,
            poll_interval,
            reminder_after,
            reminder_interval,
        } => {
            wait_for_approval(
                rt,
                def,
                message,
                approvers.clone(),
                channels,
                *poll_interval,
                *reminder_after,
                *reminder_interval,
            )
            .await
        }
    }
}

async fn wait_for_condition(
    rt: &StepRuntime,
    def: &WaitDef,
    ctx: &WorkflowContext,
    condition: &Condition,
    poll_interval: Duration,
    backoff_multiplier: f64,
    max_interval: Option<Duration>,
) -> WaitOutcome {
    let started = Instant::now();
    let mut interval = poll_interval;
    loop {
        if condition(ctx) {
            debug!(
                "Wait '{}' condition satisfied after {:?}",
                def.name,
                started.elapsed()
            );
            return resolved(json!({
                "satisfied": true,
                "waited_ms": started.elapsed().as_millis() as u64,
            }));
        }

        let mut nap = interval;
        if let Some(timeout) = def.timeout {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return timed_out(rt, def, started.elapsed(), None).await;
            }
            nap = nap.min(remaining);
        }
        sleep(nap).await;

        if backoff_multiplier > 1.0 {
            interval = interval.mul_f64(backoff_multiplier);
            if let Some(max) = max_interval {
                interval = interval.min(max);
            }
        }
    }
}

async fn wait_until_time(rt: &StepRuntime, def: &WaitDef, target: DateTime<Utc>) -> WaitOutcome {
    let remaining = (target - Utc::now()).to_std().unwrap_or_default();
    if let Some(timeout) = def.timeout {
        if remaining > timeout {
            sleep(timeout).await;
            return timed_out(rt, def, timeout, None).await;
        }
    }
    sleep(remaining).await;
    resolved(json!({ "resumed_at": target.to_rfc3339() }))
}

#[allow(clippy::too_many_arguments)]
async fn wait_for_approval(
    rt: &StepRuntime,
    def: &WaitDef,
    message: &str,
    approvers: Vec<String>,
    channels: &[String],
    poll_interval: Duration,
    reminder_after: Option<Duration>,
    reminder_interval: Option<Duration>,
) -> WaitOutcome {
    let Some(store) = rt.approvals.as_ref() else {
        error!(
            "Wait '{}' requires an approval store but none is configured",
            def.name
        );
        return WaitOutcome {
            result: StepResult::failure(
                "approval_unconfigured",
                format!("wait '{}' has no approval store", def.name),
            ),
            control: Control::Halt,
        };
    };

    let mut record = ApprovalRecord::new(rt.workflow.clone(), def.name.clone(), message, approvers);
    if let Some(timeout) = def.timeout {
        let expiry = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        record = record.with_expiry(Utc::now() + expiry);
    }
    if let Err(err) = store.save(&record).await {
        warn!("Failed to persist approval request '{}': {}", def.name, err);
    }
    if let Some(notifier) = rt.notifier.as_ref() {
        let delivered = notifier.notify(&record, message, channels).await;
        debug!(
            "Approval '{}' notified on {}/{} channel(s)",
            def.name,
            delivered.values().filter(|ok| **ok).count(),
            delivered.len()
        );
    }

    let started = Instant::now();
    let mut next_reminder = reminder_after.map(|after| started + after);
    loop {
        let mut nap = poll_interval;
        if let Some(timeout) = def.timeout {
            nap = nap.min(timeout.saturating_sub(started.elapsed()));
        }
        sleep(nap).await;

        match store.find(record.id).await {
            Ok(Some(found)) => record = found,
            Ok(None) => {}
            Err(err) => warn!("Approval lookup for '{}' failed: {}", def.name, err),
        }

        match record.status {
            ApprovalStatus::Approved => {
                info!(
                    "Approval '{}' granted by {:?}",
                    def.name, record.resolved_by
                );
                return resolved(json!({
                    "approved": true,
                    "approved_by": record.resolved_by,
                    "waited_ms": started.elapsed().as_millis() as u64,
                }));
            }
            ApprovalStatus::Rejected => {
                let by = record.resolved_by.as_deref().unwrap_or("unknown");
                warn!("Approval '{}' rejected by {}", def.name, by);
                return WaitOutcome {
                    result: StepResult::failure(
                        "approval_rejected",
                        format!("approval '{}' rejected by {}", def.name, by),
                    ),
                    control: Control::Halt,
                };
            }
            ApprovalStatus::Expired => {
                return timed_out(rt, def, started.elapsed(), Some(&mut record)).await;
            }
            ApprovalStatus::Pending => {}
        }

        if let Some(timeout) = def.timeout {
            if started.elapsed() >= timeout {
                record.expire();
                if let Err(err) = store.save(&record).await {
                    warn!("Failed to persist approval expiry '{}': {}", def.name, err);
                }
                return timed_out(rt, def, started.elapsed(), Some(&mut record)).await;
            }
        }

        if next_reminder.is_some_and(|at| Instant::now() >= at) {
            if let Some(notifier) = rt.notifier.as_ref() {
                notifier.remind(&record, message).await;
            }
            record.mark_reminded();
            if let Err(err) = store.save(&record).await {
                warn!("Failed to persist reminder for '{}': {}", def.name, err);
            }
            next_reminder = reminder_interval.map(|every| Instant::now() + every);
        }
    }
}

/// Map an elapsed timeout through the wait's configured action.
async fn timed_out(
    rt: &StepRuntime,
    def: &WaitDef,
    waited: Duration,
    record: Option<&mut ApprovalRecord>,
) -> WaitOutcome {
    let waited_ms = waited.as_millis() as u64;
    match def.on_timeout {
        TimeoutAction::Continue => {
            warn!("Wait '{}' timed out after {:?}; continuing", def.name, waited);
            WaitOutcome {
                result: timed_out_value(waited_ms),
                control: Control::Continue,
            }
        }
        TimeoutAction::SkipNext => {
            warn!(
                "Wait '{}' timed out after {:?}; skipping next item",
                def.name, waited
            );
            WaitOutcome {
                result: timed_out_value(waited_ms),
                control: Control::SkipNext(format!("wait '{}' timed out", def.name)),
            }
        }
        TimeoutAction::Escalate => match &def.escalate_to {
            Some(target) => {
                if let Some(record) = record {
                    record.escalated_to = Some(target.clone());
                    if let Some(store) = rt.approvals.as_ref() {
                        if let Err(err) = store.save(record).await {
                            warn!("Failed to persist escalation for '{}': {}", def.name, err);
                        }
                    }
                    if let Some(notifier) = rt.notifier.as_ref() {
                        notifier
                            .remind(
                                record,
                                &format!("escalated to {}: wait '{}' timed out", target, def.name),
                            )
                            .await;
                    }
                }
                warn!("Wait '{}' escalated to '{}'", def.name, target);
                WaitOutcome {
                    result: StepResult::failure(
                        "wait_escalated",
                        format!(
                            "wait '{}' escalated to {} after {}ms",
                            def.name, target, waited_ms
                        ),
                    ),
                    control: Control::Halt,
                }
            }
            None => {
                warn!(
                    "Wait '{}' is configured to escalate but has no target; failing",
                    def.name
                );
                failed(def, waited_ms)
            }
        },
        TimeoutAction::Fail => failed(def, waited_ms),
    }
}

/// A non-failing timeout still counts as a successful wait.
fn timed_out_value(waited_ms: u64) -> StepResult {
    StepResult::value(
        json!({ "timed_out": true, "waited_ms": waited_ms }),
        Usage::default(),
    )
}

fn failed(def: &WaitDef, waited_ms: u64) -> WaitOutcome {
    WaitOutcome {
        result: StepResult::failure(
            "wait_timeout",
            format!("wait '{}' timed out after {}ms", def.name, waited_ms),
        ),
        control: Control::Halt,
    }
}
