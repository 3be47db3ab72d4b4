//! Tick-driven scheduler.
//!
//! Each tick promotes new tasks, pulls ready ones in priority order,
//! attempts resource assignment, enforces timeouts and retries, and runs
//! deadlock detection. Completion is reactive: the agent-facing helpers
//! release allocations and re-evaluate dependents immediately rather than
//! waiting for the next tick.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::context::CoordinationContext;
use crate::coordination::events::{Event, EventKind};
use crate::error::{Error, Result};
use crate::memory::AgentId;
use crate::resources::AllocationOutcome;
use crate::task::{TaskDefinition, TaskId, TaskStatus};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum tasks in `Assigned`/`Running` at once.
    pub max_concurrent_agents: usize,
    /// How long a task may wait on a denied resource before failing.
    pub resource_timeout: Duration,
    /// Whether to run cycle and stuck detection each tick.
    pub deadlock_detection: bool,
    /// Ticks with an unchanged unmet-dependency set before a task is stuck.
    pub stuck_tick_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 5,
            resource_timeout: Duration::from_secs(60),
            deadlock_detection: true,
            stuck_tick_threshold: 10,
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone)]
pub struct TickReport {
    /// Tasks promoted `Created -> Queued`.
    pub promoted: Vec<TaskId>,
    /// Tasks granted all their resources and assigned.
    pub assigned: Vec<TaskId>,
    /// Tasks left queued after a resource denial (task, resource).
    pub denied: Vec<(TaskId, String)>,
    /// Tasks failed this tick (resource timeout or execution timeout).
    pub failed: Vec<TaskId>,
    /// Tasks requeued by the retry budget.
    pub retried: Vec<TaskId>,
    /// Dependency cycles found (system alert; requires intervention).
    pub deadlocks: Vec<Vec<TaskId>>,
    /// Tasks whose unmet dependencies have not changed for too many ticks.
    pub stuck: Vec<TaskId>,
}

#[derive(Default)]
struct SchedulerState {
    /// When each queued task first had a resource denied.
    first_denied: HashMap<TaskId, DateTime<Utc>>,
    /// Unmet-dependency fingerprint and how many ticks it has held.
    unmet: HashMap<TaskId, (Vec<TaskId>, u32)>,
}

/// The cooperative scheduler. One instance may be ticked by a timer while
/// agents call the task helpers concurrently.
pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Run one scheduling tick.
    pub async fn tick(&self, ctx: &CoordinationContext) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.promote_created(ctx, &mut report).await?;
        self.enforce_running_timeouts(ctx, &mut report).await?;
        self.assign_ready(ctx, &mut report).await?;

        if self.config.deadlock_detection {
            self.detect_deadlocks(ctx, &mut report).await?;
        }

        Ok(report)
    }

    /// Queued tasks whose dependencies are satisfied, priority descending,
    /// then creation order ascending so old tasks cannot starve.
    pub async fn pull_ready_tasks(&self, ctx: &CoordinationContext) -> Result<Vec<TaskDefinition>> {
        let mut ready = ctx.graph.ready_tasks().await?;
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(ready)
    }

    /// Try to grant every requirement of a ready task.
    ///
    /// Any denial rolls back grants made in this call and leaves the task
    /// queued; once the first denial is older than `resource_timeout` the
    /// task fails with a resource timeout and consumes a retry.
    pub async fn attempt_assign(&self, ctx: &CoordinationContext, task: &TaskDefinition, report: &mut TickReport) -> Result<bool> {
        let mut granted: Vec<String> = Vec::new();
        let mut denial: Option<String> = None;

        for requirement in &task.resource_requirements {
            match ctx.allocator.request(&ctx.store, &task.id, requirement).await? {
                AllocationOutcome::Granted(_) => granted.push(requirement.resource_id.clone()),
                AllocationOutcome::Denied { .. } => {
                    denial = Some(requirement.resource_id.clone());
                    break;
                }
            }
        }

        let Some(resource) = denial else {
            ctx.graph
                .transition(&task.id, TaskStatus::Assigned, "resources granted", "scheduler")
                .await?;
            let mut state = self.state.lock().await;
            state.first_denied.remove(&task.id);
            drop(state);
            ctx.events
                .publish(Event::new(EventKind::TaskAssigned).for_task(task.id.clone()))
                .await;
            report.assigned.push(task.id.clone());
            return Ok(true);
        };

        // Roll back partial grants so the task holds nothing while it waits
        for resource_id in granted {
            ctx.allocator.release(&ctx.store, &task.id, &resource_id).await?;
        }

        let now = Utc::now();
        let deadline_passed = {
            let mut state = self.state.lock().await;
            let first = *state.first_denied.entry(task.id.clone()).or_insert(now);
            now - first >= chrono::Duration::milliseconds(self.config.resource_timeout.as_millis() as i64)
        };

        if deadline_passed {
            let error = Error::ResourceTimeout {
                task: task.id.clone(),
                resource: resource.clone(),
            };
            self.fail_with_retry(ctx, &task.id, error.to_string(), report).await?;
            let mut state = self.state.lock().await;
            state.first_denied.remove(&task.id);
        } else {
            report.denied.push((task.id.clone(), resource));
        }
        Ok(false)
    }

    /// Agent-facing: move an assigned task to running.
    pub async fn start_task(&self, ctx: &CoordinationContext, id: &TaskId, agent: &AgentId) -> Result<TaskDefinition> {
        let task = ctx
            .graph
            .transition(id, TaskStatus::Running, "execution started", agent.to_string())
            .await?;
        ctx.events
            .publish(Event::new(EventKind::TaskStarted).for_task(id.clone()).by_agent(agent.clone()))
            .await;
        Ok(task)
    }

    /// Agent-facing: complete a running task, release its resources, and
    /// re-evaluate its dependents so satisfaction latches immediately.
    pub async fn complete_task(&self, ctx: &CoordinationContext, id: &TaskId, agent: &AgentId) -> Result<TaskDefinition> {
        let task = ctx
            .graph
            .transition(id, TaskStatus::Completed, "completed", agent.to_string())
            .await?;
        self.on_terminal(ctx, id).await?;
        ctx.events
            .publish(Event::new(EventKind::TaskCompleted).for_task(id.clone()).by_agent(agent.clone()))
            .await;
        Ok(task)
    }

    /// Agent-facing: fail a running task; retried if budget remains.
    pub async fn fail_task(
        &self,
        ctx: &CoordinationContext,
        id: &TaskId,
        reason: impl Into<String>,
        agent: &AgentId,
    ) -> Result<TaskDefinition> {
        let reason = reason.into();
        ctx.graph
            .transition(id, TaskStatus::Failed, reason.clone(), agent.to_string())
            .await?;
        self.on_terminal(ctx, id).await?;

        let task = ctx.graph.get_task(id).await?;
        if task.retries_remaining() {
            let task = ctx.graph.retry(id, format!("retry after: {}", reason)).await?;
            ctx.events
                .publish(Event::new(EventKind::TaskRetried).for_task(id.clone()))
                .await;
            return Ok(task);
        }

        ctx.events
            .publish(Event::new(EventKind::TaskFailed).for_task(id.clone()).by_agent(agent.clone()))
            .await;
        Ok(task)
    }

    /// Cancel a task from any non-terminal state.
    pub async fn cancel_task(
        &self,
        ctx: &CoordinationContext,
        id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<TaskDefinition> {
        let task = ctx
            .graph
            .transition(id, TaskStatus::Cancelled, reason, "caller")
            .await?;
        self.on_terminal(ctx, id).await?;
        ctx.events
            .publish(Event::new(EventKind::TaskCancelled).for_task(id.clone()))
            .await;
        Ok(task)
    }

    async fn promote_created(&self, ctx: &CoordinationContext, report: &mut TickReport) -> Result<()> {
        for task in ctx.graph.created_tasks().await {
            ctx.graph
                .transition(&task.id, TaskStatus::Queued, "schedulable", "scheduler")
                .await?;
            ctx.events
                .publish(Event::new(EventKind::TaskQueued).for_task(task.id.clone()))
                .await;
            report.promoted.push(task.id);
        }
        Ok(())
    }

    async fn enforce_running_timeouts(&self, ctx: &CoordinationContext, report: &mut TickReport) -> Result<()> {
        let now = Utc::now();
        for task in ctx.graph.all_tasks().await {
            let Some(timeout_ms) = task.constraints.timeout_after_ms else {
                continue;
            };
            let Some(since) = task.running_since() else {
                continue;
            };
            if now - since >= chrono::Duration::milliseconds(timeout_ms as i64) {
                self.fail_with_retry(ctx, &task.id, "timeout".to_string(), report).await?;
            }
        }
        Ok(())
    }

    async fn assign_ready(&self, ctx: &CoordinationContext, report: &mut TickReport) -> Result<()> {
        let counts = ctx.graph.counts().await;
        let busy = counts.assigned + counts.running;
        let capacity = self.config.max_concurrent_agents.saturating_sub(busy);

        let ready = self.pull_ready_tasks(ctx).await?;
        let mut assigned = 0;
        for task in ready {
            if assigned >= capacity {
                break;
            }
            if self.attempt_assign(ctx, &task, report).await? {
                assigned += 1;
            }
        }
        Ok(())
    }

    /// Fail a task (from `Queued` or `Running`), release everything it
    /// holds, and requeue it if its retry budget allows.
    async fn fail_with_retry(
        &self,
        ctx: &CoordinationContext,
        id: &TaskId,
        reason: String,
        report: &mut TickReport,
    ) -> Result<()> {
        ctx.graph
            .transition(id, TaskStatus::Failed, reason.clone(), "scheduler")
            .await?;
        self.on_terminal(ctx, id).await?;
        report.failed.push(id.clone());

        let task = ctx.graph.get_task(id).await?;
        if task.retries_remaining() {
            ctx.graph.retry(id, format!("retry after: {}", reason)).await?;
            ctx.events
                .publish(Event::new(EventKind::TaskRetried).for_task(id.clone()))
                .await;
            report.retried.push(id.clone());
        } else {
            log::warn!("task {} failed terminally: {}", id, reason);
            ctx.events
                .publish(Event::new(EventKind::TaskFailed).for_task(id.clone()))
                .await;
        }
        Ok(())
    }

    /// Terminal housekeeping: drop allocations, refresh dependent latches.
    async fn on_terminal(&self, ctx: &CoordinationContext, id: &TaskId) -> Result<()> {
        let released = ctx.allocator.release_all(&ctx.store, id).await?;
        if !released.is_empty() {
            log::debug!("released {:?} held by {}", released, id);
        }
        for dependent in ctx.graph.dependents_of(id).await {
            // Evaluating records the latch if the dependency just completed
            let _ = ctx.graph.get_task_status(&dependent.id).await?;
        }
        Ok(())
    }

    async fn detect_deadlocks(&self, ctx: &CoordinationContext, report: &mut TickReport) -> Result<()> {
        let cycles = ctx.graph.detect_cycles().await;
        for cycle in &cycles {
            log::error!("dependency cycle detected: {:?}", cycle);
            ctx.events
                .publish(
                    Event::new(EventKind::DeadlockDetected)
                        .with_payload(serde_json::json!({
                            "cycle": cycle.iter().map(|t| t.to_string()).collect::<Vec<_>>()
                        })),
                )
                .await;
        }
        report.deadlocks = cycles;

        // Stuck detection: an unmet-dependency set frozen across N ticks
        let mut state = self.state.lock().await;
        let mut seen = Vec::new();
        for task in ctx.graph.all_tasks().await {
            if task.status != TaskStatus::Queued {
                continue;
            }
            let snapshot = ctx.graph.get_task_status(&task.id).await?;
            let mut unmet = snapshot.unmet_dependencies();
            if unmet.is_empty() {
                continue;
            }
            unmet.sort();
            seen.push(task.id.clone());

            let entry = state.unmet.entry(task.id.clone()).or_insert((unmet.clone(), 0));
            if entry.0 == unmet {
                entry.1 += 1;
            } else {
                *entry = (unmet, 1);
            }
            if entry.1 >= self.config.stuck_tick_threshold {
                log::error!("task {} stuck: unmet dependencies {:?} unchanged", task.id, entry.0);
                report.stuck.push(task.id.clone());
                ctx.events
                    .publish(Event::new(EventKind::DeadlockDetected).for_task(task.id.clone()))
                    .await;
            }
        }
        state.unmet.retain(|id, _| seen.contains(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceRequirement;
    use crate::task::TaskSpec;

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_tick_promotes_and_assigns() {
        let ctx = CoordinationContext::new();
        let sched = scheduler();

        let task = ctx
            .graph
            .create_task("swarm", TaskSpec::new("a", "test", "plain task"))
            .await
            .unwrap();

        let report = sched.tick(&ctx).await.unwrap();
        assert_eq!(report.promoted, vec![task.id.clone()]);
        // Promoted this tick; assigned on the same tick since it is ready
        assert_eq!(report.assigned, vec![task.id.clone()]);

        let task = ctx.graph.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_priority_ordering_with_anti_starvation() {
        let ctx = CoordinationContext::new();
        // Zero capacity keeps everything queued so the pull order is visible
        let sched = Scheduler::new(SchedulerConfig {
            max_concurrent_agents: 0,
            ..SchedulerConfig::default()
        });

        for (name, priority) in [("low", 1u8), ("high", 9), ("high2", 9)] {
            ctx.graph
                .create_task("swarm", TaskSpec::new(name, "test", "task").with_priority(priority))
                .await
                .unwrap();
        }
        sched.tick(&ctx).await.unwrap();

        let ready = sched.pull_ready_tasks(&ctx).await.unwrap();
        assert_eq!(ready.len(), 3);
        assert_eq!(ready[0].name, "high");
        // Same priority: earlier creation wins, so old tasks cannot starve
        assert_eq!(ready[1].name, "high2");
        assert_eq!(ready[2].name, "low");
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let ctx = CoordinationContext::new();
        let sched = Scheduler::new(SchedulerConfig {
            max_concurrent_agents: 2,
            ..SchedulerConfig::default()
        });

        for i in 0..4 {
            ctx.graph
                .create_task("swarm", TaskSpec::new(format!("t{}", i), "test", "task"))
                .await
                .unwrap();
        }

        let report = sched.tick(&ctx).await.unwrap();
        assert_eq!(report.assigned.len(), 2);

        let counts = ctx.graph.counts().await;
        assert_eq!(counts.assigned, 2);
        assert_eq!(counts.queued, 2);
    }

    #[tokio::test]
    async fn test_dependency_gates_assignment() {
        let ctx = CoordinationContext::new();
        let sched = scheduler();
        let agent = AgentId::new("agent-1");

        let a = ctx
            .graph
            .create_task("swarm", TaskSpec::new("a", "test", "first"))
            .await
            .unwrap();
        let b = ctx
            .graph
            .create_task(
                "swarm",
                TaskSpec::new("b", "test", "second").depends_on(a.id.clone()),
            )
            .await
            .unwrap();

        let report = sched.tick(&ctx).await.unwrap();
        assert_eq!(report.assigned, vec![a.id.clone()]);

        sched.start_task(&ctx, &a.id, &agent).await.unwrap();
        sched.complete_task(&ctx, &a.id, &agent).await.unwrap();

        let report = sched.tick(&ctx).await.unwrap();
        assert_eq!(report.assigned, vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn test_exclusive_denial_leaves_queued() {
        let ctx = CoordinationContext::new();
        let sched = scheduler();

        let holder = ctx
            .graph
            .create_task(
                "swarm",
                TaskSpec::new("holder", "test", "holds the db").requires(ResourceRequirement::exclusive("db")),
            )
            .await
            .unwrap();
        let waiter = ctx
            .graph
            .create_task(
                "swarm",
                TaskSpec::new("waiter", "test", "wants the db").requires(ResourceRequirement::exclusive("db")),
            )
            .await
            .unwrap();

        let report = sched.tick(&ctx).await.unwrap();
        assert_eq!(report.assigned, vec![holder.id.clone()]);
        assert_eq!(report.denied.len(), 1);
        assert_eq!(report.denied[0].0, waiter.id);

        let waiter_task = ctx.graph.get_task(&waiter.id).await.unwrap();
        assert_eq!(waiter_task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_resource_timeout_consumes_retry() {
        let ctx = CoordinationContext::new();
        let sched = Scheduler::new(SchedulerConfig {
            resource_timeout: Duration::from_millis(0),
            ..SchedulerConfig::default()
        });

        ctx.graph
            .create_task(
                "swarm",
                TaskSpec::new("holder", "test", "holds").requires(ResourceRequirement::exclusive("db")),
            )
            .await
            .unwrap();
        let mut spec = TaskSpec::new("waiter", "test", "waits").requires(ResourceRequirement::exclusive("db"));
        spec.constraints.max_retries = 1;
        let waiter = ctx.graph.create_task("swarm", spec).await.unwrap();

        // First tick: holder assigned; waiter denied and (timeout=0) fails
        // immediately, then the retry budget requeues it
        let report = sched.tick(&ctx).await.unwrap();
        assert!(report.failed.contains(&waiter.id));
        assert!(report.retried.contains(&waiter.id));

        let task = ctx.graph.get_task(&waiter.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_running_timeout_fails_task() {
        let ctx = CoordinationContext::new();
        let sched = scheduler();
        let agent = AgentId::new("agent-1");

        let mut spec = TaskSpec::new("slow", "test", "runs too long");
        spec.constraints.timeout_after_ms = Some(10);
        spec.constraints.max_retries = 0;
        let task = ctx.graph.create_task("swarm", spec).await.unwrap();

        sched.tick(&ctx).await.unwrap();
        sched.start_task(&ctx, &task.id, &agent).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        let report = sched.tick(&ctx).await.unwrap();
        assert!(report.failed.contains(&task.id));

        let task = ctx.graph.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .status_history
            .iter()
            .any(|c| c.to == TaskStatus::Failed && c.reason == "timeout"));
    }

    #[tokio::test]
    async fn test_terminal_releases_allocations() {
        let ctx = CoordinationContext::new();
        let sched = scheduler();
        let agent = AgentId::new("agent-1");

        let task = ctx
            .graph
            .create_task(
                "swarm",
                TaskSpec::new("a", "test", "uses db").requires(ResourceRequirement::exclusive("db")),
            )
            .await
            .unwrap();

        sched.tick(&ctx).await.unwrap();
        sched.start_task(&ctx, &task.id, &agent).await.unwrap();
        assert_eq!(ctx.allocator.status(&ctx.store, "db").await.unwrap().len(), 1);

        sched.complete_task(&ctx, &task.id, &agent).await.unwrap();
        assert!(ctx.allocator.status(&ctx.store, "db").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_task_reported_not_resolved() {
        let ctx = CoordinationContext::new();
        let sched = Scheduler::new(SchedulerConfig {
            stuck_tick_threshold: 2,
            ..SchedulerConfig::default()
        });

        // Two tasks depending on a third that never completes
        let blocker = ctx
            .graph
            .create_task("swarm", TaskSpec::new("blocker", "test", "never runs"))
            .await
            .unwrap();
        let stuck = ctx
            .graph
            .create_task(
                "swarm",
                TaskSpec::new("stuck", "test", "waits forever").depends_on(blocker.id.clone()),
            )
            .await
            .unwrap();
        // Cancel the blocker so the dependency can never be satisfied
        sched.tick(&ctx).await.unwrap();
        sched.cancel_task(&ctx, &blocker.id, "abandoned").await.unwrap();

        let mut reported = false;
        for _ in 0..4 {
            let report = sched.tick(&ctx).await.unwrap();
            if report.stuck.contains(&stuck.id) {
                reported = true;
            }
        }
        assert!(reported);

        // Stuck tasks are reported, never silently failed
        let task = ctx.graph.get_task(&stuck.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }
}
