//! End-to-end swarm scenarios.
//!
//! Each test walks one coordination story through the public API the way a
//! real agent runtime would: create tasks, tick the scheduler, race for
//! resources, lose heartbeats, and watch the history that remains.

use std::sync::Arc;
use std::time::Duration;

use stigmergy::coordination::{AgentType, CapabilityTier, WorkItem, WorkPoolCoordinator};
use stigmergy::{
    AgentId, AllocationOutcome, CoordinationContext, EntryKind, MemoryEntry, ResourceAllocator,
    ResourceRequirement, Scheduler, SchedulerConfig, SharedMemoryStore, TaskSpec, TaskStatus,
};
use tokio::time::sleep;

/// Scenario A: dependency satisfaction flips exactly when the upstream task
/// completes.
#[tokio::test]
async fn scenario_a_dependency_becomes_satisfied_on_completion() {
    let ctx = CoordinationContext::new();
    let sched = Scheduler::new(SchedulerConfig::default());
    let agent = AgentId::new("agent-1");

    let a = ctx
        .graph
        .create_task("swarm", TaskSpec::new("a", "build", "produce the artifact"))
        .await
        .unwrap();
    let b = ctx
        .graph
        .create_task(
            "swarm",
            TaskSpec::new("b", "deploy", "ship the artifact").depends_on(a.id.clone()),
        )
        .await
        .unwrap();

    let before = ctx.graph.get_task_status(&b.id).await.unwrap();
    assert!(!before.dependencies_satisfied());

    sched.tick(&ctx).await.unwrap();
    sched.start_task(&ctx, &a.id, &agent).await.unwrap();

    // Still unsatisfied while a is merely running
    let running = ctx.graph.get_task_status(&b.id).await.unwrap();
    assert!(!running.dependencies_satisfied());

    sched.complete_task(&ctx, &a.id, &agent).await.unwrap();

    // Satisfied immediately after the completed transition
    let after = ctx.graph.get_task_status(&b.id).await.unwrap();
    assert!(after.dependencies_satisfied());
}

/// Scenario B: two agents race an exclusive resource in the same tick;
/// exactly one wins, and the loser succeeds only after release.
#[tokio::test]
async fn scenario_b_exclusive_resource_race() {
    let store = Arc::new(SharedMemoryStore::new());
    let allocator = Arc::new(ResourceAllocator::new());
    let requirement = ResourceRequirement::exclusive("prod-db");

    let task_a = stigmergy::TaskId::new("swarm", 1);
    let task_b = stigmergy::TaskId::new("swarm", 2);

    let (outcome_a, outcome_b) = tokio::join!(
        allocator.request(&store, &task_a, &requirement),
        allocator.request(&store, &task_b, &requirement),
    );
    let outcome_a = outcome_a.unwrap();
    let outcome_b = outcome_b.unwrap();

    assert_eq!(
        outcome_a.is_granted() as usize + outcome_b.is_granted() as usize,
        1,
        "exactly one racer may hold prod-db"
    );
    let holders = allocator.status(&store, "prod-db").await.unwrap();
    assert_eq!(holders.len(), 1);

    // The loser is granted once the winner releases
    let (winner, loser) = if outcome_a.is_granted() {
        (task_a, task_b)
    } else {
        (task_b, task_a)
    };
    allocator.release(&store, &winner, "prod-db").await.unwrap();

    let retry = allocator.request(&store, &loser, &requirement).await.unwrap();
    assert!(matches!(retry, AllocationOutcome::Granted(_)));
}

/// Scenario C: a lock entry with a 100ms TTL is gone after 150ms and a
/// maintenance sweep.
#[tokio::test]
async fn scenario_c_lock_ttl_expiry() {
    let store = SharedMemoryStore::new();

    let lock = MemoryEntry::new(EntryKind::Lock, serde_json::json!({"resource": "repo"}))
        .in_namespace("coordination")
        .with_ttl(Duration::from_millis(100));
    let lock_id = store.store(lock).await.unwrap();

    assert!(store.retrieve(&lock_id).await.unwrap().is_some());

    sleep(Duration::from_millis(150)).await;
    store.perform_maintenance().await.unwrap();

    assert!(store.retrieve(&lock_id).await.unwrap().is_none());
}

/// Scenario D: five items, three racing stealers; at most five handed out
/// and reconciliation leaves exactly one owner per item.
#[tokio::test]
async fn scenario_d_work_stealing_race() {
    let store = Arc::new(SharedMemoryStore::new());
    let pools = Arc::new(WorkPoolCoordinator::new());

    let items: Vec<WorkItem> = (0..5)
        .map(|i| WorkItem::new(format!("item-{}", i), format!("unit {}", i), CapabilityTier::Standard))
        .collect();
    pools.create_pool(&store, "shared", items).await.unwrap();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let store = store.clone();
            let pools = pools.clone();
            tokio::spawn(async move {
                let me = AgentId::new(format!("agent-{}", i));
                let mut claimed = Vec::new();
                while let Some(assignment) = pools
                    .steal(&store, "shared", &me, AgentType::Generalist)
                    .await
                    .unwrap()
                {
                    claimed.push(assignment);
                }
                claimed
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let total: usize = results.iter().map(|r| r.as_ref().unwrap().len()).sum();
    assert!(total <= 5, "cannot distribute more than the pool held");

    // After reconciliation every item has exactly one owner
    for i in 0..5 {
        let item_id = format!("item-{}", i);
        let winner = pools.reconcile(&store, "shared", &item_id).await.unwrap();
        assert!(winner.is_some(), "item {} must end with an owner", item_id);
        let claims = pools.assignments_for(&store, "shared", &item_id).await.unwrap();
        assert_eq!(claims.len(), 1, "item {} must have exactly one claim", item_id);
    }
}

/// Scenario E: a task with max_retries=2 fails twice on a resource timeout,
/// then succeeds; the history shows both failed->queued retries followed by
/// a terminal completed.
#[tokio::test]
async fn scenario_e_retry_budget_then_success() {
    let ctx = CoordinationContext::new();
    let sched = Scheduler::new(SchedulerConfig {
        resource_timeout: Duration::from_millis(0),
        ..SchedulerConfig::default()
    });
    let agent = AgentId::new("agent-1");

    let holder = ctx
        .graph
        .create_task(
            "swarm",
            TaskSpec::new("holder", "build", "holds prod-db").requires(ResourceRequirement::exclusive("prod-db")),
        )
        .await
        .unwrap();
    let mut spec =
        TaskSpec::new("waiter", "deploy", "needs prod-db").requires(ResourceRequirement::exclusive("prod-db"));
    spec.constraints.max_retries = 2;
    let waiter = ctx.graph.create_task("swarm", spec).await.unwrap();

    // Two ticks while the holder sits on the resource: two timeout failures,
    // each consumed by the retry budget
    sched.tick(&ctx).await.unwrap();
    sched.tick(&ctx).await.unwrap();

    let mid = ctx.graph.get_task(&waiter.id).await.unwrap();
    assert_eq!(mid.status, TaskStatus::Queued);
    assert_eq!(mid.failure_count(), 2);

    // Holder finishes; the waiter gets the resource on the next tick
    sched.start_task(&ctx, &holder.id, &agent).await.unwrap();
    sched.complete_task(&ctx, &holder.id, &agent).await.unwrap();

    sched.tick(&ctx).await.unwrap();
    sched.start_task(&ctx, &waiter.id, &agent).await.unwrap();
    sched.complete_task(&ctx, &waiter.id, &agent).await.unwrap();

    let done = ctx.graph.get_task(&waiter.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let retries: Vec<_> = done
        .status_history
        .iter()
        .filter(|c| c.from == TaskStatus::Failed && c.to == TaskStatus::Queued)
        .collect();
    assert_eq!(retries.len(), 2, "history must show both failed->queued retries");
    assert_eq!(done.status_history.last().unwrap().to, TaskStatus::Completed);
}
