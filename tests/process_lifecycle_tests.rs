mod common;

use chrono::{Duration, Utc};
use common::*;
use serde_json::json;

use procflow_core::error::WorkflowError;
use procflow_core::events::EventType;
use procflow_core::models::{ApprovalMode, HistoryAction, NodeTemplate, NodeType, ProcessUpdate};
use procflow_core::orchestration::{NewProcess, ProcessManager};
use procflow_core::state_machine::{NodeStatus, ProcessStatus, TaskStatus};
use procflow_core::store::{PageRequest, ProcessFilter};

#[tokio::test]
async fn test_start_single_task_process() {
    let manager = ProcessManager::in_memory();
    let recorder = record_all(&manager).await;
    let template = single_review_with(
        NodeTemplate::task("review", "Review", ["bob"], ApprovalMode::Any).with_due_in(24 * 3600),
    );

    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense #1")).await;

    let process = manager.get(process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Running);
    assert!(process.started_at.is_some());

    let nodes = manager.node_engine().process_nodes(process_id).await.unwrap();
    let review = nodes.iter().find(|n| n.template_key == "review").unwrap();
    assert_eq!(review.status, NodeStatus::Active);
    let start = nodes.iter().find(|n| n.node_type == NodeType::Start).unwrap();
    assert_eq!(start.status, NodeStatus::Completed);

    let task = open_task(&manager, process_id).await;
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assignees, vec!["bob".to_string()]);
    let due = task.due_date.expect("due date");
    assert!(due > Utc::now() + Duration::hours(23));

    assert_eq!(
        history_actions(&manager, process_id).await,
        vec![
            HistoryAction::ProcessCreated,
            HistoryAction::ProcessStarted,
            HistoryAction::NodeStarted,
            HistoryAction::NodeCompleted,
            HistoryAction::NodeStarted,
            HistoryAction::TaskCreated,
        ]
    );
    assert_eq!(
        recorder.types_for(process_id),
        vec![
            EventType::ProcessStarted,
            EventType::NodeStarted,
            EventType::NodeCompleted,
            EventType::NodeStarted,
            EventType::TaskCreated,
            EventType::TaskAssigned,
        ]
    );
}

#[tokio::test]
async fn test_completing_task_advances_to_end() {
    let manager = ProcessManager::in_memory();
    let recorder = record_all(&manager).await;
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense #2")).await;
    let task = open_task(&manager, process_id).await;
    recorder.clear();

    let task = manager
        .task_scheduler()
        .complete_task(task.task_id, "bob", Some("approved".into()), None)
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.actions[0].comment.as_deref(), Some("approved"));

    let review = manager.node_engine().get(task.node_id).await.unwrap();
    assert_eq!(review.status, NodeStatus::Completed);
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Completed);

    let types = recorder.types_for(process_id);
    assert_eq!(
        types,
        vec![
            EventType::TaskCompleted,
            EventType::NodeCompleted,
            EventType::NodeStarted,
            EventType::NodeCompleted,
            EventType::ProcessCompleted,
        ]
    );
    let node_completed = &recorder.events()[1];
    assert_eq!(node_completed.node_id, Some(review.node_id));
    assert!(node_completed.next_node_id.is_some());
}

#[tokio::test]
async fn test_suspension_blocks_task_completion() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense #3")).await;
    let task = open_task(&manager, process_id).await;
    let recorder = record_all(&manager).await;

    let suspended = manager
        .suspend(process_id, Some("awaiting external input".into()), OWNER)
        .await
        .unwrap();
    assert_eq!(suspended.status, ProcessStatus::Suspended);
    assert_eq!(suspended.suspend_reason.as_deref(), Some("awaiting external input"));

    let err = manager
        .task_scheduler()
        .complete_task(task.task_id, "bob", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));

    let err = manager
        .node_engine()
        .complete(task.node_id, None, OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));

    // Nothing moved while suspended
    assert_eq!(open_task(&manager, process_id).await.status, TaskStatus::Assigned);

    let resumed = manager.resume(process_id, OWNER).await.unwrap();
    assert_eq!(resumed.status, ProcessStatus::Running);
    assert!(resumed.suspend_reason.is_none());
    assert_eq!(
        recorder.types_for(process_id),
        vec![EventType::ProcessSuspended, EventType::ProcessResumed]
    );

    manager
        .task_scheduler()
        .complete_task(task.task_id, "bob", None, None)
        .await
        .unwrap();
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Completed);
}

#[tokio::test]
async fn test_terminate_cascades_to_open_tasks_and_nodes() {
    let manager = ProcessManager::in_memory();
    let recorder = record_all(&manager).await;
    let process_id = create_and_start(&manager, &parallel_review(), NewProcess::named("Contract")).await;
    assert_eq!(open_tasks(&manager, process_id).await.len(), 2);
    recorder.clear();

    let process = manager
        .terminate(process_id, "contract withdrawn by vendor", OWNER)
        .await
        .unwrap();
    assert_eq!(process.status, ProcessStatus::Terminated);
    assert_eq!(process.end_reason.as_deref(), Some("contract withdrawn by vendor"));

    let tasks = manager.task_scheduler().process_tasks(process_id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Cancelled));

    let nodes = manager.node_engine().process_nodes(process_id).await.unwrap();
    for key in ["legal", "finance"] {
        let node = nodes.iter().find(|n| n.template_key == key).unwrap();
        assert_eq!(node.status, NodeStatus::Cancelled, "{key}");
    }
    assert!(nodes.iter().all(|n| n.status != NodeStatus::Active));

    let actions = history_actions(&manager, process_id).await;
    let tail: Vec<_> = actions[actions.len() - 5..].to_vec();
    assert_eq!(
        tail,
        vec![
            HistoryAction::TaskCancelled,
            HistoryAction::TaskCancelled,
            HistoryAction::NodeCancelled,
            HistoryAction::NodeCancelled,
            HistoryAction::ProcessTerminated,
        ]
    );
    assert_eq!(
        recorder.types_for(process_id),
        vec![
            EventType::TaskCancelled,
            EventType::TaskCancelled,
            EventType::NodeCancelled,
            EventType::NodeCancelled,
            EventType::ProcessTerminated,
        ]
    );
}

#[tokio::test]
async fn test_terminate_requires_reason() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense")).await;

    let err = manager.terminate(process_id, "  ", OWNER).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Running);
    assert_eq!(open_tasks(&manager, process_id).await.len(), 1);
}

#[tokio::test]
async fn test_terminal_states_are_final() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense")).await;
    manager.cancel(process_id, "duplicate request", OWNER).await.unwrap();

    assert!(manager.start(process_id, OWNER).await.is_err());
    assert!(manager.resume(process_id, OWNER).await.is_err());
    assert!(manager.terminate(process_id, "again", OWNER).await.is_err());
    assert!(manager.suspend(process_id, None, OWNER).await.is_err());
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_pending_process() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create(&manager, &template, NewProcess::named("Never started")).await;

    let process = manager.cancel(process_id, "not needed", OWNER).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Cancelled);
    assert!(open_tasks(&manager, process_id).await.is_empty());
}

#[tokio::test]
async fn test_reject_and_rejecting_end() {
    let manager = ProcessManager::in_memory();
    let template = approve_or_reject("bob");

    let process_id = create_and_start(&manager, &template, NewProcess::named("Leave #1")).await;
    let task = open_task(&manager, process_id).await;
    manager
        .task_scheduler()
        .complete_task(task.task_id, "bob", Some("no budget".into()), Some("deny".into()))
        .await
        .unwrap();
    let process = manager.get(process_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Rejected);
    assert!(process.end_reason.unwrap().contains("rejected"));

    let other = create_and_start(&manager, &template, NewProcess::named("Leave #2")).await;
    let process = manager.reject(other, "policy violation", OWNER).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Rejected);
    assert_eq!(open_task_count(&manager, other).await, 0);
}

async fn open_task_count(manager: &ProcessManager, process_id: uuid::Uuid) -> usize {
    open_tasks(manager, process_id).await.len()
}

#[tokio::test]
async fn test_withdraw_is_owner_only() {
    let manager = ProcessManager::in_memory();
    let recorder = record_all(&manager).await;
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense")).await;

    let err = manager.withdraw(process_id, "mallory").await.unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    let process = manager.withdraw(process_id, OWNER).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Cancelled);
    assert_eq!(
        recorder.types_for(process_id).last(),
        Some(&EventType::ProcessWithdraw)
    );
    assert_eq!(
        history_actions(&manager, process_id).await.last(),
        Some(&HistoryAction::ProcessWithdrawn)
    );
}

#[tokio::test]
async fn test_explicit_complete() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create_and_start(&manager, &template, NewProcess::named("Expense")).await;

    let err = manager.complete(process_id, OWNER).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));

    let task = open_task(&manager, process_id).await;
    manager
        .task_scheduler()
        .complete_task(task.task_id, "bob", None, None)
        .await
        .unwrap();

    // Completing an already Completed process is accepted without new history
    let before = history(&manager, process_id).await.len();
    let process = manager.complete(process_id, OWNER).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Completed);
    assert_eq!(history(&manager, process_id).await.len(), before);
}

#[tokio::test]
async fn test_update_and_delete() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let process_id = create(&manager, &template, NewProcess::named("Draft").with_variable("amount", json!(10))).await;

    let update = ProcessUpdate {
        name: Some("Expense #9".into()),
        variables: Some([("amount".to_string(), json!(20))].into_iter().collect()),
        ..Default::default()
    };
    let process = manager.update(process_id, update, OWNER).await.unwrap();
    assert_eq!(process.name, "Expense #9");
    assert_eq!(process.variables["amount"], json!(20));

    let err = manager
        .update(process_id, ProcessUpdate::default(), OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));

    manager.start(process_id, OWNER).await.unwrap();
    assert!(manager.delete(process_id).await.is_err());

    manager.terminate(process_id, "cleanup", OWNER).await.unwrap();
    manager.delete(process_id).await.unwrap();
    assert!(matches!(
        manager.get(process_id).await,
        Err(WorkflowError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_list_and_count_processes() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    for i in 0..5 {
        let id = create(&manager, &template, NewProcess::named(format!("Expense {i}"))).await;
        if i % 2 == 0 {
            manager.start(id, OWNER).await.unwrap();
        }
    }

    let running = ProcessFilter {
        status: Some(ProcessStatus::Running),
        ..Default::default()
    };
    assert_eq!(manager.count(&running).await.unwrap(), 3);
    assert_eq!(manager.count(&ProcessFilter::default()).await.unwrap(), 5);

    let first = manager.list(&ProcessFilter::default(), &PageRequest::first(2)).await.unwrap();
    assert_eq!(first.items.len(), 2);
    let cursor = first.next_cursor.expect("more pages");
    let second = manager
        .list(&ProcessFilter::default(), &PageRequest::after(cursor, 10))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 3);
    assert!(second.next_cursor.is_none());
    assert!(first
        .items
        .iter()
        .all(|p| second.items.iter().all(|q| q.process_id != p.process_id)));
}

#[tokio::test]
async fn test_create_rejects_invalid_template() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any).with_node(NodeTemplate::start("second_start"));
    let err = manager
        .create(&template, NewProcess::named("Broken"), OWNER)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Validation(_)));
    assert_eq!(manager.count(&ProcessFilter::default()).await.unwrap(), 0);
}
