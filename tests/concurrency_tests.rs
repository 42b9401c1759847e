mod common;

use common::*;
use std::collections::HashSet;

use procflow_core::models::{ApprovalMode, HistoryAction};
use procflow_core::orchestration::{NewProcess, ProcessManager};
use procflow_core::state_machine::{ProcessStatus, TaskStatus};
use procflow_core::WorkflowError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_completions_apply_once() {
    let manager = ProcessManager::in_memory();
    let process_id = create_and_start(
        &manager,
        &single_review(&["bob", "carol", "dave"], ApprovalMode::Any),
        NewProcess::named("Race"),
    )
    .await;
    let task_id = open_task(&manager, process_id).await.task_id;

    let handles: Vec<_> = ["bob", "carol", "dave", "bob"]
        .into_iter()
        .map(|operator| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .task_scheduler()
                    .complete_task(task_id, operator, None, None)
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(WorkflowError::InvalidStateTransition { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1);

    let task = manager.task_scheduler().get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.actions.len(), 1);
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Completed);

    let actions = history_actions(&manager, process_id).await;
    let count = |action: HistoryAction| actions.iter().filter(|a| **a == action).count();
    assert_eq!(count(HistoryAction::TaskCompleted), 1);
    assert_eq!(count(HistoryAction::ProcessCompleted), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_mode_approvals_from_parallel_callers() {
    let manager = ProcessManager::in_memory();
    let assignees = ["a1", "a2", "a3", "a4", "a5"];
    let process_id = create_and_start(
        &manager,
        &single_review(&assignees, ApprovalMode::All),
        NewProcess::named("Committee"),
    )
    .await;
    let task_id = open_task(&manager, process_id).await.task_id;

    let handles: Vec<_> = assignees
        .into_iter()
        .map(|operator| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .task_scheduler()
                    .complete_task(task_id, operator, None, None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let task = manager.task_scheduler().get(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let acted: HashSet<&str> = task.actions.iter().map(|a| a.assignee.as_str()).collect();
    assert_eq!(acted.len(), assignees.len());
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_branches_join_once() {
    let manager = ProcessManager::in_memory();
    let process_id = create_and_start(&manager, &parallel_review(), NewProcess::named("Branches")).await;
    let tasks = open_tasks(&manager, process_id).await;
    assert_eq!(tasks.len(), 2);

    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let manager = manager.clone();
            let operator = task.assignees[0].clone();
            tokio::spawn(async move {
                manager
                    .task_scheduler()
                    .complete_task(task.task_id, &operator, None, None)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Completed);
    let nodes = manager.node_engine().process_nodes(process_id).await.unwrap();
    let join = nodes.iter().find(|n| n.template_key == "join").unwrap();
    assert_eq!(join.incoming_completed, 2);

    let actions = history_actions(&manager, process_id).await;
    let completions = actions
        .iter()
        .filter(|a| **a == HistoryAction::ProcessCompleted)
        .count();
    assert_eq!(completions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_races_with_completion() {
    let manager = ProcessManager::in_memory();
    let process_id = create_and_start(&manager, &parallel_review(), NewProcess::named("Contested")).await;
    let task = open_tasks(&manager, process_id).await.remove(0);
    let operator = task.assignees[0].clone();

    let completing = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .task_scheduler()
                .complete_task(task.task_id, &operator, None, None)
                .await
        })
    };
    let terminating = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.terminate(process_id, "budget cut", OWNER).await })
    };

    let _ = completing.await.unwrap();
    terminating.await.unwrap().unwrap();

    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Terminated);
    assert!(open_tasks(&manager, process_id).await.is_empty());
    assert_eq!(
        history_actions(&manager, process_id).await.last(),
        Some(&HistoryAction::ProcessTerminated)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_processes_progress_concurrently() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let manager = manager.clone();
            let template = template.clone();
            tokio::spawn(async move {
                let process = manager
                    .create(&template, NewProcess::named(format!("Batch {i}")), OWNER)
                    .await?;
                manager.start(process.process_id, OWNER).await?;
                let tasks = manager.task_scheduler().process_tasks(process.process_id).await?;
                manager
                    .task_scheduler()
                    .complete_task(tasks[0].task_id, "bob", None, None)
                    .await?;
                manager.get(process.process_id).await
            })
        })
        .collect();

    for handle in handles {
        let process = handle.await.unwrap().unwrap();
        assert_eq!(process.status, ProcessStatus::Completed);
        let records = history(&manager, process.process_id).await;
        assert!(records.iter().all(|r| r.process_id == process.process_id));
        for pair in records.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_processes_release_lock_and_cursor_entries() {
    let manager = ProcessManager::in_memory();
    let template = single_review(&["bob"], ApprovalMode::Any);
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(create_and_start(&manager, &template, NewProcess::named(format!("Batch {i}"))).await);
    }
    assert_eq!(manager.tracked_locks(), 8);
    assert_eq!(manager.history().tracked_processes(), 8);

    let mut handles = Vec::new();
    for (i, process_id) in ids.iter().copied().enumerate() {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let task_id = open_task(&manager, process_id).await.task_id;
                manager
                    .task_scheduler()
                    .complete_task(task_id, "bob", None, None)
                    .await
                    .map(|_| ())
            } else {
                manager.terminate(process_id, "batch closed", OWNER).await.map(|_| ())
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for process_id in &ids {
        assert!(manager.get(*process_id).await.unwrap().is_terminal());
    }
    assert_eq!(manager.tracked_locks(), 0);
    assert_eq!(manager.history().tracked_processes(), 0);

    let records = history(&manager, ids[0]).await;
    assert!(records.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));
    assert_eq!(records.last().map(|r| r.action), Some(HistoryAction::ProcessCompleted));
}

#[tokio::test]
async fn test_idle_locks_of_running_processes_are_released() {
    let manager = ProcessManager::in_memory();
    let process_id = create_and_start(&manager, &single_review(&["bob"], ApprovalMode::Any), NewProcess::named("Idle")).await;
    assert_eq!(manager.tracked_locks(), 1);
    assert_eq!(manager.release_idle_locks(), 1);
    assert_eq!(manager.tracked_locks(), 0);

    // A fresh entry is created on demand
    let task_id = open_task(&manager, process_id).await.task_id;
    manager
        .task_scheduler()
        .complete_task(task_id, "bob", None, None)
        .await
        .unwrap();
    assert_eq!(manager.get(process_id).await.unwrap().status, ProcessStatus::Completed);
}
