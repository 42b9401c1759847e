//! Property checks for the pure parts of the engine: the process state
//! machine, rule selection and the condition language.

use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

use procflow_core::models::{ApprovalMode, GatewayKind, NodeTemplate, ProcessTemplate, RuleTemplate};
use procflow_core::rules::{Environment, Expression, RuleEvaluator};
use procflow_core::state_machine::process_state_machine::determine_target_state;
use procflow_core::state_machine::{ProcessEvent, ProcessStatus};

fn process_event() -> impl Strategy<Value = ProcessEvent> {
    prop_oneof![
        Just(ProcessEvent::Start),
        Just(ProcessEvent::Suspend(None)),
        Just(ProcessEvent::Resume),
        Just(ProcessEvent::Complete),
        Just(ProcessEvent::Terminate("stop".into())),
        Just(ProcessEvent::Reject("no".into())),
        Just(ProcessEvent::Cancel("gone".into())),
        Just(ProcessEvent::Withdraw),
    ]
}

fn router() -> ProcessTemplate {
    ProcessTemplate::new("router", "Router")
        .with_node(NodeTemplate::start("start"))
        .with_node(NodeTemplate::gateway("gate", GatewayKind::Exclusive))
        .with_node(NodeTemplate::task("big", "Big", ["director"], ApprovalMode::Any))
        .with_node(NodeTemplate::task("medium", "Medium", ["manager"], ApprovalMode::Any))
        .with_node(NodeTemplate::task("small", "Small", ["clerk"], ApprovalMode::Any))
        .with_node(NodeTemplate::end("end"))
        .with_rule(RuleTemplate::always("start", "gate", 1))
        .with_rule(RuleTemplate::when("gate", "big", 1, "amount > 1000"))
        .with_rule(RuleTemplate::when("gate", "medium", 2, "amount > 100"))
        .with_rule(RuleTemplate::otherwise("gate", "small"))
        .with_rule(RuleTemplate::always("big", "end", 1))
        .with_rule(RuleTemplate::always("medium", "end", 1))
        .with_rule(RuleTemplate::always("small", "end", 1))
}

proptest! {
    #[test]
    fn process_walks_stay_on_the_state_graph(events in prop::collection::vec(process_event(), 1..30)) {
        let mut status = ProcessStatus::Pending;
        for event in &events {
            match determine_target_state(status, event) {
                Some(next) => {
                    prop_assert!(!status.is_terminal(), "left terminal state {status}");
                    if next == ProcessStatus::Running {
                        prop_assert!(matches!(status, ProcessStatus::Pending | ProcessStatus::Suspended));
                    }
                    if matches!(next, ProcessStatus::Completed | ProcessStatus::Rejected) {
                        prop_assert_eq!(status, ProcessStatus::Running);
                    }
                    status = next;
                }
                None => {}
            }
        }
    }

    #[test]
    fn terminal_states_accept_no_event(event in process_event()) {
        for status in [
            ProcessStatus::Completed,
            ProcessStatus::Terminated,
            ProcessStatus::Rejected,
            ProcessStatus::Cancelled,
        ] {
            prop_assert_eq!(determine_target_state(status, &event), None);
        }
    }

    #[test]
    fn exclusive_routing_is_deterministic(amount in -10_000i64..10_000) {
        let (nodes, rules) = router().instantiate(Uuid::new_v4()).unwrap();
        let key_of = |id: Uuid| nodes.iter().find(|n| n.node_id == id).unwrap().template_key.clone();
        let gate = nodes.iter().find(|n| n.template_key == "gate").unwrap();

        let mut variables = BTreeMap::new();
        variables.insert("amount".to_string(), json!(amount));
        let business = json!({});
        let env = Environment::new(&variables, &business);

        let evaluator = RuleEvaluator::new();
        let first = evaluator.select_next(gate, &rules, &env).unwrap();
        let mut shuffled = rules.clone();
        shuffled.reverse();
        let second = evaluator.select_next(gate, &shuffled, &env).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.len(), 1);

        let expected = if amount > 1000 {
            "big"
        } else if amount > 100 {
            "medium"
        } else {
            "small"
        };
        prop_assert_eq!(key_of(first[0]), expected);
    }

    #[test]
    fn numeric_comparisons_match_rust(a in -1_000i64..1_000, b in -1_000i64..1_000) {
        let mut variables = BTreeMap::new();
        variables.insert("a".to_string(), json!(a));
        variables.insert("b".to_string(), json!(b));
        let business = json!({});
        let env = Environment::new(&variables, &business);

        let check = |source: &str, expected: bool| -> Result<(), TestCaseError> {
            let expr = Expression::parse(source).map_err(|e| TestCaseError::fail(e.to_string()))?;
            let actual = expr.evaluate(&env).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(actual, expected, "{}", source);
            Ok(())
        };
        check("a > b", a > b)?;
        check("a >= b", a >= b)?;
        check("a < b", a < b)?;
        check("a <= b", a <= b)?;
        check("a == b", a == b)?;
        check("a != b", a != b)?;
        check("a > b && b > 0", a > b && b > 0)?;
        check("a > b || b > 0", a > b || b > 0)?;
    }

    #[test]
    fn parser_never_panics(source in "\\PC{0,40}") {
        let _ = Expression::parse(&source);
    }
}
