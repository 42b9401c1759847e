use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

use procflow_core::models::{ApprovalMode, GatewayKind, NodeTemplate, ProcessTemplate, RuleTemplate};
use procflow_core::rules::{Environment, Expression, RuleEvaluator};

const CONDITION: &str = "amount > 1000 && business.region == \"emea\" || priority >= 3";

fn router(branches: i32) -> ProcessTemplate {
    let mut template = ProcessTemplate::new("bench", "Bench")
        .with_node(NodeTemplate::start("start"))
        .with_node(NodeTemplate::gateway("gate", GatewayKind::Exclusive))
        .with_node(NodeTemplate::end("end"))
        .with_rule(RuleTemplate::always("start", "gate", 1))
        .with_rule(RuleTemplate::otherwise("gate", "end"));
    for i in 0..branches {
        let key = format!("branch_{i}");
        template = template
            .with_node(NodeTemplate::task(key.clone(), key.clone(), ["bench"], ApprovalMode::Any))
            .with_rule(RuleTemplate::when("gate", key.clone(), i, format!("amount > {}", (branches - i) * 100)))
            .with_rule(RuleTemplate::always(key, "end", 1));
    }
    template
}

fn benchmark_parse(c: &mut Criterion) {
    c.bench_function("expression_parse", |b| {
        b.iter(|| Expression::parse(black_box(CONDITION)))
    });
}

fn benchmark_evaluate(c: &mut Criterion) {
    let expr = Expression::parse(CONDITION).unwrap();
    let mut variables = BTreeMap::new();
    variables.insert("amount".to_string(), json!(1500));
    variables.insert("priority".to_string(), json!(1));
    let business = json!({ "region": "emea" });
    let env = Environment::new(&variables, &business);

    c.bench_function("expression_evaluate", |b| {
        b.iter(|| expr.evaluate(black_box(&env)))
    });
}

fn benchmark_select_next(c: &mut Criterion) {
    let (nodes, rules) = router(20).instantiate(Uuid::new_v4()).unwrap();
    let gate = nodes.iter().find(|n| n.template_key == "gate").unwrap().clone();
    let evaluator = RuleEvaluator::new();
    let mut variables = BTreeMap::new();
    variables.insert("amount".to_string(), json!(50));
    let business = json!({});
    let env = Environment::new(&variables, &business);

    c.bench_function("select_next_20_rules", |b| {
        b.iter(|| evaluator.select_next(black_box(&gate), black_box(&rules), &env))
    });
}

criterion_group!(benches, benchmark_parse, benchmark_evaluate, benchmark_select_next);
criterion_main!(benches);
