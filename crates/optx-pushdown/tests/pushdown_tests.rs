//! Per-operator predicate pushdown behavior: projections, windows,
//! aggregations, set operations, and the operators that block or pass
//! predicates through unchanged.

use optx_plan::allocator::{PlanNodeIdAllocator, VariableAllocator};
use optx_plan::catalog::InMemoryMetadata;
use optx_plan::error::OptimizerError;
use optx_plan::expr::{extract_conjuncts, BinaryOp, Expr};
use optx_plan::optimizer::PlanOptimizer;
use optx_plan::plan::*;
use optx_plan::session::{Session, WarningCollector};
use optx_plan::simplify::ExpressionEquivalence;
use optx_plan::types::{DataType, ScalarValue, TableRef, Variable};
use optx_pushdown::dynamic_filters::dynamic_filter_expression;
use optx_pushdown::PredicatePushDown;
use std::collections::BTreeMap;
use std::sync::Arc;

fn bigint(name: &str) -> Variable {
    Variable::new(name, DataType::Bigint)
}

fn var(name: &str) -> Expr {
    Expr::Variable(bigint(name))
}

fn int(v: i64) -> Expr {
    Expr::Literal(ScalarValue::Int64(v))
}

fn gt(left: Expr, right: Expr) -> Expr {
    Expr::binary(BinaryOp::Gt, left, right)
}

fn scan(id: u64, table: &str, columns: &[&str]) -> Arc<PlanNode> {
    Arc::new(PlanNode::TableScan(TableScanNode {
        id: PlanNodeId(id),
        table: TableRef::new("test", table),
        outputs: columns.iter().map(|c| bigint(c)).collect(),
        predicate: None,
    }))
}

fn filter(id: u64, source: Arc<PlanNode>, predicate: Expr) -> Arc<PlanNode> {
    Arc::new(PlanNode::Filter(FilterNode {
        id: PlanNodeId(id),
        source,
        predicate,
    }))
}

fn optimize(plan: &Arc<PlanNode>) -> Arc<PlanNode> {
    optimize_with(plan, false)
}

fn optimize_with(plan: &Arc<PlanNode>, dynamic_filtering: bool) -> Arc<PlanNode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let pass = PredicatePushDown::new(
        Arc::new(InMemoryMetadata::new()),
        false,
        dynamic_filtering,
    );
    let session = Session::new("test");
    let mut variables = VariableAllocator::new();
    let mut ids = PlanNodeIdAllocator::starting_at(100);
    let mut warnings = WarningCollector::new();
    pass.optimize(plan.clone(), &session, &mut variables, &mut ids, &mut warnings)
        .expect("predicate pushdown failed")
}

fn equivalent(left: &Expr, right: &Expr) -> bool {
    ExpressionEquivalence::new().are_equivalent(left, right)
}

fn expect_filter(node: &PlanNode) -> &FilterNode {
    match node {
        PlanNode::Filter(n) => n,
        other => panic!("expected filter, got {other:?}"),
    }
}

#[test]
fn predicate_moves_through_projection_with_inlining() {
    let source = scan(0, "t", &["x", "y"]);
    let mut assignments = Assignments::new();
    assignments.put(bigint("a"), var("x"));
    assignments.put(bigint("b"), var("y"));
    let project = Arc::new(PlanNode::Project(ProjectNode {
        id: PlanNodeId(1),
        source: source.clone(),
        assignments,
    }));
    let plan = filter(
        2,
        project,
        gt(Expr::binary(BinaryOp::Add, var("a"), var("b")), int(10)),
    );

    let optimized = optimize(&plan);

    let PlanNode::Project(project) = optimized.as_ref() else {
        panic!("expected projection at the root, got {optimized:?}");
    };
    let pushed = expect_filter(&project.source);
    assert!(equivalent(
        &pushed.predicate,
        &gt(Expr::binary(BinaryOp::Add, var("x"), var("y")), int(10)),
    ));
    assert!(Arc::ptr_eq(&pushed.source, &source));
}

#[test]
fn window_passes_partition_conjuncts_and_blocks_the_rest() {
    let window = Arc::new(PlanNode::Window(WindowNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["part", "other"]),
        partition_by: vec![bigint("part")],
        order_by: vec![],
        functions: vec![WindowFunction {
            output: bigint("rnk"),
            function: "rank".into(),
            args: vec![],
        }],
    }));
    let plan = filter(
        3,
        window,
        Expr::And(vec![
            Expr::equals(var("part"), int(7)),
            gt(var("other"), int(0)),
        ]),
    );

    let optimized = optimize(&plan);

    let above = expect_filter(&optimized);
    assert!(equivalent(&above.predicate, &gt(var("other"), int(0))));
    let PlanNode::Window(window) = above.source.as_ref() else {
        panic!("expected window below the residual filter");
    };
    let below = expect_filter(&window.source);
    assert!(equivalent(&below.predicate, &Expr::equals(var("part"), int(7))));
}

#[test]
fn aggregation_pushes_grouping_key_conjuncts_only() {
    let aggregation = Arc::new(PlanNode::Aggregation(AggregationNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["g", "v"]),
        aggregations: vec![Aggregation {
            output: bigint("cnt"),
            func: AggFunc::Count,
            arg: None,
            distinct: false,
        }],
        grouping_sets: GroupingSetDescriptor::single(vec![bigint("g")]),
        step: AggregationStep::Single,
        group_id_variable: None,
    }));
    let plan = filter(
        3,
        aggregation,
        Expr::And(vec![Expr::equals(var("g"), int(3)), gt(var("cnt"), int(10))]),
    );

    let optimized = optimize(&plan);

    let above = expect_filter(&optimized);
    assert!(equivalent(&above.predicate, &gt(var("cnt"), int(10))));
    let PlanNode::Aggregation(aggregation) = above.source.as_ref() else {
        panic!("expected aggregation below the residual filter");
    };
    let below = expect_filter(&aggregation.source);
    assert!(equivalent(&below.predicate, &Expr::equals(var("g"), int(3))));
}

#[test]
fn global_aggregation_blocks_pushdown_entirely() {
    let aggregation = Arc::new(PlanNode::Aggregation(AggregationNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["v"]),
        aggregations: vec![Aggregation {
            output: bigint("cnt"),
            func: AggFunc::Count,
            arg: None,
            distinct: false,
        }],
        grouping_sets: GroupingSetDescriptor::single(vec![]),
        step: AggregationStep::Single,
        group_id_variable: None,
    }));
    let plan = filter(3, aggregation, gt(var("cnt"), int(10)));

    let optimized = optimize(&plan);

    // Nothing can move, and the reconstructed filter collapses back to the
    // original node.
    assert!(Arc::ptr_eq(&optimized, &plan));
}

#[test]
fn union_translates_the_predicate_into_each_source() {
    let s1 = scan(1, "s1", &["a"]);
    let s2 = scan(2, "s2", &["b"]);
    let mut mapping = BTreeMap::new();
    mapping.insert(bigint("out"), vec![bigint("a"), bigint("b")]);
    let union = Arc::new(PlanNode::Union(UnionNode {
        id: PlanNodeId(3),
        sources: vec![s1, s2],
        outputs: vec![bigint("out")],
        variable_mapping: mapping,
    }));
    let plan = filter(4, union, gt(var("out"), int(0)));

    let optimized = optimize(&plan);

    let PlanNode::Union(union) = optimized.as_ref() else {
        panic!("expected union at the root, got {optimized:?}");
    };
    let first = expect_filter(&union.sources[0]);
    assert!(equivalent(&first.predicate, &gt(var("a"), int(0))));
    let second = expect_filter(&union.sources[1]);
    assert!(equivalent(&second.predicate, &gt(var("b"), int(0))));
}

#[test]
fn exchange_translates_the_predicate_by_column_position() {
    let exchange = Arc::new(PlanNode::Exchange(ExchangeNode {
        id: PlanNodeId(2),
        kind: ExchangeKind::Repartition,
        sources: vec![scan(1, "t", &["a"])],
        outputs: vec![bigint("out")],
        inputs: vec![vec![bigint("a")]],
    }));
    let plan = filter(3, exchange, gt(var("out"), int(0)));

    let optimized = optimize(&plan);

    let PlanNode::Exchange(exchange) = optimized.as_ref() else {
        panic!("expected exchange at the root, got {optimized:?}");
    };
    let pushed = expect_filter(&exchange.sources[0]);
    assert!(equivalent(&pushed.predicate, &gt(var("a"), int(0))));
}

#[test]
fn mark_distinct_passes_conjuncts_over_distinct_keys() {
    let mark = Arc::new(PlanNode::MarkDistinct(MarkDistinctNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["k", "other"]),
        marker: Variable::new("is_distinct", DataType::Boolean),
        distinct_variables: vec![bigint("k")],
    }));
    let plan = filter(
        3,
        mark,
        Expr::And(vec![Expr::equals(var("k"), int(1)), gt(var("other"), int(2))]),
    );

    let optimized = optimize(&plan);

    let above = expect_filter(&optimized);
    assert!(equivalent(&above.predicate, &gt(var("other"), int(2))));
    let PlanNode::MarkDistinct(mark) = above.source.as_ref() else {
        panic!("expected mark distinct below the residual filter");
    };
    let below = expect_filter(&mark.source);
    assert!(equivalent(&below.predicate, &Expr::equals(var("k"), int(1))));
}

#[test]
fn group_id_pushes_only_common_grouping_columns() {
    let g_a = bigint("ga");
    let g_b = bigint("gb");
    let mut grouping_columns = BTreeMap::new();
    grouping_columns.insert(g_a.clone(), bigint("a_in"));
    grouping_columns.insert(g_b.clone(), bigint("b_in"));
    let group_id = Arc::new(PlanNode::GroupId(GroupIdNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["a_in", "b_in"]),
        grouping_sets: vec![vec![g_a.clone(), g_b.clone()], vec![g_a.clone()]],
        grouping_columns,
        aggregation_arguments: vec![],
        group_id_variable: bigint("gid"),
    }));
    let plan = filter(
        3,
        group_id,
        Expr::And(vec![
            Expr::equals(var("ga"), int(5)),
            Expr::equals(var("gb"), int(6)),
        ]),
    );

    let optimized = optimize(&plan);

    let above = expect_filter(&optimized);
    assert!(equivalent(&above.predicate, &Expr::equals(var("gb"), int(6))));
    let PlanNode::GroupId(group_id) = above.source.as_ref() else {
        panic!("expected group id below the residual filter");
    };
    let below = expect_filter(&group_id.source);
    assert!(equivalent(&below.predicate, &Expr::equals(var("a_in"), int(5))));
}

#[test]
fn unnest_pushes_conjuncts_over_replicated_columns() {
    let mut unnest_variables = BTreeMap::new();
    unnest_variables.insert(bigint("arr"), vec![bigint("elem")]);
    let unnest = Arc::new(PlanNode::Unnest(UnnestNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["r", "arr"]),
        replicate_variables: vec![bigint("r")],
        unnest_variables,
        ordinality_variable: None,
    }));
    let plan = filter(
        3,
        unnest,
        Expr::And(vec![Expr::equals(var("r"), int(1)), gt(var("elem"), int(5))]),
    );

    let optimized = optimize(&plan);

    let above = expect_filter(&optimized);
    assert!(equivalent(&above.predicate, &gt(var("elem"), int(5))));
    let PlanNode::Unnest(unnest) = above.source.as_ref() else {
        panic!("expected unnest below the residual filter");
    };
    let below = expect_filter(&unnest.source);
    assert!(equivalent(&below.predicate, &Expr::equals(var("r"), int(1))));
}

#[test]
fn try_conjuncts_never_cross_a_projection() {
    let mut assignments = Assignments::new();
    assignments.put(bigint("a"), var("x"));
    let project = Arc::new(PlanNode::Project(ProjectNode {
        id: PlanNodeId(1),
        source: scan(0, "t", &["x"]),
        assignments,
    }));
    let plan = filter(2, project, Expr::equals(Expr::call("try", vec![var("a")]), int(1)));

    let optimized = optimize(&plan);

    // The conjunct stays above the projection, and the reconstructed filter
    // collapses back to the original node.
    assert!(Arc::ptr_eq(&optimized, &plan));
}

#[test]
fn sort_and_sample_are_transparent() {
    let sort = Arc::new(PlanNode::Sort(SortNode {
        id: PlanNodeId(2),
        source: Arc::new(PlanNode::Sample(SampleNode {
            id: PlanNodeId(1),
            source: scan(0, "t", &["x"]),
            sample_type: SampleType::Bernoulli,
            sample_ratio: 0.1.into(),
        })),
        order_by: vec![SortItem {
            variable: bigint("x"),
            ascending: true,
            nulls_first: false,
        }],
    }));
    let plan = filter(3, sort, gt(var("x"), int(1)));

    let optimized = optimize(&plan);

    let PlanNode::Sort(sort) = optimized.as_ref() else {
        panic!("expected sort at the root, got {optimized:?}");
    };
    let PlanNode::Sample(sample) = sort.source.as_ref() else {
        panic!("expected sample below the sort");
    };
    let pushed = expect_filter(&sample.source);
    assert!(equivalent(&pushed.predicate, &gt(var("x"), int(1))));
}

#[test]
fn assign_unique_id_passes_predicates_over_other_columns() {
    let assign = Arc::new(PlanNode::AssignUniqueId(AssignUniqueIdNode {
        id: PlanNodeId(1),
        source: scan(0, "t", &["x"]),
        id_variable: bigint("uid"),
    }));
    let plan = filter(2, assign, Expr::equals(var("x"), int(1)));

    let optimized = optimize(&plan);

    let PlanNode::AssignUniqueId(assign) = optimized.as_ref() else {
        panic!("expected assign unique id at the root, got {optimized:?}");
    };
    let pushed = expect_filter(&assign.source);
    assert!(equivalent(&pushed.predicate, &Expr::equals(var("x"), int(1))));
}

#[test]
fn predicate_over_the_generated_id_column_is_rejected() {
    let assign = Arc::new(PlanNode::AssignUniqueId(AssignUniqueIdNode {
        id: PlanNodeId(1),
        source: scan(0, "t", &["x"]),
        id_variable: bigint("uid"),
    }));
    let plan = filter(2, assign, Expr::equals(var("uid"), int(1)));

    let pass = PredicatePushDown::new(Arc::new(InMemoryMetadata::new()), false, false);
    let session = Session::new("test");
    let mut variables = VariableAllocator::new();
    let mut ids = PlanNodeIdAllocator::starting_at(100);
    let mut warnings = WarningCollector::new();
    let result = pass.optimize(plan, &session, &mut variables, &mut ids, &mut warnings);

    assert!(matches!(result, Err(OptimizerError::ScopeViolation(_))));
}

#[test]
fn cte_scan_passes_a_pure_dynamic_filter_predicate_through() {
    let cte = Arc::new(PlanNode::CteScan(CteScanNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["x"]),
        cte_name: "cte1".into(),
        outputs: vec![bigint("x")],
    }));
    let df_predicate = dynamic_filter_expression("7", bigint("x"), None);
    let plan = filter(3, cte, df_predicate.clone());

    let optimized = optimize_with(&plan, true);

    let PlanNode::CteScan(cte) = optimized.as_ref() else {
        panic!("expected cte scan at the root, got {optimized:?}");
    };
    let pushed = expect_filter(&cte.source);
    assert_eq!(pushed.predicate, df_predicate);
}

#[test]
fn cte_scan_blocks_predicates_with_static_conjuncts() {
    let cte = Arc::new(PlanNode::CteScan(CteScanNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["x"]),
        cte_name: "cte1".into(),
        outputs: vec![bigint("x")],
    }));
    let plan = filter(
        3,
        cte,
        Expr::And(vec![
            dynamic_filter_expression("7", bigint("x"), None),
            gt(var("x"), int(5)),
        ]),
    );

    let optimized = optimize_with(&plan, true);

    assert!(Arc::ptr_eq(&optimized, &plan));
}

#[test]
fn nondeterministic_conjuncts_stay_above_a_window() {
    let window = Arc::new(PlanNode::Window(WindowNode {
        id: PlanNodeId(2),
        source: scan(1, "t", &["part"]),
        partition_by: vec![bigint("part")],
        order_by: vec![],
        functions: vec![WindowFunction {
            output: bigint("rnk"),
            function: "rank".into(),
            args: vec![],
        }],
    }));
    let nondeterministic = Expr::binary(
        BinaryOp::Lt,
        Expr::call("random", vec![]),
        Expr::Literal(ScalarValue::Float64(0.5.into())),
    );
    let plan = filter(3, window, nondeterministic.clone());

    let optimized = optimize(&plan);

    // random() mentions no non-partition column, but non-determinism alone
    // pins it above the window.
    assert!(Arc::ptr_eq(&optimized, &plan));
}

#[test]
fn a_second_pass_leaves_the_plan_untouched() {
    let source = scan(0, "t", &["x", "y"]);
    let mut assignments = Assignments::new();
    assignments.put(bigint("a"), var("x"));
    assignments.put(bigint("b"), var("y"));
    let project = Arc::new(PlanNode::Project(ProjectNode {
        id: PlanNodeId(1),
        source,
        assignments,
    }));
    let plan = filter(
        2,
        project,
        gt(Expr::binary(BinaryOp::Add, var("a"), var("b")), int(10)),
    );

    let once = optimize(&plan);
    let twice = optimize(&once);

    assert_eq!(once, twice);

    let conjuncts_once: Vec<Expr> = collect_filter_predicates(&once)
        .iter()
        .flat_map(|p| extract_conjuncts(p))
        .collect();
    let conjuncts_twice: Vec<Expr> = collect_filter_predicates(&twice)
        .iter()
        .flat_map(|p| extract_conjuncts(p))
        .collect();
    assert_eq!(conjuncts_once, conjuncts_twice);
}

fn collect_filter_predicates(node: &Arc<PlanNode>) -> Vec<Expr> {
    let mut predicates = Vec::new();
    if let PlanNode::Filter(f) = node.as_ref() {
        predicates.push(f.predicate.clone());
    }
    for source in node.sources() {
        predicates.extend(collect_filter_predicates(source));
    }
    predicates
}
