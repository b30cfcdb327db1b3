//! Join pushdown behavior: equi-clause derivation, outer-to-inner
//! normalization, degenerate join predicates, dynamic filter synthesis, and
//! the semi and spatial join rules.

use optx_plan::allocator::{PlanNodeIdAllocator, VariableAllocator};
use optx_plan::catalog::InMemoryMetadata;
use optx_plan::expr::{extract_conjuncts, BinaryOp, Expr, UnaryOp};
use optx_plan::optimizer::PlanOptimizer;
use optx_plan::plan::*;
use optx_plan::session::{Session, WarningCollector};
use optx_plan::simplify::ExpressionEquivalence;
use optx_plan::types::{DataType, ScalarValue, TableRef, Variable};
use optx_pushdown::dynamic_filters::{
    dynamic_filter_comparison, dynamic_filter_id, dynamic_filter_probe, extract_dynamic_filters,
};
use optx_pushdown::PredicatePushDown;
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

fn join(
    id: u64,
    join_type: JoinType,
    left: Arc<PlanNode>,
    right: Arc<PlanNode>,
    criteria: Vec<EquiJoinClause>,
    join_filter: Option<Expr>,
) -> Arc<PlanNode> {
    let mut outputs = left.output_variables();
    outputs.extend(right.output_variables());
    Arc::new(PlanNode::Join(JoinNode {
        id: PlanNodeId(id),
        join_type,
        left,
        right,
        criteria,
        outputs,
        filter: join_filter,
        distribution: None,
        spillable: false,
        dynamic_filters: Default::default(),
    }))
}

fn optimize(plan: &Arc<PlanNode>) -> Arc<PlanNode> {
    optimize_with(plan, false, false)
}

fn optimize_with(
    plan: &Arc<PlanNode>,
    dynamic_filtering: bool,
    session_dynamic_filtering: bool,
) -> Arc<PlanNode> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let pass = PredicatePushDown::new(
        Arc::new(InMemoryMetadata::new()),
        false,
        dynamic_filtering,
    );
    let session = Session::new("test").with_dynamic_filtering(session_dynamic_filtering);
    let mut variables = VariableAllocator::new();
    let mut ids = PlanNodeIdAllocator::starting_at(100);
    let mut warnings = WarningCollector::new();
    pass.optimize(plan.clone(), &session, &mut variables, &mut ids, &mut warnings)
        .expect("predicate pushdown failed")
}

fn equivalent(left: &Expr, right: &Expr) -> bool {
    ExpressionEquivalence::new().are_equivalent(left, right)
}

/// Identity projections are bookkeeping the pass re-installs around rebuilt
/// joins; step over them to reach the interesting shape.
fn skip_identity_projections(node: &Arc<PlanNode>) -> &Arc<PlanNode> {
    let mut current = node;
    while let PlanNode::Project(project) = current.as_ref() {
        if !project.is_identity() {
            break;
        }
        current = &project.source;
    }
    current
}

fn expect_filter(node: &PlanNode) -> &FilterNode {
    match node {
        PlanNode::Filter(n) => n,
        other => panic!("expected filter, got {other:?}"),
    }
}

fn expect_join(node: &PlanNode) -> &JoinNode {
    match node {
        PlanNode::Join(n) => n,
        other => panic!("expected join, got {other:?}"),
    }
}

#[test]
fn inner_join_derives_equi_clause_and_per_side_filters() {
    let left = scan(0, "l", &["l_k", "l_v"]);
    let right = scan(1, "r", &["r_k", "r_v"]);
    let plan = filter(
        3,
        join(2, JoinType::Inner, left.clone(), right.clone(), vec![], None),
        Expr::And(vec![
            Expr::equals(var("l_k"), var("r_k")),
            Expr::binary(BinaryOp::Gt, var("l_v"), int(5)),
            Expr::binary(BinaryOp::Lt, var("r_v"), int(9)),
        ]),
    );

    let optimized = optimize(&plan);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(
        join.criteria,
        vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))]
    );
    assert_eq!(join.filter, None);

    let left_filter = expect_filter(skip_identity_projections(&join.left));
    assert!(equivalent(
        &left_filter.predicate,
        &Expr::binary(BinaryOp::Gt, var("l_v"), int(5)),
    ));
    assert!(Arc::ptr_eq(&left_filter.source, &left));

    let right_filter = expect_filter(skip_identity_projections(&join.right));
    assert!(equivalent(
        &right_filter.predicate,
        &Expr::binary(BinaryOp::Lt, var("r_v"), int(9)),
    ));
    assert!(Arc::ptr_eq(&right_filter.source, &right));
}

#[test]
fn null_rejecting_predicate_promotes_left_join_to_inner() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let plan = filter(
        3,
        join(
            2,
            JoinType::Left,
            left,
            right,
            vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))],
            None,
        ),
        Expr::unary(UnaryOp::IsNotNull, var("r_k")),
    );

    let optimized = optimize(&plan);

    // The inherited conjunct is consumed: through the join equality it
    // reaches both inputs and nothing remains above the join.
    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(join.join_type, JoinType::Inner);
    assert_eq!(
        join.criteria,
        vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))]
    );

    let left_filter = expect_filter(skip_identity_projections(&join.left));
    assert!(equivalent(
        &left_filter.predicate,
        &Expr::unary(UnaryOp::IsNotNull, var("l_k")),
    ));
    let right_filter = expect_filter(skip_identity_projections(&join.right));
    assert!(equivalent(
        &right_filter.predicate,
        &Expr::unary(UnaryOp::IsNotNull, var("r_k")),
    ));
}

#[test]
fn full_join_narrows_one_side_per_null_rejection() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let plan = filter(
        3,
        join(
            2,
            JoinType::Full,
            left,
            right,
            vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))],
            None,
        ),
        Expr::unary(UnaryOp::IsNotNull, var("l_k")),
    );

    let optimized = optimize(&plan);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(join.join_type, JoinType::Left);
}

#[test]
fn full_join_promotes_to_inner_when_both_sides_are_null_rejected() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let plan = filter(
        3,
        join(
            2,
            JoinType::Full,
            left,
            right,
            vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))],
            None,
        ),
        Expr::And(vec![
            Expr::unary(UnaryOp::IsNotNull, var("l_k")),
            Expr::unary(UnaryOp::IsNotNull, var("r_k")),
        ]),
    );

    let optimized = optimize(&plan);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(join.join_type, JoinType::Inner);
}

#[test]
fn false_join_predicate_is_replaced_by_a_constant_comparison() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let plan = join(
        2,
        JoinType::Full,
        left,
        right,
        vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))],
        Some(Expr::false_literal()),
    );

    let optimized = optimize(&plan);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(join.join_type, JoinType::Full);
    assert!(join.criteria.is_empty());
    assert_eq!(join.filter, Some(Expr::equals(int(0), int(1))));
}

#[test]
fn inner_join_without_equi_clauses_folds_the_filter_above() {
    let left = scan(0, "l", &["l_a"]);
    let right = scan(1, "r", &["r_b"]);
    let residual = Expr::binary(BinaryOp::Lt, var("l_a"), var("r_b"));
    let plan = join(
        2,
        JoinType::Inner,
        left,
        right,
        vec![],
        Some(residual.clone()),
    );

    let optimized = optimize(&plan);

    // No equi-clause means no hash join to evaluate the filter in; it runs
    // above a nested-loops join instead.
    let above = expect_filter(&optimized);
    assert!(equivalent(&above.predicate, &residual));
    let join = expect_join(&above.source);
    assert!(join.criteria.is_empty());
    assert_eq!(join.filter, None);
}

#[test]
fn nondeterministic_conjuncts_land_on_the_join_filter() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let nondeterministic = Expr::binary(
        BinaryOp::Lt,
        Expr::call("random", vec![]),
        Expr::Literal(ScalarValue::Float64(0.5.into())),
    );
    let plan = filter(
        3,
        join(2, JoinType::Inner, left, right, vec![], None),
        Expr::And(vec![
            Expr::equals(var("l_k"), var("r_k")),
            nondeterministic.clone(),
        ]),
    );

    let optimized = optimize(&plan);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(
        join.criteria,
        vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))]
    );
    assert_eq!(join.filter, Some(nondeterministic));
    // Neither side received a copy.
    assert!(!matches!(
        skip_identity_projections(&join.left).as_ref(),
        PlanNode::Filter(_)
    ));
    assert!(!matches!(
        skip_identity_projections(&join.right).as_ref(),
        PlanNode::Filter(_)
    ));
}

#[test]
fn compound_equality_sides_get_projected_onto_fresh_variables() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let plan = filter(
        3,
        join(2, JoinType::Inner, left, right, vec![], None),
        Expr::equals(
            Expr::binary(BinaryOp::Add, var("l_k"), int(1)),
            var("r_k"),
        ),
    );

    let optimized = optimize(&plan);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(join.criteria.len(), 1);
    let clause = &join.criteria[0];
    assert_eq!(clause.right, bigint("r_k"));
    // The left side of the clause is a synthesized variable computed by a
    // projection below the join.
    assert_ne!(clause.left, bigint("l_k"));
    let PlanNode::Project(left_project) = join.left.as_ref() else {
        panic!("expected projection on the left input");
    };
    assert_eq!(
        left_project.assignments.get(&clause.left),
        Some(&Expr::binary(BinaryOp::Add, var("l_k"), int(1))),
    );
}

#[test]
fn dynamic_filters_are_synthesized_per_equi_clause_and_range_conjunct() {
    let left = scan(0, "l", &["l_k", "l_a"]);
    let right = scan(1, "r", &["r_k", "r_b"]);
    let plan = filter(
        3,
        join(2, JoinType::Inner, left, right, vec![], None),
        Expr::And(vec![
            Expr::equals(var("l_k"), var("r_k")),
            Expr::binary(BinaryOp::Lt, var("l_a"), var("r_b")),
        ]),
    );

    let optimized = optimize_with(&plan, true, true);

    let join = expect_join(skip_identity_projections(&optimized));
    assert_eq!(join.dynamic_filters.len(), 2);

    let left_filter = expect_filter(skip_identity_projections(&join.left));
    let split = extract_dynamic_filters(&left_filter.predicate);
    assert_eq!(split.dynamic_conjuncts.len(), 2);
    assert!(split.static_conjuncts.is_empty());

    for placeholder in &split.dynamic_conjuncts {
        let id = dynamic_filter_id(placeholder).expect("placeholder carries an id");
        let probe = dynamic_filter_probe(placeholder).expect("placeholder carries a probe");
        let build = join
            .dynamic_filters
            .get(id)
            .expect("join registers the placeholder id");
        match probe.name.as_str() {
            "l_k" => {
                assert_eq!(build, &bigint("r_k"));
                assert!(dynamic_filter_comparison(placeholder).is_none());
            }
            "l_a" => {
                assert_eq!(build, &bigint("r_b"));
                assert_eq!(
                    dynamic_filter_comparison(placeholder),
                    Some(&Expr::binary(BinaryOp::Lt, var("l_a"), var("r_b"))),
                );
            }
            other => panic!("unexpected probe variable {other}"),
        }
    }
}

#[test]
fn reversed_range_conjuncts_flip_the_dynamic_filter_comparison() {
    let left = scan(0, "l", &["l_k", "l_a"]);
    let right = scan(1, "r", &["r_k", "r_b"]);
    let plan = filter(
        3,
        join(2, JoinType::Inner, left, right, vec![], None),
        Expr::And(vec![
            Expr::equals(var("l_k"), var("r_k")),
            Expr::binary(BinaryOp::Lt, var("r_b"), var("l_a")),
        ]),
    );

    let optimized = optimize_with(&plan, true, true);

    let join = expect_join(skip_identity_projections(&optimized));
    let left_filter = expect_filter(skip_identity_projections(&join.left));
    let split = extract_dynamic_filters(&left_filter.predicate);
    let range = split
        .dynamic_conjuncts
        .iter()
        .find(|p| dynamic_filter_comparison(p).is_some())
        .expect("a range dynamic filter was synthesized");
    assert_eq!(dynamic_filter_probe(range), Some(&bigint("l_a")));
    assert_eq!(
        dynamic_filter_comparison(range),
        Some(&Expr::binary(BinaryOp::Gt, var("l_a"), var("r_b"))),
    );
}

#[test]
fn left_joins_do_not_get_dynamic_filters() {
    let left = scan(0, "l", &["l_k"]);
    let right = scan(1, "r", &["r_k"]);
    let plan = join(
        2,
        JoinType::Left,
        left,
        right,
        vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))],
        None,
    );

    let optimized = optimize_with(&plan, true, true);

    let join = expect_join(skip_identity_projections(&optimized));
    assert!(join.dynamic_filters.is_empty());
}

#[test]
fn non_filtering_semi_join_pushes_conjuncts_to_the_source_side() {
    let source = scan(0, "s", &["s_k", "s_v"]);
    let filtering = scan(1, "f", &["f_k"]);
    let semi = Arc::new(PlanNode::SemiJoin(SemiJoinNode {
        id: PlanNodeId(2),
        source: source.clone(),
        filtering_source: filtering.clone(),
        source_join_variable: bigint("s_k"),
        filtering_source_join_variable: bigint("f_k"),
        semi_join_output: Variable::new("matched", DataType::Boolean),
        distribution: None,
        dynamic_filter_id: None,
    }));
    let nondeterministic = Expr::binary(
        BinaryOp::Lt,
        Expr::call("random", vec![]),
        Expr::Literal(ScalarValue::Float64(0.5.into())),
    );
    let plan = filter(
        3,
        semi,
        Expr::And(vec![
            Expr::binary(BinaryOp::Gt, var("s_v"), int(5)),
            nondeterministic.clone(),
        ]),
    );

    let optimized = optimize(&plan);

    let PlanNode::SemiJoin(semi) = optimized.as_ref() else {
        panic!("expected semi join at the root, got {optimized:?}");
    };
    // Each source row appears exactly once in the output, so even the
    // non-deterministic conjunct moved down.
    let pushed = expect_filter(&semi.source);
    let conjuncts = extract_conjuncts(&pushed.predicate);
    assert!(conjuncts.contains(&Expr::binary(BinaryOp::Gt, var("s_v"), int(5))));
    assert!(conjuncts.contains(&nondeterministic));
    assert!(Arc::ptr_eq(&semi.filtering_source, &filtering));
}

#[test]
fn filtering_semi_join_keeps_the_marker_above_and_installs_a_dynamic_filter() {
    let source = scan(0, "s", &["s_k", "s_v"]);
    let filtering = scan(1, "f", &["f_k"]);
    let marker = Variable::new("matched", DataType::Boolean);
    let semi = Arc::new(PlanNode::SemiJoin(SemiJoinNode {
        id: PlanNodeId(2),
        source,
        filtering_source: filtering,
        source_join_variable: bigint("s_k"),
        filtering_source_join_variable: bigint("f_k"),
        semi_join_output: marker.clone(),
        distribution: None,
        dynamic_filter_id: None,
    }));
    let plan = filter(
        3,
        semi,
        Expr::And(vec![
            Expr::Variable(marker.clone()),
            Expr::binary(BinaryOp::Gt, var("s_v"), int(5)),
        ]),
    );

    let optimized = optimize_with(&plan, true, true);

    let above = expect_filter(&optimized);
    assert_eq!(above.predicate, Expr::Variable(marker));
    let PlanNode::SemiJoin(semi) = above.source.as_ref() else {
        panic!("expected semi join below the marker filter");
    };
    let installed_id = semi
        .dynamic_filter_id
        .as_deref()
        .expect("a dynamic filter id was installed");

    let pushed = expect_filter(&semi.source);
    let split = extract_dynamic_filters(&pushed.predicate);
    assert_eq!(split.dynamic_conjuncts.len(), 1);
    assert_eq!(
        dynamic_filter_id(&split.dynamic_conjuncts[0]),
        Some(installed_id)
    );
    assert_eq!(
        dynamic_filter_probe(&split.dynamic_conjuncts[0]),
        Some(&bigint("s_k"))
    );
    assert!(split
        .static_conjuncts
        .contains(&Expr::binary(BinaryOp::Gt, var("s_v"), int(5))));
}

#[test]
fn filtering_semi_join_transfers_effective_predicates_across_the_join_key() {
    let source = scan(0, "s", &["s_k"]);
    let filtering = filter(
        2,
        scan(1, "f", &["f_k"]),
        Expr::binary(BinaryOp::Gt, var("f_k"), int(10)),
    );
    let marker = Variable::new("matched", DataType::Boolean);
    let semi = Arc::new(PlanNode::SemiJoin(SemiJoinNode {
        id: PlanNodeId(3),
        source,
        filtering_source: filtering,
        source_join_variable: bigint("s_k"),
        filtering_source_join_variable: bigint("f_k"),
        semi_join_output: marker.clone(),
        distribution: None,
        dynamic_filter_id: None,
    }));
    let plan = filter(4, semi, Expr::Variable(marker));

    let optimized = optimize(&plan);

    let above = expect_filter(&optimized);
    let PlanNode::SemiJoin(semi) = above.source.as_ref() else {
        panic!("expected semi join below the marker filter");
    };
    let pushed = expect_filter(&semi.source);
    assert!(equivalent(
        &pushed.predicate,
        &Expr::binary(BinaryOp::Gt, var("s_k"), int(10)),
    ));
}

#[test]
fn left_spatial_join_promotes_to_inner_and_pushes_per_side_conjuncts() {
    let left = scan(0, "l", &["l_x", "l_g"]);
    let right = scan(1, "r", &["r_g"]);
    let spatial = Arc::new(PlanNode::SpatialJoin(SpatialJoinNode {
        id: PlanNodeId(2),
        join_type: SpatialJoinType::Left,
        left: left.clone(),
        right: right.clone(),
        outputs: vec![bigint("l_x"), bigint("l_g"), bigint("r_g")],
        filter: Expr::call("st_contains", vec![var("l_g"), var("r_g")]),
        left_partition_variable: None,
        right_partition_variable: None,
        kdb_tree: None,
    }));
    let plan = filter(
        3,
        spatial,
        Expr::And(vec![
            Expr::unary(UnaryOp::IsNotNull, var("r_g")),
            Expr::binary(BinaryOp::Gt, var("l_x"), int(0)),
        ]),
    );

    let optimized = optimize(&plan);

    let PlanNode::SpatialJoin(spatial) = optimized.as_ref() else {
        panic!("expected spatial join at the root, got {optimized:?}");
    };
    assert_eq!(spatial.join_type, SpatialJoinType::Inner);
    assert_eq!(
        spatial.filter,
        Expr::call("st_contains", vec![var("l_g"), var("r_g")])
    );

    let left_filter = expect_filter(skip_identity_projections(&spatial.left));
    assert!(equivalent(
        &left_filter.predicate,
        &Expr::binary(BinaryOp::Gt, var("l_x"), int(0)),
    ));
    let right_filter = expect_filter(skip_identity_projections(&spatial.right));
    assert!(equivalent(
        &right_filter.predicate,
        &Expr::unary(UnaryOp::IsNotNull, var("r_g")),
    ));
}

#[test]
fn effective_predicates_migrate_across_an_inner_join() {
    let left = filter(
        1,
        scan(0, "l", &["l_k"]),
        Expr::binary(BinaryOp::Gt, var("l_k"), int(100)),
    );
    let right = scan(2, "r", &["r_k"]);
    let plan = join(
        3,
        JoinType::Inner,
        left,
        right.clone(),
        vec![EquiJoinClause::new(bigint("l_k"), bigint("r_k"))],
        None,
    );

    let optimized = optimize(&plan);

    // The left-side restriction implies, through the join equality, the same
    // restriction on the right side.
    let join = expect_join(skip_identity_projections(&optimized));
    let right_filter = expect_filter(skip_identity_projections(&join.right));
    assert!(equivalent(
        &right_filter.predicate,
        &Expr::binary(BinaryOp::Gt, var("r_k"), int(100)),
    ));
}

#[test]
fn repeated_application_is_structurally_stable() {
    let left = scan(0, "l", &["l_k", "l_v"]);
    let right = scan(1, "r", &["r_k", "r_v"]);
    let plan = filter(
        3,
        join(2, JoinType::Inner, left, right, vec![], None),
        Expr::And(vec![
            Expr::equals(var("l_k"), var("r_k")),
            Expr::binary(BinaryOp::Gt, var("l_v"), int(5)),
            Expr::binary(BinaryOp::Lt, var("r_v"), int(9)),
        ]),
    );

    let once = optimize(&plan);
    let twice = optimize(&once);
    assert_eq!(once, twice);
}

#[test]
fn repeated_application_is_stable_with_dynamic_filters() {
    let left = scan(0, "l", &["l_k", "l_a"]);
    let right = scan(1, "r", &["r_k", "r_b"]);
    let plan = filter(
        3,
        join(2, JoinType::Inner, left, right, vec![], None),
        Expr::And(vec![
            Expr::equals(var("l_k"), var("r_k")),
            Expr::binary(BinaryOp::Lt, var("l_a"), var("r_b")),
        ]),
    );

    let once = optimize_with(&plan, true, true);
    let twice = optimize_with(&once, true, true);
    assert_eq!(once, twice);
}
