//! # Plan Tree
//!
//! The logical plan is a tree of relational operator nodes. Nodes are
//! immutable values; optimizer passes produce new trees that share unchanged
//! subtrees by reference (`Arc`), so `Arc::ptr_eq` on a rewritten child tells
//! a pass whether anything underneath actually changed. New node identities
//! are minted only when a pass creates a genuinely new node (e.g., a residual
//! filter); replacing the children of an existing node keeps its identity.
//!
//! Each node declares its output as an ordered list of [`Variable`]s. The
//! scope invariant of the planner is that every free variable of every
//! expression attached to a node is contained in the output of the node's
//! inputs at that position.

use crate::expr::Expr;
use crate::types::{TableRef, Variable};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a plan node, unique within one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub u64);

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SQL join types.
///
/// The join type determines which side's rows survive without a match and
/// therefore which predicates may cross the join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    /// Inner join: only matching rows from both sides.
    Inner,
    /// Left outer join: all rows from left, matching from right (or NULLs).
    Left,
    /// Right outer join: all rows from right, matching from left (or NULLs).
    Right,
    /// Full outer join: all rows from both sides, NULLs where no match.
    Full,
}

impl JoinType {
    /// Join types that can only execute with partitioned inputs.
    pub fn must_partition(&self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }

    /// Join types that can only execute with a replicated build side when
    /// they carry no equi-clauses.
    pub fn must_replicate(&self, criteria: &[EquiJoinClause]) -> bool {
        criteria.is_empty() && matches!(self, JoinType::Inner | JoinType::Left)
    }
}

/// Spatial join types. Only inner and left spatial joins exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpatialJoinType {
    Inner,
    Left,
}

/// How join inputs are distributed across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionType {
    Partitioned,
    Replicated,
}

/// A hashable join condition: a pair of variables, one per side, known equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EquiJoinClause {
    pub left: Variable,
    pub right: Variable,
}

impl EquiJoinClause {
    pub fn new(left: Variable, right: Variable) -> Self {
        Self { left, right }
    }
}

/// Ordered output-variable-to-expression assignments of a projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignments {
    entries: Vec<(Variable, Expr)>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity assignments for the given variables, in order.
    pub fn identity<I>(variables: I) -> Self
    where
        I: IntoIterator<Item = Variable>,
    {
        let entries = variables
            .into_iter()
            .map(|v| (v.clone(), Expr::Variable(v)))
            .collect();
        Self { entries }
    }

    /// Add an assignment, replacing any previous entry for the same output.
    pub fn put(&mut self, output: Variable, expr: Expr) {
        if let Some(entry) = self.entries.iter_mut().find(|(v, _)| *v == output) {
            entry.1 = expr;
        } else {
            self.entries.push((output, expr));
        }
    }

    pub fn get(&self, output: &Variable) -> Option<&Expr> {
        self.entries
            .iter()
            .find(|(v, _)| v == output)
            .map(|(_, e)| e)
    }

    pub fn outputs(&self) -> Vec<Variable> {
        self.entries.iter().map(|(v, _)| v.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Expr)> {
        self.entries.iter().map(|(v, e)| (v, e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The assignments as a substitution mapping output variables to their
    /// defining expressions.
    pub fn as_map(&self) -> BTreeMap<Variable, Expr> {
        self.entries.iter().cloned().collect()
    }
}

impl FromIterator<(Variable, Expr)> for Assignments {
    fn from_iter<I: IntoIterator<Item = (Variable, Expr)>>(iter: I) -> Self {
        let mut assignments = Assignments::new();
        for (v, e) in iter {
            assignments.put(v, e);
        }
        assignments
    }
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate call producing one output variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub output: Variable,
    pub func: AggFunc,
    pub arg: Option<Expr>,
    pub distinct: bool,
}

/// Execution step of an aggregation in a distributed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregationStep {
    Single,
    Partial,
    Final,
}

/// Grouping structure of an aggregation.
///
/// `global_grouping_sets` lists the indices of grouping sets that contain no
/// grouping keys. A global grouping set produces an output row even for empty
/// input, which blocks predicate pushdown below the aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingSetDescriptor {
    pub grouping_keys: Vec<Variable>,
    pub grouping_set_count: usize,
    pub global_grouping_sets: Vec<usize>,
}

impl GroupingSetDescriptor {
    /// Grouping over a single set of keys.
    pub fn single(grouping_keys: Vec<Variable>) -> Self {
        let global = if grouping_keys.is_empty() { vec![0] } else { vec![] };
        Self {
            grouping_keys,
            grouping_set_count: 1,
            global_grouping_sets: global,
        }
    }

    pub fn has_empty_grouping_set(&self) -> bool {
        !self.global_grouping_sets.is_empty() || self.grouping_keys.is_empty()
    }
}

/// Sort key with direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortItem {
    pub variable: Variable,
    pub ascending: bool,
    pub nulls_first: bool,
}

/// One window function call producing one output variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowFunction {
    pub output: Variable,
    pub function: String,
    pub args: Vec<Expr>,
}

/// Sampling methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleType {
    Bernoulli,
    System,
}

/// Exchange flavors in a distributed plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    Gather,
    Repartition,
    Replicate,
}

/// A source of rows with a declared output schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableScanNode {
    pub id: PlanNodeId,
    pub table: TableRef,
    pub outputs: Vec<Variable>,
    /// Predicate already pushed into the connector; holds on every produced row.
    pub predicate: Option<Expr>,
}

/// Applies a predicate to its child, discarding non-matching rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub predicate: Expr,
}

/// Computes output expressions from its child's columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub assignments: Assignments,
}

impl ProjectNode {
    /// Whether every assignment is `output := output`.
    pub fn is_identity(&self) -> bool {
        self.assignments
            .iter()
            .all(|(v, e)| matches!(e, Expr::Variable(inner) if inner == v))
    }
}

/// Combines two relations on equi-clauses and an optional residual filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinNode {
    pub id: PlanNodeId,
    pub join_type: JoinType,
    pub left: Arc<PlanNode>,
    pub right: Arc<PlanNode>,
    pub criteria: Vec<EquiJoinClause>,
    pub outputs: Vec<Variable>,
    pub filter: Option<Expr>,
    pub distribution: Option<DistributionType>,
    pub spillable: bool,
    /// Dynamic filter id to build-side variable.
    pub dynamic_filters: BTreeMap<String, Variable>,
}

/// Joins two relations on a mandatory spatial predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialJoinNode {
    pub id: PlanNodeId,
    pub join_type: SpatialJoinType,
    pub left: Arc<PlanNode>,
    pub right: Arc<PlanNode>,
    pub outputs: Vec<Variable>,
    pub filter: Expr,
    pub left_partition_variable: Option<Variable>,
    pub right_partition_variable: Option<Variable>,
    /// Serialized spatial index used to partition both sides.
    pub kdb_tree: Option<String>,
}

/// Marks each source row with whether its join variable appears in the
/// filtering source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemiJoinNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub filtering_source: Arc<PlanNode>,
    pub source_join_variable: Variable,
    pub filtering_source_join_variable: Variable,
    pub semi_join_output: Variable,
    pub distribution: Option<DistributionType>,
    pub dynamic_filter_id: Option<String>,
}

/// Groups rows and computes aggregate functions per group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub aggregations: Vec<Aggregation>,
    pub grouping_sets: GroupingSetDescriptor,
    pub step: AggregationStep,
    pub group_id_variable: Option<Variable>,
}

/// Concatenates N sources, mapping each output variable to one variable per
/// source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionNode {
    pub id: PlanNodeId,
    pub sources: Vec<Arc<PlanNode>>,
    pub outputs: Vec<Variable>,
    /// Output variable to its corresponding variable in each source, indexed
    /// like `sources`.
    pub variable_mapping: BTreeMap<Variable, Vec<Variable>>,
}

impl UnionNode {
    /// The output-to-source-variable substitution for one source.
    pub fn source_variable_map(&self, source_index: usize) -> BTreeMap<Variable, Expr> {
        self.variable_mapping
            .iter()
            .map(|(output, inputs)| {
                (output.clone(), Expr::Variable(inputs[source_index].clone()))
            })
            .collect()
    }
}

/// Redistributes rows between stages of a distributed plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeNode {
    pub id: PlanNodeId,
    pub kind: ExchangeKind,
    pub sources: Vec<Arc<PlanNode>>,
    pub outputs: Vec<Variable>,
    /// Per-source input columns, positionally aligned with `outputs`.
    pub inputs: Vec<Vec<Variable>>,
}

impl ExchangeNode {
    /// The output-to-source-variable substitution for one source.
    pub fn source_variable_map(&self, source_index: usize) -> BTreeMap<Variable, Expr> {
        self.outputs
            .iter()
            .zip(self.inputs[source_index].iter())
            .map(|(output, input)| (output.clone(), Expr::Variable(input.clone())))
            .collect()
    }
}

/// Evaluates window functions over partitions of its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub partition_by: Vec<Variable>,
    pub order_by: Vec<SortItem>,
    pub functions: Vec<WindowFunction>,
}

/// Marks the first occurrence of each distinct key combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDistinctNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub marker: Variable,
    pub distinct_variables: Vec<Variable>,
}

/// Expands each input row once per grouping set, tagging rows with a group id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupIdNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    /// Grouping sets over output grouping variables.
    pub grouping_sets: Vec<Vec<Variable>>,
    /// Output grouping variable to the input variable it is copied from.
    pub grouping_columns: BTreeMap<Variable, Variable>,
    pub aggregation_arguments: Vec<Variable>,
    pub group_id_variable: Variable,
}

impl GroupIdNode {
    /// Grouping columns present in every grouping set. Predicates over these
    /// hold for every expanded row and may cross the node.
    pub fn common_grouping_columns(&self) -> Vec<Variable> {
        self.grouping_columns
            .keys()
            .filter(|column| self.grouping_sets.iter().all(|set| set.contains(column)))
            .cloned()
            .collect()
    }
}

/// Flattens collection-typed columns, replicating the remaining columns per
/// produced element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnnestNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub replicate_variables: Vec<Variable>,
    /// Collection column to the element columns it unnests into.
    pub unnest_variables: BTreeMap<Variable, Vec<Variable>>,
    pub ordinality_variable: Option<Variable>,
}

/// Extends each row with a generated unique id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignUniqueIdNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub id_variable: Variable,
}

/// Orders its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub order_by: Vec<SortItem>,
}

/// Samples a fraction of its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub sample_type: SampleType,
    pub sample_ratio: OrderedFloat<f64>,
}

/// Reads the materialized result of a common table expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CteScanNode {
    pub id: PlanNodeId,
    pub source: Arc<PlanNode>,
    pub cte_name: String,
    pub outputs: Vec<Variable>,
}

/// A relational operator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanNode {
    TableScan(TableScanNode),
    Filter(FilterNode),
    Project(ProjectNode),
    Join(JoinNode),
    SpatialJoin(SpatialJoinNode),
    SemiJoin(SemiJoinNode),
    Aggregation(AggregationNode),
    Union(UnionNode),
    Exchange(ExchangeNode),
    Window(WindowNode),
    MarkDistinct(MarkDistinctNode),
    GroupId(GroupIdNode),
    Unnest(UnnestNode),
    AssignUniqueId(AssignUniqueIdNode),
    Sort(SortNode),
    Sample(SampleNode),
    CteScan(CteScanNode),
}

impl PlanNode {
    pub fn id(&self) -> PlanNodeId {
        match self {
            PlanNode::TableScan(n) => n.id,
            PlanNode::Filter(n) => n.id,
            PlanNode::Project(n) => n.id,
            PlanNode::Join(n) => n.id,
            PlanNode::SpatialJoin(n) => n.id,
            PlanNode::SemiJoin(n) => n.id,
            PlanNode::Aggregation(n) => n.id,
            PlanNode::Union(n) => n.id,
            PlanNode::Exchange(n) => n.id,
            PlanNode::Window(n) => n.id,
            PlanNode::MarkDistinct(n) => n.id,
            PlanNode::GroupId(n) => n.id,
            PlanNode::Unnest(n) => n.id,
            PlanNode::AssignUniqueId(n) => n.id,
            PlanNode::Sort(n) => n.id,
            PlanNode::Sample(n) => n.id,
            PlanNode::CteScan(n) => n.id,
        }
    }

    /// The node's input subtrees, in order.
    pub fn sources(&self) -> Vec<&Arc<PlanNode>> {
        match self {
            PlanNode::TableScan(_) => vec![],
            PlanNode::Filter(n) => vec![&n.source],
            PlanNode::Project(n) => vec![&n.source],
            PlanNode::Join(n) => vec![&n.left, &n.right],
            PlanNode::SpatialJoin(n) => vec![&n.left, &n.right],
            PlanNode::SemiJoin(n) => vec![&n.source, &n.filtering_source],
            PlanNode::Aggregation(n) => vec![&n.source],
            PlanNode::Union(n) => n.sources.iter().collect(),
            PlanNode::Exchange(n) => n.sources.iter().collect(),
            PlanNode::Window(n) => vec![&n.source],
            PlanNode::MarkDistinct(n) => vec![&n.source],
            PlanNode::GroupId(n) => vec![&n.source],
            PlanNode::Unnest(n) => vec![&n.source],
            PlanNode::AssignUniqueId(n) => vec![&n.source],
            PlanNode::Sort(n) => vec![&n.source],
            PlanNode::Sample(n) => vec![&n.source],
            PlanNode::CteScan(n) => vec![&n.source],
        }
    }

    /// The node with its sources replaced, identity and all other fields kept.
    /// The replacement list must match `sources()` in length and order.
    pub fn replace_sources(&self, sources: &[Arc<PlanNode>]) -> PlanNode {
        match self {
            PlanNode::TableScan(n) => PlanNode::TableScan(n.clone()),
            PlanNode::Filter(n) => PlanNode::Filter(FilterNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::Project(n) => PlanNode::Project(ProjectNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::Join(n) => PlanNode::Join(JoinNode {
                left: sources[0].clone(),
                right: sources[1].clone(),
                ..n.clone()
            }),
            PlanNode::SpatialJoin(n) => PlanNode::SpatialJoin(SpatialJoinNode {
                left: sources[0].clone(),
                right: sources[1].clone(),
                ..n.clone()
            }),
            PlanNode::SemiJoin(n) => PlanNode::SemiJoin(SemiJoinNode {
                source: sources[0].clone(),
                filtering_source: sources[1].clone(),
                ..n.clone()
            }),
            PlanNode::Aggregation(n) => PlanNode::Aggregation(AggregationNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::Union(n) => PlanNode::Union(UnionNode {
                sources: sources.to_vec(),
                ..n.clone()
            }),
            PlanNode::Exchange(n) => PlanNode::Exchange(ExchangeNode {
                sources: sources.to_vec(),
                ..n.clone()
            }),
            PlanNode::Window(n) => PlanNode::Window(WindowNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::MarkDistinct(n) => PlanNode::MarkDistinct(MarkDistinctNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::GroupId(n) => PlanNode::GroupId(GroupIdNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::Unnest(n) => PlanNode::Unnest(UnnestNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::AssignUniqueId(n) => PlanNode::AssignUniqueId(AssignUniqueIdNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::Sort(n) => PlanNode::Sort(SortNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::Sample(n) => PlanNode::Sample(SampleNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
            PlanNode::CteScan(n) => PlanNode::CteScan(CteScanNode {
                source: sources[0].clone(),
                ..n.clone()
            }),
        }
    }

    /// The ordered output columns of this node.
    pub fn output_variables(&self) -> Vec<Variable> {
        match self {
            PlanNode::TableScan(n) => n.outputs.clone(),
            PlanNode::Filter(n) => n.source.output_variables(),
            PlanNode::Project(n) => n.assignments.outputs(),
            PlanNode::Join(n) => n.outputs.clone(),
            PlanNode::SpatialJoin(n) => n.outputs.clone(),
            PlanNode::SemiJoin(n) => {
                let mut outputs = n.source.output_variables();
                outputs.push(n.semi_join_output.clone());
                outputs
            }
            PlanNode::Aggregation(n) => {
                let mut outputs = n.grouping_sets.grouping_keys.clone();
                if let Some(group_id) = &n.group_id_variable {
                    outputs.push(group_id.clone());
                }
                outputs.extend(n.aggregations.iter().map(|a| a.output.clone()));
                outputs
            }
            PlanNode::Union(n) => n.outputs.clone(),
            PlanNode::Exchange(n) => n.outputs.clone(),
            PlanNode::Window(n) => {
                let mut outputs = n.source.output_variables();
                outputs.extend(n.functions.iter().map(|f| f.output.clone()));
                outputs
            }
            PlanNode::MarkDistinct(n) => {
                let mut outputs = n.source.output_variables();
                outputs.push(n.marker.clone());
                outputs
            }
            PlanNode::GroupId(n) => {
                let mut outputs: Vec<Variable> = n.grouping_columns.keys().cloned().collect();
                outputs.extend(n.aggregation_arguments.iter().cloned());
                outputs.push(n.group_id_variable.clone());
                outputs
            }
            PlanNode::Unnest(n) => {
                let mut outputs = n.replicate_variables.clone();
                for unnested in n.unnest_variables.values() {
                    outputs.extend(unnested.iter().cloned());
                }
                if let Some(ordinality) = &n.ordinality_variable {
                    outputs.push(ordinality.clone());
                }
                outputs
            }
            PlanNode::AssignUniqueId(n) => {
                let mut outputs = n.source.output_variables();
                outputs.push(n.id_variable.clone());
                outputs
            }
            PlanNode::Sort(n) => n.source.output_variables(),
            PlanNode::Sample(n) => n.source.output_variables(),
            PlanNode::CteScan(n) => n.outputs.clone(),
        }
    }
}
