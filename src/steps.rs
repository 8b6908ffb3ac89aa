use std::collections::BTreeMap;

use log::debug;
use petgraph::graph::NodeIndex;

use crate::algorithms::{self, Fingerprint};
use crate::graph::{FlowGraph, FlowGraphId, Program};
use crate::matching::MatchingContext;

/// A call graph matching heuristic: a stable name (histogram key and fixed
/// point identity), a prior confidence in [0, 1], and a fingerprint function.
/// Steps are ordered from most selective to least.
pub trait MatchingStep {
    fn name(&self) -> &'static str;

    fn confidence(&self) -> f64;

    /// Fingerprint of a candidate function. `None` removes the candidate from
    /// this step's buckets entirely.
    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint>;
}

/// A basic block matching heuristic, scoped to one matched function pair.
pub trait BasicBlockStep {
    fn name(&self) -> &'static str;

    fn confidence(&self) -> f64;

    /// Fingerprint of a candidate block. Steps that are only meaningful when
    /// narrowing a matched pair's neighborhood return `None` without a parent.
    fn fingerprint(
        &self,
        flow_graph: &FlowGraph,
        block: NodeIndex,
        has_parent: bool,
    ) -> Option<Fingerprint>;
}

/// The default call graph step order.
pub fn default_call_graph_steps() -> Vec<Box<dyn MatchingStep>> {
    vec![
        Box::new(FunctionHashMatching),
        Box::new(FunctionNameHashMatching),
        Box::new(FunctionMdIndexMatching),
        Box::new(FunctionPrimeSignatureMatching),
        Box::new(FunctionEdgesMdIndexMatching),
        Box::new(FunctionInstructionCountMatching),
    ]
}

/// The default basic block step order.
pub fn default_basic_block_steps() -> Vec<Box<dyn BasicBlockStep>> {
    vec![
        Box::new(BasicBlockHashMatching),
        Box::new(BasicBlockPrimeMatching),
        Box::new(BasicBlockEntryPointMatching),
        Box::new(BasicBlockInstructionCountMatching),
        Box::new(BasicBlockPropagationMatching),
    ]
}

/// Unique-fingerprint matching over `steps`: bucket both candidate sets by
/// the front step's fingerprint, accept every bucket holding exactly one
/// candidate per side, and recurse into the remaining steps on ambiguous
/// buckets. Returns true iff at least one new fixed point was created.
pub fn find_fixed_points(
    steps: &[Box<dyn MatchingStep>],
    block_steps: &[Box<dyn BasicBlockStep>],
    parents: Option<(FlowGraphId, FlowGraphId)>,
    primary_candidates: &[FlowGraphId],
    secondary_candidates: &[FlowGraphId],
    context: &mut MatchingContext,
) -> bool {
    let Some((step, remaining)) = steps.split_first() else {
        return false;
    };

    let mut buckets: BTreeMap<Fingerprint, (Vec<FlowGraphId>, Vec<FlowGraphId>)> = BTreeMap::new();
    let mut skipped: (Vec<FlowGraphId>, Vec<FlowGraphId>) = (Vec::new(), Vec::new());
    for &id in primary_candidates {
        if context.primary.flow_graphs[id].is_matched() {
            continue;
        }
        match step.fingerprint(&context.primary, id) {
            Some(fingerprint) => buckets.entry(fingerprint).or_default().0.push(id),
            None => skipped.0.push(id),
        }
    }
    for &id in secondary_candidates {
        if context.secondary.flow_graphs[id].is_matched() {
            continue;
        }
        match step.fingerprint(&context.secondary, id) {
            Some(fingerprint) => buckets.entry(fingerprint).or_default().1.push(id),
            None => skipped.1.push(id),
        }
    }

    let mut found = false;
    for (_, (primary_bucket, secondary_bucket)) in buckets {
        match (primary_bucket.len(), secondary_bucket.len()) {
            (1, 1) => {
                if context.add_fixed_point(primary_bucket[0], secondary_bucket[0], step.name()) {
                    context.match_basic_blocks(primary_bucket[0], secondary_bucket[0], block_steps);
                    found = true;
                }
            }
            (0, _) | (_, 0) => {}
            _ => {
                found |= find_fixed_points(
                    remaining,
                    block_steps,
                    parents,
                    &primary_bucket,
                    &secondary_bucket,
                    context,
                );
            }
        }
    }
    // Candidates this step has no fingerprint for fall through to the
    // remaining steps as their own group.
    if !skipped.0.is_empty() && !skipped.1.is_empty() {
        found |= find_fixed_points(
            remaining,
            block_steps,
            parents,
            &skipped.0,
            &skipped.1,
            context,
        );
    }
    if found {
        debug!(
            "step \"{}\" produced fixed points (parents: {:?})",
            step.name(),
            parents
        );
    }
    found
}

struct FunctionHashMatching;

impl MatchingStep for FunctionHashMatching {
    fn name(&self) -> &'static str {
        "function: hash matching"
    }

    fn confidence(&self) -> f64 {
        1.0
    }

    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint> {
        let flow_graph = &program.flow_graphs[id];
        if flow_graph.is_stub() {
            return None;
        }
        Some(algorithms::function_hash(flow_graph))
    }
}

struct FunctionNameHashMatching;

impl MatchingStep for FunctionNameHashMatching {
    fn name(&self) -> &'static str {
        "function: name hash matching"
    }

    fn confidence(&self) -> f64 {
        1.0
    }

    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint> {
        program
            .function_of(id)
            .best_name()
            .map(algorithms::name_hash)
    }
}

struct FunctionMdIndexMatching;

impl MatchingStep for FunctionMdIndexMatching {
    fn name(&self) -> &'static str {
        "function: MD index matching (flow graph)"
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint> {
        Some(program.flow_graphs[id].md_index().to_bits() as Fingerprint)
    }
}

struct FunctionPrimeSignatureMatching;

impl MatchingStep for FunctionPrimeSignatureMatching {
    fn name(&self) -> &'static str {
        "function: prime signature matching"
    }

    fn confidence(&self) -> f64 {
        0.85
    }

    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint> {
        Some(algorithms::function_prime_product(&program.flow_graphs[id]) as Fingerprint)
    }
}

struct FunctionEdgesMdIndexMatching;

impl MatchingStep for FunctionEdgesMdIndexMatching {
    fn name(&self) -> &'static str {
        "function: edges flow graph MD index"
    }

    fn confidence(&self) -> f64 {
        0.7
    }

    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint> {
        Some(algorithms::edges_md_index_fingerprint(program, id))
    }
}

struct FunctionInstructionCountMatching;

impl MatchingStep for FunctionInstructionCountMatching {
    fn name(&self) -> &'static str {
        "function: instruction count"
    }

    fn confidence(&self) -> f64 {
        0.4
    }

    fn fingerprint(&self, program: &Program, id: FlowGraphId) -> Option<Fingerprint> {
        Some(program.flow_graphs[id].instruction_count() as Fingerprint)
    }
}

struct BasicBlockHashMatching;

impl BasicBlockStep for BasicBlockHashMatching {
    fn name(&self) -> &'static str {
        "basicBlock: hash matching"
    }

    fn confidence(&self) -> f64 {
        1.0
    }

    fn fingerprint(
        &self,
        flow_graph: &FlowGraph,
        block: NodeIndex,
        _has_parent: bool,
    ) -> Option<Fingerprint> {
        Some(algorithms::basic_block_hash(flow_graph.block(block)))
    }
}

struct BasicBlockPrimeMatching;

impl BasicBlockStep for BasicBlockPrimeMatching {
    fn name(&self) -> &'static str {
        "basicBlock: prime matching"
    }

    fn confidence(&self) -> f64 {
        0.9
    }

    fn fingerprint(
        &self,
        flow_graph: &FlowGraph,
        block: NodeIndex,
        _has_parent: bool,
    ) -> Option<Fingerprint> {
        Some(algorithms::prime_product(flow_graph.block(block).instructions.iter()) as Fingerprint)
    }
}

struct BasicBlockEntryPointMatching;

impl BasicBlockStep for BasicBlockEntryPointMatching {
    fn name(&self) -> &'static str {
        "basicBlock: entry point matching"
    }

    fn confidence(&self) -> f64 {
        0.7
    }

    fn fingerprint(
        &self,
        flow_graph: &FlowGraph,
        block: NodeIndex,
        _has_parent: bool,
    ) -> Option<Fingerprint> {
        (flow_graph.block(block).address == flow_graph.entry_address()).then_some(1)
    }
}

struct BasicBlockInstructionCountMatching;

impl BasicBlockStep for BasicBlockInstructionCountMatching {
    fn name(&self) -> &'static str {
        "basicBlock: instruction count matching"
    }

    fn confidence(&self) -> f64 {
        0.5
    }

    fn fingerprint(
        &self,
        flow_graph: &FlowGraph,
        block: NodeIndex,
        _has_parent: bool,
    ) -> Option<Fingerprint> {
        Some(flow_graph.block(block).instruction_count() as Fingerprint)
    }
}

/// Matches the sole remaining neighbor on each side of an already-matched
/// block pair. Inert outside a parent neighborhood; prior is zero.
struct BasicBlockPropagationMatching;

impl BasicBlockStep for BasicBlockPropagationMatching {
    fn name(&self) -> &'static str {
        "basicBlock: propagation (size==1)"
    }

    fn confidence(&self) -> f64 {
        0.0
    }

    fn fingerprint(
        &self,
        _flow_graph: &FlowGraph,
        _block: NodeIndex,
        has_parent: bool,
    ) -> Option<Fingerprint> {
        has_parent.then_some(0)
    }
}
