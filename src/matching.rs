use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};
use petgraph::graph::NodeIndex;
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::algorithms::{self, Fingerprint};
use crate::graph::{FlowGraph, FlowGraphId, Program};
use crate::steps::{self, BasicBlockStep, MatchingStep};
use crate::Address;

/// Step identity of matches produced by call reference refinement. Not part
/// of the walked step list; its prior lives in the confidence map.
pub const CALL_REFERENCE_STEP: &str = "function: call reference matching";

/// A confirmed match between two basic blocks, with the instruction pairs
/// aligned inside them.
#[derive(Debug, Clone)]
pub struct BasicBlockFixedPoint {
    pub step_name: &'static str,
    pub instruction_matches: Vec<(Address, Address)>,
}

/// How a matched function pair differs, set by `classify_changes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeFlags {
    pub structure: bool,
    pub instructions: bool,
}

impl ChangeFlags {
    pub fn describe(self) -> &'static str {
        match (self.structure, self.instructions) {
            (false, false) => "identical",
            (true, false) => "structure changed",
            (false, true) => "instructions changed",
            (true, true) => "structure and instructions changed",
        }
    }
}

/// A confirmed match between two functions: the step that created it plus the
/// basic block fixed points discovered inside the pair, keyed by block entry
/// addresses.
pub struct FixedPoint {
    pub primary: FlowGraphId,
    pub secondary: FlowGraphId,
    pub step_name: &'static str,
    pub basic_blocks: BTreeMap<(Address, Address), BasicBlockFixedPoint>,
    pub change_flags: ChangeFlags,
    primary_blocks: FxHashMap<Address, Address>,
    secondary_blocks: FxHashSet<Address>,
}

impl FixedPoint {
    fn new(primary: FlowGraphId, secondary: FlowGraphId, step_name: &'static str) -> Self {
        Self {
            primary,
            secondary,
            step_name,
            basic_blocks: BTreeMap::new(),
            change_flags: ChangeFlags::default(),
            primary_blocks: FxHashMap::default(),
            secondary_blocks: FxHashSet::default(),
        }
    }

    /// Guarded insertion: each block participates in at most one basic block
    /// fixed point per side.
    fn add_basic_block_match(
        &mut self,
        primary_address: Address,
        secondary_address: Address,
        step_name: &'static str,
        instruction_matches: Vec<(Address, Address)>,
    ) -> bool {
        if self.primary_blocks.contains_key(&primary_address)
            || self.secondary_blocks.contains(&secondary_address)
        {
            return false;
        }
        self.primary_blocks.insert(primary_address, secondary_address);
        self.secondary_blocks.insert(secondary_address);
        self.basic_blocks.insert(
            (primary_address, secondary_address),
            BasicBlockFixedPoint {
                step_name,
                instruction_matches,
            },
        );
        true
    }

    pub fn has_primary_block(&self, address: Address) -> bool {
        self.primary_blocks.contains_key(&address)
    }

    pub fn has_secondary_block(&self, address: Address) -> bool {
        self.secondary_blocks.contains(&address)
    }

    /// The secondary block matched to the given primary block, if any.
    pub fn secondary_block(&self, primary_address: Address) -> Option<Address> {
        self.primary_blocks.get(&primary_address).copied()
    }

    pub fn basic_block_match_count(&self) -> usize {
        self.basic_blocks.len()
    }

    pub fn instruction_match_count(&self) -> usize {
        self.basic_blocks
            .values()
            .map(|block| block.instruction_matches.len())
            .sum()
    }
}

/// The monotonically growing set of accepted matches. Keyed by function entry
/// addresses so iteration order is stable across runs.
#[derive(Default)]
pub struct FixedPointStore {
    fixed_points: BTreeMap<(Address, Address), FixedPoint>,
    new_keys: Vec<(Address, Address)>,
}

impl FixedPointStore {
    pub fn len(&self) -> usize {
        self.fixed_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixed_points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(Address, Address), &FixedPoint)> {
        self.fixed_points.iter()
    }

    pub fn get(&self, key: &(Address, Address)) -> Option<&FixedPoint> {
        self.fixed_points.get(key)
    }

    pub fn get_mut(&mut self, key: &(Address, Address)) -> Option<&mut FixedPoint> {
        self.fixed_points.get_mut(key)
    }

    pub fn keys(&self) -> Vec<(Address, Address)> {
        self.fixed_points.keys().copied().collect()
    }

    /// Snapshot of the endpoints of every fixed point, in key order.
    pub fn endpoint_pairs(&self) -> Vec<(FlowGraphId, FlowGraphId)> {
        self.fixed_points
            .values()
            .map(|fixed_point| (fixed_point.primary, fixed_point.secondary))
            .collect()
    }

    /// Fixed points added since the start of the current outer iteration.
    pub fn new_keys(&self) -> &[(Address, Address)] {
        &self.new_keys
    }

    pub fn clear_new(&mut self) {
        self.new_keys.clear();
    }

    fn insert(&mut self, key: (Address, Address), fixed_point: FixedPoint) {
        self.fixed_points.insert(key, fixed_point);
        self.new_keys.push(key);
    }
}

/// Everything one diff session matches over: the two programs and the fixed
/// point store. Graphs are immutable during matching except for the per
/// function matched flags.
pub struct MatchingContext {
    pub primary: Program,
    pub secondary: Program,
    pub fixed_points: FixedPointStore,
}

impl MatchingContext {
    pub fn new(primary: Program, secondary: Program) -> Self {
        Self {
            primary,
            secondary,
            fixed_points: FixedPointStore::default(),
        }
    }

    /// Guarded insertion of a function fixed point. Rejects the pair when
    /// either endpoint is already matched; a rejection reaching this point
    /// indicates a driver bug, not a user error.
    pub fn add_fixed_point(
        &mut self,
        primary: FlowGraphId,
        secondary: FlowGraphId,
        step_name: &'static str,
    ) -> bool {
        if self.primary.flow_graphs[primary].is_matched()
            || self.secondary.flow_graphs[secondary].is_matched()
        {
            warn!(
                "rejected fixed point {:#x} <-> {:#x}: endpoint already matched",
                self.primary.flow_graphs[primary].entry_address(),
                self.secondary.flow_graphs[secondary].entry_address()
            );
            return false;
        }

        let key = (
            self.primary.flow_graphs[primary].entry_address(),
            self.secondary.flow_graphs[secondary].entry_address(),
        );
        self.primary.flow_graphs[primary].set_matched(true);
        self.secondary.flow_graphs[secondary].set_matched(true);
        self.fixed_points
            .insert(key, FixedPoint::new(primary, secondary, step_name));
        debug!(
            "fixed point {:#x} <-> {:#x} via \"{}\"",
            key.0, key.1, step_name
        );
        true
    }

    /// Runs the basic block step list inside a matched function pair, with
    /// the same rigor discipline as the driver: per step-list suffix, one
    /// pass over all blocks, then propagation along control flow edges of
    /// already-matched block pairs until a full pass adds nothing.
    pub fn match_basic_blocks(
        &mut self,
        primary: FlowGraphId,
        secondary: FlowGraphId,
        block_steps: &[Box<dyn BasicBlockStep>],
    ) {
        let primary_fg = &self.primary.flow_graphs[primary];
        let secondary_fg = &self.secondary.flow_graphs[secondary];
        let key = (primary_fg.entry_address(), secondary_fg.entry_address());
        let Some(fixed_point) = self.fixed_points.get_mut(&key) else {
            return;
        };

        let primary_all = primary_fg.blocks_by_address();
        let secondary_all = secondary_fg.blocks_by_address();
        for level in 0..block_steps.len() {
            let level_steps = &block_steps[level..];
            block_find_fixed_points(
                level_steps,
                primary_fg,
                secondary_fg,
                false,
                &primary_all,
                &secondary_all,
                fixed_point,
            );

            loop {
                let mut more_found = false;
                let pairs: Vec<(Address, Address)> =
                    fixed_point.basic_blocks.keys().copied().collect();
                for (primary_address, secondary_address) in pairs {
                    let (Some(p), Some(s)) = (
                        primary_fg.find_block(primary_address),
                        secondary_fg.find_block(secondary_address),
                    ) else {
                        continue;
                    };
                    for direction in [Direction::Outgoing, Direction::Incoming] {
                        let primary_candidates =
                            unmatched_block_neighbors(primary_fg, p, direction, |address| {
                                fixed_point.has_primary_block(address)
                            });
                        let secondary_candidates =
                            unmatched_block_neighbors(secondary_fg, s, direction, |address| {
                                fixed_point.has_secondary_block(address)
                            });
                        if primary_candidates.is_empty() || secondary_candidates.is_empty() {
                            continue;
                        }
                        more_found |= block_find_fixed_points(
                            level_steps,
                            primary_fg,
                            secondary_fg,
                            true,
                            &primary_candidates,
                            &secondary_candidates,
                            fixed_point,
                        );
                    }
                }
                if !more_found {
                    break;
                }
            }
        }
    }

    /// Voids all matches so the same context can be diffed again.
    pub fn reset_matches(&mut self) {
        self.fixed_points = FixedPointStore::default();
        self.primary.reset_matches();
        self.secondary.reset_matches();
    }
}

/// Runs the full matching pipeline. The outer loop drops the front step after
/// each pass, lowering selectivity so functions missed by rigorous steps get
/// a chance under looser ones; inside each pass, matches propagate through
/// call graph neighborhoods until no pass discovers anything new.
pub fn diff(
    context: &mut MatchingContext,
    call_graph_steps: &[Box<dyn MatchingStep>],
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) {
    for level in 0..call_graph_steps.len() {
        let level_steps = &call_graph_steps[level..];
        context.fixed_points.clear_new();

        let primary_all = context.primary.sorted_flow_graph_ids();
        let secondary_all = context.secondary.sorted_flow_graph_ids();
        steps::find_fixed_points(
            level_steps,
            basic_block_steps,
            None,
            &primary_all,
            &secondary_all,
            context,
        );

        // Every fixed point is revisited on every pass, not just new ones:
        // neighbors that were ambiguous before may have become unique after
        // some of their siblings were matched. Completeness over speed.
        loop {
            let mut more_found = false;
            for direction in [Direction::Outgoing, Direction::Incoming] {
                for (primary, secondary) in context.fixed_points.endpoint_pairs() {
                    let primary_vertex = context.primary.flow_graphs[primary].call_graph_vertex();
                    let secondary_vertex =
                        context.secondary.flow_graphs[secondary].call_graph_vertex();
                    let primary_candidates =
                        unmatched_neighbors(&context.primary, primary_vertex, direction);
                    let secondary_candidates =
                        unmatched_neighbors(&context.secondary, secondary_vertex, direction);
                    if primary_candidates.is_empty() || secondary_candidates.is_empty() {
                        continue;
                    }
                    more_found |= steps::find_fixed_points(
                        level_steps,
                        basic_block_steps,
                        Some((primary, secondary)),
                        &primary_candidates,
                        &secondary_candidates,
                        context,
                    );
                }
            }
            if !more_found {
                break;
            }
        }

        // Derive further function matches from call instructions inside the
        // fixed points this level discovered; matches created here are
        // themselves refined before the next level starts.
        let mut worklist: VecDeque<(Address, Address)> =
            context.fixed_points.new_keys().iter().copied().collect();
        while let Some(key) = worklist.pop_front() {
            for created in find_call_reference_fixed_points(context, key, basic_block_steps) {
                worklist.push_back(created);
            }
        }
    }
    classify_changes(context);
}

/// Tags every fixed point with what changed between its two functions.
pub fn classify_changes(context: &mut MatchingContext) {
    for key in context.fixed_points.keys() {
        let Some(fixed_point) = context.fixed_points.get(&key) else {
            continue;
        };
        let primary = &context.primary.flow_graphs[fixed_point.primary];
        let secondary = &context.secondary.flow_graphs[fixed_point.secondary];
        let block_matches = fixed_point.basic_block_match_count();
        let instruction_matches = fixed_point.instruction_match_count();
        let flags = ChangeFlags {
            structure: primary.block_count() != secondary.block_count()
                || primary.edge_count() != secondary.edge_count()
                || block_matches != primary.block_count(),
            instructions: primary.instruction_count() != secondary.instruction_count()
                || instruction_matches != primary.instruction_count(),
        };
        if let Some(fixed_point) = context.fixed_points.get_mut(&key) {
            fixed_point.change_flags = flags;
        }
    }
}

/// Call graph neighbors of a vertex that can still be matched: duplicate
/// edges are skipped, as are neighbors whose flow graph is missing or already
/// part of a fixed point. Sorted by entry address.
fn unmatched_neighbors(
    program: &Program,
    vertex: NodeIndex,
    direction: Direction,
) -> Vec<FlowGraphId> {
    let mut out: Vec<FlowGraphId> = program
        .call_graph
        .neighbors(vertex, direction)
        .into_iter()
        .filter_map(|neighbor| program.call_graph.vertex(neighbor).flow_graph)
        .filter(|&id| !program.flow_graphs[id].is_matched())
        .collect();
    out.sort_by_key(|&id| program.flow_graphs[id].entry_address());
    out.dedup();
    out
}

fn unmatched_block_neighbors(
    flow_graph: &FlowGraph,
    block: NodeIndex,
    direction: Direction,
    is_matched: impl Fn(Address) -> bool,
) -> Vec<NodeIndex> {
    let mut out: Vec<NodeIndex> = flow_graph
        .neighbors(block, direction)
        .into_iter()
        .filter(|&neighbor| !is_matched(flow_graph.block(neighbor).address))
        .collect();
    out.sort_by_key(|&neighbor| flow_graph.block(neighbor).address);
    out.dedup();
    out
}

/// The unique-fingerprint discipline applied to basic blocks of one matched
/// function pair. A successful block match immediately aligns the
/// instructions inside the two blocks.
fn block_find_fixed_points(
    steps: &[Box<dyn BasicBlockStep>],
    primary_fg: &FlowGraph,
    secondary_fg: &FlowGraph,
    has_parent: bool,
    primary_candidates: &[NodeIndex],
    secondary_candidates: &[NodeIndex],
    fixed_point: &mut FixedPoint,
) -> bool {
    let Some((step, remaining)) = steps.split_first() else {
        return false;
    };

    let mut buckets: BTreeMap<Fingerprint, (Vec<NodeIndex>, Vec<NodeIndex>)> = BTreeMap::new();
    let mut skipped: (Vec<NodeIndex>, Vec<NodeIndex>) = (Vec::new(), Vec::new());
    for &block in primary_candidates {
        if fixed_point.has_primary_block(primary_fg.block(block).address) {
            continue;
        }
        match step.fingerprint(primary_fg, block, has_parent) {
            Some(fingerprint) => buckets.entry(fingerprint).or_default().0.push(block),
            None => skipped.0.push(block),
        }
    }
    for &block in secondary_candidates {
        if fixed_point.has_secondary_block(secondary_fg.block(block).address) {
            continue;
        }
        match step.fingerprint(secondary_fg, block, has_parent) {
            Some(fingerprint) => buckets.entry(fingerprint).or_default().1.push(block),
            None => skipped.1.push(block),
        }
    }

    let mut found = false;
    for (_, (primary_bucket, secondary_bucket)) in buckets {
        match (primary_bucket.len(), secondary_bucket.len()) {
            (1, 1) => {
                let primary_block = primary_fg.block(primary_bucket[0]);
                let secondary_block = secondary_fg.block(secondary_bucket[0]);
                let instruction_matches = algorithms::align_instructions(
                    &primary_block.instructions,
                    &secondary_block.instructions,
                );
                found |= fixed_point.add_basic_block_match(
                    primary_block.address,
                    secondary_block.address,
                    step.name(),
                    instruction_matches,
                );
            }
            (0, _) | (_, 0) => {}
            _ => {
                found |= block_find_fixed_points(
                    remaining,
                    primary_fg,
                    secondary_fg,
                    has_parent,
                    &primary_bucket,
                    &secondary_bucket,
                    fixed_point,
                );
            }
        }
    }
    if !skipped.0.is_empty() && !skipped.1.is_empty() {
        found |= block_find_fixed_points(
            remaining,
            primary_fg,
            secondary_fg,
            has_parent,
            &skipped.0,
            &skipped.1,
            fixed_point,
        );
    }
    found
}

/// For every matched block pair inside `key`, walks the call instructions on
/// both sides in order; positionally corresponding calls whose targets are
/// both unmatched yield new function fixed points.
fn find_call_reference_fixed_points(
    context: &mut MatchingContext,
    key: (Address, Address),
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) -> Vec<(Address, Address)> {
    let mut candidate_pairs: Vec<(FlowGraphId, FlowGraphId)> = Vec::new();
    {
        let Some(fixed_point) = context.fixed_points.get(&key) else {
            return Vec::new();
        };
        let primary_fg = &context.primary.flow_graphs[fixed_point.primary];
        let secondary_fg = &context.secondary.flow_graphs[fixed_point.secondary];
        for &(primary_address, secondary_address) in fixed_point.basic_blocks.keys() {
            let (Some(p), Some(s)) = (
                primary_fg.find_block(primary_address),
                secondary_fg.find_block(secondary_address),
            ) else {
                continue;
            };
            let primary_calls: Vec<Address> = primary_fg.block(p).call_targets().collect();
            let secondary_calls: Vec<Address> = secondary_fg.block(s).call_targets().collect();
            if primary_calls.is_empty() || primary_calls.len() != secondary_calls.len() {
                continue;
            }
            for (&primary_target, &secondary_target) in primary_calls.iter().zip(&secondary_calls)
            {
                let Some(primary_id) = resolve_unmatched(&context.primary, primary_target) else {
                    continue;
                };
                let Some(secondary_id) = resolve_unmatched(&context.secondary, secondary_target)
                else {
                    continue;
                };
                candidate_pairs.push((primary_id, secondary_id));
            }
        }
    }

    let mut created = Vec::new();
    for (primary_id, secondary_id) in candidate_pairs {
        if context.primary.flow_graphs[primary_id].is_matched()
            || context.secondary.flow_graphs[secondary_id].is_matched()
        {
            continue;
        }
        if context.add_fixed_point(primary_id, secondary_id, CALL_REFERENCE_STEP) {
            context.match_basic_blocks(primary_id, secondary_id, basic_block_steps);
            created.push((
                context.primary.flow_graphs[primary_id].entry_address(),
                context.secondary.flow_graphs[secondary_id].entry_address(),
            ));
        }
    }
    created
}

fn resolve_unmatched(program: &Program, target: Address) -> Option<FlowGraphId> {
    let vertex = program.call_graph.find(target)?;
    let id = program.call_graph.vertex(vertex).flow_graph?;
    (!program.flow_graphs[id].is_matched()).then_some(id)
}
