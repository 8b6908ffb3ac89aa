use std::collections::BTreeMap;

use petgraph::visit::EdgeRef;

use crate::graph::Program;
use crate::matching::{FixedPoint, FixedPointStore};

/// Aggregate tallies keyed by category name.
pub type Counts = BTreeMap<String, u64>;

/// Fixed points created per matching step, function and basic block level
/// combined.
pub type Histogram = BTreeMap<String, u64>;

/// Tallies one program's functions, basic blocks, instructions and flow graph
/// edges, split by library and non-library. Stubs count as library functions.
pub fn count_program(program: &Program) -> Counts {
    let mut functions = 0u64;
    let mut basic_blocks = 0u64;
    let mut instructions = 0u64;
    let mut edges = 0u64;
    let mut lib_functions = 0u64;
    let mut lib_basic_blocks = 0u64;
    let mut lib_instructions = 0u64;
    let mut lib_edges = 0u64;

    for id in program.flow_graphs.ids() {
        let flow_graph = &program.flow_graphs[id];
        if program.is_library(id) {
            lib_functions += 1;
            lib_basic_blocks += flow_graph.block_count() as u64;
            lib_instructions += flow_graph.instruction_count() as u64;
            lib_edges += flow_graph.edge_count() as u64;
        } else {
            functions += 1;
            basic_blocks += flow_graph.block_count() as u64;
            instructions += flow_graph.instruction_count() as u64;
            edges += flow_graph.edge_count() as u64;
        }
    }

    let mut counts = Counts::new();
    counts.insert("functions (library)".to_string(), lib_functions);
    counts.insert("functions (non-library)".to_string(), functions);
    counts.insert("basicBlocks (library)".to_string(), lib_basic_blocks);
    counts.insert("basicBlocks (non-library)".to_string(), basic_blocks);
    counts.insert("instructions (library)".to_string(), lib_instructions);
    counts.insert("instructions (non-library)".to_string(), instructions);
    counts.insert("edges (library)".to_string(), lib_edges);
    counts.insert("edges (non-library)".to_string(), edges);
    counts
}

/// Tallies one fixed point: its function, block and instruction matches plus
/// the matched flow graph edges. An edge is matched iff both of its endpoint
/// blocks are matched and their images are connected by an edge of any kind
/// in the secondary graph. The histogram is credited for the function match
/// and each block match.
pub fn count_fixed_point(
    primary: &Program,
    secondary: &Program,
    fixed_point: &FixedPoint,
) -> (Counts, Histogram) {
    let mut counts = zeroed_match_counts();
    let mut histogram = Histogram::new();

    let primary_fg = &primary.flow_graphs[fixed_point.primary];
    let secondary_fg = &secondary.flow_graphs[fixed_point.secondary];
    let library =
        primary.is_library(fixed_point.primary) || secondary.is_library(fixed_point.secondary);
    let suffix = if library { "(library)" } else { "(non-library)" };

    *histogram.entry(fixed_point.step_name.to_string()).or_default() += 1;
    bump(&mut counts, "function matches", suffix, 1);
    bump(
        &mut counts,
        "basicBlock matches",
        suffix,
        fixed_point.basic_block_match_count() as u64,
    );
    for block in fixed_point.basic_blocks.values() {
        *histogram.entry(block.step_name.to_string()).or_default() += 1;
        bump(
            &mut counts,
            "instruction matches",
            suffix,
            block.instruction_matches.len() as u64,
        );
    }

    let mut edge_matches = 0u64;
    for edge in primary_fg.graph().edge_references() {
        let source = primary_fg.block(edge.source()).address;
        let target = primary_fg.block(edge.target()).address;
        let (Some(source_image), Some(target_image)) = (
            fixed_point.secondary_block(source),
            fixed_point.secondary_block(target),
        ) else {
            continue;
        };
        let (Some(s), Some(t)) = (
            secondary_fg.find_block(source_image),
            secondary_fg.find_block(target_image),
        ) else {
            continue;
        };
        if secondary_fg.has_edge(s, t) {
            edge_matches += 1;
        }
    }
    bump(&mut counts, "flowGraph edge matches", suffix, edge_matches);

    (counts, histogram)
}

/// Whole-diff tallies: per-side totals for both programs plus the mirrored
/// match counts summed over every fixed point, alongside the step histogram.
pub fn get_counts_and_histogram(
    primary: &Program,
    secondary: &Program,
    fixed_points: &FixedPointStore,
) -> (Counts, Histogram) {
    let primary_counts = count_program(primary);
    let secondary_counts = count_program(secondary);

    let mut counts = Counts::new();
    for kind in ["functions", "basicBlocks", "instructions"] {
        for lib in ["(library)", "(non-library)"] {
            counts.insert(
                format!("{kind} primary {lib}"),
                primary_counts[&format!("{kind} {lib}")],
            );
            counts.insert(
                format!("{kind} secondary {lib}"),
                secondary_counts[&format!("{kind} {lib}")],
            );
        }
    }
    for lib in ["(library)", "(non-library)"] {
        counts.insert(
            format!("flowGraph edges primary {lib}"),
            primary_counts[&format!("edges {lib}")],
        );
        counts.insert(
            format!("flowGraph edges secondary {lib}"),
            secondary_counts[&format!("edges {lib}")],
        );
    }
    for (key, value) in zeroed_match_counts() {
        counts.insert(key, value);
    }

    let mut histogram = Histogram::new();
    for (_, fixed_point) in fixed_points.iter() {
        let (pair_counts, pair_histogram) = count_fixed_point(primary, secondary, fixed_point);
        for (key, value) in pair_counts {
            *counts.entry(key).or_default() += value;
        }
        for (key, value) in pair_histogram {
            *histogram.entry(key).or_default() += value;
        }
    }

    (counts, histogram)
}

fn zeroed_match_counts() -> Counts {
    let mut counts = Counts::new();
    for kind in [
        "function matches",
        "basicBlock matches",
        "instruction matches",
        "flowGraph edge matches",
    ] {
        for lib in ["(library)", "(non-library)"] {
            counts.insert(format!("{kind} {lib}"), 0);
        }
    }
    counts
}

fn bump(counts: &mut Counts, kind: &str, suffix: &str, amount: u64) {
    *counts.entry(format!("{kind} {suffix}")).or_default() += amount;
}
