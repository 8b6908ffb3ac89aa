use std::collections::BTreeMap;

use crate::counting::{Counts, Histogram};
use crate::graph::{CallGraph, FlowGraph};
use crate::matching::CALL_REFERENCE_STEP;
use crate::steps::{BasicBlockStep, MatchingStep};

/// Per-step priors, injected into every scoring call.
pub type Confidences = BTreeMap<&'static str, f64>;

/// Builds the prior table from both step registries. The propagation block
/// step is pinned to zero; call reference matching, which runs outside the
/// walked step list, gets its fixed prior here.
pub fn confidence_map(
    call_graph_steps: &[Box<dyn MatchingStep>],
    basic_block_steps: &[Box<dyn BasicBlockStep>],
) -> Confidences {
    let mut confidences = Confidences::new();
    for step in call_graph_steps {
        confidences.insert(step.name(), step.confidence());
    }
    for step in basic_block_steps {
        confidences.insert(step.name(), step.confidence());
    }
    confidences.insert("basicBlock: propagation (size==1)", 0.0);
    confidences.insert(CALL_REFERENCE_STEP, 0.75);
    confidences
}

/// Histogram-weighted mean of the per-step priors, squashed through a sigmoid
/// centered at 0.5. An empty histogram yields zero confidence.
pub fn confidence(histogram: &Histogram, confidences: &Confidences) -> f64 {
    let mut weighted = 0.0;
    let mut match_count = 0.0;
    for (name, &count) in histogram {
        let prior = confidences.get(name.as_str()).copied().unwrap_or(0.0);
        weighted += count as f64 * prior;
        match_count += count as f64;
    }
    if match_count == 0.0 {
        return 0.0;
    }
    1.0 / (1.0 + (-(weighted / match_count - 0.5) * 10.0).exp())
}

/// Similarity of one matched function pair. Library functions are included
/// here; a pair whose blocks and instructions are fully matched on both sides
/// reads 1.0 regardless of which steps found it.
pub fn flow_graph_similarity(
    primary: &FlowGraph,
    secondary: &FlowGraph,
    histogram: &Histogram,
    counts: &Counts,
    confidences: &Confidences,
) -> f64 {
    let block_matches = count(counts, "basicBlock matches (non-library)")
        + count(counts, "basicBlock matches (library)");
    let instruction_matches = count(counts, "instruction matches (non-library)")
        + count(counts, "instruction matches (library)");
    let edge_matches = count(counts, "flowGraph edge matches (non-library)")
        + count(counts, "flowGraph edge matches (library)");

    let blocks_primary = primary.block_count() as f64;
    let blocks_secondary = secondary.block_count() as f64;
    let instructions_primary = primary.instruction_count() as f64;
    let instructions_secondary = secondary.instruction_count() as f64;
    let edges_primary = primary.edge_count() as f64;
    let edges_secondary = secondary.edge_count() as f64;

    if block_matches == blocks_primary
        && block_matches == blocks_secondary
        && instruction_matches == instructions_primary
        && instruction_matches == instructions_secondary
    {
        return 1.0;
    }

    let mut similarity = 0.55 * ratio(edge_matches, edges_primary, edges_secondary)
        + 0.30 * ratio(block_matches, blocks_primary, blocks_secondary)
        + 0.15 * ratio(instruction_matches, instructions_primary, instructions_secondary);
    similarity = similarity.min(1.0);
    similarity += md_term(primary.md_index(), secondary.md_index());
    similarity /= 2.0;
    similarity * confidence(histogram, confidences)
}

/// Whole-program similarity. Library functions are excluded from the ratios
/// so they cannot inflate the score; a diff whose non-library blocks and
/// instructions are fully matched on both sides reads 1.0.
pub fn call_graph_similarity(
    primary: &CallGraph,
    secondary: &CallGraph,
    histogram: &Histogram,
    counts: &Counts,
    confidences: &Confidences,
) -> f64 {
    let functions_primary = count(counts, "functions primary (non-library)");
    let functions_secondary = count(counts, "functions secondary (non-library)");
    if functions_primary == 0.0 && functions_secondary == 0.0 {
        return 0.0;
    }

    let block_matches = count(counts, "basicBlock matches (non-library)");
    let blocks_primary = count(counts, "basicBlocks primary (non-library)");
    let blocks_secondary = count(counts, "basicBlocks secondary (non-library)");
    let instruction_matches = count(counts, "instruction matches (non-library)");
    let instructions_primary = count(counts, "instructions primary (non-library)");
    let instructions_secondary = count(counts, "instructions secondary (non-library)");

    if blocks_primary + blocks_secondary > 0.0
        && block_matches == blocks_primary
        && block_matches == blocks_secondary
        && instruction_matches == instructions_primary
        && instruction_matches == instructions_secondary
    {
        return 1.0;
    }

    let mut similarity = 0.35
        * ratio(
            count(counts, "flowGraph edge matches (non-library)"),
            count(counts, "flowGraph edges primary (non-library)"),
            count(counts, "flowGraph edges secondary (non-library)"),
        )
        + 0.25 * ratio(block_matches, blocks_primary, blocks_secondary)
        + 0.10
            * ratio(
                count(counts, "function matches (non-library)"),
                functions_primary,
                functions_secondary,
            )
        + 0.10 * ratio(instruction_matches, instructions_primary, instructions_secondary)
        + 0.20 * md_term(primary.md_index(), secondary.md_index());
    similarity = similarity.min(1.0);
    similarity * confidence(histogram, confidences)
}

fn ratio(matches: f64, primary: f64, secondary: f64) -> f64 {
    matches / 1f64.max(0.5 * (primary + secondary))
}

fn md_term(primary: f64, secondary: f64) -> f64 {
    1.0 - (primary - secondary).abs() / (1.0 + primary + secondary)
}

fn count(counts: &Counts, key: &str) -> f64 {
    counts.get(key).copied().unwrap_or(0) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{default_basic_block_steps, default_call_graph_steps};

    fn default_confidences() -> Confidences {
        confidence_map(&default_call_graph_steps(), &default_basic_block_steps())
    }

    #[test]
    fn empty_histogram_has_zero_confidence() {
        assert_eq!(confidence(&Histogram::new(), &default_confidences()), 0.0);
    }

    #[test]
    fn balanced_priors_sit_at_the_sigmoid_midpoint() {
        let mut confidences = Confidences::new();
        confidences.insert("strong", 0.9);
        confidences.insert("weak", 0.1);
        let mut histogram = Histogram::new();
        histogram.insert("strong".to_string(), 1);
        histogram.insert("weak".to_string(), 1);
        assert!((confidence(&histogram, &confidences) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn hash_only_histogram_is_close_to_one() {
        let mut histogram = Histogram::new();
        histogram.insert("function: hash matching".to_string(), 3);
        let value = confidence(&histogram, &default_confidences());
        assert!(value > 0.99, "got {value}");
    }

    #[test]
    fn propagation_and_call_reference_priors_are_pinned() {
        let confidences = default_confidences();
        assert_eq!(confidences["basicBlock: propagation (size==1)"], 0.0);
        assert_eq!(confidences["function: call reference matching"], 0.75);
    }

    #[test]
    fn all_library_programs_score_zero_globally() {
        let primary = CallGraph::new("a", "");
        let secondary = CallGraph::new("b", "");
        let mut counts = Counts::new();
        counts.insert("functions primary (non-library)".to_string(), 0);
        counts.insert("functions secondary (non-library)".to_string(), 0);
        counts.insert("function matches (library)".to_string(), 4);
        let mut histogram = Histogram::new();
        histogram.insert("function: hash matching".to_string(), 4);
        let score = call_graph_similarity(
            &primary,
            &secondary,
            &histogram,
            &counts,
            &default_confidences(),
        );
        assert_eq!(score, 0.0);
    }

    #[test]
    fn ratio_is_clamped_by_the_unit_denominator() {
        assert_eq!(ratio(0.0, 0.0, 0.0), 0.0);
        assert_eq!(ratio(2.0, 2.0, 2.0), 1.0);
    }
}
