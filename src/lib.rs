//! Structural diffing of disassembled binaries.
//!
//! Two pre-computed exports (call graph, per-function control flow graphs,
//! instruction streams) go in; out come the matched function, basic block and
//! instruction pairs ("fixed points"), aggregate counts, a per-step match
//! histogram, and a similarity/confidence score pair. Matching is a pipeline
//! of heuristic steps ordered from most discriminating to least, with matches
//! propagated through call graph neighborhoods until nothing new is found.

use std::time::Instant;

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};

pub mod algorithms;
pub mod counting;
pub mod database;
pub mod graph;
pub mod instruction;
pub mod matching;
pub mod report;
pub mod similarity;
pub mod steps;

use crate::counting::{Counts, Histogram};
use crate::database::ProgramExport;
use crate::graph::Program;
use crate::instruction::InstructionCache;
use crate::matching::MatchingContext;
use crate::similarity::Confidences;
use crate::steps::{BasicBlockStep, MatchingStep};

/// A code location. Unique within a single program.
pub type Address = u64;

/// Installs the logging backend once per process.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

/// One matched function pair as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMatch {
    pub primary_address: Address,
    pub secondary_address: Address,
    pub primary_name: String,
    pub secondary_name: String,
    pub step: String,
    pub similarity: f64,
    pub confidence: f64,
    pub change: String,
    pub basic_block_matches: usize,
    pub instruction_matches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedFunction {
    pub address: Address,
    pub name: String,
}

/// Everything a diff produces: the match list, per-category counts, the step
/// histogram and the two scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResults {
    pub primary_executable: String,
    pub secondary_executable: String,
    pub primary_hash: String,
    pub secondary_hash: String,
    pub similarity: f64,
    pub confidence: f64,
    pub analysis_time: f64,
    pub counts: Counts,
    pub histogram: Histogram,
    pub matches: Vec<FunctionMatch>,
    pub unmatched_primary: Vec<UnmatchedFunction>,
    pub unmatched_secondary: Vec<UnmatchedFunction>,
}

/// One diff session: owns the two programs, the step registries and the
/// shared instruction cache. Dropping the session releases the cache no
/// matter how matching terminated.
pub struct DiffSession {
    context: MatchingContext,
    call_graph_steps: Vec<Box<dyn MatchingStep>>,
    basic_block_steps: Vec<Box<dyn BasicBlockStep>>,
    confidences: Confidences,
    cache: InstructionCache,
}

impl DiffSession {
    pub fn new(primary: Program, secondary: Program, cache: InstructionCache) -> Self {
        let call_graph_steps = steps::default_call_graph_steps();
        let basic_block_steps = steps::default_basic_block_steps();
        let confidences = similarity::confidence_map(&call_graph_steps, &basic_block_steps);
        Self {
            context: MatchingContext::new(primary, secondary),
            call_graph_steps,
            basic_block_steps,
            confidences,
            cache,
        }
    }

    /// Builds a session from two parsed exports, interning both programs'
    /// instructions through one shared cache.
    pub fn from_exports(primary: &ProgramExport, secondary: &ProgramExport) -> Self {
        let cache = InstructionCache::new();
        let primary = database::build_program(primary, &cache);
        let secondary = database::build_program(secondary, &cache);
        Self::new(primary, secondary, cache)
    }

    /// Reads and parses two export files and builds a session from them.
    pub fn from_files(primary: &std::path::Path, secondary: &std::path::Path) -> Result<Self> {
        let primary = database::read_export(primary)?;
        let secondary = database::read_export(secondary)?;
        Ok(Self::from_exports(&primary, &secondary))
    }

    /// Runs the matching pipeline and assembles the results.
    pub fn diff(&mut self) -> DiffResults {
        let start = Instant::now();
        info!(
            "diffing {} vs {}",
            self.context.primary.call_graph.executable, self.context.secondary.call_graph.executable
        );
        matching::diff(
            &mut self.context,
            &self.call_graph_steps,
            &self.basic_block_steps,
        );
        let mut results = self.results();
        results.analysis_time = start.elapsed().as_secs_f64();
        info!(
            "diff finished in {:.2}s: {} matches, similarity {:.3}, confidence {:.3}",
            results.analysis_time,
            results.matches.len(),
            results.similarity,
            results.confidence
        );
        results
    }

    /// Assembles results from the current state of the fixed point store.
    pub fn results(&self) -> DiffResults {
        let context = &self.context;
        let (counts, histogram) = counting::get_counts_and_histogram(
            &context.primary,
            &context.secondary,
            &context.fixed_points,
        );
        let confidence = similarity::confidence(&histogram, &self.confidences);
        let similarity_score = similarity::call_graph_similarity(
            &context.primary.call_graph,
            &context.secondary.call_graph,
            &histogram,
            &counts,
            &self.confidences,
        );

        let mut matches = Vec::with_capacity(context.fixed_points.len());
        for (_, fixed_point) in context.fixed_points.iter() {
            let (pair_counts, pair_histogram) =
                counting::count_fixed_point(&context.primary, &context.secondary, fixed_point);
            let primary_fg = &context.primary.flow_graphs[fixed_point.primary];
            let secondary_fg = &context.secondary.flow_graphs[fixed_point.secondary];
            matches.push(FunctionMatch {
                primary_address: primary_fg.entry_address(),
                secondary_address: secondary_fg.entry_address(),
                primary_name: context.primary.function_of(fixed_point.primary).display_name(),
                secondary_name: context
                    .secondary
                    .function_of(fixed_point.secondary)
                    .display_name(),
                step: fixed_point.step_name.to_string(),
                similarity: similarity::flow_graph_similarity(
                    primary_fg,
                    secondary_fg,
                    &pair_histogram,
                    &pair_counts,
                    &self.confidences,
                ),
                confidence: similarity::confidence(&pair_histogram, &self.confidences),
                change: fixed_point.change_flags.describe().to_string(),
                basic_block_matches: fixed_point.basic_block_match_count(),
                instruction_matches: fixed_point.instruction_match_count(),
            });
        }

        DiffResults {
            primary_executable: context.primary.call_graph.executable.clone(),
            secondary_executable: context.secondary.call_graph.executable.clone(),
            primary_hash: context.primary.call_graph.exe_hash.clone(),
            secondary_hash: context.secondary.call_graph.exe_hash.clone(),
            similarity: similarity_score,
            confidence,
            analysis_time: 0.0,
            counts,
            histogram,
            matches,
            unmatched_primary: unmatched_functions(&context.primary),
            unmatched_secondary: unmatched_functions(&context.secondary),
        }
    }

    /// Voids all matches so the same session can be diffed again.
    pub fn reset_matches(&mut self) {
        self.context.reset_matches();
    }

    pub fn context(&self) -> &MatchingContext {
        &self.context
    }

    pub fn instruction_cache(&self) -> &InstructionCache {
        &self.cache
    }
}

impl Drop for DiffSession {
    fn drop(&mut self) {
        self.cache.clear();
    }
}

fn unmatched_functions(program: &Program) -> Vec<UnmatchedFunction> {
    program
        .sorted_flow_graph_ids()
        .into_iter()
        .filter(|&id| !program.flow_graphs[id].is_matched())
        .map(|id| UnmatchedFunction {
            address: program.flow_graphs[id].entry_address(),
            name: program.function_of(id).display_name(),
        })
        .collect()
}
