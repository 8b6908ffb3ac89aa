use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::algorithms;
use crate::graph::{BasicBlock, CallGraph, EdgeKind, FlowGraph, FunctionVertex, Program};
use crate::instruction::InstructionCache;
use crate::{Address, DiffResults};

/// Meta information block of an export: which binary was disassembled and the
/// hash of its contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaInformation {
    #[serde(default)]
    pub input_binary: String,
    #[serde(default)]
    pub input_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescription {
    pub address: Address,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub demangled_name: Option<String>,
    #[serde(default)]
    pub library: bool,
    #[serde(default)]
    pub stub: bool,
    #[serde(default)]
    pub imported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallDescription {
    pub source: Address,
    pub target: Address,
}

/// Call graph section of an export. The older format spelling `functions` is
/// accepted alongside `vertices`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallGraphDescription {
    #[serde(alias = "functions")]
    pub vertices: Vec<FunctionDescription>,
    #[serde(default)]
    pub edges: Vec<CallDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionDescription {
    pub address: Address,
    pub mnemonic: String,
    #[serde(default)]
    pub operands: String,
    #[serde(default)]
    pub call_target: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlockDescription {
    pub address: Address,
    #[serde(default)]
    pub instructions: Vec<InstructionDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdgeDescription {
    pub source: Address,
    pub target: Address,
    #[serde(default)]
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphDescription {
    pub address: Address,
    #[serde(default, alias = "blocks")]
    pub basic_blocks: Vec<BasicBlockDescription>,
    #[serde(default)]
    pub edges: Vec<FlowEdgeDescription>,
}

/// One side of a diff as produced by the external exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramExport {
    #[serde(default)]
    pub meta: MetaInformation,
    pub call_graph: CallGraphDescription,
    #[serde(default)]
    pub flow_graphs: Vec<FlowGraphDescription>,
}

/// Parses an export file. A malformed file is the one input error that stops
/// a diff session before it starts.
pub fn read_export(path: &Path) -> Result<ProgramExport> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read export {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("failed to parse export {}", path.display()))
}

/// Builds the in-memory graphs from an export. Structural oddities inside an
/// otherwise well-formed export (empty flow graphs, dangling edges) are
/// logged and skipped, and matching continues without them.
pub fn build_program(export: &ProgramExport, cache: &InstructionCache) -> Program {
    let mut call_graph = CallGraph::new(
        export.meta.input_binary.clone(),
        export.meta.input_hash.clone(),
    );
    for function in &export.call_graph.vertices {
        let vertex = FunctionVertex {
            address: function.address,
            name: function.name.clone(),
            demangled_name: function.demangled_name.clone(),
            library: function.library,
            stub: function.stub,
            imported: function.imported,
            flow_graph: None,
        };
        if call_graph.add_function(vertex).is_none() {
            warn!(
                "duplicate function at {:#x}, keeping the first",
                function.address
            );
        }
    }
    for call in &export.call_graph.edges {
        if !call_graph.add_call(call.source, call.target) {
            warn!(
                "dropping call {:#x} -> {:#x}: unknown endpoint",
                call.source, call.target
            );
        }
    }

    let mut program = Program::new(call_graph);
    for description in &export.flow_graphs {
        if description.basic_blocks.is_empty() {
            warn!("skipping empty flow graph at {:#x}", description.address);
            continue;
        }
        let Some(vertex) = program.call_graph.find(description.address) else {
            warn!(
                "skipping flow graph at {:#x}: no call graph vertex",
                description.address
            );
            continue;
        };
        if program.call_graph.vertex(vertex).flow_graph.is_some() {
            warn!("skipping duplicate flow graph at {:#x}", description.address);
            continue;
        }

        let mut flow_graph = FlowGraph::new(description.address, vertex);
        for block in &description.basic_blocks {
            let instructions = block
                .instructions
                .iter()
                .map(|i| cache.intern(i.address, &i.mnemonic, &i.operands, i.call_target))
                .collect();
            if flow_graph
                .add_block(BasicBlock {
                    address: block.address,
                    instructions,
                })
                .is_none()
            {
                warn!("duplicate basic block at {:#x}", block.address);
            }
        }
        for edge in &description.edges {
            if !flow_graph.add_edge(edge.source, edge.target, edge.kind) {
                warn!(
                    "dropping flow edge {:#x} -> {:#x}: unknown block",
                    edge.source, edge.target
                );
            }
        }
        flow_graph.set_md_index(algorithms::md_index(flow_graph.graph()));

        let id = program.flow_graphs.insert(flow_graph);
        program.call_graph.vertex_mut(vertex).flow_graph = Some(id);
    }

    program.add_stubs();
    let md = algorithms::md_index(program.call_graph.graph());
    program.call_graph.set_md_index(md);
    program
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsMetadata {
    pub created_at: String,
    pub engine_version: String,
    pub total_matches: usize,
}

/// On-disk wrapper around `DiffResults`; serialization of these to any other
/// results store is up to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsDatabase {
    pub metadata: ResultsMetadata,
    pub results: DiffResults,
}

pub fn save_results(results: &DiffResults, path: &Path) -> Result<()> {
    let database = ResultsDatabase {
        metadata: ResultsMetadata {
            created_at: chrono::Utc::now().to_rfc3339(),
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            total_matches: results.matches.len(),
        },
        results: results.clone(),
    };
    let json =
        serde_json::to_string_pretty(&database).context("failed to serialize diff results")?;
    fs::write(path, json)
        .with_context(|| format!("failed to write results file {}", path.display()))?;
    Ok(())
}

pub fn load_results(path: &Path) -> Result<ResultsDatabase> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read results file {}", path.display()))?;
    serde_json::from_str(&json).context("failed to deserialize diff results")
}

pub fn export_to_csv(results: &DiffResults, path: &Path) -> Result<()> {
    let mut csv = String::new();
    csv.push_str(
        "primary_address,primary_name,secondary_address,secondary_name,step,similarity,confidence,change,basic_block_matches,instruction_matches\n",
    );
    for m in &results.matches {
        csv.push_str(&format!(
            "{:#x},{},{:#x},{},{},{:.4},{:.4},{},{},{}\n",
            m.primary_address,
            m.primary_name,
            m.secondary_address,
            m.secondary_name,
            m.step,
            m.similarity,
            m.confidence,
            m.change,
            m.basic_block_matches,
            m.instruction_matches
        ));
    }
    fs::write(path, csv).with_context(|| format!("failed to write CSV {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffStatistics {
    pub total_matches: usize,
    pub average_similarity: f64,
    pub average_confidence: f64,
    pub identical: usize,
    pub changed: usize,
    pub unmatched_primary: usize,
    pub unmatched_secondary: usize,
    pub matches_by_step: BTreeMap<String, usize>,
}

impl DiffStatistics {
    pub fn print_summary(&self) {
        println!("=== Diff Statistics ===");
        println!("Total Matches: {}", self.total_matches);
        for (step, count) in &self.matches_by_step {
            println!("  - {}: {}", step, count);
        }
        println!("Identical: {}", self.identical);
        println!("Changed: {}", self.changed);
        println!("Average Similarity: {:.4}", self.average_similarity);
        println!("Average Confidence: {:.4}", self.average_confidence);
        println!("Unmatched Functions (primary): {}", self.unmatched_primary);
        println!(
            "Unmatched Functions (secondary): {}",
            self.unmatched_secondary
        );
    }
}

pub fn generate_statistics(results: &DiffResults) -> DiffStatistics {
    let total_matches = results.matches.len();
    let mut matches_by_step: BTreeMap<String, usize> = BTreeMap::new();
    let mut similarity_sum = 0.0;
    let mut confidence_sum = 0.0;
    let mut identical = 0;
    for m in &results.matches {
        *matches_by_step.entry(m.step.clone()).or_default() += 1;
        similarity_sum += m.similarity;
        confidence_sum += m.confidence;
        if m.change == "identical" {
            identical += 1;
        }
    }
    DiffStatistics {
        total_matches,
        average_similarity: if total_matches > 0 {
            similarity_sum / total_matches as f64
        } else {
            0.0
        },
        average_confidence: if total_matches > 0 {
            confidence_sum / total_matches as f64
        } else {
            0.0
        },
        identical,
        changed: total_matches - identical,
        unmatched_primary: results.unmatched_primary.len(),
        unmatched_secondary: results.unmatched_secondary.len(),
        matches_by_step,
    }
}
