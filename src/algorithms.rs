use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use sha2::{Digest, Sha256};

use crate::graph::{BasicBlock, FlowGraph, FlowGraphId, Program};
use crate::instruction::Instruction;
use crate::Address;

/// Universal fingerprint value produced by matching steps. Steps with narrower
/// native domains (counts, bit patterns of an MD index) widen into it.
pub type Fingerprint = u128;

const SMALL_PRIMES: [u64; 25] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89, 97,
];

/// Degree-weighted structural fingerprint of a directed graph. Each edge
/// contributes a term derived from the in- and out-degrees of its endpoints,
/// weighted by irrational constants.
pub fn md_index<N, E>(graph: &DiGraph<N, E>) -> f64 {
    let mut index = 0.0;
    for edge in graph.edge_references() {
        let source = edge.source();
        let target = edge.target();
        let weight = 2f64.sqrt()
            * graph.neighbors_directed(source, Direction::Incoming).count() as f64
            + 3f64.sqrt() * graph.neighbors_directed(source, Direction::Outgoing).count() as f64
            + 5f64.sqrt() * graph.neighbors_directed(target, Direction::Incoming).count() as f64
            + 7f64.sqrt() * graph.neighbors_directed(target, Direction::Outgoing).count() as f64;
        if weight > 0.0 {
            index += 1.0 / weight.sqrt();
        }
    }
    index
}

/// Content hash of a whole function: every instruction's mnemonic and operand
/// text, blocks visited in address order.
pub fn function_hash(flow_graph: &FlowGraph) -> Fingerprint {
    let mut hasher = Sha256::new();
    for block_index in flow_graph.blocks_by_address() {
        for instruction in &flow_graph.block(block_index).instructions {
            hash_instruction(&mut hasher, instruction);
        }
    }
    truncate_digest(hasher)
}

/// Content hash of a single basic block.
pub fn basic_block_hash(block: &BasicBlock) -> Fingerprint {
    let mut hasher = Sha256::new();
    for instruction in &block.instructions {
        hash_instruction(&mut hasher, instruction);
    }
    truncate_digest(hasher)
}

pub fn name_hash(name: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    truncate_digest(hasher)
}

/// Order-independent product of small primes over instruction mnemonics.
/// Robust against basic block reordering, sensitive to mnemonic changes.
pub fn prime_product<'a>(instructions: impl Iterator<Item = &'a Instruction>) -> u64 {
    let mut product = 1u64;
    for instruction in instructions {
        let mnemonic_sum = instruction
            .mnemonic()
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_add(b as u64));
        let prime = SMALL_PRIMES[(mnemonic_sum % SMALL_PRIMES.len() as u64) as usize];
        product = product.wrapping_mul(prime);
    }
    product
}

pub fn function_prime_product(flow_graph: &FlowGraph) -> u64 {
    let mut product = 1u64;
    for block_index in flow_graph.blocks() {
        product = product.wrapping_mul(prime_product(
            flow_graph.block(block_index).instructions.iter(),
        ));
    }
    product
}

/// Fingerprint combining a function's own MD index with the sorted MD indices
/// of the functions it calls.
pub fn edges_md_index_fingerprint(program: &Program, id: FlowGraphId) -> Fingerprint {
    let flow_graph = &program.flow_graphs[id];
    let mut callee_indices: Vec<u64> = program
        .call_graph
        .neighbors(flow_graph.call_graph_vertex(), Direction::Outgoing)
        .into_iter()
        .filter_map(|vertex| program.call_graph.vertex(vertex).flow_graph)
        .map(|callee| program.flow_graphs[callee].md_index().to_bits())
        .collect();
    callee_indices.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(flow_graph.md_index().to_bits().to_le_bytes());
    for bits in callee_indices {
        hasher.update(bits.to_le_bytes());
    }
    truncate_digest(hasher)
}

/// Longest common subsequence of two instruction streams under cache
/// identity. Returns the aligned address pairs.
pub fn align_instructions(
    primary: &[Instruction],
    secondary: &[Instruction],
) -> Vec<(Address, Address)> {
    let rows = primary.len();
    let cols = secondary.len();
    let mut lengths = vec![vec![0usize; cols + 1]; rows + 1];
    for i in 0..rows {
        for j in 0..cols {
            lengths[i + 1][j + 1] = if primary[i].same_as(&secondary[j]) {
                lengths[i][j] + 1
            } else {
                lengths[i][j + 1].max(lengths[i + 1][j])
            };
        }
    }

    let mut matches = Vec::with_capacity(lengths[rows][cols]);
    let (mut i, mut j) = (rows, cols);
    while i > 0 && j > 0 {
        if primary[i - 1].same_as(&secondary[j - 1]) {
            matches.push((primary[i - 1].address, secondary[j - 1].address));
            i -= 1;
            j -= 1;
        } else if lengths[i - 1][j] >= lengths[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    matches.reverse();
    matches
}

fn hash_instruction(hasher: &mut Sha256, instruction: &Instruction) {
    hasher.update(instruction.mnemonic().as_bytes());
    hasher.update([0u8]);
    hasher.update(instruction.operands().as_bytes());
    hasher.update([0xffu8]);
}

fn truncate_digest(hasher: Sha256) -> Fingerprint {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_le_bytes(bytes)
}
