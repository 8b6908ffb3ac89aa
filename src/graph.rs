use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;
use crate::Address;

/// Handle into a program's flow graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowGraphId(pub(crate) usize);

/// Kind of an intra-function control flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Unconditional,
    #[serde(rename = "true")]
    TrueBranch,
    #[serde(rename = "false")]
    FalseBranch,
    Switch,
}

/// Per-function attributes of a call graph vertex.
#[derive(Debug, Clone)]
pub struct FunctionVertex {
    pub address: Address,
    pub name: Option<String>,
    pub demangled_name: Option<String>,
    pub library: bool,
    pub stub: bool,
    pub imported: bool,
    pub flow_graph: Option<FlowGraphId>,
}

impl FunctionVertex {
    pub fn display_name(&self) -> String {
        self.demangled_name
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| format!("sub_{:x}", self.address))
    }

    /// The name used for name-based fingerprints, if the function has one.
    pub fn best_name(&self) -> Option<&str> {
        self.demangled_name.as_deref().or(self.name.as_deref())
    }
}

/// A call relationship. Multiple syntactic calls between the same pair of
/// functions collapse to one non-duplicate edge plus duplicate-flagged extras.
#[derive(Debug, Clone)]
pub struct CallEdge {
    pub duplicate: bool,
}

/// Directed multigraph of functions. Vertices are keyed by entry address.
pub struct CallGraph {
    pub executable: String,
    pub exe_hash: String,
    graph: DiGraph<FunctionVertex, CallEdge>,
    by_address: FxHashMap<Address, NodeIndex>,
    md_index: f64,
}

impl CallGraph {
    pub fn new(executable: impl Into<String>, exe_hash: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            exe_hash: exe_hash.into(),
            graph: DiGraph::new(),
            by_address: FxHashMap::default(),
            md_index: 0.0,
        }
    }

    /// Inserts a function vertex. Returns `None` if the address is taken.
    pub fn add_function(&mut self, vertex: FunctionVertex) -> Option<NodeIndex> {
        if self.by_address.contains_key(&vertex.address) {
            return None;
        }
        let address = vertex.address;
        let index = self.graph.add_node(vertex);
        self.by_address.insert(address, index);
        Some(index)
    }

    /// Inserts a call edge, collapsing repeats into duplicates. Returns false
    /// when either endpoint is unknown.
    pub fn add_call(&mut self, source: Address, target: Address) -> bool {
        let (Some(&from), Some(&to)) = (self.by_address.get(&source), self.by_address.get(&target))
        else {
            return false;
        };
        let duplicate = self.graph.find_edge(from, to).is_some();
        self.graph.add_edge(from, to, CallEdge { duplicate });
        true
    }

    pub fn find(&self, address: Address) -> Option<NodeIndex> {
        self.by_address.get(&address).copied()
    }

    pub fn vertex(&self, index: NodeIndex) -> &FunctionVertex {
        &self.graph[index]
    }

    pub fn vertex_mut(&mut self, index: NodeIndex) -> &mut FunctionVertex {
        &mut self.graph[index]
    }

    pub fn vertices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn function_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Call graph neighbors along `direction`, skipping duplicate edges.
    pub fn neighbors(&self, vertex: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        for edge in self.graph.edges_directed(vertex, direction) {
            if edge.weight().duplicate {
                continue;
            }
            out.push(match direction {
                Direction::Outgoing => edge.target(),
                Direction::Incoming => edge.source(),
            });
        }
        out
    }

    pub fn graph(&self) -> &DiGraph<FunctionVertex, CallEdge> {
        &self.graph
    }

    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    pub fn set_md_index(&mut self, value: f64) {
        self.md_index = value;
    }
}

/// A straight-line sequence of instructions with one entry and one exit.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub address: Address,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Call instructions of the block in address order.
    pub fn call_targets(&self) -> impl Iterator<Item = Address> + '_ {
        self.instructions.iter().filter_map(|i| i.call_target)
    }
}

/// Control flow graph of a single function. Stub functions (imports without a
/// body in the export) carry an empty graph.
pub struct FlowGraph {
    entry: Address,
    call_graph_vertex: NodeIndex,
    graph: DiGraph<BasicBlock, EdgeKind>,
    by_address: FxHashMap<Address, NodeIndex>,
    md_index: f64,
    matched: bool,
}

impl FlowGraph {
    pub fn new(entry: Address, call_graph_vertex: NodeIndex) -> Self {
        Self {
            entry,
            call_graph_vertex,
            graph: DiGraph::new(),
            by_address: FxHashMap::default(),
            md_index: 0.0,
            matched: false,
        }
    }

    /// Inserts a basic block. Returns `None` if the address is taken.
    pub fn add_block(&mut self, block: BasicBlock) -> Option<NodeIndex> {
        if self.by_address.contains_key(&block.address) {
            return None;
        }
        let address = block.address;
        let index = self.graph.add_node(block);
        self.by_address.insert(address, index);
        Some(index)
    }

    /// Inserts a control flow edge between two known blocks.
    pub fn add_edge(&mut self, source: Address, target: Address, kind: EdgeKind) -> bool {
        let (Some(&from), Some(&to)) = (self.by_address.get(&source), self.by_address.get(&target))
        else {
            return false;
        };
        self.graph.add_edge(from, to, kind);
        true
    }

    pub fn entry_address(&self) -> Address {
        self.entry
    }

    pub fn call_graph_vertex(&self) -> NodeIndex {
        self.call_graph_vertex
    }

    pub fn find_block(&self, address: Address) -> Option<NodeIndex> {
        self.by_address.get(&address).copied()
    }

    pub fn block(&self, index: NodeIndex) -> &BasicBlock {
        &self.graph[index]
    }

    pub fn blocks(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    /// Block node indices sorted by block entry address.
    pub fn blocks_by_address(&self) -> Vec<NodeIndex> {
        let mut out: Vec<NodeIndex> = self.graph.node_indices().collect();
        out.sort_by_key(|&index| self.graph[index].address);
        out
    }

    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn instruction_count(&self) -> usize {
        self.graph
            .node_weights()
            .map(|block| block.instruction_count())
            .sum()
    }

    pub fn is_stub(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn neighbors(&self, block: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
        self.graph.neighbors_directed(block, direction).collect()
    }

    pub fn has_edge(&self, source: NodeIndex, target: NodeIndex) -> bool {
        self.graph.find_edge(source, target).is_some()
    }

    pub fn graph(&self) -> &DiGraph<BasicBlock, EdgeKind> {
        &self.graph
    }

    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    pub fn set_md_index(&mut self, value: f64) {
        self.md_index = value;
    }

    /// Whether this function is part of a fixed point. The only per-vertex
    /// state that changes during matching.
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    pub fn set_matched(&mut self, matched: bool) {
        self.matched = matched;
    }
}

/// Arena of flow graphs owned by one program.
#[derive(Default)]
pub struct FlowGraphs {
    graphs: Vec<FlowGraph>,
}

impl FlowGraphs {
    pub fn insert(&mut self, flow_graph: FlowGraph) -> FlowGraphId {
        let id = FlowGraphId(self.graphs.len());
        self.graphs.push(flow_graph);
        id
    }

    pub fn ids(&self) -> impl Iterator<Item = FlowGraphId> {
        (0..self.graphs.len()).map(FlowGraphId)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowGraph> {
        self.graphs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut FlowGraph> {
        self.graphs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

impl std::ops::Index<FlowGraphId> for FlowGraphs {
    type Output = FlowGraph;

    fn index(&self, id: FlowGraphId) -> &FlowGraph {
        &self.graphs[id.0]
    }
}

impl std::ops::IndexMut<FlowGraphId> for FlowGraphs {
    fn index_mut(&mut self, id: FlowGraphId) -> &mut FlowGraph {
        &mut self.graphs[id.0]
    }
}

/// One side of a diff: a call graph plus the flow graphs of its functions.
pub struct Program {
    pub call_graph: CallGraph,
    pub flow_graphs: FlowGraphs,
}

impl Program {
    pub fn new(call_graph: CallGraph) -> Self {
        Self {
            call_graph,
            flow_graphs: FlowGraphs::default(),
        }
    }

    pub fn function_of(&self, id: FlowGraphId) -> &FunctionVertex {
        self.call_graph.vertex(self.flow_graphs[id].call_graph_vertex())
    }

    pub fn is_library(&self, id: FlowGraphId) -> bool {
        self.function_of(id).library
    }

    /// Synthesizes empty stub flow graphs for call graph vertices without a
    /// body in the export (imports from shared libraries), so call graph
    /// matching still sees a node.
    pub fn add_stubs(&mut self) {
        let vertices: Vec<NodeIndex> = self.call_graph.vertices().collect();
        for vertex in vertices {
            if self.call_graph.vertex(vertex).flow_graph.is_some() {
                continue;
            }
            let entry = self.call_graph.vertex(vertex).address;
            let id = self.flow_graphs.insert(FlowGraph::new(entry, vertex));
            let function = self.call_graph.vertex_mut(vertex);
            function.flow_graph = Some(id);
            function.stub = true;
            function.library = true;
        }
    }

    /// All flow graph ids ordered by function entry address.
    pub fn sorted_flow_graph_ids(&self) -> Vec<FlowGraphId> {
        let mut ids: Vec<FlowGraphId> = self.flow_graphs.ids().collect();
        ids.sort_by_key(|&id| self.flow_graphs[id].entry_address());
        ids
    }

    pub fn reset_matches(&mut self) {
        for flow_graph in self.flow_graphs.iter_mut() {
            flow_graph.set_matched(false);
        }
    }
}
