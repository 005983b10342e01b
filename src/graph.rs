//! Attribution graph over a transformer's components
//!
//! Nodes are the input embedding, every attention head, every MLP and the
//! logits. Every node except the logits *writes* to the residual stream;
//! every node except the input *reads* from it. Attention heads read through
//! three separate inputs (query, key, value), so an edge into a head is
//! labelled with the input it feeds.
//!
//! ## Index layout
//!
//! Writers are numbered in topological order:
//!
//! ```text
//! input            -> 0
//! a{l}.h{h}        -> 1 + l*(H+1) + h
//! m{l}             -> 1 + l*(H+1) + H
//! ```
//!
//! Readers are numbered per layer as `H` query slots, `H` key slots,
//! `H` value slots and one MLP slot, followed by a final logits slot.
//! Scores live in a dense `[n_forward, n_backward]` matrix; an entry is a
//! real edge only when the writer sits upstream of the reader.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EapError, Result};

/// Model dimensions a graph is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    pub d_model: usize,
}

impl GraphConfig {
    pub fn new(n_layers: usize, n_heads: usize, d_model: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            d_model,
        }
    }

    /// Number of writer nodes (input, heads, MLPs)
    pub fn n_forward(&self) -> usize {
        1 + self.n_layers * (self.n_heads + 1)
    }

    /// Number of reader slots (q/k/v per head, MLPs, logits)
    pub fn n_backward(&self) -> usize {
        self.n_layers * self.readers_per_layer() + 1
    }

    fn readers_per_layer(&self) -> usize {
        3 * self.n_heads + 1
    }

    /// First reader slot of layer `layer`'s attention heads
    pub fn attention_reader_start(&self, layer: usize) -> usize {
        layer * self.readers_per_layer()
    }

    /// Reader slot of an attention head input
    pub fn attention_reader(&self, layer: usize, head: usize, qkv: Qkv) -> usize {
        self.attention_reader_start(layer) + qkv.offset() * self.n_heads + head
    }

    /// Reader slot of layer `layer`'s MLP
    pub fn mlp_reader(&self, layer: usize) -> usize {
        self.attention_reader_start(layer) + 3 * self.n_heads
    }

    /// Reader slot of the logits
    pub fn logits_reader(&self) -> usize {
        self.n_layers * self.readers_per_layer()
    }

    /// First writer index of layer `layer`
    pub fn layer_writer_start(&self, layer: usize) -> usize {
        1 + layer * (self.n_heads + 1)
    }

    /// Number of writers upstream of a reader slot. Writers with a smaller
    /// index are exactly the parents of that reader.
    pub fn prefix(&self, reader: usize) -> usize {
        if reader >= self.logits_reader() {
            return self.n_forward();
        }
        let layer = reader / self.readers_per_layer();
        let slot = reader % self.readers_per_layer();
        if slot < 3 * self.n_heads {
            self.layer_writer_start(layer)
        } else {
            self.layer_writer_start(layer) + self.n_heads
        }
    }

    /// Writer index of a node, `None` for the logits
    pub fn forward_index(&self, node: Node) -> Option<usize> {
        match node {
            Node::Input => Some(0),
            Node::Attention { layer, head } => Some(self.layer_writer_start(layer) + head),
            Node::Mlp { layer } => Some(self.layer_writer_start(layer) + self.n_heads),
            Node::Logits => None,
        }
    }

    /// Node writing at index `index`
    pub fn writer_node(&self, index: usize) -> Node {
        if index == 0 {
            return Node::Input;
        }
        let layer = (index - 1) / (self.n_heads + 1);
        let slot = (index - 1) % (self.n_heads + 1);
        if slot < self.n_heads {
            Node::Attention { layer, head: slot }
        } else {
            Node::Mlp { layer }
        }
    }

    /// Node and input letter reading at slot `reader`
    pub fn reader_node(&self, reader: usize) -> (Node, Option<Qkv>) {
        if reader >= self.logits_reader() {
            return (Node::Logits, None);
        }
        let layer = reader / self.readers_per_layer();
        let slot = reader % self.readers_per_layer();
        if slot == 3 * self.n_heads {
            return (Node::Mlp { layer }, None);
        }
        let qkv = Qkv::from_offset(slot / self.n_heads);
        (
            Node::Attention {
                layer,
                head: slot % self.n_heads,
            },
            Some(qkv),
        )
    }

    /// Reader slots of a node (empty for the input)
    pub fn readers(&self, node: Node) -> Vec<usize> {
        match node {
            Node::Input => Vec::new(),
            Node::Attention { layer, head } => Qkv::ALL
                .iter()
                .map(|&qkv| self.attention_reader(layer, head, qkv))
                .collect(),
            Node::Mlp { layer } => vec![self.mlp_reader(layer)],
            Node::Logits => vec![self.logits_reader()],
        }
    }

    /// Dense node id: writer index, or `n_forward` for the logits
    pub fn node_id(&self, node: Node) -> usize {
        self.forward_index(node).unwrap_or_else(|| self.n_forward())
    }

    /// Node from a dense node id
    pub fn node_at(&self, id: usize) -> Node {
        if id >= self.n_forward() {
            Node::Logits
        } else {
            self.writer_node(id)
        }
    }

    /// All nodes in topological order
    pub fn nodes(&self) -> Vec<Node> {
        (0..=self.n_forward()).map(|id| self.node_at(id)).collect()
    }

    /// Number of real edges
    pub fn n_edges(&self) -> usize {
        (0..self.n_backward()).map(|r| self.prefix(r)).sum()
    }

    fn validate(&self, node: Node) -> bool {
        match node {
            Node::Input | Node::Logits => true,
            Node::Attention { layer, head } => layer < self.n_layers && head < self.n_heads,
            Node::Mlp { layer } => layer < self.n_layers,
        }
    }
}

/// Attention head input letter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qkv {
    Q,
    K,
    V,
}

impl Qkv {
    pub const ALL: [Qkv; 3] = [Qkv::Q, Qkv::K, Qkv::V];

    fn offset(self) -> usize {
        match self {
            Qkv::Q => 0,
            Qkv::K => 1,
            Qkv::V => 2,
        }
    }

    fn from_offset(offset: usize) -> Self {
        match offset {
            0 => Qkv::Q,
            1 => Qkv::K,
            _ => Qkv::V,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Qkv::Q => 'q',
            Qkv::K => 'k',
            Qkv::V => 'v',
        }
    }
}

/// A component of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Input,
    Attention { layer: usize, head: usize },
    Mlp { layer: usize },
    Logits,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Input => write!(f, "input"),
            Node::Attention { layer, head } => write!(f, "a{layer}.h{head}"),
            Node::Mlp { layer } => write!(f, "m{layer}"),
            Node::Logits => write!(f, "logits"),
        }
    }
}

impl FromStr for Node {
    type Err = EapError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || EapError::Graph(format!("bad node name: {s:?}"));
        match s {
            "input" => return Ok(Node::Input),
            "logits" => return Ok(Node::Logits),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix('a') {
            let (layer, head) = rest.split_once(".h").ok_or_else(bad)?;
            return Ok(Node::Attention {
                layer: layer.parse().map_err(|_| bad())?,
                head: head.parse().map_err(|_| bad())?,
            });
        }
        if let Some(layer) = s.strip_prefix('m') {
            return Ok(Node::Mlp {
                layer: layer.parse().map_err(|_| bad())?,
            });
        }
        Err(bad())
    }
}

/// View of one edge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub parent: Node,
    pub child: Node,
    pub qkv: Option<Qkv>,
    pub score: f32,
    pub in_graph: bool,
    pub forward: usize,
    pub backward: usize,
}

impl Edge {
    pub fn name(&self) -> String {
        match self.qkv {
            Some(qkv) => format!("{}->{}<{}>", self.parent, self.child, qkv.letter()),
            None => format!("{}->{}", self.parent, self.child),
        }
    }
}

/// Heap entry for greedy selection
#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: f32,
    forward: usize,
    backward: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // Max-heap on key; ties pop the lowest (forward, backward) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.forward.cmp(&self.forward))
            .then_with(|| other.backward.cmp(&self.backward))
    }
}

/// Scored attribution graph with an in-graph selection
#[derive(Debug, Clone)]
pub struct Graph {
    cfg: GraphConfig,
    scores: Vec<f32>,
    in_graph: Vec<bool>,
    nodes_in_graph: Vec<bool>,
    scored: bool,
}

impl Graph {
    /// Fresh graph with every real edge and node included and no scores
    pub fn from_config(cfg: GraphConfig) -> Self {
        let n = cfg.n_forward() * cfg.n_backward();
        let mut graph = Self {
            cfg,
            scores: vec![0.0; n],
            in_graph: vec![false; n],
            nodes_in_graph: vec![true; cfg.n_forward() + 1],
            scored: false,
        };
        graph.include_all();
        graph
    }

    pub fn cfg(&self) -> &GraphConfig {
        &self.cfg
    }

    /// Whether attribution scores have been written
    pub fn is_scored(&self) -> bool {
        self.scored
    }

    fn flat(&self, forward: usize, backward: usize) -> usize {
        forward * self.cfg.n_backward() + backward
    }

    fn is_real(&self, forward: usize, backward: usize) -> bool {
        forward < self.cfg.prefix(backward)
    }

    /// Number of real edges
    pub fn n_edges(&self) -> usize {
        self.cfg.n_edges()
    }

    fn edge_at(&self, forward: usize, backward: usize) -> Edge {
        let (child, qkv) = self.cfg.reader_node(backward);
        let i = self.flat(forward, backward);
        Edge {
            parent: self.cfg.writer_node(forward),
            child,
            qkv,
            score: self.scores[i],
            in_graph: self.in_graph[i],
            forward,
            backward,
        }
    }

    /// Every real edge, ordered by reader slot then writer index
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        (0..self.cfg.n_backward())
            .flat_map(move |b| (0..self.cfg.prefix(b)).map(move |f| (f, b)))
            .map(|(f, b)| self.edge_at(f, b))
    }

    /// Look up an edge by name, e.g. `"a0.h1->m2"` or `"input->a1.h0<k>"`
    pub fn edge(&self, name: &str) -> Result<Edge> {
        let (forward, backward) = self.parse_edge_name(name)?;
        Ok(self.edge_at(forward, backward))
    }

    fn parse_edge_name(&self, name: &str) -> Result<(usize, usize)> {
        let bad = |why: &str| EapError::Graph(format!("bad edge name {name:?}: {why}"));
        let (parent, child) = name.split_once("->").ok_or_else(|| bad("missing '->'"))?;
        let (child, qkv) = match child.strip_suffix('>').and_then(|c| c.split_once('<')) {
            Some((c, "q")) => (c, Some(Qkv::Q)),
            Some((c, "k")) => (c, Some(Qkv::K)),
            Some((c, "v")) => (c, Some(Qkv::V)),
            Some(_) => return Err(bad("unknown input letter")),
            None => (child, None),
        };
        let parent: Node = parent.parse()?;
        let child: Node = child.parse()?;
        if !self.cfg.validate(parent) || !self.cfg.validate(child) {
            return Err(bad("node out of range"));
        }
        let forward = self
            .cfg
            .forward_index(parent)
            .ok_or_else(|| bad("logits cannot be a parent"))?;
        let backward = match (child, qkv) {
            (Node::Attention { layer, head }, Some(qkv)) => {
                self.cfg.attention_reader(layer, head, qkv)
            }
            (Node::Mlp { layer }, None) => self.cfg.mlp_reader(layer),
            (Node::Logits, None) => self.cfg.logits_reader(),
            _ => return Err(bad("input letter does not match child")),
        };
        if !self.is_real(forward, backward) {
            return Err(bad("parent is not upstream of child"));
        }
        Ok((forward, backward))
    }

    /// Score of edge `forward -> backward`
    pub fn score(&self, forward: usize, backward: usize) -> f32 {
        self.scores[self.flat(forward, backward)]
    }

    /// Raw `[n_forward, n_backward]` score matrix, row-major
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Add `scale * matrix` to the scores of real edges
    pub fn add_scores(&mut self, matrix: &[f32], scale: f32) -> Result<()> {
        if matrix.len() != self.scores.len() {
            return Err(EapError::Graph(format!(
                "score matrix has {} entries, expected {}",
                matrix.len(),
                self.scores.len()
            )));
        }
        for b in 0..self.cfg.n_backward() {
            for f in 0..self.cfg.prefix(b) {
                let i = self.flat(f, b);
                self.scores[i] += scale * matrix[i];
            }
        }
        self.scored = true;
        Ok(())
    }

    /// Whether node is currently in the graph
    pub fn node_in_graph(&self, node: Node) -> bool {
        self.nodes_in_graph[self.cfg.node_id(node)]
    }

    fn reset(&mut self) {
        self.in_graph.iter_mut().for_each(|e| *e = false);
        self.nodes_in_graph.iter_mut().for_each(|n| *n = false);
    }

    /// Include every real edge and node
    pub fn include_all(&mut self) {
        for b in 0..self.cfg.n_backward() {
            for f in 0..self.cfg.prefix(b) {
                let i = self.flat(f, b);
                self.in_graph[i] = true;
            }
        }
        self.nodes_in_graph.iter_mut().for_each(|n| *n = true);
    }

    /// Exclude every edge and node
    pub fn exclude_all(&mut self) {
        self.reset();
    }

    /// Mark edge `forward -> backward` as included or not. Node flags are
    /// left untouched.
    pub fn set_edge(&mut self, forward: usize, backward: usize, in_graph: bool) -> Result<()> {
        if backward >= self.cfg.n_backward() || !self.is_real(forward, backward) {
            return Err(EapError::Graph(format!(
                "no edge between writer {forward} and reader {backward}"
            )));
        }
        let i = self.flat(forward, backward);
        self.in_graph[i] = in_graph;
        Ok(())
    }

    fn parent_edges(&self, node: Node) -> Vec<(usize, usize)> {
        self.cfg
            .readers(node)
            .into_iter()
            .flat_map(|b| (0..self.cfg.prefix(b)).map(move |f| (f, b)))
            .collect()
    }

    fn child_edges(&self, forward: usize) -> Vec<(usize, usize)> {
        (0..self.cfg.n_backward())
            .filter(|&b| forward < self.cfg.prefix(b))
            .map(|b| (forward, b))
            .collect()
    }

    fn key(score: f32, absolute: bool) -> f32 {
        if absolute {
            score.abs()
        } else {
            score
        }
    }

    /// Greedily grow a circuit of `n_edges` edges backwards from the logits.
    ///
    /// Candidates start as the logits' incoming edges. Each step includes the
    /// best-scoring candidate; when that edge brings a new parent node into
    /// the graph, the parent's own incoming edges become candidates. Every
    /// included edge is therefore connected to the logits.
    pub fn apply_greedy(&mut self, n_edges: usize, absolute: bool) {
        self.reset();
        let logits = self.cfg.node_id(Node::Logits);
        self.nodes_in_graph[logits] = true;

        let mut heap = BinaryHeap::new();
        self.push_candidates(&mut heap, Node::Logits, absolute);

        let mut added = 0;
        while added < n_edges {
            let Some(top) = heap.pop() else { break };
            let i = self.flat(top.forward, top.backward);
            self.in_graph[i] = true;
            added += 1;

            if !self.nodes_in_graph[top.forward] {
                self.nodes_in_graph[top.forward] = true;
                let parent = self.cfg.writer_node(top.forward);
                self.push_candidates(&mut heap, parent, absolute);
            }
        }
        debug!("Greedy selection: {} of {} requested edges", added, n_edges);
    }

    fn push_candidates(&self, heap: &mut BinaryHeap<Candidate>, node: Node, absolute: bool) {
        for (forward, backward) in self.parent_edges(node) {
            heap.push(Candidate {
                key: Self::key(self.score(forward, backward), absolute),
                forward,
                backward,
            });
        }
    }

    fn ranked_edges(&self, absolute: bool) -> Vec<Candidate> {
        let mut ranked: Vec<Candidate> = self
            .edges()
            .map(|e| Candidate {
                key: Self::key(e.score, absolute),
                forward: e.forward,
                backward: e.backward,
            })
            .collect();
        ranked.sort_by(|a, b| b.cmp(a));
        ranked
    }

    fn include_with_endpoints(&mut self, forward: usize, backward: usize) {
        let i = self.flat(forward, backward);
        self.in_graph[i] = true;
        self.nodes_in_graph[forward] = true;
        let child = self.cfg.node_id(self.cfg.reader_node(backward).0);
        self.nodes_in_graph[child] = true;
    }

    /// Include the `n` highest-scoring edges, ignoring connectivity
    pub fn apply_topn(&mut self, n: usize, absolute: bool) {
        self.reset();
        for c in self.ranked_edges(absolute).into_iter().take(n) {
            self.include_with_endpoints(c.forward, c.backward);
        }
    }

    /// Include every edge whose score (or absolute score) reaches `threshold`
    pub fn apply_threshold(&mut self, threshold: f32, absolute: bool) {
        self.reset();
        for c in self.ranked_edges(absolute) {
            if c.key < threshold {
                break;
            }
            self.include_with_endpoints(c.forward, c.backward);
        }
    }

    /// Remove nodes that cannot influence the logits or cannot be influenced
    /// by the input.
    ///
    /// A reverse-topological pass drops nodes with no included child edge
    /// (and, with `prune_childless`, their incoming edges). A forward pass
    /// then drops non-input nodes with no included parent edge along with
    /// their outgoing edges.
    pub fn prune_dead_nodes(&mut self, prune_childless: bool, prune_parentless: bool) {
        let logits = self.cfg.node_id(Node::Logits);
        self.nodes_in_graph[logits] = self.any_included(&self.parent_edges(Node::Logits));

        for forward in (0..self.cfg.n_forward()).rev() {
            let node = self.cfg.writer_node(forward);
            if self.any_included(&self.child_edges(forward)) {
                self.nodes_in_graph[forward] = true;
            } else if prune_childless {
                self.nodes_in_graph[forward] = false;
                for (f, b) in self.parent_edges(node) {
                    let i = self.flat(f, b);
                    self.in_graph[i] = false;
                }
            } else {
                self.nodes_in_graph[forward] = self.any_included(&self.parent_edges(node));
            }
        }

        if prune_parentless {
            for id in 1..=self.cfg.n_forward() {
                let node = self.cfg.node_at(id);
                if self.nodes_in_graph[id] && !self.any_included(&self.parent_edges(node)) {
                    self.nodes_in_graph[id] = false;
                    if id < self.cfg.n_forward() {
                        for (f, b) in self.child_edges(id) {
                            let i = self.flat(f, b);
                            self.in_graph[i] = false;
                        }
                    }
                }
            }
        }
    }

    fn any_included(&self, edges: &[(usize, usize)]) -> bool {
        edges.iter().any(|&(f, b)| self.in_graph[self.flat(f, b)])
    }

    /// Number of included edges
    pub fn count_included_edges(&self) -> usize {
        self.in_graph.iter().filter(|&&e| e).count()
    }

    /// Number of included nodes
    pub fn count_included_nodes(&self) -> usize {
        self.nodes_in_graph.iter().filter(|&&n| n).count()
    }

    /// `[n_forward, n_backward]` matrix with 1.0 for every real edge that is
    /// not in the graph
    pub fn excluded_edge_matrix(&self) -> Vec<f32> {
        let mut out = vec![0.0; self.scores.len()];
        for b in 0..self.cfg.n_backward() {
            for f in 0..self.cfg.prefix(b) {
                let i = self.flat(f, b);
                if !self.in_graph[i] {
                    out[i] = 1.0;
                }
            }
        }
        out
    }

    /// Serialize to the JSON snapshot layout
    pub fn to_json_value(&self) -> GraphJson {
        let nodes = self
            .cfg
            .nodes()
            .into_iter()
            .map(|n| (n.to_string(), self.node_in_graph(n)))
            .collect();
        let edges = self
            .edges()
            .map(|e| {
                (
                    e.name(),
                    EdgeJson {
                        score: self.scored.then_some(e.score),
                        in_graph: e.in_graph,
                    },
                )
            })
            .collect();
        GraphJson {
            cfg: self.cfg,
            nodes,
            edges,
        }
    }

    /// Write a JSON snapshot
    pub fn to_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.to_json_value())?;
        Ok(())
    }

    /// Rebuild a graph from a JSON snapshot
    pub fn from_json_value(json: &GraphJson) -> Result<Self> {
        let mut graph = Self::from_config(json.cfg);
        graph.reset();
        let mut scored = false;
        for (name, edge) in &json.edges {
            let (f, b) = graph.parse_edge_name(name)?;
            let i = graph.flat(f, b);
            graph.in_graph[i] = edge.in_graph;
            if let Some(score) = edge.score {
                graph.scores[i] = score;
                scored = true;
            }
        }
        let ids: HashMap<String, usize> = graph
            .cfg
            .nodes()
            .into_iter()
            .map(|n| (n.to_string(), graph.cfg.node_id(n)))
            .collect();
        for (name, &in_graph) in &json.nodes {
            let id = ids
                .get(name)
                .ok_or_else(|| EapError::Graph(format!("unknown node {name:?}")))?;
            graph.nodes_in_graph[*id] = in_graph;
        }
        graph.scored = scored;
        Ok(graph)
    }

    /// Load a JSON snapshot
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let json: GraphJson = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::from_json_value(&json)
    }
}

/// JSON snapshot layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphJson {
    pub cfg: GraphConfig,
    pub nodes: BTreeMap<String, bool>,
    pub edges: BTreeMap<String, EdgeJson>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeJson {
    pub score: Option<f32>,
    pub in_graph: bool,
}
