//! Variant hashing
//!
//! Each package instance is named on disk by
//! `BLAKE3(canonical-key | sorted weak bindings | sorted fallbacks)`.
//! Strong dependencies contribute nothing: they are reached transitively
//! through their own variant hashes, so rebuilding a strong dep's
//! provider does not move its dependents. Rebinding a weak or ref-only
//! product to a different provider does.

use crate::resolver::{EdgeKind, Graph};
use std::collections::BTreeSet;

/// Annotate every package node in the graph with its variant hash.
pub fn compute_variant_hashes(graph: &mut Graph) {
    for i in 0..graph.nodes.len() {
        if graph.nodes[i].is_bundle() {
            continue;
        }
        let input = hash_input(graph, i);
        graph.nodes[i].variant_hash = blake3::hash(input.as_bytes()).to_hex().to_string();
    }
}

/// The exact pre-hash byte string for one node. Kept separate so tests
/// can assert on the input grammar.
pub fn hash_input(graph: &Graph, idx: usize) -> String {
    let node = &graph.nodes[idx];
    let strong_reach = strong_reachable(graph, idx);

    let mut pairs: Vec<String> = Vec::new();
    for edge in &node.edges {
        if let EdgeKind::Product {
            name,
            via_weak: true,
        } = &edge.kind
        {
            // Providers already reached over a pure-strong path are
            // covered by strong-dep transitivity; only pool bindings
            // name the provider in the hash.
            if strong_reach.contains(&edge.target) {
                continue;
            }
            pairs.push(format!("|{}={}", name, graph.nodes[edge.target].key));
        }
    }
    pairs.sort();

    let mut input = node.key.clone();
    for pair in &pairs {
        input.push_str(pair);
    }
    for fallback in &node.used_fallbacks {
        input.push_str("|fallback=");
        input.push_str(fallback);
    }
    input
}

/// Nodes reachable from `idx` over strong edges only, excluding `idx`.
fn strong_reachable(graph: &Graph, idx: usize) -> BTreeSet<usize> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<usize> = graph.nodes[idx]
        .edges
        .iter()
        .filter(|e| e.is_strong())
        .map(|e| e.target)
        .collect();
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        for e in &graph.nodes[n].edges {
            if e.is_strong() {
                stack.push(e.target);
            }
        }
    }
    seen
}
