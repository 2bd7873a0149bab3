//! Deterministic topological linearization of node sets.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use super::node::Node;
use super::GraphError;

/// Computes a dependency-respecting order over `nodes`, returned as positions into the slice.
///
/// Edges follow `bottoms`. Among ready nodes the one with the smallest original position goes
/// first, so the order is stable: an already-sorted input comes back unchanged.
pub fn topological_order(nodes: &[Node]) -> Result<Vec<usize>, GraphError> {
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
    for (idx, node) in nodes.iter().enumerate() {
        if position.insert(node.name.as_str(), idx).is_some() {
            return Err(GraphError::DuplicateNode {
                name: node.name.clone(),
            });
        }
    }

    let mut indegree = vec![0usize; nodes.len()];
    let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (idx, node) in nodes.iter().enumerate() {
        for bottom in &node.bottoms {
            let Some(&producer) = position.get(bottom.as_str()) else {
                return Err(GraphError::DanglingBottom {
                    node: node.name.clone(),
                    bottom: bottom.clone(),
                });
            };
            consumers[producer].push(idx);
            indegree[idx] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &consumer in &consumers[idx] {
            indegree[consumer] -= 1;
            if indegree[consumer] == 0 {
                ready.push(Reverse(consumer));
            }
        }
    }

    if order.len() != nodes.len() {
        let node = node_on_cycle(nodes, &position, &indegree);
        return Err(GraphError::Cycle { node });
    }
    Ok(order)
}

/// Reorders `nodes` topologically, see [`topological_order`].
pub fn sort_topologically(nodes: Vec<Node>) -> Result<Vec<Node>, GraphError> {
    let order = topological_order(&nodes)?;
    let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect())
}

/// Every unordered node keeps an unordered producer, so walking producers from one of them must
/// revisit a node; the first revisited node lies on a cycle.
fn node_on_cycle(nodes: &[Node], position: &HashMap<&str, usize>, indegree: &[usize]) -> String {
    let Some(start) = indegree.iter().position(|&deg| deg > 0) else {
        return String::new();
    };
    let mut visited = vec![false; nodes.len()];
    let mut current = start;
    loop {
        if visited[current] {
            return nodes[current].name.clone();
        }
        visited[current] = true;
        let next = nodes[current]
            .bottoms
            .iter()
            .filter_map(|bottom| position.get(bottom.as_str()).copied())
            .find(|&producer| indegree[producer] > 0);
        match next {
            Some(producer) => current = producer,
            None => return nodes[current].name.clone(),
        }
    }
}
