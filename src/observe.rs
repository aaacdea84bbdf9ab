//! Selector-query observer for debugging scraper assumptions.
//!
//! An explicit scope object: scraper code holds a [`SelectorObserver`] and
//! records each checked selector evaluation against it. Queries on elements
//! returned by an earlier query link back to the producing node, so the
//! output is a tree mirroring how the page was walked. Repeated queries with
//! the same `(parent, selector)` coalesce into one node with aggregated
//! counts.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::SelectorKind;

const MAX_SAMPLES: usize = 3;
const MAX_SAMPLE_LENGTH: usize = 100;

/// Opaque handle for an element returned by a recorded query. Passing it as
/// the parent of a later query nests that query under the producing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementToken(u64);

/// One recorded selector query, as serialized into the JSON tree.
#[derive(Debug, Clone, Serialize)]
pub struct QueryNode {
    pub selector: String,
    pub selector_type: SelectorKind,
    pub description: String,
    pub match_count: usize,
    pub expected_min: u32,
    pub expected_max: Option<u32>,
    pub sample_elements: Vec<String>,
    pub element_id: String,
    pub parent_element_id: Option<String>,
    pub children: Vec<QueryNode>,
}

impl QueryNode {
    fn within_bounds(&self) -> bool {
        self.match_count >= self.expected_min as usize
            && self
                .expected_max
                .is_none_or(|max| self.match_count <= max as usize)
    }
}

#[derive(Default)]
struct ObserverInner {
    /// Arena of nodes; roots and children index into it.
    nodes: Vec<QueryNode>,
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
    /// element token → node that produced it
    token_to_node: HashMap<u64, usize>,
    /// (parent node element_id, selector) → node, for coalescing
    dedup: HashMap<(Option<String>, String), usize>,
    next_token: u64,
    next_element_id: u64,
}

/// Collects selector query records for one observation scope.
pub struct SelectorObserver {
    inner: Mutex<ObserverInner>,
}

impl Default for SelectorObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectorObserver {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ObserverInner::default()),
        }
    }

    /// Record a query and its results.
    ///
    /// `samples` are the text contents of the matches (all of them or a
    /// prefix); `match_count` may exceed `samples.len()`. The returned
    /// tokens, one per match, identify the matched elements for nesting.
    pub fn record_query(
        &self,
        selector: &str,
        selector_type: SelectorKind,
        description: &str,
        match_count: usize,
        samples: &[String],
        expected_min: u32,
        expected_max: Option<u32>,
        parent: Option<ElementToken>,
    ) -> Vec<ElementToken> {
        let mut inner = self.inner.lock().expect("observer lock poisoned");

        let parent_node = parent.and_then(|t| inner.token_to_node.get(&t.0).copied());
        let parent_element_id = parent_node.map(|idx| inner.nodes[idx].element_id.clone());
        let dedup_key = (parent_element_id.clone(), selector.to_string());

        let node_idx = match inner.dedup.get(&dedup_key).copied() {
            Some(existing) => {
                // Coalesce: aggregate counts and top up samples to the cap
                let node = &mut inner.nodes[existing];
                node.match_count += match_count;
                let room = MAX_SAMPLES.saturating_sub(node.sample_elements.len());
                node.sample_elements
                    .extend(samples.iter().take(room).map(|s| clip(s)));
                existing
            }
            None => {
                inner.next_element_id += 1;
                let element_id = format!("query_match_{}", inner.next_element_id);
                let node = QueryNode {
                    selector: selector.to_string(),
                    selector_type,
                    description: description.to_string(),
                    match_count,
                    expected_min,
                    expected_max,
                    sample_elements: samples.iter().take(MAX_SAMPLES).map(|s| clip(s)).collect(),
                    element_id,
                    parent_element_id,
                    children: Vec::new(),
                };
                let idx = inner.nodes.len();
                inner.nodes.push(node);
                inner.children.push(Vec::new());
                match parent_node {
                    Some(parent_idx) => inner.children[parent_idx].push(idx),
                    None => inner.roots.push(idx),
                }
                inner.dedup.insert(dedup_key, idx);
                idx
            }
        };

        // Issue a token per match, all mapping back to this node
        let mut tokens = Vec::with_capacity(match_count);
        for _ in 0..match_count {
            inner.next_token += 1;
            let token = inner.next_token;
            inner.token_to_node.insert(token, node_idx);
            tokens.push(ElementToken(token));
        }
        tokens
    }

    /// Human-readable tree with check/cross marks and one sample preview
    /// per node.
    pub fn simple_tree(&self) -> String {
        let inner = self.inner.lock().expect("observer lock poisoned");
        let mut lines = Vec::new();
        for &root in &inner.roots {
            format_node(&inner, root, 0, &mut lines);
        }
        lines.join("\n")
    }

    /// JSON tree for UI highlighting.
    pub fn json(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("observer lock poisoned");
        let trees: Vec<QueryNode> = inner
            .roots
            .iter()
            .map(|&root| materialize(&inner, root))
            .collect();
        serde_json::to_value(trees).unwrap_or(serde_json::Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("observer lock poisoned").nodes.is_empty()
    }
}

fn clip(sample: &str) -> String {
    let collapsed = sample.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() > MAX_SAMPLE_LENGTH {
        let mut end = MAX_SAMPLE_LENGTH;
        while !collapsed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &collapsed[..end])
    } else {
        collapsed
    }
}

fn format_node(inner: &ObserverInner, idx: usize, indent: usize, lines: &mut Vec<String>) {
    let node = &inner.nodes[idx];
    let status = if node.within_bounds() { "\u{2713}" } else { "\u{2717}" };

    let mut match_text = format!(
        "{} match{}",
        node.match_count,
        if node.match_count == 1 { "" } else { "es" }
    );
    if !node.within_bounds() {
        if node.match_count < node.expected_min as usize {
            match_text.push_str(&format!(", expected {}+", node.expected_min));
        } else if let Some(max) = node.expected_max {
            match_text.push_str(&format!(", expected max {max}"));
        }
    }

    lines.push(format!(
        "{}- {} \"{}\" {} ({})",
        "  ".repeat(indent),
        node.selector,
        node.description,
        status,
        match_text
    ));

    if node.match_count > 0 {
        if let Some(sample) = node.sample_elements.first() {
            if !sample.is_empty() {
                lines.push(format!("{}\u{2192} \"{}\"", "  ".repeat(indent + 1), sample));
            }
        }
    }

    for &child in &inner.children[idx] {
        format_node(inner, child, indent + 1, lines);
    }
}

fn materialize(inner: &ObserverInner, idx: usize) -> QueryNode {
    let mut node = inner.nodes[idx].clone();
    node.children = inner.children[idx]
        .iter()
        .map(|&child| materialize(inner, child))
        .collect();
    node
}
