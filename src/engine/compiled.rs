//! Indexed, validated rule chain
//!
//! Nodes live in a table addressed by index; relations map `(from, label)` to
//! target indices. Validation happens once at install time so execution never
//! meets an unknown node.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering}
};

use crate::{
    domain::{
        chain::{ChainId, CompletionPolicy, RuleChainDef},
        error::PipelineError
    },
    engine::{
        node::{NodeState, RuleNode},
        template::TemplateSet
    }
};

#[derive(Debug)]
pub struct CompiledNode {
    pub id:   String,
    pub name: String,
    pub kind: &'static str,
    pub node: RuleNode
}

/// Source of `CompiledChain::generation`
static GENERATIONS: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct CompiledChain {
    pub id:         ChainId,
    pub name:       String,
    pub version:    u64,
    /// Distinct for every compilation, even of the same id and version
    pub generation: u64,
    pub root:       usize,
    pub hop_budget: u32,
    pub completion: CompletionPolicy,
    nodes:          Vec<CompiledNode>,
    relations:      HashMap<(usize, String), Vec<usize>>,
    templates:      TemplateSet
}

impl CompiledChain {
    pub fn compile(def: &RuleChainDef, default_hop_budget: u32) -> Result<Self, PipelineError> {
        let chain_error = |reason: String| PipelineError::ChainConfiguration(format!("chain {}: {}", def.id, reason));

        if def.nodes.is_empty() {
            return Err(chain_error("no nodes".to_string()));
        }

        let mut index = HashMap::new();
        let mut templates = TemplateSet::new();
        let mut nodes = Vec::with_capacity(def.nodes.len());

        for node_def in &def.nodes {
            if index.insert(node_def.id.clone(), nodes.len()).is_some() {
                return Err(chain_error(format!("duplicate node id {}", node_def.id)));
            }
            let node = RuleNode::compile(&node_def.id, &node_def.config, &mut templates)
                .map_err(|e| chain_error(format!("node {}: {}", node_def.id, e)))?;
            nodes.push(CompiledNode {
                id: node_def.id.clone(),
                name: node_def.name.clone().unwrap_or_else(|| node_def.id.clone()),
                kind: node_def.config.kind(),
                node
            });
        }

        let root =
            *index.get(&def.root).ok_or_else(|| chain_error(format!("root node {} is not defined", def.root)))?;

        let mut relations: HashMap<(usize, String), Vec<usize>> = HashMap::new();
        for relation in &def.relations {
            let from = *index
                .get(&relation.from)
                .ok_or_else(|| chain_error(format!("relation from unknown node {}", relation.from)))?;
            let to = *index.get(&relation.to).ok_or_else(|| {
                chain_error(format!("relation {} --{}--> unknown target {}", relation.from, relation.label, relation.to))
            })?;
            let targets = relations.entry((from, relation.label.clone())).or_default();
            if !targets.contains(&to) {
                targets.push(to);
            }
        }

        let hop_budget = def.hop_budget.unwrap_or(default_hop_budget);
        if hop_budget == 0 {
            return Err(chain_error("hop budget must be positive".to_string()));
        }

        Ok(Self {
            id: def.id.clone(),
            name: def.name.clone(),
            version: def.version,
            generation: GENERATIONS.fetch_add(1, Ordering::Relaxed),
            root,
            hop_budget,
            completion: def.completion,
            nodes,
            relations,
            templates
        })
    }

    pub fn node(&self, index: usize) -> &CompiledNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Targets of `label` leaving `from`; empty when the label is not connected
    pub fn targets(&self, from: usize, label: &str) -> &[usize] {
        self.relations.get(&(from, label.to_string())).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// Fresh node-local state for every node
    pub fn initial_states(&self) -> Vec<NodeState> {
        self.nodes.iter().map(|node| node.node.initial_state()).collect()
    }
}
