//! Translation of custom node requests into parameters.
//!
//! Every request position becomes a selectable index. The generated fragment
//! only references names it defines itself, so it always resolves.

use super::{expression::Value, reference, ParameterTable};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub const INDEX_VARIABLE: &str = "custom_node_index";
pub const NODES_VARIABLE: &str = "custom_nodes";
pub const NODESET_VARIABLE: &str = "custom_nodeset";
pub const SUBMIT_VARIABLE: &str = "custom_submit_args";

/// one requested node count, optionally pinned to an explicit node set
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeRequest {
    pub nodes: u32,
    #[serde(default)]
    pub nodelist: Option<String>,
}

impl NodeRequest {
    pub fn new(nodes: u32, nodelist: Option<&str>) -> Self {
        Self {
            nodes,
            nodelist: nodelist.map(str::to_owned),
        }
    }
}

/// Scheduler specific spelling of a node request in the submit command
pub trait NodeSetSyntax: Send + Sync {
    fn plain(&self, nodes: u32) -> String;
    fn labelled(&self, nodes: u32, label: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmNodeSet;

impl NodeSetSyntax for SlurmNodeSet {
    fn plain(&self, nodes: u32) -> String {
        format!("--nodes={nodes}")
    }

    fn labelled(&self, nodes: u32, label: &str) -> String {
        format!("--nodes={nodes} --nodelist={label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequestFragment {
    table: ParameterTable,
    positions: usize,
    labelled: bool,
}

fn fragment_variable(position: usize) -> String {
    format!("{SUBMIT_VARIABLE}_{position}")
}

/// body of a single quoted string literal
fn literal_body(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}

/// quote for use inside of a list literal, markers are escaped for the scanner
fn quoted(text: &str) -> String {
    reference::escape(&format!("'{}'", literal_body(text)))
}

pub fn translate_custom_nodes(
    requests: &[NodeRequest],
    syntax: &dyn NodeSetSyntax,
) -> NodeRequestFragment {
    let mut table = ParameterTable::new();
    let labelled = requests.iter().any(|request| request.nodelist.is_some());
    let selector = format!("[${INDEX_VARIABLE}]");

    if requests.is_empty() {
        return NodeRequestFragment {
            table,
            positions: 0,
            labelled,
        };
    }

    table.insert(INDEX_VARIABLE, (0..requests.len()).join(","));
    table.insert(
        NODES_VARIABLE,
        format!(
            "[{}]{selector}",
            requests.iter().map(|request| request.nodes).join(",")
        ),
    );

    if labelled {
        table.insert(
            NODESET_VARIABLE,
            format!(
                "[{}]{selector}",
                requests
                    .iter()
                    .map(|request| match &request.nodelist {
                        Some(label) => quoted(label),
                        None => Value::None.repr(),
                    })
                    .join(",")
            ),
        );

        for (position, request) in requests.iter().enumerate() {
            let fragment = match &request.nodelist {
                Some(label) => syntax.labelled(request.nodes, label),
                None => syntax.plain(request.nodes),
            };

            // spliced into a quoted list element below
            table.insert(
                fragment_variable(position),
                reference::escape(&literal_body(&fragment)),
            );
        }

        table.insert(
            SUBMIT_VARIABLE,
            format!(
                "[{}]{selector}",
                (0..requests.len())
                    .map(|position| format!("'${{{}}}'", fragment_variable(position)))
                    .join(",")
            ),
        );
    }

    NodeRequestFragment {
        table,
        positions: requests.len(),
        labelled,
    }
}

impl NodeRequestFragment {
    pub fn table(&self) -> &ParameterTable {
        &self.table
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn is_empty(&self) -> bool {
        self.positions == 0
    }

    /// the fragment with the index fixed to one request position
    pub fn pinned(&self, position: usize) -> ParameterTable {
        let mut table = self.table.clone();
        table.insert(INDEX_VARIABLE, position.to_string());

        table
    }

    /// generated names that belong into result listings
    pub fn result_columns(&self) -> Vec<&'static str> {
        match (self.positions, self.labelled) {
            (0, _) => Vec::new(),
            (_, false) => vec![INDEX_VARIABLE, NODES_VARIABLE],
            (_, true) => vec![INDEX_VARIABLE, NODES_VARIABLE, NODESET_VARIABLE],
        }
    }
}
