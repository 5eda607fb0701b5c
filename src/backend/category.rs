//! Resource categories and their apply-order dependencies

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::backup::validate_name;
use crate::{Result, VaultError};

/// A category and the categories whose records must exist before its own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    /// Category name, also used in object keys
    pub name: String,
    /// Categories that must be imported first
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl CategoryDefinition {
    /// Definition from string slices
    pub fn new(name: &str, depends_on: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Fixed dependency table the resource backend orders imports by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryTable {
    categories: Vec<CategoryDefinition>,
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl CategoryTable {
    /// Build and validate a table
    pub fn new(categories: Vec<CategoryDefinition>) -> Result<Self> {
        let table = Self { categories };
        table.validate()?;
        Ok(table)
    }

    /// Identity-provider style defaults
    pub fn standard() -> Self {
        Self {
            categories: vec![
                CategoryDefinition::new("principals", &[]),
                CategoryDefinition::new("groups", &[]),
                CategoryDefinition::new("applications", &[]),
                CategoryDefinition::new("memberships", &["principals", "groups"]),
                CategoryDefinition::new("app_assignments", &["applications", "principals", "groups"]),
                CategoryDefinition::new("policies", &[]),
                CategoryDefinition::new("policy_bindings", &["policies", "principals", "groups"]),
            ],
        }
    }

    /// Definitions in declaration order
    pub fn definitions(&self) -> &[CategoryDefinition] {
        &self.categories
    }

    /// Category names in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(|c| c.name.as_str())
    }

    /// Whether `name` is a known category
    pub fn contains(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c.name == name)
    }

    /// Unique, well-formed names; every dependency declared; no cycles
    pub fn validate(&self) -> Result<()> {
        self.ordered().map(|_| ())
    }

    /// Reject filters naming categories outside the table
    pub fn validate_filter(&self, filter: &[String]) -> Result<()> {
        let unknown: Vec<&str> = filter
            .iter()
            .filter(|name| !self.contains(name))
            .map(String::as_str)
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(VaultError::Validation(format!(
                "unknown resource categories [{}]; known categories are [{}]",
                unknown.join(", "),
                self.names().collect::<Vec<_>>().join(", ")
            )))
        }
    }

    /// Dependency-respecting order, restricted to `filter` when it is non-empty
    pub fn apply_order(&self, filter: &[String]) -> Result<Vec<String>> {
        self.validate_filter(filter)?;
        Ok(self
            .ordered()?
            .into_iter()
            .filter(|name| filter.is_empty() || filter.contains(name))
            .collect())
    }

    fn ordered(&self) -> Result<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();

        for category in &self.categories {
            validate_name("category", &category.name)?;
            if index.insert(&category.name, graph.add_node(&category.name)).is_some() {
                return Err(VaultError::Validation(format!(
                    "category '{}' declared twice",
                    category.name
                )));
            }
        }

        for category in &self.categories {
            let to = index[category.name.as_str()];
            for dependency in &category.depends_on {
                let from = index.get(dependency.as_str()).ok_or_else(|| {
                    VaultError::Validation(format!(
                        "category '{}' depends on undeclared category '{}'",
                        category.name, dependency
                    ))
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        let sorted = toposort(&graph, None).map_err(|cycle| {
            VaultError::Validation(format!(
                "category dependencies form a cycle through '{}'",
                graph[cycle.node_id()]
            ))
        })?;

        Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_standard_order_puts_dependencies_first() {
        let order = CategoryTable::standard().apply_order(&[]).unwrap();
        assert_eq!(order.len(), 7);
        assert!(position(&order, "principals") < position(&order, "memberships"));
        assert!(position(&order, "groups") < position(&order, "memberships"));
        assert!(position(&order, "applications") < position(&order, "app_assignments"));
        assert!(position(&order, "policies") < position(&order, "policy_bindings"));
    }

    #[test]
    fn test_filter_restricts_order() {
        let table = CategoryTable::standard();
        let filter = vec!["memberships".to_string(), "principals".to_string()];
        assert_eq!(table.apply_order(&filter).unwrap(), vec!["principals", "memberships"]);
    }

    #[test]
    fn test_unknown_filter_category_is_rejected() {
        let err = CategoryTable::standard()
            .apply_order(&["roles".to_string()])
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(ref msg) if msg.contains("roles")));
    }

    #[test]
    fn test_cycles_and_dangling_dependencies_are_rejected() {
        let cyclic = CategoryTable::new(vec![
            CategoryDefinition::new("a", &["b"]),
            CategoryDefinition::new("b", &["a"]),
        ]);
        assert!(matches!(cyclic, Err(VaultError::Validation(_))));

        let dangling = CategoryTable::new(vec![CategoryDefinition::new("a", &["ghost"])]);
        assert!(matches!(dangling, Err(VaultError::Validation(_))));

        let duplicate = CategoryTable::new(vec![
            CategoryDefinition::new("a", &[]),
            CategoryDefinition::new("a", &[]),
        ]);
        assert!(duplicate.is_err());
    }
}
