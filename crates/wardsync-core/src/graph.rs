//! Dependency graph between record types.
//!
//! Edges run from a type to every type it references, so a topological order
//! lists parents before children. Self references (a task whose parent is a
//! task) are kept out of the ordering and reported separately; the apply path
//! writes those columns in a second pass.

use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};
use crate::schema::SyncSchema;

/// A child type that must be re-sent when a parent record changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependent {
    pub record_type: String,
    pub table: String,
    /// Column in the child table holding the parent's id
    pub column: String,
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    depends_on: BTreeSet<usize>,
    self_columns: Vec<String>,
    dependents: Vec<Dependent>,
}

/// Static per-type dependency graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    ranks: Option<HashMap<String, usize>>,
}

impl DependencyGraph {
    /// Build one node per record type with edges to every foreign key target
    /// and from every included relation.
    pub fn from_schema(schema: &SyncSchema) -> Result<Self> {
        let mut nodes: Vec<Node> = schema
            .models()
            .iter()
            .map(|model| Node {
                name: model.name.clone(),
                depends_on: BTreeSet::new(),
                self_columns: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for (index, model) in schema.models().iter().enumerate() {
            for fk in &model.foreign_keys {
                let target = schema.index_of(&fk.references).ok_or_else(|| {
                    Error::Schema(format!(
                        "'{}.{}' references unknown record type '{}'",
                        model.name, fk.column, fk.references
                    ))
                })?;
                if target == index {
                    nodes[index].self_columns.push(fk.column.clone());
                } else {
                    nodes[index].depends_on.insert(target);
                }
                nodes[target].dependents.push(Dependent {
                    record_type: model.name.clone(),
                    table: model.table.clone(),
                    column: fk.column.clone(),
                });
            }

            for relation in &model.included_relations {
                let child_index = schema.index_of(&relation.record_type).ok_or_else(|| {
                    Error::Schema(format!(
                        "'{}' includes unknown record type '{}'",
                        model.name, relation.record_type
                    ))
                })?;
                let child = &schema.models()[child_index];
                if child_index != index {
                    nodes[child_index].depends_on.insert(index);
                }
                nodes[index].dependents.push(Dependent {
                    record_type: child.name.clone(),
                    table: child.table.clone(),
                    column: relation.column.clone(),
                });
            }
        }

        let mut graph = Self { nodes, ranks: None };
        graph.ranks = graph.order_indices().ok().map(|order| {
            order
                .into_iter()
                .enumerate()
                .map(|(rank, index)| (graph.nodes[index].name.clone(), rank))
                .collect()
        });
        Ok(graph)
    }

    /// Record types ordered so that every type follows everything it depends on.
    /// Ties are broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        Ok(self
            .order_indices()?
            .into_iter()
            .map(|index| self.nodes[index].name.clone())
            .collect())
    }

    /// Call `visit` once per record type in dependency order
    pub fn run<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<()>,
    {
        for name in self.topological_order()? {
            visit(&name)?;
        }
        Ok(())
    }

    /// Position of `record_type` in the topological order
    pub fn rank(&self, record_type: &str) -> Option<usize> {
        self.ranks.as_ref()?.get(record_type).copied()
    }

    /// Columns of `record_type` that reference the same type
    pub fn self_referential_columns(&self, record_type: &str) -> &[String] {
        self.node(record_type)
            .map_or(&[], |node| node.self_columns.as_slice())
    }

    /// Child types (and their linking column) that depend on `record_type`
    pub fn dependents_of(&self, record_type: &str) -> &[Dependent] {
        self.node(record_type)
            .map_or(&[], |node| node.dependents.as_slice())
    }

    fn node(&self, record_type: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == record_type)
    }

    fn order_indices(&self) -> Result<Vec<usize>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.depends_on.len()).collect();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (index, node) in self.nodes.iter().enumerate() {
            for &parent in &node.depends_on {
                children[parent].push(index);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&index| in_degree[index] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = ready.pop_first() {
            order.push(index);
            for &child in &children[index] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err(Error::DependencyCycle(self.find_cycle(&in_degree)))
        }
    }

    /// Walk dependency edges among the unresolved nodes until one repeats
    fn find_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let Some(start) = (0..self.nodes.len()).find(|&index| in_degree[index] > 0) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut current = start;
        loop {
            let Some(&next) = self.nodes[current]
                .depends_on
                .iter()
                .find(|&&parent| in_degree[parent] > 0)
            else {
                break;
            };
            if let Some(position) = path.iter().position(|&seen| seen == next) {
                let mut cycle: Vec<String> = path[position..]
                    .iter()
                    .map(|&index| self.nodes[index].name.clone())
                    .collect();
                cycle.push(self.nodes[next].name.clone());
                return cycle;
            }
            path.push(next);
            current = next;
        }

        path.into_iter()
            .map(|index| self.nodes[index].name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordModel;
    use pretty_assertions::assert_eq;

    fn graph(models: Vec<RecordModel>) -> DependencyGraph {
        DependencyGraph::from_schema(&SyncSchema::new(models).unwrap()).unwrap()
    }

    #[test]
    fn clinical_order_puts_parents_first() {
        let graph = DependencyGraph::from_schema(&SyncSchema::clinical()).unwrap();
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![
                "Facility",
                "ScheduledVaccine",
                "Patient",
                "Encounter",
                "AdministeredVaccine",
                "LabRequest",
                "Task",
            ]
        );
    }

    #[test]
    fn children_declared_first_still_follow_parents() {
        let graph = graph(vec![
            RecordModel::new("Encounter", "encounters").references("patient_id", "Patient"),
            RecordModel::new("Note", "notes"),
            RecordModel::new("Patient", "patients"),
        ]);
        assert_eq!(
            graph.topological_order().unwrap(),
            vec!["Note", "Patient", "Encounter"]
        );
        assert!(graph.rank("Patient").unwrap() < graph.rank("Encounter").unwrap());
    }

    #[test]
    fn ties_follow_declaration_order() {
        let graph = graph(vec![
            RecordModel::new("B", "b"),
            RecordModel::new("A", "a"),
            RecordModel::new("C", "c"),
        ]);
        assert_eq!(graph.topological_order().unwrap(), vec!["B", "A", "C"]);
    }

    #[test]
    fn cycle_is_reported() {
        let graph = graph(vec![
            RecordModel::new("A", "a").references("b_id", "B"),
            RecordModel::new("B", "b").references("a_id", "A"),
            RecordModel::new("C", "c"),
        ]);
        let err = graph.topological_order().unwrap_err();
        match err {
            Error::DependencyCycle(cycle) => {
                assert!(cycle.contains(&"A".to_string()));
                assert!(cycle.contains(&"B".to_string()));
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(graph.rank("C"), None);

        let mut visited = Vec::new();
        assert!(graph
            .run(|name| {
                visited.push(name.to_string());
                Ok(())
            })
            .is_err());
        assert!(visited.is_empty());
    }

    #[test]
    fn self_reference_is_deferred_not_rejected() {
        let graph = graph(vec![
            RecordModel::new("Task", "tasks").references("parent_task_id", "Task")
        ]);
        assert_eq!(graph.topological_order().unwrap(), vec!["Task"]);
        assert_eq!(graph.self_referential_columns("Task"), ["parent_task_id"]);
    }

    #[test]
    fn run_visits_each_type_once_in_order() {
        let graph = DependencyGraph::from_schema(&SyncSchema::clinical()).unwrap();
        let mut visited = Vec::new();
        graph
            .run(|name| {
                visited.push(name.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(visited, graph.topological_order().unwrap());
    }

    #[test]
    fn dependents_include_foreign_keys_and_included_relations() {
        let graph = DependencyGraph::from_schema(&SyncSchema::clinical()).unwrap();

        let encounter_children: Vec<(&str, &str)> = graph
            .dependents_of("Encounter")
            .iter()
            .map(|d| (d.record_type.as_str(), d.column.as_str()))
            .collect();
        assert!(encounter_children.contains(&("AdministeredVaccine", "encounter_id")));
        assert!(encounter_children.contains(&("LabRequest", "encounter_id")));
        assert!(encounter_children.contains(&("Task", "encounter_id")));

        let patient_children = graph.dependents_of("Patient");
        assert_eq!(patient_children.len(), 1);
        assert_eq!(patient_children[0].record_type, "Encounter");
        assert!(graph.dependents_of("LabRequest").is_empty());
    }
}
