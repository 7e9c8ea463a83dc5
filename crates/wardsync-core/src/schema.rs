//! Catalog of syncable record types.
//!
//! Each [`RecordModel`] names its table, the payload fields that are foreign
//! keys to other record types, and any included relations: child types that
//! are linked without a declared foreign key but must still be re-sent when
//! the parent changes.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::util::is_sql_identifier;

/// Columns every record table carries; payload foreign keys may not reuse them.
pub const RESERVED_COLUMNS: [&str; 6] = [
    "id",
    "updated_at_tick",
    "is_deleted",
    "sync_patient_id",
    "sync_facility_id",
    "data",
];

/// A payload field that references another record type's id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub references: String,
}

/// A child type whose `column` points at this type without a declared foreign key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludedRelation {
    pub record_type: String,
    pub column: String,
}

/// One syncable record type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordModel {
    pub name: String,
    pub table: String,
    pub foreign_keys: Vec<ForeignKey>,
    pub included_relations: Vec<IncludedRelation>,
}

impl RecordModel {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            foreign_keys: Vec::new(),
            included_relations: Vec::new(),
        }
    }

    /// Declare a foreign key payload field
    #[must_use]
    pub fn references(mut self, column: impl Into<String>, target: impl Into<String>) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.into(),
            references: target.into(),
        });
        self
    }

    /// Declare a child type that travels with this one
    #[must_use]
    pub fn includes(mut self, record_type: impl Into<String>, column: impl Into<String>) -> Self {
        self.included_relations.push(IncludedRelation {
            record_type: record_type.into(),
            column: column.into(),
        });
        self
    }
}

/// Ordered set of record models; declaration order breaks ordering ties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchema {
    models: Vec<RecordModel>,
}

impl SyncSchema {
    /// Build a schema, validating names and references
    pub fn new(models: Vec<RecordModel>) -> Result<Self> {
        let mut names = HashSet::new();
        let mut tables = HashSet::new();
        for model in &models {
            if !names.insert(model.name.as_str()) {
                return Err(Error::Schema(format!(
                    "record type '{}' declared twice",
                    model.name
                )));
            }
            if !is_sql_identifier(&model.table) || !tables.insert(model.table.as_str()) {
                return Err(Error::Schema(format!(
                    "invalid or duplicate table name '{}'",
                    model.table
                )));
            }
            for fk in &model.foreign_keys {
                if !is_sql_identifier(&fk.column) || RESERVED_COLUMNS.contains(&fk.column.as_str())
                {
                    return Err(Error::Schema(format!(
                        "invalid foreign key column '{}' on '{}'",
                        fk.column, model.name
                    )));
                }
            }
        }

        for model in &models {
            for fk in &model.foreign_keys {
                if !names.contains(fk.references.as_str()) {
                    return Err(Error::Schema(format!(
                        "'{}.{}' references unknown record type '{}'",
                        model.name, fk.column, fk.references
                    )));
                }
            }
            for relation in &model.included_relations {
                if !names.contains(relation.record_type.as_str()) {
                    return Err(Error::Schema(format!(
                        "'{}' includes unknown record type '{}'",
                        model.name, relation.record_type
                    )));
                }
                if !is_sql_identifier(&relation.column) {
                    return Err(Error::Schema(format!(
                        "invalid included relation column '{}'",
                        relation.column
                    )));
                }
            }
        }

        Ok(Self { models })
    }

    /// The default clinical catalog used by the central server and CLI.
    ///
    /// Encounters carry their administered vaccines as an included relation;
    /// tasks may have a parent task of the same type.
    pub fn clinical() -> Self {
        let models = vec![
            RecordModel::new("Facility", "facilities"),
            RecordModel::new("ScheduledVaccine", "scheduled_vaccines"),
            RecordModel::new("Patient", "patients"),
            RecordModel::new("Encounter", "encounters")
                .references("patient_id", "Patient")
                .references("location_facility_id", "Facility")
                .includes("AdministeredVaccine", "encounter_id"),
            RecordModel::new("AdministeredVaccine", "administered_vaccines")
                .references("scheduled_vaccine_id", "ScheduledVaccine"),
            RecordModel::new("LabRequest", "lab_requests").references("encounter_id", "Encounter"),
            RecordModel::new("Task", "tasks")
                .references("encounter_id", "Encounter")
                .references("parent_task_id", "Task"),
        ];
        Self { models }
    }

    pub fn models(&self) -> &[RecordModel] {
        &self.models
    }

    /// Look up a model by record type name
    pub fn model(&self, name: &str) -> Result<&RecordModel> {
        self.models
            .iter()
            .find(|model| model.name == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown record type '{name}'")))
    }

    /// Look up a model by table name
    pub fn model_for_table(&self, table: &str) -> Option<&RecordModel> {
        self.models.iter().find(|model| model.table == table)
    }

    /// Declaration index of a record type
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.models.iter().position(|model| model.name == name)
    }
}
