// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Schema drift reconciliation shared by every driver
//
// Drivers introspect what they already store, ask `plan` what to do, and
// then either create, append or migrate. Migration means: read the stored
// rows with the old schema, recreate the table with the union schema and
// write the old rows (null-padded) followed by the new batch.

use crate::error::Result;
use crate::record::{ColumnSchema, Record};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavePlan {
    /// Nothing stored yet: create from the incoming schema
    Create(ColumnSchema),
    /// Stored columns already cover the batch: plain append
    Append(ColumnSchema),
    /// New or widened columns: rewrite stored rows under `target`
    Migrate {
        previous: ColumnSchema,
        target: ColumnSchema,
    },
}

impl SavePlan {
    /// Schema the backend holds once the plan has been carried out
    pub fn target(&self) -> &ColumnSchema {
        match self {
            SavePlan::Create(target) | SavePlan::Append(target) => target,
            SavePlan::Migrate { target, .. } => target,
        }
    }
}

/// Decide how to persist a batch described by `incoming` on top of `existing`.
///
/// Columns missing from `incoming` are kept: stored columns are never removed.
pub fn plan(existing: Option<&ColumnSchema>, incoming: &ColumnSchema) -> SavePlan {
    let Some(existing) = existing else {
        return SavePlan::Create(incoming.clone());
    };

    let target = existing.merge(incoming);
    if target == *existing {
        return SavePlan::Append(target);
    }

    debug!(
        "Schema drift: stored [{}], target [{}]",
        existing.names().collect::<Vec<_>>().join(", "),
        target.names().collect::<Vec<_>>().join(", ")
    );
    SavePlan::Migrate {
        previous: existing.clone(),
        target,
    }
}

/// Flatten `records` into rows of `schema`.
///
/// Runs before anything is written so a value that cannot be represented
/// fails the whole batch.
pub fn prepare_rows<'a, I>(records: I, schema: &ColumnSchema) -> Result<Vec<Map<String, Value>>>
where
    I: IntoIterator<Item = &'a Record>,
{
    records
        .into_iter()
        .map(|record| record.to_row(schema))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatsError;
    use crate::record::ColumnType;
    use serde_json::json;

    fn schema(columns: &[(&str, ColumnType)]) -> ColumnSchema {
        ColumnSchema::from_columns(columns.iter().copied())
    }

    #[test]
    fn test_plan_create_when_nothing_stored() {
        let incoming = schema(&[("a", ColumnType::Integer)]);
        assert_eq!(plan(None, &incoming), SavePlan::Create(incoming.clone()));
    }

    #[test]
    fn test_plan_append_when_subset() {
        let stored = schema(&[("a", ColumnType::Integer), ("b", ColumnType::String)]);
        let incoming = schema(&[("a", ColumnType::Integer)]);
        assert_eq!(plan(Some(&stored), &incoming), SavePlan::Append(stored.clone()));
    }

    #[test]
    fn test_plan_migrate_on_new_column() {
        let stored = schema(&[("a", ColumnType::Integer), ("b", ColumnType::String)]);
        let incoming = schema(&[
            ("a", ColumnType::Integer),
            ("b", ColumnType::String),
            ("c", ColumnType::Boolean),
        ]);
        match plan(Some(&stored), &incoming) {
            SavePlan::Migrate { previous, target } => {
                assert_eq!(previous, stored);
                assert!(target.contains("c"));
                assert_eq!(target.len(), stored.len() + 1);
            }
            other => panic!("expected migration, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_migrate_on_widened_column() {
        let stored = schema(&[("a", ColumnType::Integer)]);
        let incoming = schema(&[("a", ColumnType::String)]);
        let plan = plan(Some(&stored), &incoming);
        assert!(matches!(plan, SavePlan::Migrate { .. }));
        assert_eq!(plan.target().get("a"), Some(ColumnType::String));
    }

    #[test]
    fn test_plan_keeps_columns_on_shrinkage() {
        let stored = schema(&[("a", ColumnType::Integer), ("b", ColumnType::String)]);
        let incoming = ColumnSchema::new();
        let plan = plan(Some(&stored), &incoming);
        assert_eq!(plan, SavePlan::Append(stored));
    }

    #[test]
    fn test_prepare_rows_rejects_unrepresentable_value() {
        let target = schema(&[("a", ColumnType::Integer)]);
        let good = Record::new("c", 1, "k", json!({"a": 1}).as_object().unwrap().clone());
        let bad = Record::new("c", 2, "k", json!({"a": [1]}).as_object().unwrap().clone());
        let err = prepare_rows([&good, &bad], &target).unwrap_err();
        assert!(matches!(err, StatsError::SchemaConflict { .. }));
    }
}
