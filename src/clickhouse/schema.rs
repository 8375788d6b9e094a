// Copyright 2021 Datafuse Labs
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

use log::info;

use crate::fields::FieldSnapshot;

/// Top-level columns of the logs table besides the two map columns.
pub const FIXED_COLUMNS: [&str; 8] = [
    "timestamp",
    "cluster",
    "namespace",
    "app",
    "pod_name",
    "container_name",
    "host",
    "log",
];

pub const STRING_MAP_COLUMN: &str = "fields_string";
pub const NUMBER_MAP_COLUMN: &str = "fields_number";

/// Which map column a field should be read from when it is not a real
/// column, derived from the other side of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeContext {
    String,
    Number,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogsSchema {
    database: String,
    materialized_columns: Vec<String>,
}

impl LogsSchema {
    pub fn new(database: impl Into<String>, materialized_columns: Vec<String>) -> Self {
        let schema = Self {
            database: database.into(),
            materialized_columns,
        };
        info!(
            "logs schema resolved: table={}, materialized_columns={:?}",
            schema.table(),
            schema.materialized_columns
        );
        schema
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> String {
        format!("{}.logs", self.database)
    }

    pub fn materialized_columns(&self) -> &[String] {
        &self.materialized_columns
    }

    /// Fixed and materialized columns are addressed directly, everything
    /// else lives in one of the map columns.
    pub fn is_column(&self, name: &str) -> bool {
        FIXED_COLUMNS.contains(&name) || self.materialized_columns.iter().any(|col| col == name)
    }

    /// Materialized columns win over map keys of either type, even when the
    /// context says the value is numeric and the key is only known as a
    /// string key.
    pub fn resolve(&self, field: &str, context: TypeContext, fields: &FieldSnapshot) -> String {
        if self.is_column(field) {
            return field.to_string();
        }
        match context {
            TypeContext::Number => number_key(field),
            TypeContext::String => string_key(field),
            TypeContext::Unknown if fields.has_number(field) => number_key(field),
            TypeContext::Unknown => string_key(field),
        }
    }

    pub fn exists_clause(&self, field: &str) -> String {
        if self.is_column(field) {
            format!("{field} IS NOT NULL")
        } else {
            format!(
                "(mapContains({STRING_MAP_COLUMN}, '{field}') = 1 OR mapContains({NUMBER_MAP_COLUMN}, '{field}') = 1)"
            )
        }
    }

    /// A map field may hold either type, so ordering by it sorts on both
    /// map columns.
    pub fn order_clause(&self, field: &str, direction: SortDirection) -> String {
        let dir = direction.sql();
        if self.is_column(field) {
            format!("{field} {dir}")
        } else {
            format!("{} {dir}, {} {dir}", string_key(field), number_key(field))
        }
    }
}

fn string_key(field: &str) -> String {
    format!("{STRING_MAP_COLUMN}['{field}']")
}

fn number_key(field: &str) -> String {
    format!("{NUMBER_MAP_COLUMN}['{field}']")
}
