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

mod core;
mod http;
mod schema;
mod value;

pub use self::core::{
    Executor, ExecutorError, MemoryRows, Row, RowStream, Rows, SETTINGS_CLAUSE, collect_rows,
    from_unixtime,
};
#[cfg(test)]
pub(crate) use self::core::RecordingExecutor;
pub use http::ClickHouseClient;
pub use schema::{FIXED_COLUMNS, LogsSchema, SortDirection, TypeContext};
pub use value::Value;
