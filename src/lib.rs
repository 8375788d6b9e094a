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


//! Query engine behind the klogs log explorer.
//!
//! User queries (`namespace = 'bookinfo' _and_ status >= 500`) are parsed,
//! lowered to ClickHouse `WHERE` fragments and executed against a `logs`
//! table whose dynamic fields live in `fields_string` and `fields_number`
//! maps.

pub mod aggregation;
pub mod app;
pub mod clickhouse;
pub mod config;
pub mod error;
pub mod fields;
pub mod logs;
pub mod query;
