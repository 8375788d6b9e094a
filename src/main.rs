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

use clap::Parser;
use klogs::{
    app::{AppConfig, AppState, router},
    config::Args,
    error::AppError,
};
use log::{LevelFilter, info};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let args = Args::parse();
    let clickhouse = args.clickhouse_config()?;
    let default_limit = args.default_limit()?;
    info!(
        "starting klogs (address={}, database={}, bind={})",
        clickhouse.address, clickhouse.database, args.bind
    );
    let config = AppConfig {
        clickhouse,
        default_limit,
    };
    info!("bootstrapping application state");
    let state = AppState::bootstrap(config).await?;
    info!("router initialized, preparing HTTP server");
    let app = router(state);

    info!("binding TCP listener on {}", args.bind);
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind listener: {err}")))?;
    info!("klogs listening on {}", args.bind);
    axum::serve(listener, app)
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;
    Ok(())
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env().init();
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("klogs", LevelFilter::Info)
            .init();
    }
}
