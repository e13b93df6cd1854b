/*
 * Copyright (C) 2024 The Quarry Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::env;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use quarry::quarry::api::types::SettingName;
use quarry::quarry::config::Config;
use quarry::quarry::controller::node::NodeController;
use quarry::quarry::datastore::registry::ClusterRegistry;
use quarry::quarry::datastore::{error_is_not_found, DataStore};
use quarry::quarry::k8s::event::EventRegistry;
use quarry::quarry::logger::{log_error, log_info, set_log_format, LogFormat};
use quarry::quarry::util::error::{BoxError, ResultContext};

const COMPONENT: &str = "main";

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_KUBERNETES_VERSION: &str = "v1.17.0";

fn node_name() -> Result<String, BoxError> {
    let configured = Config::NodeName.get();
    if !configured.is_empty() {
        return Ok(configured);
    }
    let hostname = nix::unistd::gethostname().context("resolve node name from hostname")?;
    Ok(hostname.to_string_lossy().to_string())
}

fn worker_count() -> usize {
    env::var("QUARRY_WORKERS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_WORKERS)
}

async fn run() -> Result<(), BoxError> {
    let namespace = Config::Namespace.get();
    let controller_id = node_name()?;
    let kubernetes_version = env::var("QUARRY_KUBERNETES_VERSION")
        .unwrap_or_else(|_| DEFAULT_KUBERNETES_VERSION.to_string());

    log_info(
        COMPONENT,
        "starting quarry node controller",
        &[
            ("namespace", &namespace),
            ("node", &controller_id),
            ("kubernetes_version", &kubernetes_version),
        ],
    );

    let registry = ClusterRegistry::new(&namespace, &kubernetes_version);
    let events = EventRegistry::new();
    let ds = DataStore::new(registry.clone());

    ds.init_settings().context("seed default settings")?;
    if env::var(Config::DataDir.env_var()).is_ok() {
        let data_dir = Config::DataDir.get_path()?;
        let mut setting = ds.get_setting(SettingName::DefaultDataPath)?;
        setting.value = data_dir.to_string_lossy().to_string();
        ds.update_setting(setting)
            .context("override the default data path")?;
    }
    match ds.get_node(&controller_id) {
        Ok(_) => {}
        Err(err) if error_is_not_found(&err) => {
            ds.create_default_node(&controller_id)
                .await
                .context(format!("register node {}", controller_id))?;
            log_info(COMPONENT, "registered node", &[("node", &controller_id)]);
        }
        Err(err) => return Err(Box::new(err)),
    }

    let controller = NodeController::new(registry, events, &namespace, &controller_id);
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                let message = err.to_string();
                log_error(
                    COMPONENT,
                    "failed to install SIGTERM handler",
                    &[("error", &message)],
                );
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                let message = err.to_string();
                log_error(
                    COMPONENT,
                    "failed to install SIGINT handler",
                    &[("error", &message)],
                );
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        log_info(COMPONENT, "received stop signal", &[]);
        shutdown.cancel();
    });

    let workers = worker_count();
    controller.run(workers, cancel).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if env::var("QUARRY_LOG_FORMAT").as_deref() == Ok("json") {
        set_log_format(LogFormat::Json);
    }
    if let Err(err) = run().await {
        let message = err.to_string();
        log_error(COMPONENT, "node controller failed", &[("error", &message)]);
        std::process::exit(1);
    }
}
