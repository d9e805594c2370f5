/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::future::Future;

use gateway_operator::*;

use clap::Parser;
use kube::Client;
use tokio::try_join;
use tracing::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::parse();
    let client = Client::try_default().await?;
    let ctx = Context::new(KubeStore::new(client), config.clone());
    info!(controller_name = %config.controller_name, "starting gateway operator");

    if let Err(error) = try_join!(
        run_if(
            config.enable_controller_gateway,
            "gatewayclass",
            gatewayclass_controller(ctx.clone())
        ),
        run_if(
            config.enable_controller_gateway,
            "gateway",
            gateway_controller(ctx.clone())
        ),
        run_if(
            config.enable_controller_dataplane,
            "dataplane",
            dataplane_controller(ctx.clone())
        ),
        run_if(
            config.enable_controller_controlplane,
            "controlplane",
            controlplane_controller(ctx)
        ),
    ) {
        error!("failed to start controllers: {error:?}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_if(
    enabled: bool,
    name: &str,
    controller: impl Future<Output = Result<()>>,
) -> Result<()> {
    if !enabled {
        info!(controller = name, "controller disabled");
        return Ok(());
    }
    controller.await
}
