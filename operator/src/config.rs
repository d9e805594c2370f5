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

use std::time::Duration;

use clap::Parser;

use crate::consts::{DEFAULT_CONTROLLER_NAME, DEFAULT_CONTROLPLANE_IMAGE, DEFAULT_DATAPLANE_IMAGE};

#[derive(Debug, Parser, Clone)]
#[clap(name = "controller", about = "Gateway operator for DataPlanes and ControlPlanes")]
pub struct Config {
    /// GatewayClass controllerName claimed by this operator.
    #[clap(long, env = "GATEWAY_OPERATOR_CONTROLLER_NAME", default_value = DEFAULT_CONTROLLER_NAME)]
    pub controller_name: String,

    /// Image used when a DataPlane pod template does not name one.
    #[clap(long, env = "GATEWAY_OPERATOR_DATAPLANE_IMAGE", default_value = DEFAULT_DATAPLANE_IMAGE)]
    pub dataplane_image: String,

    /// Image used when a ControlPlane pod template does not name one.
    #[clap(
        long,
        env = "GATEWAY_OPERATOR_CONTROLPLANE_IMAGE",
        default_value = DEFAULT_CONTROLPLANE_IMAGE
    )]
    pub controlplane_image: String,

    /// Interval after which every object is reconciled again.
    #[clap(long, env = "GATEWAY_OPERATOR_RESYNC_PERIOD_SECS", default_value_t = 60)]
    pub resync_period_secs: u64,

    /// Requeue interval used when a referenced object is missing.
    #[clap(long, env = "GATEWAY_OPERATOR_REFERENTIAL_REQUEUE_SECS", default_value_t = 60)]
    pub referential_requeue_secs: u64,

    #[clap(
        long,
        env = "GATEWAY_OPERATOR_ENABLE_CONTROLLER_GATEWAY",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_controller_gateway: bool,

    #[clap(
        long,
        env = "GATEWAY_OPERATOR_ENABLE_CONTROLLER_DATAPLANE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_controller_dataplane: bool,

    #[clap(
        long,
        env = "GATEWAY_OPERATOR_ENABLE_CONTROLLER_CONTROLPLANE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub enable_controller_controlplane: bool,
}

impl Config {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn referential_requeue(&self) -> Duration {
        Duration::from_secs(self.referential_requeue_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            dataplane_image: DEFAULT_DATAPLANE_IMAGE.to_string(),
            controlplane_image: DEFAULT_CONTROLPLANE_IMAGE.to_string(),
            resync_period_secs: 60,
            referential_requeue_secs: 60,
            enable_controller_gateway: true,
            enable_controller_dataplane: true,
            enable_controller_controlplane: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_overrides() {
        let config = Config::parse_from(["controller"]);
        assert_eq!(config.controller_name, DEFAULT_CONTROLLER_NAME);
        assert_eq!(config.resync_period(), Duration::from_secs(60));
        assert!(config.enable_controller_dataplane);

        let config = Config::parse_from([
            "controller",
            "--controller-name",
            "example.com/other",
            "--enable-controller-gateway",
            "false",
            "--resync-period-secs",
            "30",
        ]);
        assert_eq!(config.controller_name, "example.com/other");
        assert!(!config.enable_controller_gateway);
        assert_eq!(config.resync_period(), Duration::from_secs(30));
    }
}
