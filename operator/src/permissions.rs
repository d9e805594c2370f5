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

//! Maps a control plane image to the ClusterRole its version requires.

use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use kube::core::ObjectMeta;
use semver::Version;
use thiserror::Error;

use crate::consts::LATEST_CONTROLPLANE_VERSION;

#[derive(Error, Debug)]
pub enum PermissionsError {
    #[error("invalid version {version:?}: {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },
    #[error("version {0} not supported")]
    UnsupportedVersion(Version),
}

type ClusterRoleGenerator = fn(&str) -> ClusterRole;

// Half-open version range [min, max) bound to the permissions it needs.
struct PermissionRange {
    min: (u64, u64),
    max: Option<(u64, u64)>,
    generate: ClusterRoleGenerator,
}

impl PermissionRange {
    fn contains(&self, version: &Version) -> bool {
        let min = Version::new(self.min.0, self.min.1, 0);
        *version >= min
            && self
                .max
                .map_or(true, |(major, minor)| *version < Version::new(major, minor, 0))
    }
}

// Must stay ascending, contiguous and non-overlapping.
const PERMISSION_RANGES: [PermissionRange; 5] = [
    PermissionRange {
        min: (2, 1),
        max: Some((2, 2)),
        generate: cluster_role_ge2_1_lt2_2,
    },
    PermissionRange {
        min: (2, 2),
        max: Some((2, 3)),
        generate: cluster_role_ge2_2_lt2_3,
    },
    PermissionRange {
        min: (2, 3),
        max: Some((2, 4)),
        generate: cluster_role_ge2_3_lt2_4,
    },
    PermissionRange {
        min: (2, 4),
        max: Some((2, 6)),
        generate: cluster_role_ge2_4_lt2_6,
    },
    PermissionRange {
        min: (2, 6),
        max: None,
        generate: cluster_role_ge2_6,
    },
];

/// Returns the ClusterRole named `name` with every permission needed by the
/// control plane running `image`.
pub fn resolve_permissions(
    name: &str,
    image: Option<&str>,
) -> Result<ClusterRole, PermissionsError> {
    let version = parse_version(&image_version(image))?;
    PERMISSION_RANGES
        .iter()
        .find(|range| range.contains(&version))
        .map(|range| (range.generate)(name))
        .ok_or(PermissionsError::UnsupportedVersion(version))
}

// Extracts the version tag of an image reference. References without a tag and
// the "latest" tag map to the latest known version.
pub fn image_version(image: Option<&str>) -> String {
    let reference = image
        .map(|i| i.split('@').next().unwrap_or_default())
        .unwrap_or_default();
    match reference.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() && !tag.contains('/') && tag != "latest" => {
            tag.to_string()
        }
        _ => LATEST_CONTROLPLANE_VERSION.to_string(),
    }
}

// Parses a tag as a semantic version, accepting a leading "v" and missing
// minor/patch components ("2.11" is 2.11.0).
pub fn parse_version(tag: &str) -> Result<Version, PermissionsError> {
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    let split = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split);
    let mut normalized = core.to_string();
    for _ in core.split('.').count()..3 {
        normalized.push_str(".0");
    }
    normalized.push_str(suffix);

    Version::parse(&normalized).map_err(|source| PermissionsError::InvalidVersion {
        version: tag.to_string(),
        source,
    })
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(strings(api_groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..Default::default()
    }
}

const READ: &[&str] = &["get", "list", "watch"];
const STATUS_WRITE: &[&str] = &["get", "patch", "update"];

fn rules_ge2_1() -> Vec<PolicyRule> {
    vec![
        rule(&[""], &["configmaps", "endpoints", "nodes", "pods", "secrets"], &["list", "watch"]),
        rule(&[""], &["services"], READ),
        rule(&[""], &["events"], &["create", "patch"]),
        rule(&["networking.k8s.io"], &["ingresses", "ingressclasses"], READ),
        rule(&["networking.k8s.io"], &["ingresses/status"], STATUS_WRITE),
        rule(
            &["gateway.networking.k8s.io"],
            &["gateways", "gatewayclasses", "httproutes"],
            READ,
        ),
        rule(
            &["gateway.networking.k8s.io"],
            &["gateways/status", "gatewayclasses/status", "httproutes/status"],
            STATUS_WRITE,
        ),
        rule(
            &["configuration.konghq.com"],
            &["kongplugins", "kongclusterplugins", "kongconsumers", "kongingresses"],
            READ,
        ),
    ]
}

fn rules_ge2_2() -> Vec<PolicyRule> {
    let mut rules = rules_ge2_1();
    rules.push(rule(&["discovery.k8s.io"], &["endpointslices"], READ));
    rules
}

fn rules_ge2_3() -> Vec<PolicyRule> {
    let mut rules = rules_ge2_2();
    rules.push(rule(
        &["gateway.networking.k8s.io"],
        &["referencegrants", "tcproutes", "udproutes", "tlsroutes"],
        READ,
    ));
    rules.push(rule(
        &["gateway.networking.k8s.io"],
        &["tcproutes/status", "udproutes/status", "tlsroutes/status"],
        STATUS_WRITE,
    ));
    rules
}

fn rules_ge2_4() -> Vec<PolicyRule> {
    let mut rules = rules_ge2_3();
    rules.push(rule(&["gateway.networking.k8s.io"], &["grpcroutes"], READ));
    rules.push(rule(&["gateway.networking.k8s.io"], &["grpcroutes/status"], STATUS_WRITE));
    rules
}

fn rules_ge2_6() -> Vec<PolicyRule> {
    let mut rules = rules_ge2_4();
    rules.push(rule(
        &["coordination.k8s.io"],
        &["leases"],
        &["create", "get", "list", "update"],
    ));
    rules.push(rule(
        &["configuration.konghq.com"],
        &["kongupstreampolicies", "konglicenses", "kongvaults"],
        READ,
    ));
    rules
}

fn cluster_role(name: &str, rules: Vec<PolicyRule>) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        rules: Some(rules),
        aggregation_rule: None,
    }
}

pub(crate) fn cluster_role_ge2_1_lt2_2(name: &str) -> ClusterRole {
    cluster_role(name, rules_ge2_1())
}

pub(crate) fn cluster_role_ge2_2_lt2_3(name: &str) -> ClusterRole {
    cluster_role(name, rules_ge2_2())
}

pub(crate) fn cluster_role_ge2_3_lt2_4(name: &str) -> ClusterRole {
    cluster_role(name, rules_ge2_3())
}

pub(crate) fn cluster_role_ge2_4_lt2_6(name: &str) -> ClusterRole {
    cluster_role(name, rules_ge2_4())
}

pub(crate) fn cluster_role_ge2_6(name: &str) -> ClusterRole {
    cluster_role(name, rules_ge2_6())
}
