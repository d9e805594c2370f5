// API group of the operator's own custom resources.
pub const OPERATOR_API_GROUP: &str = "gateway-operator.blixt.dev";

// Default controller name claimed by this operator on GatewayClasses.
pub const DEFAULT_CONTROLLER_NAME: &str = "gateway-operator.blixt.dev/gateway-controller";

// Field manager used when writing to the API server.
pub const OPERATOR_FIELD_MANAGER: &str = "gateway-operator-field-manager";

// Default container images.
pub const DEFAULT_DATAPLANE_IMAGE: &str = "kong:3.4";
pub const DEFAULT_CONTROLPLANE_IMAGE: &str = "kong/kubernetes-ingress-controller:3.0";

// Version assumed for control plane images without a usable tag.
pub const LATEST_CONTROLPLANE_VERSION: &str = "3.0.0";

// Container names inside generated pod templates.
pub const DATAPLANE_PROXY_CONTAINER_NAME: &str = "proxy";
pub const CONTROLPLANE_CONTROLLER_CONTAINER_NAME: &str = "controller";

// Ports exposed by the data plane proxy.
pub const DATAPLANE_PROXY_PORT: i32 = 8000;
pub const DATAPLANE_PROXY_SSL_PORT: i32 = 8443;
pub const DATAPLANE_ADMIN_API_PORT: i32 = 8444;
pub const DATAPLANE_METRICS_PORT: i32 = 8100;

// -----------------------------------------------------------------------------
// Labels
// -----------------------------------------------------------------------------

// Label naming the tier that manages an object.
pub const MANAGED_BY_LABEL: &str = "gateway-operator.blixt.dev/managed-by";
pub const DATAPLANE_MANAGED_LABEL_VALUE: &str = "dataplane";
pub const CONTROLPLANE_MANAGED_LABEL_VALUE: &str = "controlplane";
pub const GATEWAY_MANAGED_LABEL_VALUE: &str = "gateway";

// Label used to indicate that a DataPlane or ControlPlane is owned by a Gateway.
pub const GATEWAY_OWNER_LABEL: &str = "gateway-operator.blixt.dev/owned-by-gateway";

// Label carrying the UID of the ControlPlane owning a cluster-scoped object.
pub const CONTROLPLANE_OWNER_UID_LABEL: &str = "gateway-operator.blixt.dev/owned-by-controlplane";

// Label distinguishing the two DataPlane services.
pub const DATAPLANE_SERVICE_TYPE_LABEL: &str = "gateway-operator.blixt.dev/service-type";
pub const SERVICE_TYPE_ADMIN: &str = "admin";
pub const SERVICE_TYPE_INGRESS: &str = "ingress";

// Generation labels for services/secrets and for deployments.
pub const DATAPLANE_GENERATION_STATE_LABEL: &str = "gateway-operator.blixt.dev/generation-state";
pub const DATAPLANE_DEPLOYMENT_STATE_LABEL: &str = "gateway-operator.blixt.dev/deployment-state";
pub const STATE_LIVE: &str = "live";
pub const STATE_PREVIEW: &str = "preview";

// Pod label used as the deployment selector. Services route by this label.
pub const DATAPLANE_SELECTOR_LABEL: &str = "gateway-operator.blixt.dev/selector";

pub const APP_LABEL: &str = "app";

// -----------------------------------------------------------------------------
// Annotations and finalizers
// -----------------------------------------------------------------------------

// Promotion trigger for a blue/green DataPlane rollout.
pub const DATAPLANE_PROMOTE_WHEN_READY_ANNOTATION: &str =
    "gateway-operator.blixt.dev/promote-when-ready";
pub const DATAPLANE_PROMOTE_WHEN_READY_TRUE: &str = "true";

// Finalizer on every DataPlane child, removed only once the owner goes away.
pub const WAIT_FOR_OWNER_FINALIZER: &str = "gateway-operator.blixt.dev/wait-for-owner";

// The finalizer used for DataPlane children cleanup.
pub const DATAPLANE_FINALIZER: &str = "gateway-operator.blixt.dev/dataplane-cleanup";

// The finalizer used for ControlPlane cluster-scoped cleanup.
pub const CONTROLPLANE_FINALIZER: &str = "gateway-operator.blixt.dev/controlplane-cleanup";

// -----------------------------------------------------------------------------
// Conditions
// -----------------------------------------------------------------------------

pub const CONDITION_SCHEDULED: &str = "Scheduled";
pub const CONDITION_PROVISIONED: &str = "Provisioned";
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ROLLED_OUT: &str = "RolledOut";

pub const REASON_SCHEDULED: &str = "GatewayScheduled";
pub const REASON_INVALID_PARAMETERS: &str = "InvalidParameters";
pub const REASON_NO_SUCH_GATEWAY_CLASS: &str = "NoSuchGatewayClass";
pub const REASON_PROVISIONED: &str = "Provisioned";
pub const REASON_PROVISIONING: &str = "Provisioning";
pub const REASON_PODS_READY: &str = "PodsReady";
pub const REASON_PODS_NOT_READY: &str = "PodsNotReady";
pub const REASON_READY: &str = "Ready";
pub const REASON_DEPENDENCIES_NOT_READY: &str = "DependenciesNotReady";
pub const REASON_NO_DATAPLANE: &str = "NoDataPlane";
pub const REASON_DATAPLANE_SET: &str = "DataPlaneSet";
pub const REASON_UNSUPPORTED_IMAGE: &str = "UnsupportedImage";

// RolledOut reasons.
pub const REASON_ROLLOUT_PROGRESSING: &str = "Progressing";
pub const REASON_ROLLOUT_AWAITING_PROMOTION: &str = "AwaitingPromotion";
pub const REASON_ROLLOUT_PROMOTING: &str = "Promoting";
pub const REASON_ROLLOUT_PROMOTION_DONE: &str = "PromotionDone";

// -----------------------------------------------------------------------------
// Control plane environment
// -----------------------------------------------------------------------------

pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_PUBLISH_SERVICE: &str = "CONTROLLER_PUBLISH_SERVICE";
pub const ENV_ADMIN_SERVICE: &str = "CONTROLLER_ADMIN_SVC";
pub const ENV_GATEWAY_CONTROLLER_NAME: &str = "CONTROLLER_GATEWAY_API_CONTROLLER_NAME";
pub const ENV_ELECTION_ID: &str = "CONTROLLER_ELECTION_ID";
pub const ENV_MANAGED_BY_GATEWAY: &str = "CONTROLLER_GATEWAY_DISCOVERY_MANAGED";
