//! HTTP API for the node.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! catapult-node serve --listen 0.0.0.0:8888
//!
//! # Build a drive, then boot a VM from it
//! curl -X POST http://localhost:8888/api/v1/drives \
//!   -H "Content-Type: application/json" \
//!   -d '{"name": "library/alpine:3.19"}'
//! curl -X POST http://localhost:8888/api/v1/vms \
//!   -H "Content-Type: application/json" \
//!   -d '{"id": "vm-1", "kernel_image_path": "/boot/vmlinux",
//!        "root_filesystem": "/var/lib/catapult/images/library-alpine_3.19/rootfs.ext4"}'
//! ```

pub mod error;
pub mod handlers;
pub mod types;
pub mod validation;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::node::NodeService;

/// OpenAPI documentation for the node API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "catapult-node API",
        version = "0.1.0",
        description = "Node-local Firecracker microVM control plane: VM lifecycle, root drives and remote volumes."
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "VMs", description = "MicroVM lifecycle"),
        (name = "Storage", description = "Root drives and remote volumes")
    ),
    paths(
        handlers::health::health,
        handlers::vms::start_vm,
        handlers::vms::list_vms,
        handlers::vms::get_vm,
        handlers::vms::stop_vm,
        handlers::drives::create_drive,
        handlers::volumes::connect_volume,
    ),
    components(schemas(
        // Request types
        types::VmConfig,
        types::StopVmRequest,
        types::ImageName,
        types::Volume,
        // Response types
        types::Status,
        types::HealthResponse,
        types::VmNetworkConfig,
        types::VmResponse,
        types::StatusResponse,
        types::VmList,
        types::VmInfo,
        types::DriveResponse,
        types::VolumeResponse,
        types::ApiErrorResponse,
    ))
)]
pub struct ApiDoc;

/// Slack added to the graceful stop timeout for VM routes.
const VM_REQUEST_SLACK: Duration = Duration::from_secs(30);

/// Create the API router.
///
/// VM routes time out after the configured graceful stop budget plus some
/// slack. Drive and volume routes have no timeout; pulls can take minutes.
pub fn create_router(node: Arc<NodeService>) -> Router {
    let vm_timeout = node.config().hypervisor.stop_timeout()
        + node.config().hypervisor.startup_grace()
        + VM_REQUEST_SLACK;

    let health_route = Router::new().route("/health", get(handlers::health::health));

    let vm_routes = Router::new()
        .route("/", post(handlers::vms::start_vm))
        .route("/", get(handlers::vms::list_vms))
        .route("/:id", get(handlers::vms::get_vm))
        .route("/:id/stop", post(handlers::vms::stop_vm))
        .layer(TimeoutLayer::new(vm_timeout));

    let storage_routes = Router::new()
        .route("/drives", post(handlers::drives::create_drive))
        .route("/volumes", post(handlers::volumes::connect_volume));

    let api_v1 = Router::new()
        .nest("/vms", vm_routes)
        .merge(storage_routes);

    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}
