//! Shared HTTP plumbing: capped fetches and the axum wiring for inbound endpoints.

mod fetch;
pub mod inbox_route;
pub mod nodeinfo;

pub use fetch::fetch_json_capped;
pub use inbox_route::router;
pub use nodeinfo::NodeInfoUsageSource;
