//! Kubernetes API plumbing shared by the controller.

use async_trait::async_trait;
use kube::api::{Api, PostParams};

mod watch;

pub use self::watch::{Event, NodeEvents};
pub use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::api::ResourceExt;
pub use kube_runtime::reflector::{ObjectRef, Store};

/// The authoritative node API the reconciler writes through. The informer
/// cache serves reads on the hot path; this trait is only for the fresh read
/// before a taint update and for the spec updates themselves.
#[async_trait]
pub trait Nodes: Send + Sync + 'static {
    async fn get(&self, name: &str) -> kube::Result<Node>;

    /// Optimistic-concurrency write; a stale resource version surfaces as a
    /// conflict error.
    async fn update(&self, node: &Node) -> kube::Result<Node>;
}

pub struct NodeClient(Api<Node>);

// === impl NodeClient ===

impl NodeClient {
    pub fn new(client: kube::Client) -> Self {
        Self(Api::all(client))
    }
}

#[async_trait]
impl Nodes for NodeClient {
    async fn get(&self, name: &str) -> kube::Result<Node> {
        self.0.get(name).await
    }

    async fn update(&self, node: &Node) -> kube::Result<Node> {
        self.0
            .replace(&node.name(), &PostParams::default(), node)
            .await
    }
}

/// Whether the error is an optimistic-concurrency conflict (the object
/// changed under us). Conflicts are retried through the queue.
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}
