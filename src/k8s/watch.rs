use super::Node;
use futures::prelude::*;
use kube::api::{Api, ListParams};
use kube_runtime::reflector::{self, Store};
use kube_runtime::watcher;
use std::pin::Pin;
use tokio::time;
use tracing::info;

pub use kube_runtime::watcher::Event;

/// The node event stream, backed by a reflector so that the paired
/// [`Store`] always reflects the last event delivered here.
pub struct NodeEvents(Pin<Box<dyn Stream<Item = watcher::Result<Event<Node>>> + Send + 'static>>);

// === impl NodeEvents ===

impl NodeEvents {
    /// Starts watching all nodes, returning the local cache alongside the
    /// event stream that keeps it current.
    pub fn with_store(client: kube::Client) -> (Store<Node>, Self) {
        let writer = reflector::store::Writer::default();
        let store = writer.as_reader();
        let stream = reflector::reflector(
            writer,
            watcher(Api::<Node>::all(client), ListParams::default()),
        );
        (store, Self(stream.boxed()))
    }

    #[cfg(test)]
    pub(crate) fn from_stream(
        stream: impl Stream<Item = watcher::Result<Event<Node>>> + Send + 'static,
    ) -> Self {
        Self(stream.boxed())
    }

    /// Receives the next node event.
    ///
    /// If the watch fails, log the error and sleep for 1s before polling for
    /// a reset event.
    pub async fn recv(&mut self) -> Event<Node> {
        loop {
            match self
                .0
                .next()
                .await
                .expect("node watch stream must not terminate")
            {
                Ok(ev) => return ev,
                Err(error) => {
                    info!(%error, "Disconnected");
                    time::sleep(time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}
