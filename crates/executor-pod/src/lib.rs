pub mod api;
pub mod events;
pub mod kube_api;
pub mod logs;
pub mod metrics;
pub mod naming;
pub mod orphans;
pub mod persistence;
pub mod phase;
pub mod pod_backend;
pub mod poller;
mod retry;

pub use api::{ConfigMapApi, EventStream, PodApi};
pub use events::PodEventWatcher;
pub use kube_api::{connect, KubeConfigMapApi, KubePodApi};
pub use logs::{PodLogStreamer, SinceMarker, SinceMarkerStore};
pub use metrics::AgentMetrics;
pub use orphans::{OrphanReconciler, SweepReport};
pub use persistence::MetricsPersistence;
pub use phase::{Observation, PhaseReport, PhaseSource, PhaseTracker, PodPhase};
pub use pod_backend::{PodBackend, PodObservation, PodRef};
pub use poller::PodStatusPoller;
