// =============================================================================
// Upstream feed integration
// =============================================================================
//
// - protocol: the JSON frame contract with the upstream feed
// - ingress: bounded drop-oldest queues between dispatcher and processors
// - manager: the single-connection subscription manager

pub mod ingress;
pub mod manager;
pub mod protocol;

pub use ingress::{EventReceiver, EventSender, FeedEvent};
pub use manager::{FeedHandle, FeedMetricsSnapshot, FeedSettings, SubscriptionGuard};
pub use protocol::{Frame, SnapshotFrame, TickFrame};
