//! Coordination service interface
//!
//! The coordination service is a hierarchical namespace of nodes holding
//! bytes. The metadata cache only needs listing, reading and watches, so
//! that is all this trait exposes. Watch notifications are delivered as
//! [`ChangeEvent`]s on a channel the caller owns.

use crossbeam_channel::Sender;
use derive_more::Display;
use tidepool_common::Result;
use tidepool_common::config::WatchMode;

/// Handle identifying one watch registration
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("watch#{_0}")]
pub struct WatchId(pub u64);

/// Channel side that receives watch notifications
pub type WatchSink = Sender<ChangeEvent>;

/// What changed on a watched path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// The set of children under the path changed
    ChildrenChanged {
        /// Full child list after the change
        children: Vec<String>,
    },
    /// The node's content was replaced
    DataChanged {
        /// New content
        payload: Vec<u8>,
    },
    /// The node was deleted
    DataDeleted,
}

/// A notification delivered for one watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Registration that produced the event
    pub watch: WatchId,
    /// Path the watch was registered on
    pub path: String,
    /// The change
    pub kind: ChangeKind,
}

impl ChangeEvent {
    /// Create an event
    pub fn new(watch: WatchId, path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            watch,
            path: path.into(),
            kind,
        }
    }
}

/// Client of the coordination service
///
/// Implementations must be safe to call from the notification dispatcher
/// while readers use the cache.
pub trait Coordinator: Send + Sync {
    /// Whether a watch keeps firing or must be re-armed after each event
    fn watch_mode(&self) -> WatchMode;

    /// Names of the children of `path`; empty if the path does not exist
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Content of `path`, or `None` if it does not exist
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Watch the child list of `path`
    fn watch_children(&self, path: &str, sink: &WatchSink) -> Result<WatchId>;

    /// Watch the content of `path`, including its deletion
    fn watch_data(&self, path: &str, sink: &WatchSink) -> Result<WatchId>;

    /// Cancel a watch; unknown ids are ignored
    fn unwatch(&self, watch: WatchId);

    /// Release the connection; all watches stop firing
    fn close(&self) -> Result<()>;
}
