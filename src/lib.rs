pub mod aggregator;
pub mod cluster;
pub mod config;
pub mod error;
pub mod extent;
pub mod fiemap;
pub mod logging;
pub mod scanner;
pub mod selection;
pub mod snapshot;
pub mod store;
pub mod view;
pub mod viewport;
pub mod watcher;

pub use cluster::{Cluster, ClusterGrid, ClusterState};
pub use error::{FragmapError, Result};
pub use extent::{Extent, FileId, FileModel, FileRecord};
pub use selection::SelectionState;
pub use store::{SharedFileModel, SharedStore};
pub use view::FragmapView;
pub use viewport::{DisplayArea, Viewport, ViewportCalculator, ZoomDirection};
