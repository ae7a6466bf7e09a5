//! Collaborator interfaces consumed by the lifecycle subsystem

mod events;
mod image;
mod store;

pub use events::{Event, EventAction, EventBus, EventKind, EventSink};
pub use image::{ImageInspector, NoImageInspector, StaticImageInspector};
pub use store::{MemoryStore, MetadataStore};
