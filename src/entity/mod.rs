pub mod instance;
pub mod mask;
pub mod state;

pub use instance::{EntityInstance, EntityView};
pub use mask::{GroupMask, MaskTracker};
pub use state::{EntityState, LifecycleEvent};
