//! Resource lifetime tracking.
//!
//! Two mechanisms keep VM-side objects and host-side resources consistent:
//!
//! - [`CleanupRegistry`]: an ordered set of destructors drained last-in,
//!   first-out at every transaction boundary.
//! - [`DescriptorArena`]: reference-counted row descriptor handles, each
//!   weakly attached to the invocation frame that created it, so that an
//!   aborted frame can force-release descriptors still referenced by
//!   script objects that outlive it.

mod frames;
mod registry;

pub use frames::{DescriptorArena, DescriptorHandle, FrameExit, FrameId, HandleId, HandleStatus};
pub use registry::{CleanupRegistry, ResourceId, XactEvent};
