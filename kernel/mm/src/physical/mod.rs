//! Physical frame tracking: zones, regions and page handles.

mod page;
mod region;
mod zone;

pub use page::PhysicalPage;
pub use region::{DEFAULT_ZONE_SIZES, PhysicalRegion};
pub use zone::{MAX_ZONE_FRAMES, MIN_ZONE_FRAMES, PhysicalZone};
