pub mod allocator;
pub mod header;
pub mod iterator;
pub mod region;
pub mod runtimemap;
pub mod span;
pub mod stream;

pub use iterator::{EntryIter, RegionIter};
pub use region::{Entry, Region, RegionRuntime, RuntimeState};
pub use span::{Span, SpanType};
pub use stream::{ReservedEntry, Stream};
