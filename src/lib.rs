pub mod error;
pub mod mem;
pub mod stream;

pub use error::StreamError;
pub use error::StreamResult;

pub use mem::map::{AnonMap, FileMap, MapBackend, MemFlags};
pub use stream::{Entry, EntryIter, Region, RegionIter, RegionRuntime, ReservedEntry, Stream};
