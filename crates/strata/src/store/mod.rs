mod entry;
mod interface;
mod memory;
mod query;

pub use entry::*;
pub use interface::*;
pub use memory::*;
pub use query::*;
