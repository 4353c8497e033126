pub mod cursor;
pub mod decision;
pub mod map;
pub mod page;
pub mod page_io;
pub mod root;
pub mod types;

#[cfg(test)]
mod test;

pub use cursor::Cursor;
pub use decision::{Decision, DecisionMaker};
pub use map::{MapCommit, MvMap};
pub use page_io::{PageSource, WriteContext};
pub use root::RootReference;
pub use types::{BytesType, DataType, StringType, U64Type};
