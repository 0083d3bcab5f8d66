//! Job reads and writes, split by direction.

mod read;
mod write;
