pub mod collections;
pub mod common;
pub mod completions;
pub mod devices;
pub mod heads;
pub mod objects;
pub mod partners;
