pub mod job;
pub mod policy;
pub mod write;
