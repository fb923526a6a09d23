//! Storage backend implementations.

pub mod filesystem;
pub mod hdfs;
pub mod object;
pub mod s3;
