//! The bytecode chunk format consumed by the vireo virtual machine
//!
//! Chunks are produced by external front ends (the imperative compiler, the
//! shell dialect, and the C-like dialects) and consumed read-only by the VM.

#![warn(missing_docs)]

mod builder;
mod chunk;
mod op;
mod type_tag;

pub use crate::{
    builder::ChunkBuilder,
    chunk::{BYTECODE_VERSION, Chunk, Constant},
    op::Op,
    type_tag::TypeTag,
};
