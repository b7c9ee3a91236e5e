//! The reconstruction pipeline: basic blocks, dominators, structured tree.

pub mod ast;
pub mod cfg;
pub mod dominators;
pub mod method;
