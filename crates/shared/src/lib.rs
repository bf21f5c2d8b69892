//! Wire-level types shared by the pane engine and transport implementations.

pub mod domain;
pub mod error;
pub mod protocol;
