//! State machines built with `statig`.

pub mod vm_sm;
