//! Single-pass compiler from the eight-command tape language to a
//! control-flow graph of basic blocks.
//!
//! [`frontend`] turns source bytes into a [`ir::Module`]; [`backend`] prints it
//! as LLVM IR, runs it, or lowers it to a static x86-64 ELF executable.

pub mod backend;
pub mod frontend;
pub mod ir;
#[cfg(unix)]
pub mod test_helpers;
