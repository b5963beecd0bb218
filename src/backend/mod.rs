pub mod compiler;
pub mod elf;
pub mod interp;
pub mod llvm;
