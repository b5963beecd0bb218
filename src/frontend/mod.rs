pub mod parser;
pub mod tape;
pub mod translator;

pub use parser::{Command, Program};
pub use tape::{Tape, DEFAULT_TAPE_SIZE, MAX_TAPE_SIZE};
pub use translator::{compile, Config, LoopFrame, TranslateError, Translator};
