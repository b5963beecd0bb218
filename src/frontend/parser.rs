use derive_more::TryFrom;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFrom)]
#[try_from(repr)]
#[repr(u8)]
pub enum Command {
    Right = b'>',
    Left = b'<',
    Inc = b'+',
    Dec = b'-',
    Output = b'.',
    Input = b',',
    Open = b'[',
    Close = b']',
}

/// The instruction stream of a source file.
///
/// Bytes outside the eight-command alphabet are comments and are dropped;
/// every kept command remembers its byte offset in the source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
    instrs: Vec<(usize, Command)>,
}

impl Program {
    pub fn commands(&self) -> impl Iterator<Item = (usize, Command)> + '_ {
        self.instrs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

impl From<&[u8]> for Program {
    fn from(value: &[u8]) -> Self {
        let instrs = value
            .iter()
            .enumerate()
            .filter_map(|(pos, &c)| Command::try_from(c).ok().map(|cmd| (pos, cmd)))
            .collect();

        Program { instrs }
    }
}

impl From<&str> for Program {
    fn from(value: &str) -> Self {
        value.as_bytes().into()
    }
}
