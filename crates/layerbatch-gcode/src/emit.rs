//! Serialization of command streams back to text.

use crate::command::Command;

/// Line terminator used for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    /// `\n`
    #[default]
    Lf,
    /// `\r\n`
    CrLf,
}

impl LineEnding {
    /// Detect from the first line terminator in `text`.
    pub fn detect(text: &str) -> Self {
        match text.find('\n') {
            Some(idx) if idx > 0 && text.as_bytes()[idx - 1] == b'\r' => LineEnding::CrLf,
            _ => LineEnding::Lf,
        }
    }

    /// The terminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Accumulates commands into program text.
#[derive(Debug, Clone)]
pub struct Emitter {
    line_ending: LineEnding,
    out: String,
}

impl Emitter {
    /// New emitter.
    pub fn new(line_ending: LineEnding) -> Self {
        Self {
            line_ending,
            out: String::new(),
        }
    }

    /// Append one command's text.
    pub fn push(&mut self, cmd: &Command) {
        self.out.push_str(&cmd.raw);
        self.out.push_str(self.line_ending.as_str());
    }

    /// Append every command.
    pub fn push_all<'a>(&mut self, cmds: impl IntoIterator<Item = &'a Command>) {
        for cmd in cmds {
            self.push(cmd);
        }
    }

    /// Finished text.
    pub fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_line_ending() {
        assert_eq!(LineEnding::detect("G1\r\nG2\r\n"), LineEnding::CrLf);
        assert_eq!(LineEnding::detect("G1\nG2\n"), LineEnding::Lf);
        assert_eq!(LineEnding::detect("G1"), LineEnding::Lf);
        assert_eq!(LineEnding::detect("\nG1"), LineEnding::Lf);
    }

    #[test]
    fn test_emitter() {
        let mut out = Emitter::new(LineEnding::CrLf);
        out.push(&Command::parse(0, "G28"));
        out.push(&Command::comment_line("done"));
        assert_eq!(out.finish(), "G28\r\n; done\r\n");
    }
}
