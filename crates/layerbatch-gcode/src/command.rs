//! Single-line G-code commands.
//!
//! A [`Command`] is the parsed form of one instruction line. Parsing never
//! fails: a line that cannot be split into address words keeps its text and
//! gets an empty mnemonic, so it is passed through verbatim.

use std::fmt::Write as _;

/// Decimal places for X/Y/Z in synthesized commands.
pub const AXIS_PRECISION: usize = 3;
/// Decimal places for E in synthesized commands.
pub const EXTRUSION_PRECISION: usize = 5;

/// One G-code line.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Zero-based source line index. `None` for synthesized commands.
    pub line: Option<usize>,
    /// Line text without its terminator.
    pub raw: String,
    /// Command word, e.g. `G1`, `M620.1`, `T1`. Empty for comments and
    /// lines that are not made of address words.
    pub mnemonic: String,
    /// X word.
    pub x: Option<f64>,
    /// Y word.
    pub y: Option<f64>,
    /// Z word.
    pub z: Option<f64>,
    /// E word (extrusion).
    pub e: Option<f64>,
    /// F word (feedrate, mm/min).
    pub f: Option<f64>,
    /// Tool selected by a bare `T0`..`T9` line.
    pub tool: Option<u8>,
    /// Comment text after `;`, trimmed.
    pub comment: Option<String>,
    /// Member of a tool-change sequence.
    pub in_tool_change: bool,
}

/// An address word: a letter and the (possibly empty) text that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word<'a> {
    letter: char,
    value: &'a str,
}

impl Command {
    /// Parse one line of G-code.
    pub fn parse(line: usize, text: &str) -> Self {
        let raw = text.trim_end_matches(['\r', '\n']).to_string();
        let mut cmd = Self::opaque(Some(line), raw);
        cmd.fill_fields();
        cmd
    }

    /// Build a synthesized command from text.
    ///
    /// The fields are recovered by parsing the text, so raw text and fields
    /// always agree and re-parsing the emitted line yields the same command.
    pub fn synthesized(text: impl Into<String>) -> Self {
        let mut cmd = Self::opaque(None, text.into());
        cmd.fill_fields();
        cmd
    }

    /// Synthesized comment line.
    pub fn comment_line(text: &str) -> Self {
        Self::synthesized(format!("; {}", text))
    }

    fn opaque(line: Option<usize>, raw: String) -> Self {
        Self {
            line,
            raw,
            mnemonic: String::new(),
            x: None,
            y: None,
            z: None,
            e: None,
            f: None,
            tool: None,
            comment: None,
            in_tool_change: false,
        }
    }

    fn fill_fields(&mut self) {
        let (code, comment) = split_comment(&self.raw);
        self.comment = comment.map(|c| c.trim().to_string());

        let Some(words) = scan_words(code.trim()) else {
            return;
        };
        let Some(first) = words.first() else {
            return;
        };
        self.mnemonic = format!("{}{}", first.letter, first.value);

        for word in &words[1..] {
            let slot = match word.letter {
                'X' => &mut self.x,
                'Y' => &mut self.y,
                'Z' => &mut self.z,
                'E' => &mut self.e,
                'F' => &mut self.f,
                _ => continue,
            };
            if slot.is_none() {
                *slot = word.value.parse().ok();
            }
        }

        if words.len() == 1 && first.letter == 'T' {
            if let [digit] = first.value.as_bytes() {
                if digit.is_ascii_digit() {
                    self.tool = Some(digit - b'0');
                }
            }
        }
    }

    /// Code part of the line (before any `;`), trimmed.
    pub fn code(&self) -> &str {
        split_comment(&self.raw).0.trim()
    }

    /// Whether the line is a comment or blank.
    pub fn is_comment_or_blank(&self) -> bool {
        self.code().is_empty()
    }

    /// Linear or rapid move (`G0`/`G1`) or arc (`G2`/`G3`).
    pub fn is_motion(&self) -> bool {
        matches!(self.mnemonic.as_str(), "G0" | "G1" | "G2" | "G3")
    }

    /// Whether the line addresses any axis.
    pub fn moves_axis(&self) -> bool {
        self.is_motion()
            && (self.x.is_some() || self.y.is_some() || self.z.is_some() || self.e.is_some())
    }

    /// Mark as a tool-change sequence member.
    pub fn tool_change_member(mut self) -> Self {
        self.in_tool_change = true;
        self
    }
}

fn split_comment(raw: &str) -> (&str, Option<&str>) {
    match raw.find(';') {
        Some(idx) => (&raw[..idx], Some(&raw[idx + 1..])),
        None => (raw, None),
    }
}

/// Split code text into address words.
///
/// Accepts both `G1 X10 Y5` and `G1X10Y5`. Returns `None` when the text
/// contains anything other than uppercase letters, numeric characters and
/// whitespace, which marks the line as opaque.
fn scan_words(code: &str) -> Option<Vec<Word<'_>>> {
    let bytes = code.as_bytes();
    let mut words = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if !c.is_ascii_uppercase() {
            return None;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_number_char(bytes[end]) {
            end += 1;
        }
        words.push(Word {
            letter: c as char,
            value: &code[start..end],
        });
        i = end;
    }

    Some(words)
}

fn is_number_char(c: u8) -> bool {
    c.is_ascii_digit() || matches!(c, b'.' | b'-' | b'+')
}

/// Builder for synthesized motion commands with fixed numeric precision.
#[derive(Debug, Clone, Default)]
pub struct Move {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    e: Option<f64>,
    f: Option<f64>,
    comment: Option<String>,
}

impl Move {
    /// Empty `G1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set X.
    pub fn x(mut self, x: f64) -> Self {
        self.x = Some(x);
        self
    }

    /// Set Y.
    pub fn y(mut self, y: f64) -> Self {
        self.y = Some(y);
        self
    }

    /// Set X and Y.
    pub fn xy(self, x: f64, y: f64) -> Self {
        self.x(x).y(y)
    }

    /// Set Z.
    pub fn z(mut self, z: f64) -> Self {
        self.z = Some(z);
        self
    }

    /// Set E.
    pub fn e(mut self, e: f64) -> Self {
        self.e = Some(e);
        self
    }

    /// Set feedrate (mm/min).
    pub fn f(mut self, f: f64) -> Self {
        self.f = Some(f);
        self
    }

    /// Trailing comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Format and parse into a [`Command`].
    pub fn build(&self) -> Command {
        let mut text = String::from("G1");
        for (letter, value) in [('X', self.x), ('Y', self.y), ('Z', self.z)] {
            if let Some(v) = value {
                let _ = write!(text, " {}{}", letter, format_coord(v, AXIS_PRECISION));
            }
        }
        if let Some(e) = self.e {
            let _ = write!(text, " E{}", format_coord(e, EXTRUSION_PRECISION));
        }
        if let Some(f) = self.f {
            let _ = write!(text, " F{}", format_coord(f, 0));
        }
        if let Some(comment) = &self.comment {
            let _ = write!(text, " ; {}", comment);
        }
        Command::synthesized(text)
    }
}

/// Format a number with fixed precision, normalizing `-0` to `0`.
pub fn format_coord(value: f64, precision: usize) -> String {
    let s = format!("{:.prec$}", value, prec = precision);
    if s.starts_with('-') && s[1..].bytes().all(|b| b == b'0' || b == b'.') {
        s[1..].to_string()
    } else {
        s
    }
}
