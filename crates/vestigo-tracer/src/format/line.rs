use std::sync::LazyLock;

use colored::Color;
use regex::Regex;

pub(super) const ADDRESS: Color = Color::Blue;
pub(super) const BYTES: Color = Color::BrightBlack;
pub(super) const MNEMONIC: Color = Color::Green;
pub(super) const REGISTER: Color = Color::Cyan;
pub(super) const NUMBER: Color = Color::Yellow;
pub(super) const IMMEDIATE: Color = Color::Magenta;
pub(super) const STRING: Color = Color::BrightGreen;
pub(super) const LOCATION: Color = Color::BrightBlue;
pub(super) const ANNOTATION: Color = Color::BrightBlack;

/// Operand tokens worth highlighting: `#`-immediates, hex/decimal literals
/// and identifiers.
static OPERAND_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"#-?(?:0x[0-9a-fA-F]+|\d+)|-?0x[0-9a-fA-F]+|\b\d+\b|[A-Za-z_][A-Za-z0-9_.]*")
    {
        Ok(re) => re,
        Err(e) => unreachable!("invalid operand token regex: {e}"),
    }
});

/// Operand identifiers which are not registers.
const OPERAND_KEYWORDS: &[&str] = &[
    "ptr", "byte", "word", "dword", "qword", "tbyte", "xmmword", "ymmword", "zmmword", "lsl",
    "lsr", "asr", "ror", "msl", "uxtb", "uxth", "uxtw", "uxtx", "sxtb", "sxth", "sxtw", "sxtx",
];

/// Text line under construction.
///
/// Columns are computed over the visible characters only, so that the
/// colorized rendering is aligned exactly like the plain one.
pub(super) struct Line {
    text: String,
    width: usize,
    colored: bool,
}

impl Line {
    pub const fn new(colored: bool) -> Self {
        Self {
            text: String::new(),
            width: 0,
            colored,
        }
    }

    pub fn push(&mut self, s: &str, color: Color) {
        if self.colored && !s.is_empty() {
            self.text
                .push_str(&format!("\x1b[{}m{s}\x1b[0m", color.to_fg_str()));
        } else {
            self.text.push_str(s);
        }

        self.width += s.chars().count();
    }

    pub fn push_plain(&mut self, s: &str) {
        self.text.push_str(s);
        self.width += s.chars().count();
    }

    /// Pads the line with spaces up to `column` (at least one space).
    pub fn pad_to(&mut self, column: usize) {
        let n = column.saturating_sub(self.width).max(1);
        self.push_plain(&" ".repeat(n));
    }

    /// Pushes disassembler operands, highlighting registers and literals.
    pub fn push_operands(&mut self, operands: &str) {
        let mut last = 0;

        for token in OPERAND_TOKEN.find_iter(operands) {
            self.push_plain(&operands[last..token.start()]);

            let s = token.as_str();

            let color = if s.starts_with('#') {
                Some(IMMEDIATE)
            } else if s.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
                Some(NUMBER)
            } else if OPERAND_KEYWORDS.contains(&s) {
                None
            } else {
                Some(REGISTER)
            };

            match color {
                Some(color) => self.push(s, color),
                None => self.push_plain(s),
            }

            last = token.end();
        }

        self.push_plain(&operands[last..]);
    }

    pub fn finish(self) -> String {
        self.text
    }
}
