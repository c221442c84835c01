//! Token scanner for raw SQL text.
//!
//! Splits a statement into identifiers, keywords, literals, and symbols.
//! Comments and string literals are skipped or folded into opaque tokens
//! so they can never be mistaken for identifiers.

use std::iter::Peekable;
use std::str::CharIndices;

/// A single scanned token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlToken {
    /// Bare identifier or keyword, original case preserved.
    Word(String),
    /// Quoted identifier with quotes stripped: `"x"`, `` `x` `` or `[x]`.
    QuotedIdent(String),
    /// String literal, contents dropped.
    StringLit,
    /// Numeric literal.
    Number,
    /// Any single punctuation character: `( ) , . ; = < > * + -` etc.
    Symbol(char),
}

impl SqlToken {
    /// Case-insensitive keyword comparison for bare words only.
    /// Quoted identifiers never match keywords.
    pub fn is_keyword(&self, kw: &str) -> bool {
        match self {
            SqlToken::Word(w) => w.eq_ignore_ascii_case(kw),
            _ => false,
        }
    }

    /// The identifier text (lowercased) if this token can name a table
    /// or column.
    pub fn ident(&self) -> Option<String> {
        match self {
            SqlToken::Word(w) => Some(w.to_ascii_lowercase()),
            SqlToken::QuotedIdent(w) => Some(w.to_ascii_lowercase()),
            _ => None,
        }
    }
}

/// Scanner over one SQL statement.
pub struct Scanner<'a> {
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
        }
    }

    /// Tokenize the whole statement.
    pub fn tokenize(mut self) -> Vec<SqlToken> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token() {
            tokens.push(token);
        }
        tokens
    }

    fn next_token(&mut self) -> Option<SqlToken> {
        self.skip_whitespace_and_comments();

        let (_, c) = *self.chars.peek()?;
        match c {
            '\'' => {
                self.scan_string();
                Some(SqlToken::StringLit)
            }
            '"' => Some(SqlToken::QuotedIdent(self.scan_quoted('"'))),
            '`' => Some(SqlToken::QuotedIdent(self.scan_quoted('`'))),
            '[' => Some(SqlToken::QuotedIdent(self.scan_quoted(']'))),
            c if c.is_ascii_digit() => {
                self.scan_number();
                Some(SqlToken::Number)
            }
            c if c.is_alphabetic() || c == '_' => Some(SqlToken::Word(self.scan_word())),
            c => {
                self.chars.next();
                Some(SqlToken::Symbol(c))
            }
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
                self.chars.next();
            }

            match self.peek_two() {
                Some(('-', '-')) => {
                    while let Some((_, c)) = self.chars.next() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some(('/', '*')) => {
                    self.chars.next();
                    self.chars.next();
                    let mut prev = '\0';
                    while let Some((_, c)) = self.chars.next() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                }
                _ => break,
            }
        }
    }

    fn peek_two(&mut self) -> Option<(char, char)> {
        let mut clone = self.chars.clone();
        let (_, first) = clone.next()?;
        let (_, second) = clone.next()?;
        Some((first, second))
    }

    fn scan_string(&mut self) {
        self.chars.next(); // opening quote
        while let Some((_, c)) = self.chars.next() {
            if c == '\'' {
                // '' escapes a quote inside the literal
                if matches!(self.chars.peek(), Some((_, '\''))) {
                    self.chars.next();
                } else {
                    break;
                }
            }
        }
    }

    fn scan_quoted(&mut self, close: char) -> String {
        self.chars.next(); // opening quote/bracket
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next() {
            if c == close {
                break;
            }
            out.push(c);
        }
        out
    }

    fn scan_number(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_ascii_digit() || *c == '.') {
            self.chars.next();
        }
    }

    fn scan_word(&mut self) -> String {
        let mut out = String::new();
        while matches!(self.chars.peek(), Some((_, c)) if c.is_alphanumeric() || *c == '_' || *c == '$')
        {
            let (_, c) = self.chars.next().unwrap();
            out.push(c);
        }
        out
    }
}
