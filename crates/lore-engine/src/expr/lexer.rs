use crate::error::KbError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Integer(i64),
    /// `9223372036854775808`, valid only directly after a unary minus.
    MinIntegerMagnitude,
    Double(f64),
    Str(String),
    /// Variable or function name, possibly with `{name}` segments.
    Ident(String),
    /// `#name` system call.
    System(String),
    Semicolon,
    Comma,
    Implies,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    PlusPlus,
    MinusMinus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset into the source.
    pub position: usize,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'.' || c == b'{'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'{'
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, KbError> {
    Lexer {
        source,
        bytes: source.as_bytes(),
        pos: 0,
    }
    .run()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Result<Vec<Token>, KbError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let start = self.pos;
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    position: start,
                });
                return Ok(tokens);
            };
            let kind = if c.is_ascii_digit() {
                self.number()?
            } else if c == b'"' || c == b'\'' {
                self.string(c)?
            } else if c == b'#' {
                self.pos += 1;
                let name = self.word();
                if name.is_empty() {
                    return Err(KbError::syntax(start, "expected system call name after '#'"));
                }
                TokenKind::System(name)
            } else if is_ident_start(c) {
                TokenKind::Ident(self.identifier()?)
            } else {
                self.operator()?
            };
            tokens.push(Token {
                kind,
                position: start,
            });
        }
    }

    fn skip_trivia(&mut self) -> Result<(), KbError> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_ascii_whitespace() => self.pos += 1,
                (Some(b'/'), Some(b'/')) => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                (Some(b'/'), Some(b'*')) => {
                    let start = self.pos;
                    self.pos += 2;
                    loop {
                        match (self.peek(), self.peek_at(1)) {
                            (Some(b'*'), Some(b'/')) => {
                                self.pos += 2;
                                break;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => {
                                return Err(KbError::syntax(start, "unterminated comment"));
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        self.source[start..self.pos].to_string()
    }

    fn identifier(&mut self) -> Result<String, KbError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !is_ident_continue(c) {
                break;
            }
            if c == b'{' {
                let open = self.pos;
                while self.peek().is_some_and(|c| c != b'}') {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(KbError::syntax(open, "unterminated '{' in name"));
                }
            }
            self.pos += 1;
        }
        Ok(self.source[start..self.pos].to_string())
    }

    fn number(&mut self) -> Result<TokenKind, KbError> {
        let start = self.pos;
        let mut floating = false;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            floating = true;
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some(b'+' | b'-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                floating = true;
                self.pos += 1 + sign;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text = &self.source[start..self.pos];
        if floating {
            text.parse::<f64>()
                .map(TokenKind::Double)
                .map_err(|_| KbError::syntax(start, format!("invalid number '{text}'")))
        } else {
            match text.parse::<u64>() {
                Ok(value) if value == i64::MIN.unsigned_abs() => Ok(TokenKind::MinIntegerMagnitude),
                Ok(value) => i64::try_from(value).map(TokenKind::Integer).map_err(|_| {
                    KbError::syntax(start, format!("integer '{text}' out of range"))
                }),
                Err(_) => Err(KbError::syntax(start, format!("integer '{text}' out of range"))),
            }
        }
    }

    fn string(&mut self, quote: u8) -> Result<TokenKind, KbError> {
        let start = self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(KbError::syntax(start, "unterminated string literal"));
            };
            if c == quote {
                self.pos += 1;
                return Ok(TokenKind::Str(out));
            }
            if c == b'\\' {
                let escaped = match self.peek_at(1) {
                    Some(b'n') => '\n',
                    Some(b't') => '\t',
                    Some(b'\\') => '\\',
                    Some(b'"') => '"',
                    Some(b'\'') => '\'',
                    _ => return Err(KbError::syntax(self.pos, "invalid escape sequence")),
                };
                out.push(escaped);
                self.pos += 2;
                continue;
            }
            // Copy a whole UTF-8 scalar at a time.
            let ch_len = self.source[self.pos..]
                .chars()
                .next()
                .map_or(1, char::len_utf8);
            out.push_str(&self.source[self.pos..self.pos + ch_len]);
            self.pos += ch_len;
        }
    }

    fn operator(&mut self) -> Result<TokenKind, KbError> {
        let start = self.pos;
        let two = (self.peek(), self.peek_at(1));
        let (kind, len) = match two {
            (Some(b'='), Some(b'>')) => (TokenKind::Implies, 2),
            (Some(b'='), Some(b'=')) => (TokenKind::EqEq, 2),
            (Some(b'!'), Some(b'=')) => (TokenKind::NotEq, 2),
            (Some(b'<'), Some(b'=')) => (TokenKind::Le, 2),
            (Some(b'>'), Some(b'=')) => (TokenKind::Ge, 2),
            (Some(b'&'), Some(b'&')) => (TokenKind::AndAnd, 2),
            (Some(b'|'), Some(b'|')) => (TokenKind::OrOr, 2),
            (Some(b'+'), Some(b'+')) => (TokenKind::PlusPlus, 2),
            (Some(b'-'), Some(b'-')) => (TokenKind::MinusMinus, 2),
            (Some(b'+'), Some(b'=')) => (TokenKind::PlusAssign, 2),
            (Some(b'-'), Some(b'=')) => (TokenKind::MinusAssign, 2),
            (Some(b'*'), Some(b'=')) => (TokenKind::StarAssign, 2),
            (Some(b'/'), Some(b'=')) => (TokenKind::SlashAssign, 2),
            (Some(b'='), _) => (TokenKind::Assign, 1),
            (Some(b'<'), _) => (TokenKind::Lt, 1),
            (Some(b'>'), _) => (TokenKind::Gt, 1),
            (Some(b'+'), _) => (TokenKind::Plus, 1),
            (Some(b'-'), _) => (TokenKind::Minus, 1),
            (Some(b'*'), _) => (TokenKind::Star, 1),
            (Some(b'/'), _) => (TokenKind::Slash, 1),
            (Some(b'%'), _) => (TokenKind::Percent, 1),
            (Some(b'!'), _) => (TokenKind::Bang, 1),
            (Some(b';'), _) => (TokenKind::Semicolon, 1),
            (Some(b','), _) => (TokenKind::Comma, 1),
            (Some(b'('), _) => (TokenKind::LParen, 1),
            (Some(b')'), _) => (TokenKind::RParen, 1),
            (Some(b'['), _) => (TokenKind::LBracket, 1),
            (Some(b']'), _) => (TokenKind::RBracket, 1),
            _ => {
                let found = self.source[start..].chars().next().unwrap_or('?');
                return Err(KbError::syntax(start, format!("unexpected character '{found}'")));
            }
        };
        self.pos += len;
        Ok(kind)
    }
}
