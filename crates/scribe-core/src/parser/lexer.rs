use crate::error::{CoreError, Result};
use crate::ty::Type;

/// A line/column position in the source (both 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    If,
    Else,
    While,
    Do,
    Switch,
    Case,
    Default,
    Return,
    Goto,
    Void,
    Null,
    True,
    False,
    /// A type keyword (`int`, `string`, `widget`, ...).
    TypeKw(Type),

    // Literals and names
    IntLit { value: i32, hex: bool },
    LongLit(i64),
    StringLit(String),
    Ident(String),
    /// `$`-prefixed local name, `$` included.
    DollarIdent(String),

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Colon,
    Pipe,
    Amp,
    Dot,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Bang,
    AmpAmp,
    PipePipe,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::If => write!(f, "if"),
            Token::Else => write!(f, "else"),
            Token::While => write!(f, "while"),
            Token::Do => write!(f, "do"),
            Token::Switch => write!(f, "switch"),
            Token::Case => write!(f, "case"),
            Token::Default => write!(f, "default"),
            Token::Return => write!(f, "return"),
            Token::Goto => write!(f, "goto"),
            Token::Void => write!(f, "void"),
            Token::Null => write!(f, "null"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::TypeKw(t) => write!(f, "{}", t.keyword()),
            Token::IntLit { value, .. } => write!(f, "{value}"),
            Token::LongLit(v) => write!(f, "{v}L"),
            Token::StringLit(s) => write!(f, "{s:?}"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::DollarIdent(s) => write!(f, "{s}"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Comma => write!(f, ","),
            Token::Semi => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::Pipe => write!(f, "|"),
            Token::Amp => write!(f, "&"),
            Token::Dot => write!(f, "."),
            Token::Assign => write!(f, "="),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Bang => write!(f, "!"),
            Token::AmpAmp => write!(f, "&&"),
            Token::PipePipe => write!(f, "||"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

pub fn lex(src: &str) -> Result<Vec<(Token, Pos)>> {
    let mut lexer = Lexer {
        src: src.as_bytes(),
        pos: 0,
        line: 1,
        col: 1,
    };
    lexer.run()
}

impl Lexer<'_> {
    fn err(&self, message: String) -> CoreError {
        CoreError::Syntax {
            line: self.line,
            col: self.col,
            message,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn run(&mut self) -> Result<Vec<(Token, Pos)>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia()?;
            let pos = Pos {
                line: self.line,
                col: self.col,
            };
            let Some(c) = self.peek() else {
                tokens.push((Token::Eof, pos));
                return Ok(tokens);
            };

            let token = match c {
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b'{' => self.single(Token::LBrace),
                b'}' => self.single(Token::RBrace),
                b',' => self.single(Token::Comma),
                b';' => self.single(Token::Semi),
                b':' => self.single(Token::Colon),
                b'.' => self.single(Token::Dot),
                b'+' => self.single(Token::Plus),
                b'-' => self.single(Token::Minus),
                b'*' => self.single(Token::Star),
                b'/' => self.single(Token::Slash),
                b'%' => self.single(Token::Percent),
                b'=' => self.pair(b'=', Token::EqEq, Token::Assign),
                b'!' => self.pair(b'=', Token::NotEq, Token::Bang),
                b'<' => self.pair(b'=', Token::Le, Token::Lt),
                b'>' => self.pair(b'=', Token::Ge, Token::Gt),
                b'&' => self.pair(b'&', Token::AmpAmp, Token::Amp),
                b'|' => self.pair(b'|', Token::PipePipe, Token::Pipe),
                b'"' => self.string()?,
                b'0'..=b'9' => self.number()?,
                b'$' => self.dollar_ident()?,
                c if c.is_ascii_alphabetic() || c == b'_' => self.ident(),
                c => return Err(self.err(format!("unexpected character {:?}", c as char))),
            };
            tokens.push((token, pos));
        }
    }

    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match (self.peek(), self.peek2()) {
                            (Some(b'*'), Some(b'/')) => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            (Some(_), _) => {
                                self.bump();
                            }
                            (None, _) => return Err(self.err("unterminated comment".into())),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.bump();
        token
    }

    fn pair(&mut self, second: u8, long: Token, short: Token) -> Token {
        self.bump();
        if self.peek() == Some(second) {
            self.bump();
            long
        } else {
            short
        }
    }

    fn string(&mut self) -> Result<Token> {
        self.bump();
        let mut s = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(Token::StringLit(s)),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    other => {
                        return Err(self.err(format!(
                            "unknown escape sequence \\{}",
                            other.map(|c| c as char).unwrap_or(' ')
                        )))
                    }
                },
                Some(c) => s.push(c as char),
                None => return Err(self.err("unterminated string literal".into())),
            }
        }
    }

    fn number(&mut self) -> Result<Token> {
        let hex = self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x') | Some(b'X'));
        let mut digits = String::new();
        if hex {
            self.bump();
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    digits.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
            if digits.is_empty() {
                return Err(self.err("expected hex digits after 0x".into()));
            }
        } else {
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    digits.push(c as char);
                    self.bump();
                } else {
                    break;
                }
            }
        }

        let radix = if hex { 16 } else { 10 };
        let value = i64::from_str_radix(&digits, radix)
            .map_err(|_| self.err(format!("integer literal {digits:?} out of range")))?;

        if matches!(self.peek(), Some(b'L') | Some(b'l')) {
            self.bump();
            return Ok(Token::LongLit(value));
        }

        if value > i64::from(u32::MAX) {
            return Err(self.err(format!(
                "int literal {value} out of range (use an L suffix for longs)"
            )));
        }
        Ok(Token::IntLit {
            value: value as u32 as i32,
            hex,
        })
    }

    fn dollar_ident(&mut self) -> Result<Token> {
        self.bump();
        let mut name = String::from("$");
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                name.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        if name.len() == 1 {
            return Err(self.err("expected a name after `$`".into()));
        }
        Ok(Token::DollarIdent(name))
    }

    fn ident(&mut self) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                name.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        match name.as_str() {
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "do" => Token::Do,
            "switch" => Token::Switch,
            "case" => Token::Case,
            "default" => Token::Default,
            "return" => Token::Return,
            "goto" => Token::Goto,
            "void" => Token::Void,
            "null" => Token::Null,
            "true" => Token::True,
            "false" => Token::False,
            _ => match Type::from_keyword(&name) {
                Some(ty) => Token::TypeKw(ty),
                None => Token::Ident(name),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn punctuation_and_operators() {
        assert_eq!(
            kinds("== = != <= < && & || |"),
            vec![
                Token::EqEq,
                Token::Assign,
                Token::NotEq,
                Token::Le,
                Token::Lt,
                Token::AmpAmp,
                Token::Amp,
                Token::PipePipe,
                Token::Pipe,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn literals() {
        assert_eq!(
            kinds("12 0xff 5L \"a\\nb\""),
            vec![
                Token::IntLit {
                    value: 12,
                    hex: false
                },
                Token::IntLit {
                    value: 255,
                    hex: true
                },
                Token::LongLit(5),
                Token::StringLit("a\nb".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn keywords_types_and_idents() {
        assert_eq!(
            kinds("while widget frob $i0"),
            vec![
                Token::While,
                Token::TypeKw(Type::Widget),
                Token::Ident("frob".into()),
                Token::DollarIdent("$i0".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped_and_positions_tracked() {
        let tokens = lex("// line\nx /* block\nstill */ y").unwrap();
        assert_eq!(tokens[0].0, Token::Ident("x".into()));
        assert_eq!(tokens[0].1, Pos { line: 2, col: 1 });
        assert_eq!(tokens[1].0, Token::Ident("y".into()));
        assert_eq!(tokens[1].1, Pos { line: 3, col: 10 });
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        assert!(matches!(
            lex("\"abc"),
            Err(CoreError::Syntax { line: 1, .. })
        ));
    }
}
