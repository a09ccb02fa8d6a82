//! Lexer for the textual graph description format using logos
//!
//! Supports tokens like:
//! - Keywords: filter
//! - Identifiers: src, lowpass, my_filter
//! - Numbers: 0, 16, 1024
//! - Arrows and punctuation: ->, {, }, ;

use logos::Logos;

/// Token types for the graph description language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[token("filter")]
    Filter,

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<u64>().ok())]
    Number(u64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("->")]
    Arrow,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token(";")]
    Semicolon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Filter => write!(f, "filter"),
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Arrow => write!(f, "->"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Semicolon => write!(f, ";"),
        }
    }
}

/// Lexer wrapper that tracks source position for diagnostics
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self { inner: Token::lexer(source) }
    }

    /// Byte position of the most recent token
    pub fn position(&self) -> usize {
        self.inner.span().start
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Result<Token, ()>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
