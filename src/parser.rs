//! Parser for the graph description format
//!
//! Parses declarations like:
//! ```text
//! filter src { file_reader push 2 }
//! filter a   { pop 2 push 2 work 100 }
//! filter b   { pop 1 push 1 work 90 mult 2 prework peek 2 pop 1 push 0 }
//! filter out { file_writer pop 1 }
//! src -> a; a -> b weight 2; b -> out;
//! ```
//!
//! Filter attributes: `peek/pop/push/work/mult/init N` (steady rates, work
//! estimate, steady and init firing counts), `prework peek A pop B push C`
//! (two-phase first firing), `file_reader`/`file_writer`, `float`,
//! `vector N`, `linear`. Connections take an optional `weight N`.

use std::collections::HashMap;

use crate::error::{CompileError, CompileResult};
use crate::graph::{BoundaryKind, ElementType, FilterSpec, PreWork, StreamGraph};
use crate::lexer::{Lexer, Token};

pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> CompileResult<Self> {
        let mut parser = Self { lexer: Lexer::new(source), current: None };
        parser.advance()?;
        Ok(parser)
    }

    /// Advance to the next token, returning the previous one
    fn advance(&mut self) -> CompileResult<Option<Token>> {
        let prev = self.current.take();
        self.current = match self.lexer.next() {
            Some(Ok(tok)) => Some(tok),
            Some(Err(())) => {
                return Err(CompileError::LexerError {
                    position: self.lexer.position(),
                    message: "unrecognized token".to_string(),
                })
            }
            None => None,
        };
        Ok(prev)
    }

    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    fn expect(&mut self, expected: Token) -> CompileResult<Token> {
        if self.check(&expected) {
            Ok(self.advance()?.ok_or_else(|| CompileError::parse_error("unexpected end"))?)
        } else {
            Err(CompileError::parse_error(format!(
                "expected {:?}, got {:?}",
                expected, self.current
            )))
        }
    }

    fn expect_ident(&mut self) -> CompileResult<String> {
        match self.expect(Token::Ident(String::new()))? {
            Token::Ident(name) => Ok(name),
            _ => unreachable!(),
        }
    }

    fn expect_number(&mut self) -> CompileResult<u64> {
        match self.expect(Token::Number(0))? {
            Token::Number(n) => Ok(n),
            _ => unreachable!(),
        }
    }

    fn expect_u32(&mut self) -> CompileResult<u32> {
        let n = self.expect_number()?;
        u32::try_from(n).map_err(|_| {
            CompileError::parse_error(format!("value {n} does not fit in a rate field"))
        })
    }

    /// Parse a complete graph description into a validated stream graph
    pub fn parse_graph(&mut self) -> CompileResult<StreamGraph> {
        let mut builder = StreamGraph::builder();
        let mut names = HashMap::new();

        while self.current.is_some() {
            if self.check(&Token::Filter) {
                let spec = self.parse_filter()?;
                let name = spec.name.clone();
                let id = builder.add_filter(spec)?;
                names.insert(name, id);
            } else {
                self.parse_connection(&mut builder, &names)?;
            }
            if self.check(&Token::Semicolon) {
                self.advance()?;
            }
        }

        builder.build()
    }

    /// Parse `filter <name> { <attributes> }`
    fn parse_filter(&mut self) -> CompileResult<FilterSpec> {
        self.expect(Token::Filter)?;
        let name = self.expect_ident()?;
        self.expect(Token::LBrace)?;

        let mut spec = FilterSpec::new(name, 0, 0, 0);
        let mut peek = None;
        while !self.check(&Token::RBrace) {
            let attr = self.expect_ident()?;
            match attr.as_str() {
                "peek" => peek = Some(self.expect_u32()?),
                "pop" => spec.pop = self.expect_u32()?,
                "push" => spec.push = self.expect_u32()?,
                "work" => spec.work = self.expect_number()?,
                "mult" => spec.steady_mult = self.expect_u32()?,
                "init" => spec.init_mult = self.expect_u32()?,
                "vector" => spec.element = ElementType::Vector(self.expect_u32()?),
                "float" => spec.element = ElementType::Float,
                "linear" => spec.linear = true,
                "file_reader" => spec.boundary = Some(BoundaryKind::FileReader),
                "file_writer" => spec.boundary = Some(BoundaryKind::FileWriter),
                "prework" => spec.prework = Some(self.parse_prework()?),
                other => {
                    return Err(CompileError::parse_error(format!(
                        "unknown filter attribute '{}' in '{}'",
                        other, spec.name
                    )))
                }
            }
        }
        self.expect(Token::RBrace)?;

        spec.peek = peek.unwrap_or(spec.pop);
        // a two-phase filter necessarily fires during init
        if spec.prework.is_some() && spec.init_mult == 0 {
            spec.init_mult = 1;
        }
        Ok(spec)
    }

    /// Parse `prework peek A pop B push C`
    fn parse_prework(&mut self) -> CompileResult<PreWork> {
        let mut pre = PreWork { peek: 0, pop: 0, push: 0 };
        let mut saw_peek = false;
        for _ in 0..3 {
            let field = self.expect_ident()?;
            match field.as_str() {
                "peek" => {
                    pre.peek = self.expect_u32()?;
                    saw_peek = true;
                }
                "pop" => pre.pop = self.expect_u32()?,
                "push" => pre.push = self.expect_u32()?,
                other => {
                    return Err(CompileError::parse_error(format!(
                        "unknown prework field '{other}'"
                    )))
                }
            }
        }
        if !saw_peek {
            pre.peek = pre.pop;
        }
        Ok(pre)
    }

    /// Parse `<src> -> <dst> [weight N]`
    fn parse_connection(
        &mut self,
        builder: &mut crate::graph::StreamGraphBuilder,
        names: &HashMap<String, crate::graph::FilterId>,
    ) -> CompileResult<()> {
        let src = self.expect_ident()?;
        self.expect(Token::Arrow)?;
        let dst = self.expect_ident()?;
        let mut weight = 1;
        if let Some(Token::Ident(attr)) = &self.current {
            if attr == "weight" {
                self.advance()?;
                weight = self.expect_u32()?;
            }
        }
        let src_id = *names.get(&src).ok_or_else(|| {
            CompileError::parse_error(format!("connection references unknown filter '{src}'"))
        })?;
        let dst_id = *names.get(&dst).ok_or_else(|| {
            CompileError::parse_error(format!("connection references unknown filter '{dst}'"))
        })?;
        builder.connect_weighted(src_id, dst_id, weight)
    }
}

/// Parse a graph description into a stream graph
pub fn parse_graph(source: &str) -> CompileResult<StreamGraph> {
    Parser::new(source)?.parse_graph()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipeline() {
        let g = parse_graph(
            "filter src { file_reader push 2 }\n\
             filter a   { pop 2 push 2 work 100 }\n\
             filter out { file_writer pop 2 }\n\
             src -> a; a -> out;",
        )
        .unwrap();
        assert_eq!(g.len(), 3);
        let a = g.find("a").unwrap();
        let spec = g.filter(a);
        assert_eq!(spec.pop, 2);
        assert_eq!(spec.peek, 2);
        assert_eq!(spec.work, 100);
        assert!(g.filter(g.find("src").unwrap()).is_boundary());
        assert_eq!(g.successors(a).len(), 1);
    }

    #[test]
    fn test_parse_weights_and_peek() {
        let g = parse_graph(
            "filter a { pop 1 push 3 work 10 }\n\
             filter b { peek 8 pop 1 push 0 work 10 }\n\
             filter c { pop 2 push 0 work 10 }\n\
             a -> b weight 1; a -> c weight 2;",
        )
        .unwrap();
        let a = g.find("a").unwrap();
        assert_eq!(g.successors(a), &[(g.find("b").unwrap(), 1), (g.find("c").unwrap(), 2)]);
        assert_eq!(g.filter(g.find("b").unwrap()).peek, 8);
    }

    #[test]
    fn test_parse_two_phase() {
        let g = parse_graph(
            "filter d { pop 1 push 1 work 10 mult 2 prework peek 3 pop 2 push 1 }",
        )
        .unwrap();
        let spec = g.filter(g.find("d").unwrap());
        assert_eq!(spec.prework, Some(PreWork { peek: 3, pop: 2, push: 1 }));
        assert_eq!(spec.steady_mult, 2);
        // prework implies at least one init firing
        assert_eq!(spec.init_mult, 1);
    }

    #[test]
    fn test_unknown_filter_in_connection() {
        let err = parse_graph("filter a { push 1 }\na -> ghost;").unwrap_err();
        assert!(matches!(err, CompileError::ParseError { .. }));
    }

    #[test]
    fn test_unknown_attribute() {
        let err = parse_graph("filter a { bogus 3 }").unwrap_err();
        assert!(matches!(err, CompileError::ParseError { .. }));
    }

    #[test]
    fn test_lexer_error_position() {
        let err = parse_graph("filter a { pop 1 } ?").unwrap_err();
        assert!(matches!(err, CompileError::LexerError { .. }));
    }
}
