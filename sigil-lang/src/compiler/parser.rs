use crate::utils::metadata::Span;
use chumsky::Parser;

mod error;
mod lexer;
mod token;
pub use error::ParseError;
pub use lexer::lexer;
pub use token::{Op, Token};

#[cfg(test)]
mod test;

/// Largest line number a chunk can record.
pub const MAX_LINES: usize = u16::MAX as usize;

#[derive(Clone, Debug, PartialEq)]
pub struct TokenInfo {
    pub token: Token,
    pub line: u16,
    /// 1-based, counted in characters.
    pub column: usize,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TooManyLines {
    pub span: Span,
}

/// Pull-based access to the token sequence of one source text.
pub struct TokenStream {
    tokens: std::vec::IntoIter<(Token, Span)>,
    // char offset of the first character of every line, spans count chars too
    line_starts: Vec<usize>,
    src_len: usize,
}

impl TokenStream {
    pub fn new(src: &str) -> Result<Self, Vec<ParseError<char>>> {
        let (tokens, errs) = lexer().parse_recovery(src);
        match tokens {
            Some(tokens) if errs.is_empty() => Ok(Self {
                tokens: tokens.into_iter(),
                line_starts: std::iter::once(0)
                    .chain(
                        src.chars()
                            .enumerate()
                            .filter(|(_, c)| *c == '\n')
                            .map(|(i, _)| i + 1),
                    )
                    .collect(),
                src_len: src.chars().count(),
            }),
            _ => Err(errs.into_iter().map(ParseError).collect()),
        }
    }

    fn line_of(&self, offset: usize) -> usize {
        self.line_starts.partition_point(|start| *start <= offset)
    }

    /// Yields `EndOfInput` forever once the tokens are exhausted.
    pub fn next_token(&mut self) -> Result<TokenInfo, TooManyLines> {
        let (token, span) = self
            .tokens
            .next()
            .unwrap_or((Token::EndOfInput, self.src_len..self.src_len));
        let line = self.line_of(span.start);
        if line > MAX_LINES {
            return Err(TooManyLines { span });
        }
        let column = span.start - self.line_starts[line - 1] + 1;
        Ok(TokenInfo {
            token,
            line: line as u16,
            column,
            span,
        })
    }
}
