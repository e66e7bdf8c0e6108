//! Lexer and recursive-descent parser for label queries.
//!
//! Precedence from loosest to tightest: `or`, `and`, `not`. Symbolic
//! spellings `|`, `&` and `!` are accepted alongside the keywords.

use crate::Query;
use crate::error::SyntaxError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    In,
    Word(String),
    End,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    /// Byte offset of the token in the source text.
    pos: usize,
}

/// Characters allowed in an unquoted label.
pub(crate) fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '=' | '*' | '+' | '@' | '-')
}

pub(crate) fn is_keyword(word: &str) -> bool {
    matches!(word, "and" | "or" | "not" | "in")
}

fn tokenize(src: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        let single = |kind| Token { kind, pos };
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(single(TokenKind::LParen));
            }
            ')' => {
                chars.next();
                tokens.push(single(TokenKind::RParen));
            }
            ',' => {
                chars.next();
                tokens.push(single(TokenKind::Comma));
            }
            '!' => {
                chars.next();
                tokens.push(single(TokenKind::Not));
            }
            '&' | '|' => {
                chars.next();
                // `&&` and `||` are accepted as aliases.
                if chars.peek().map(|&(_, n)| n) == Some(c) {
                    chars.next();
                }
                let kind = if c == '&' { TokenKind::And } else { TokenKind::Or };
                tokens.push(single(kind));
            }
            '\'' | '"' => {
                chars.next();
                // `\\` and a backslash before the quote character are
                // escapes; any other backslash is literal.
                let mut word = String::new();
                let mut closed = false;
                let mut escaped = false;
                for (_, n) in chars.by_ref() {
                    if escaped {
                        if n != c && n != '\\' {
                            word.push('\\');
                        }
                        word.push(n);
                        escaped = false;
                    } else if n == '\\' {
                        escaped = true;
                    } else if n == c {
                        closed = true;
                        break;
                    } else {
                        word.push(n);
                    }
                }
                if !closed {
                    return Err(SyntaxError::new(pos, "unterminated quoted label"));
                }
                tokens.push(single(TokenKind::Word(word)));
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&(_, n)) = chars.peek() {
                    if !is_word_char(n) {
                        break;
                    }
                    word.push(n);
                    chars.next();
                }
                let kind = match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    _ => TokenKind::Word(word),
                };
                tokens.push(single(kind));
            }
            other => {
                return Err(SyntaxError::new(pos, format!("unexpected character {other:?}")));
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::End,
        pos: src.len(),
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.cursor]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.cursor].clone();
        if token.kind != TokenKind::End {
            self.cursor += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, SyntaxError> {
        let token = self.peek();
        if token.kind == kind {
            Ok(self.advance())
        } else {
            Err(SyntaxError::new(token.pos, format!("expected {what}")))
        }
    }

    fn parse_or(&mut self) -> Result<Query, SyntaxError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek().kind == TokenKind::Or {
            self.advance();
            terms.push(self.parse_and()?);
        }
        Ok(collapse(terms, Query::Or))
    }

    fn parse_and(&mut self) -> Result<Query, SyntaxError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek().kind == TokenKind::And {
            self.advance();
            terms.push(self.parse_unary()?);
        }
        Ok(collapse(terms, Query::And))
    }

    fn parse_unary(&mut self) -> Result<Query, SyntaxError> {
        if self.peek().kind == TokenKind::Not {
            self.advance();
            return Ok(Query::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Query, SyntaxError> {
        let token = self.advance();
        match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Word(label) => {
                if self.peek().kind == TokenKind::In {
                    self.advance();
                    let values = self.parse_value_list()?;
                    Ok(Query::In { key: label, values })
                } else {
                    Ok(Query::Label(label))
                }
            }
            TokenKind::End => Err(SyntaxError::new(token.pos, "unexpected end of query")),
            _ => Err(SyntaxError::new(token.pos, "expected label or '('")),
        }
    }

    fn parse_value_list(&mut self) -> Result<Vec<String>, SyntaxError> {
        self.expect(TokenKind::LParen, "'(' after 'in'")?;
        let mut values = Vec::new();
        loop {
            let token = self.advance();
            match token.kind {
                TokenKind::Word(value) => values.push(value),
                _ => return Err(SyntaxError::new(token.pos, "expected value in set")),
            }
            let next = self.advance();
            match next.kind {
                TokenKind::Comma => continue,
                TokenKind::RParen => break,
                _ => return Err(SyntaxError::new(next.pos, "expected ',' or ')'")),
            }
        }
        Ok(values)
    }
}

fn collapse(mut terms: Vec<Query>, combine: fn(Vec<Query>) -> Query) -> Query {
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        combine(terms)
    }
}

/// Parse query text. Whitespace-only input yields [`Query::All`].
pub fn parse(src: &str) -> Result<Query, SyntaxError> {
    let tokens = tokenize(src)?;
    if tokens.len() == 1 {
        return Ok(Query::All);
    }

    let mut parser = Parser { tokens, cursor: 0 };
    let query = parser.parse_or()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::End {
        return Err(SyntaxError::new(trailing.pos, "unexpected trailing input"));
    }
    Ok(query)
}
