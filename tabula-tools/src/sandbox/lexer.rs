//! Tokenizer for the procedure dialect.
//!
//! `logos` does the scanning; [`tokenize`] then tracks lines and bracket
//! depth. Newlines inside brackets are ignored, `;` separates statements, `#`
//! starts a comment and a trailing `\` joins the next line.

use super::runtime::SandboxError;
use logos::{Lexer, Logos};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Tilde,
    Newline,
    Eof,
}

/// A token and the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

/// Raw scanner output, before line and bracket bookkeeping.
#[derive(Logos, Debug, PartialEq)]
enum Lexeme {
    #[regex(r"[ \t\r\f]+", logos::skip)]
    #[regex(r"#[^\n]*", logos::skip)]
    #[regex(r"\\[ \t\r]*\n", logos::skip)]
    Ignored,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r"[0-9][0-9_]*", int)]
    Int(i64),

    #[regex(r"[0-9][0-9_]*\.[0-9]+([eE][+-]?[0-9]+)?", float)]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9]+", float)]
    Float(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, string)]
    #[regex(r#"'([^'\\\n]|\\.)*'"#, string)]
    Str(String),

    #[regex(r#""([^"\\\n]|\\.)*"#)]
    #[regex(r#"'([^'\\\n]|\\.)*"#)]
    Unterminated,

    #[token("\n")]
    #[token(";")]
    Break,

    #[token("**")]
    Power,
    #[token("//")]
    FloorDiv,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(":")]
    Colon,
    #[token("=")]
    Assign,
    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("~")]
    Tilde,
}

fn int(lex: &mut Lexer<Lexeme>) -> Option<i64> {
    lex.slice().replace('_', "").parse().ok()
}

fn float(lex: &mut Lexer<Lexeme>) -> Option<f64> {
    lex.slice().replace('_', "").parse().ok()
}

/// Body of a quoted literal with `\n`, `\t` and `\<c>` escapes resolved.
fn string(lex: &mut Lexer<Lexeme>) -> String {
    let quoted = lex.slice();
    let body = &quoted[1..quoted.len() - 1];
    let mut text = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            text.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => text.push('\n'),
            Some('t') => text.push('\t'),
            Some(other) => text.push(other),
            None => {}
        }
    }
    text
}

fn syntax(line: usize, message: impl Into<String>) -> SandboxError {
    SandboxError::Syntax {
        line,
        message: message.into(),
    }
}

fn push_newline(tokens: &mut Vec<Spanned>, line: usize) {
    if matches!(tokens.last(), Some(t) if t.token != Token::Newline) {
        tokens.push(Spanned {
            token: Token::Newline,
            line,
        });
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, SandboxError> {
    let mut lexer = Lexeme::lexer(source);
    let mut tokens: Vec<Spanned> = Vec::new();
    let mut line = 1;
    let mut scanned = 0;
    let mut depth: usize = 0;
    let mut ident_end: Option<usize> = None;

    while let Some(lexeme) = lexer.next() {
        let span = lexer.span();
        line += source[scanned..span.start].matches('\n').count();
        scanned = span.start;

        let lexeme = match lexeme {
            Ok(lexeme) => lexeme,
            Err(()) => {
                let text = lexer.slice();
                return Err(match text.chars().next() {
                    Some(c) if c.is_ascii_digit() => {
                        syntax(line, format!("invalid number '{}'", text))
                    }
                    Some('\\') => syntax(line, "unexpected '\\'"),
                    _ => syntax(line, format!("unexpected character '{}'", text)),
                });
            }
        };

        let prefixed = ident_end == Some(span.start);
        ident_end = None;
        let token = match lexeme {
            Lexeme::Ignored => continue,
            Lexeme::Break => {
                if depth == 0 {
                    push_newline(&mut tokens, line);
                }
                continue;
            }
            Lexeme::Str(_) | Lexeme::Unterminated if prefixed => {
                let prefix = tokens
                    .last()
                    .map(|t| match &t.token {
                        Token::Ident(name) => name.clone(),
                        _ => String::new(),
                    })
                    .unwrap_or_default();
                return Err(syntax(
                    line,
                    format!("string prefix '{}' is not supported", prefix),
                ));
            }
            Lexeme::Unterminated => return Err(syntax(line, "unterminated string literal")),
            Lexeme::Power => return Err(syntax(line, "'**' is not supported")),
            Lexeme::FloorDiv => return Err(syntax(line, "'//' is not supported")),
            Lexeme::Ident(name) => {
                ident_end = Some(span.end);
                Token::Ident(name)
            }
            Lexeme::Int(i) => Token::Int(i),
            Lexeme::Float(f) => Token::Float(f),
            Lexeme::Str(s) => Token::Str(s),
            Lexeme::LParen => Token::LParen,
            Lexeme::RParen => Token::RParen,
            Lexeme::LBracket => Token::LBracket,
            Lexeme::RBracket => Token::RBracket,
            Lexeme::LBrace => Token::LBrace,
            Lexeme::RBrace => Token::RBrace,
            Lexeme::Comma => Token::Comma,
            Lexeme::Dot => Token::Dot,
            Lexeme::Colon => Token::Colon,
            Lexeme::Assign => Token::Assign,
            Lexeme::Eq => Token::Eq,
            Lexeme::Ne => Token::Ne,
            Lexeme::Lt => Token::Lt,
            Lexeme::Le => Token::Le,
            Lexeme::Gt => Token::Gt,
            Lexeme::Ge => Token::Ge,
            Lexeme::Plus => Token::Plus,
            Lexeme::Minus => Token::Minus,
            Lexeme::Star => Token::Star,
            Lexeme::Slash => Token::Slash,
            Lexeme::Percent => Token::Percent,
            Lexeme::Amp => Token::Amp,
            Lexeme::Pipe => Token::Pipe,
            Lexeme::Tilde => Token::Tilde,
        };

        match token {
            Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
            Token::RParen | Token::RBracket | Token::RBrace => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| syntax(line, "unbalanced closing bracket"))?;
            }
            _ => {}
        }
        tokens.push(Spanned { token, line });
    }

    line += source[scanned..].matches('\n').count();
    if depth > 0 {
        return Err(syntax(line, "unclosed bracket"));
    }
    push_newline(&mut tokens, line);
    tokens.push(Spanned {
        token: Token::Eof,
        line,
    });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_assignment_and_index() {
        assert_eq!(
            kinds("result = df['amount'] >= 1_000"),
            vec![
                Token::Ident("result".into()),
                Token::Assign,
                Token::Ident("df".into()),
                Token::LBracket,
                Token::Str("amount".into()),
                Token::RBracket,
                Token::Ge,
                Token::Int(1000),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("2.5 1e3 7"),
            vec![
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Int(7),
                Token::Newline,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_joined() {
        let tokens = tokenize("x = f(\n  1,\n  2\n)\n\n# note\ny = 3; z = 4").unwrap();
        let newlines = tokens.iter().filter(|t| t.token == Token::Newline).count();
        assert_eq!(newlines, 3);
        let y = tokens
            .iter()
            .find(|t| t.token == Token::Ident("y".into()))
            .unwrap();
        assert_eq!(y.line, 7);
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b" 'c\n'"#)[..2],
            [Token::Str("a\"b".into()), Token::Str("c\n".into())]
        );
    }

    #[test]
    fn test_continuation_and_comments_are_skipped() {
        let tokens = tokenize("x = 1 + \\\n    2  # trailing\ny = 'a#b'").unwrap();
        let newlines = tokens.iter().filter(|t| t.token == Token::Newline).count();
        assert_eq!(newlines, 2);
        assert!(tokens.iter().any(|t| t.token == Token::Str("a#b".into()) && t.line == 3));
        assert_eq!(tokens.last().map(|t| t.line), Some(3));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            tokenize("x = 'open"),
            Err(SandboxError::Syntax { line: 1, .. })
        ));
        assert!(tokenize("x = (1").is_err());
        assert!(tokenize("x = 1)").is_err());
        assert!(tokenize("x = 2 ** 3").is_err());
        assert!(tokenize("x = f'{y}'").is_err());
        assert!(tokenize("x = $").is_err());
        assert!(tokenize("x = 7 // 2").is_err());
        assert!(tokenize("x = 99999999999999999999").is_err());
    }
}
