//! Tokenizer for the condition language.

use crate::core::error::{ExpressionError, ExpressionResult};

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `AND` / `&&`
    And,
    /// `OR` / `||`
    Or,
    /// `NOT` / `!`
    Not,
    /// `==` / `===`
    Eq,
    /// `!=` / `!==`
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Le,
    /// `>=`
    Ge,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// Integer literal, optional leading `-`.
    Int(i64),
    /// Float literal, optional leading `-`.
    Float(f64),
    /// Single- or double-quoted string literal.
    Str(String),
    /// `true` / `false`, case-insensitive.
    Bool(bool),
    /// `${...}` reference body.
    VarRef(String),
    /// Bare identifier (treated as a variable reference).
    Ident(String),
}

impl Token {
    /// Short description used in parse error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::And => "'AND'".into(),
            Self::Or => "'OR'".into(),
            Self::Not => "'NOT'".into(),
            Self::Eq => "'=='".into(),
            Self::Ne => "'!='".into(),
            Self::Lt => "'<'".into(),
            Self::Gt => "'>'".into(),
            Self::Le => "'<='".into(),
            Self::Ge => "'>='".into(),
            Self::LParen => "'('".into(),
            Self::RParen => "')'".into(),
            Self::Int(n) => format!("int {n}"),
            Self::Float(n) => format!("float {n}"),
            Self::Str(s) => format!("string {s:?}"),
            Self::Bool(b) => format!("bool {b}"),
            Self::VarRef(path) => format!("${{{path}}}"),
            Self::Ident(name) => format!("identifier '{name}'"),
        }
    }
}

/// A token with its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Byte offset where the token starts.
    pub position: usize,
}

/// Tokenize expression source text.
pub fn tokenize(source: &str) -> ExpressionResult<Vec<Spanned>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'(' => {
                tokens.push(Spanned { token: Token::LParen, position: start });
                i += 1;
            }
            b')' => {
                tokens.push(Spanned { token: Token::RParen, position: start });
                i += 1;
            }
            b'=' => {
                // ==, === — a lone '=' is not an operator
                if bytes.get(i + 1) == Some(&b'=') {
                    i += if bytes.get(i + 2) == Some(&b'=') { 3 } else { 2 };
                    tokens.push(Spanned { token: Token::Eq, position: start });
                } else {
                    return Err(ExpressionError::parse(start, "'=='", "'='"));
                }
            }
            b'!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += if bytes.get(i + 2) == Some(&b'=') { 3 } else { 2 };
                    tokens.push(Spanned { token: Token::Ne, position: start });
                } else {
                    tokens.push(Spanned { token: Token::Not, position: start });
                    i += 1;
                }
            }
            b'<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Le, position: start });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Lt, position: start });
                    i += 1;
                }
            }
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Spanned { token: Token::Ge, position: start });
                    i += 2;
                } else {
                    tokens.push(Spanned { token: Token::Gt, position: start });
                    i += 1;
                }
            }
            b'&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Spanned { token: Token::And, position: start });
                    i += 2;
                } else {
                    return Err(ExpressionError::parse(start, "'&&'", "'&'"));
                }
            }
            b'|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Spanned { token: Token::Or, position: start });
                    i += 2;
                } else {
                    return Err(ExpressionError::parse(start, "'||'", "'|'"));
                }
            }
            b'$' => {
                if bytes.get(i + 1) != Some(&b'{') {
                    return Err(ExpressionError::parse(start, "'${'", "'$'"));
                }
                let body_start = i + 2;
                let Some(rel_end) = source[body_start..].find('}') else {
                    return Err(ExpressionError::parse(start, "'}'", "end of input"));
                };
                let path = source[body_start..body_start + rel_end].to_owned();
                tokens.push(Spanned { token: Token::VarRef(path), position: start });
                i = body_start + rel_end + 1;
            }
            b'"' | b'\'' => {
                let (literal, next) = lex_string(source, i)?;
                tokens.push(Spanned { token: Token::Str(literal), position: start });
                i = next;
            }
            b'-' | b'0'..=b'9' => {
                if c == b'-' && !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                    return Err(ExpressionError::parse(start, "digit after '-'", "'-'"));
                }
                let (token, next) = lex_number(source, i)?;
                tokens.push(Spanned { token, position: start });
                i = next;
            }
            _ if c.is_ascii_alphabetic() || c == b'_' => {
                let (token, next) = lex_word(source, i);
                tokens.push(Spanned { token, position: start });
                i = next;
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(ExpressionError::parse(start, "expression", format!("'{ch}'")));
            }
        }
    }

    Ok(tokens)
}

fn lex_string(source: &str, start: usize) -> ExpressionResult<(String, usize)> {
    let bytes = source.as_bytes();
    let quote = bytes[start];
    let mut literal = String::new();
    let mut i = start + 1;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let escaped = bytes.get(i + 1).copied().ok_or_else(|| {
                    ExpressionError::parse(i, "escape character", "end of input")
                })?;
                literal.push(match escaped {
                    b'n' => '\n',
                    b't' => '\t',
                    b'r' => '\r',
                    other => other as char,
                });
                i += 2;
            }
            c if c == quote => return Ok((literal, i + 1)),
            _ => {
                let ch = source[i..].chars().next().unwrap_or('?');
                literal.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    Err(ExpressionError::parse(start, "closing quote", "end of input"))
}

fn lex_number(source: &str, start: usize) -> ExpressionResult<(Token, usize)> {
    let bytes = source.as_bytes();
    let mut i = start;
    if bytes[i] == b'-' {
        i += 1;
    }
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    let mut is_float = false;
    if i < bytes.len() && bytes[i] == b'.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }

    let text = &source[start..i];
    let token = if is_float {
        Token::Float(text.parse().map_err(|_| {
            ExpressionError::parse(start, "float literal", text.to_owned())
        })?)
    } else {
        Token::Int(text.parse().map_err(|_| {
            ExpressionError::parse(start, "int literal", text.to_owned())
        })?)
    };
    Ok((token, i))
}

fn lex_word(source: &str, start: usize) -> (Token, usize) {
    let bytes = source.as_bytes();
    let mut i = start;
    // Bare identifiers may be dotted paths (`login.status`).
    while i < bytes.len()
        && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
    {
        i += 1;
    }
    let word = &source[start..i];
    let token = match word.to_ascii_lowercase().as_str() {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "true" => Token::Bool(true),
        "false" => Token::Bool(false),
        _ => Token::Ident(word.to_owned()),
    };
    (token, i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn operators_and_parens() {
        assert_eq!(
            kinds("( ) == != < > <= >="),
            vec![
                Token::LParen,
                Token::RParen,
                Token::Eq,
                Token::Ne,
                Token::Lt,
                Token::Gt,
                Token::Le,
                Token::Ge,
            ]
        );
    }

    #[test]
    fn triple_equals_synonyms() {
        assert_eq!(kinds("=== !=="), vec![Token::Eq, Token::Ne]);
    }

    #[test]
    fn keywords_case_insensitive() {
        assert_eq!(
            kinds("AND and And OR or NOT not TRUE False"),
            vec![
                Token::And,
                Token::And,
                Token::And,
                Token::Or,
                Token::Or,
                Token::Not,
                Token::Not,
                Token::Bool(true),
                Token::Bool(false),
            ]
        );
    }

    #[test]
    fn symbol_synonyms() {
        assert_eq!(kinds("&& || !"), vec![Token::And, Token::Or, Token::Not]);
    }

    #[test]
    fn numbers() {
        assert_eq!(
            kinds("42 -7 3.25 -0.5"),
            vec![
                Token::Int(42),
                Token::Int(-7),
                Token::Float(3.25),
                Token::Float(-0.5),
            ]
        );
    }

    #[test]
    fn strings_both_quotes_with_escapes() {
        assert_eq!(
            kinds(r#""hello" 'wo\'rld' "a\nb""#),
            vec![
                Token::Str("hello".into()),
                Token::Str("wo'rld".into()),
                Token::Str("a\nb".into()),
            ]
        );
    }

    #[test]
    fn var_refs() {
        assert_eq!(
            kinds("${a} ${login.body.items[0].name}"),
            vec![
                Token::VarRef("a".into()),
                Token::VarRef("login.body.items[0].name".into()),
            ]
        );
    }

    #[test]
    fn dotted_bare_identifier() {
        assert_eq!(
            kinds("login.status"),
            vec![Token::Ident("login.status".into())]
        );
    }

    #[test]
    fn unterminated_reference_is_parse_error() {
        let err = tokenize("${abc").unwrap_err();
        assert!(matches!(err, ExpressionError::Parse { .. }));
    }

    #[test]
    fn lone_equals_is_parse_error() {
        assert!(tokenize("a = b").is_err());
    }

    #[test]
    fn positions_are_byte_offsets() {
        let tokens = tokenize("${a} == 10").unwrap();
        assert_eq!(tokens[0].position, 0);
        assert_eq!(tokens[1].position, 5);
        assert_eq!(tokens[2].position, 8);
    }
}
