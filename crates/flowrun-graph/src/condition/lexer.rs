//! Tokenizer for edge-condition expressions

/// A lexical token of the condition grammar
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Variable reference
    Ident(String),

    /// Decimal number literal
    Number(f64),

    /// Single- or double-quoted string literal
    Str(String),

    True,
    False,
    Null,

    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Error raised on malformed input; the evaluator maps it to `false`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("unexpected character `{0}` at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),

    #[error("malformed number `{0}`")]
    MalformedNumber(String),
}

/// Tokenize a condition string.
///
/// Identifiers may contain ASCII alphanumerics, `_`, `.` and `-` (dotted
/// paths and kebab-case variable names both occur in definitions).
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        match c {
            '=' | '!' | '>' | '<' => {
                let next = chars.get(pos + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', _) => (Token::Gt, 1),
                    ('<', _) => (Token::Lt, 1),
                    _ => return Err(LexError::UnexpectedChar(c, pos)),
                };
                tokens.push(token);
                pos += width;
            }

            '\'' | '"' => {
                let quote = c;
                let start = pos;
                pos += 1;
                let mut literal = String::new();
                loop {
                    match chars.get(pos) {
                        None => return Err(LexError::UnterminatedString(start)),
                        Some(&ch) if ch == quote => {
                            pos += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            pos += 1;
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }

            c if c.is_ascii_digit() || c == '-' => {
                let start = pos;
                pos += 1;
                while pos < chars.len()
                    && (chars[pos].is_ascii_digit() || chars[pos] == '.')
                {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| LexError::MalformedNumber(text))?;
                tokens.push(Token::Number(value));
            }

            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                pos += 1;
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric()
                        || chars[pos] == '_'
                        || chars[pos] == '.'
                        || chars[pos] == '-')
                {
                    pos += 1;
                }
                let word: String = chars[start..pos].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }

            other => return Err(LexError::UnexpectedChar(other, pos)),
        }
    }

    Ok(tokens)
}
