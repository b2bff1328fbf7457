//! Tokenizer for the expression language

use crate::expr::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    /// Operators and punctuation, e.g. `==`, `(`, `?.`
    Op(&'static str),
    /// Closure argument `#`
    Pointer,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

// Longest operators first so `**` wins over `*`
const OPERATORS: &[&str] = &[
    "...", "??", "?.", "==", "!=", "<=", ">=", "&&", "||", "**", "=~", "!~", "..", "+", "-",
    "*", "/", "%", "<", ">", "!", "(", ")", "[", "]", "{", "}", ",", ":", ".", "?", "|",
];

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;

        if c.is_ascii_digit() {
            let (token, next) = lex_number(&chars, i)?;
            tokens.push(Spanned { token, pos: start });
            i = next;
            continue;
        }

        if c == '"' || c == '\'' || c == '`' {
            let (text, next) = lex_string(&chars, i)?;
            tokens.push(Spanned {
                token: Token::Str(text),
                pos: start,
            });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let mut end = i;
            while end < chars.len()
                && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '$')
            {
                end += 1;
            }
            let word: String = chars[i..end].iter().collect();
            tokens.push(Spanned {
                token: Token::Ident(word),
                pos: start,
            });
            i = end;
            continue;
        }

        if c == '#' {
            tokens.push(Spanned {
                token: Token::Pointer,
                pos: start,
            });
            i += 1;
            continue;
        }

        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                // `.5` style floats are not supported, `.` is member access
                tokens.push(Spanned {
                    token: Token::Op(op),
                    pos: start,
                });
                i += op.chars().count();
            }
            None => {
                return Err(ExprError::Syntax(format!(
                    "unexpected character '{}' at position {}",
                    c, start
                )))
            }
        }
    }

    tokens.push(Spanned {
        token: Token::Eof,
        pos: chars.len(),
    });
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize), ExprError> {
    let mut end = start;
    let mut is_float = false;

    if chars[start] == '0' && start + 1 < chars.len() && (chars[start + 1] == 'x' || chars[start + 1] == 'X') {
        end = start + 2;
        while end < chars.len() && chars[end].is_ascii_hexdigit() {
            end += 1;
        }
        let digits: String = chars[start + 2..end].iter().collect();
        let value = i64::from_str_radix(&digits, 16)
            .map_err(|e| ExprError::Syntax(format!("invalid hex literal: {}", e)))?;
        return Ok((Token::Int(value), end));
    }

    while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '_') {
        end += 1;
    }
    // `1..3` is a range, not a float
    if end + 1 < chars.len() && chars[end] == '.' && chars[end + 1].is_ascii_digit() {
        is_float = true;
        end += 1;
        while end < chars.len() && chars[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < chars.len() && (chars[end] == 'e' || chars[end] == 'E') {
        let mut exp = end + 1;
        if exp < chars.len() && (chars[exp] == '+' || chars[exp] == '-') {
            exp += 1;
        }
        if exp < chars.len() && chars[exp].is_ascii_digit() {
            is_float = true;
            end = exp;
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
        }
    }

    let text: String = chars[start..end].iter().filter(|c| **c != '_').collect();
    let token = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| ExprError::Syntax(format!("invalid float literal {}", text)))?,
        )
    } else {
        match text.parse::<i64>() {
            Ok(v) => Token::Int(v),
            Err(_) => Token::Float(
                text.parse()
                    .map_err(|_| ExprError::Syntax(format!("invalid number literal {}", text)))?,
            ),
        }
    };
    Ok((token, end))
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i];
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\\' && quote != '`' {
            i += 1;
            let escaped = chars
                .get(i)
                .ok_or_else(|| ExprError::Syntax("unterminated string literal".to_string()))?;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '"' => out.push('"'),
                '\'' => out.push('\''),
                'u' => {
                    let hex: String = chars.iter().skip(i + 1).take(4).collect();
                    let code = u32::from_str_radix(&hex, 16)
                        .map_err(|_| ExprError::Syntax(format!("invalid unicode escape \\u{}", hex)))?;
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                    i += 4;
                }
                other => {
                    out.push('\\');
                    out.push(*other);
                }
            }
            i += 1;
            continue;
        }
        out.push(c);
        i += 1;
    }

    Err(ExprError::Syntax("unterminated string literal".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_numbers_and_ranges() {
        assert_eq!(
            kinds("1..3"),
            vec![Token::Int(1), Token::Op(".."), Token::Int(3), Token::Eof]
        );
        assert_eq!(kinds("2.5"), vec![Token::Float(2.5), Token::Eof]);
        assert_eq!(kinds("1_000"), vec![Token::Int(1000), Token::Eof]);
    }

    #[test]
    fn test_strings_and_operators() {
        assert_eq!(
            kinds(r#"a.b == 'x\'y' ?? "z""#),
            vec![
                Token::Ident("a".to_string()),
                Token::Op("."),
                Token::Ident("b".to_string()),
                Token::Op("=="),
                Token::Str("x'y".to_string()),
                Token::Op("??"),
                Token::Str("z".to_string()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }
}
