//! Parser for Valve's text KeyValues format, as printed by SteamCMD.

use std::iter::Peekable;
use std::str::Chars;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("KeyValues syntax error on line {line}: {message}")]
pub struct KeyValuesError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Object(KeyValues),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            Value::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&KeyValues> {
        match self {
            Value::Object(object) => Some(object),
            Value::Text(_) => None,
        }
    }
}

/// An ordered list of pairs. Keys are compared case-insensitively and may
/// repeat; lookups return the first match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValues(pub Vec<(String, Value)>);

impl KeyValues {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn object(&self, key: &str) -> Option<&KeyValues> {
        self.get(key).and_then(Value::as_object)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_text)
    }

    /// Follows nested objects, e.g. `["depots", "branches", "public"]`.
    pub fn path(&self, keys: &[&str]) -> Option<&Value> {
        let (last, init) = keys.split_last()?;
        let mut current = self;
        for key in init {
            current = current.object(key)?;
        }
        current.get(last)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Text(String),
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> KeyValuesError {
        KeyValuesError {
            line: self.line,
            message: message.into(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut ahead = self.chars.clone();
                    ahead.next();
                    if ahead.peek() != Some(&'/') {
                        return;
                    }
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                // Platform conditionals such as `[$WIN32]` carry no data.
                Some('[') => {
                    while let Some(c) = self.bump() {
                        if c == ']' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, KeyValuesError> {
        self.skip_trivia();
        let Some(&c) = self.chars.peek() else {
            return Ok(None);
        };

        match c {
            '{' => {
                self.bump();
                Ok(Some(Token::Open))
            }
            '}' => {
                self.bump();
                Ok(Some(Token::Close))
            }
            '"' => {
                self.bump();
                let mut text = String::new();
                loop {
                    match self.bump() {
                        Some('"') => return Ok(Some(Token::Text(text))),
                        Some('\\') => match self.bump() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err(self.error("unterminated escape")),
                        },
                        Some(other) => text.push(other),
                        None => return Err(self.error("unterminated string")),
                    }
                }
            }
            _ => {
                let mut text = String::new();
                while let Some(&c) = self.chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | '"') {
                        break;
                    }
                    text.push(c);
                    self.bump();
                }
                Ok(Some(Token::Text(text)))
            }
        }
    }
}

fn parse_object(lexer: &mut Lexer, nested: bool) -> Result<KeyValues, KeyValuesError> {
    let mut pairs = Vec::new();
    loop {
        let key = match lexer.next_token()? {
            Some(Token::Text(key)) => key,
            Some(Token::Close) if nested => return Ok(KeyValues(pairs)),
            Some(Token::Close) => return Err(lexer.error("unexpected '}'")),
            Some(Token::Open) => return Err(lexer.error("expected a key, found '{'")),
            None if nested => return Err(lexer.error("unexpected end of input, missing '}'")),
            None => return Ok(KeyValues(pairs)),
        };

        let value = match lexer.next_token()? {
            Some(Token::Text(text)) => Value::Text(text),
            Some(Token::Open) => Value::Object(parse_object(lexer, true)?),
            Some(Token::Close) | None => {
                return Err(lexer.error(format!("key '{key}' has no value")));
            }
        };

        pairs.push((key, value));
    }
}

/// Parses a document into its top-level pairs.
pub fn parse(input: &str) -> Result<KeyValues, KeyValuesError> {
    parse_object(&mut Lexer::new(input), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_INFO: &str = r#"
"1966720"
{
	"common"
	{
		"name"		"Lethal Company"
		"type"		"Game"
	}
	// trailing comment
	"depots"
	{
		"1966721"
		{
			"manifests"
			{
				"public"
				{
					"gid"		"7525563530173177311"
				}
			}
		}
		"branches"
		{
			"public"
			{
				"buildid"		"14003218"
				"timeupdated"		"1712345678"
			}
		}
	}
}
"#;

    #[test]
    fn test_parse_app_info() {
        let doc = parse(APP_INFO).unwrap();
        let app = doc.object("1966720").unwrap();

        assert_eq!(
            app.path(&["common", "name"]).and_then(Value::as_text),
            Some("Lethal Company")
        );
        assert_eq!(
            app.path(&["depots", "branches", "PUBLIC", "buildid"])
                .and_then(Value::as_text),
            Some("14003218")
        );
        assert_eq!(
            app.path(&["depots", "1966721", "manifests", "public", "gid"])
                .and_then(Value::as_text),
            Some("7525563530173177311")
        );
    }

    #[test]
    fn test_unquoted_escapes_and_conditionals() {
        let doc = parse("key value [$WIN32]\n\"quoted\" \"a \\\"b\\\"\\n\"").unwrap();

        assert_eq!(doc.text("key"), Some("value"));
        assert_eq!(doc.text("quoted"), Some("a \"b\"\n"));
    }

    #[test]
    fn test_errors_report_line() {
        let err = parse("\"a\"\n{\n\"b\" \"c\"\n").unwrap_err();
        assert_eq!(err.line, 4);

        let err = parse("\"a\"").unwrap_err();
        assert!(err.message.contains("no value"));

        assert!(parse("}").is_err());
    }
}
