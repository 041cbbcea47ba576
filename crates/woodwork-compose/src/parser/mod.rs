//! Configuration parser built on `nom`.
//!
//! Transforms raw configuration text into [`Declaration`] records through
//! lexing and descent parsing. Nested blocks and lists are tracked on an
//! explicit stack rather than the call stack. Declaration names are
//! validated as they are read; nothing is returned unless the whole
//! document parses.

pub mod ast;
pub mod lexer;
pub mod validator;

use woodwork_common::error::{ForbiddenReason, Result, WoodworkError};

use self::ast::Declaration;
use self::lexer::{Spanned, Token};
use self::validator::NameValidator;
use crate::value::{ConfigMap, ConfigValue};

/// Cursor into a token stream for the descent parser.
struct TokenCursor<'a> {
    tokens: &'a [Spanned],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    const fn new(tokens: &'a [Spanned]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos).map(|s| &s.token);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Line of the next token, or of the last one at end of input.
    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |s| s.line)
    }

    fn error(&self, message: String) -> WoodworkError {
        WoodworkError::Parse {
            message,
            line: self.line(),
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String> {
        let line = self.line();
        match self.advance() {
            Some(Token::Identifier(s)) => Ok(s.clone()),
            other => Err(WoodworkError::Parse {
                message: format!("expected {what}, got {}", describe(other)),
                line,
            }),
        }
    }

    fn expect_token(&mut self, expected: &Token) -> Result<()> {
        let line = self.line();
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(WoodworkError::Parse {
                message: format!("expected {}, got {}", describe(Some(expected)), describe(other)),
                line,
            }),
        }
    }

    fn skip_optional_comma(&mut self) {
        if self.peek() == Some(&Token::Comma) {
            let _ = self.advance();
        }
    }

    const fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of input".into(),
        Some(Token::Identifier(s)) => format!("identifier '{s}'"),
        Some(Token::StringLiteral(s)) => format!("string \"{s}\""),
        Some(Token::Number(n)) => format!("number {n}"),
        Some(Token::Bool(b)) => format!("boolean {b}"),
        Some(Token::EnvVar(name)) => format!("environment reference ${name}"),
        Some(Token::BraceOpen) => "'{'".into(),
        Some(Token::BraceClose) => "'}'".into(),
        Some(Token::BracketOpen) => "'['".into(),
        Some(Token::BracketClose) => "']'".into(),
        Some(Token::Equals) => "'='".into(),
        Some(Token::Colon) => "':'".into(),
        Some(Token::Comma) => "','".into(),
    }
}

/// Parses configuration text into declarations in document order.
///
/// Environment and component references are left unresolved; see
/// [`crate::resolver`].
///
/// # Errors
///
/// Returns a parse error on malformed input and a forbidden-name error as
/// soon as a reserved or duplicate declaration name is read.
pub fn parse_declarations(input: &str) -> Result<Vec<Declaration>> {
    tracing::info!("parsing configuration");
    let tokens = lexer::tokenize(input)?;
    let mut cursor = TokenCursor::new(&tokens);
    let mut names = NameValidator::new();
    let mut declarations = Vec::new();

    while !cursor.at_end() {
        declarations.push(parse_declaration(&mut cursor, &mut names)?);
    }

    tracing::debug!(count = declarations.len(), "parsed declarations");
    Ok(declarations)
}

fn parse_declaration(cursor: &mut TokenCursor<'_>, names: &mut NameValidator) -> Result<Declaration> {
    let line = cursor.line();
    let variable = match cursor.advance() {
        Some(Token::Identifier(name)) => name.clone(),
        Some(Token::Bool(b)) => {
            return Err(validator::forbidden(&b.to_string(), ForbiddenReason::Reserved));
        }
        other => {
            return Err(WoodworkError::Parse {
                message: format!("expected declaration name, got {}", describe(other)),
                line,
            });
        }
    };
    names.check(&variable)?;

    cursor.expect_token(&Token::Equals)?;
    let component = cursor.expect_identifier("component kind")?;
    let component_type = cursor.expect_identifier("component type")?;
    let config = parse_block(cursor)?;

    Ok(Declaration {
        variable,
        component,
        component_type,
        config,
        line,
    })
}

/// A container whose closing token has not been read yet.
enum Open {
    Block {
        map: ConfigMap,
        /// Key read for the value being parsed, with its line.
        key: Option<(String, usize)>,
    },
    List(Vec<ConfigValue>),
}

impl Open {
    const fn block() -> Self {
        Self::Block {
            map: ConfigMap::new(),
            key: None,
        }
    }

    const fn close_token(&self) -> Token {
        match self {
            Self::Block { .. } => Token::BraceClose,
            Self::List(_) => Token::BracketClose,
        }
    }

    const fn context(&self) -> &'static str {
        match self {
            Self::Block { .. } => "block",
            Self::List(_) => "list",
        }
    }

    fn attach(&mut self, value: ConfigValue, cursor: &TokenCursor<'_>) -> Result<()> {
        match self {
            Self::List(items) => {
                items.push(value);
                Ok(())
            }
            Self::Block { map, key } => {
                let Some((key, line)) = key.take() else {
                    return Err(cursor.error("value without a key".into()));
                };
                if map.contains_key(&key) {
                    return Err(WoodworkError::Parse {
                        message: format!("duplicate key \"{key}\" in block"),
                        line,
                    });
                }
                let _ = map.insert(key, value);
                Ok(())
            }
        }
    }

    fn into_value(self) -> ConfigValue {
        match self {
            Self::Block { map, .. } => ConfigValue::Mapping(map),
            Self::List(items) => ConfigValue::List(items),
        }
    }
}

fn parse_block(cursor: &mut TokenCursor<'_>) -> Result<ConfigMap> {
    cursor.expect_token(&Token::BraceOpen)?;
    match parse_nested(cursor, vec![Open::block()])? {
        ConfigValue::Mapping(map) => Ok(map),
        other => Err(cursor.error(format!("expected block, got {}", other.type_name()))),
    }
}

/// Parses values inside the containers of `open` until the outermost one
/// closes. Nesting lives on the heap, so depth is bounded only by memory.
fn parse_nested(cursor: &mut TokenCursor<'_>, mut open: Vec<Open>) -> Result<ConfigValue> {
    let mut value = None;
    loop {
        if let Some(done) = value.take() {
            let Some(top) = open.last_mut() else {
                return Ok(done);
            };
            top.attach(done, cursor)?;
            cursor.skip_optional_comma();
        }

        if let Some(top) = open.last_mut() {
            if cursor.peek() == Some(&top.close_token()) {
                let _ = cursor.advance();
                value = open.pop().map(Open::into_value);
                continue;
            }
            if cursor.at_end() {
                return Err(cursor.error(format!("unexpected end of input inside {}", top.context())));
            }
            if let Open::Block { key, .. } = top {
                *key = Some(parse_key(cursor)?);
            }
        }

        match cursor.peek() {
            Some(Token::BraceOpen) => {
                let _ = cursor.advance();
                open.push(Open::block());
            }
            Some(Token::BracketOpen) => {
                let _ = cursor.advance();
                open.push(Open::List(Vec::new()));
            }
            _ => value = Some(parse_scalar(cursor)?),
        }
    }
}

fn parse_key(cursor: &mut TokenCursor<'_>) -> Result<(String, usize)> {
    let line = cursor.line();
    let key = match cursor.advance() {
        Some(Token::Identifier(s) | Token::StringLiteral(s)) => s.clone(),
        other => {
            return Err(WoodworkError::Parse {
                message: format!("expected key, got {}", describe(other)),
                line,
            });
        }
    };
    cursor.expect_token(&Token::Colon)?;
    Ok((key, line))
}

fn parse_scalar(cursor: &mut TokenCursor<'_>) -> Result<ConfigValue> {
    let line = cursor.line();
    match cursor.advance() {
        Some(Token::StringLiteral(s)) => Ok(ConfigValue::String(s.clone())),
        Some(Token::Bool(b)) => Ok(ConfigValue::Bool(*b)),
        Some(Token::Number(n)) => Ok(ConfigValue::Number(*n)),
        Some(Token::EnvVar(name)) => Ok(ConfigValue::EnvRef(name.clone())),
        Some(Token::Identifier(name)) => Ok(ConfigValue::ComponentRef(name.clone())),
        other => Err(WoodworkError::Parse {
            message: format!("expected value, got {}", describe(other)),
            line,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Number;

    fn single(input: &str) -> Declaration {
        let mut decls = parse_declarations(input).expect("should parse");
        assert_eq!(decls.len(), 1);
        decls.remove(0)
    }

    fn is_forbidden(err: &WoodworkError, expected: ForbiddenReason) -> bool {
        matches!(err, WoodworkError::ForbiddenVariableName { reason, .. } if *reason == expected)
    }

    #[test]
    fn parse_empty_input() {
        assert!(parse_declarations("").expect("should parse").is_empty());
    }

    #[test]
    fn parse_minimal_declaration() {
        let decl = single(r#"name1 = keyword1 keyword2 { key1: "value1" }"#);
        assert_eq!(decl.variable, "name1");
        assert_eq!(decl.component, "keyword1");
        assert_eq!(decl.component_type, "keyword2");
        assert_eq!(decl.config.get("key1"), Some(&ConfigValue::String("value1".into())));
        assert_eq!(decl.line, 1);
    }

    #[test]
    fn parse_empty_block() {
        let decl = single("out = output console {}");
        assert!(decl.config.is_empty());
    }

    #[test]
    fn parse_all_value_kinds() {
        let decl = single(
            r#"agent = llm openai {
    name: "assistant"
    stream: TRUE
    temperature: 0.7
    retries: 3
    api_key: $OPENAI_API_KEY
    memory: store
    tools: [search, "literal", 4]
    limits: { tokens: 1024 }
}"#,
        );
        let c = &decl.config;
        assert_eq!(c.get("name"), Some(&ConfigValue::String("assistant".into())));
        assert_eq!(c.get("stream"), Some(&ConfigValue::Bool(true)));
        assert_eq!(c.get("temperature"), Some(&ConfigValue::Number(Number::Float(0.7))));
        assert_eq!(c.get("retries"), Some(&ConfigValue::Number(Number::Integer(3))));
        assert_eq!(c.get("api_key"), Some(&ConfigValue::EnvRef("OPENAI_API_KEY".into())));
        assert_eq!(c.get("memory"), Some(&ConfigValue::ComponentRef("store".into())));
        assert_eq!(
            c.get("tools"),
            Some(&ConfigValue::List(vec![
                ConfigValue::ComponentRef("search".into()),
                ConfigValue::String("literal".into()),
                ConfigValue::Number(Number::Integer(4)),
            ]))
        );
        let limits = c.get("limits").and_then(ConfigValue::as_mapping).expect("mapping");
        assert_eq!(limits.get("tokens"), Some(&ConfigValue::Number(Number::Integer(1024))));
    }

    #[test]
    fn keys_keep_declaration_order_at_every_depth() {
        let decl = single(
            r"x = a b {
    zebra: 1
    apple: { mango: 1, kiwi: { z: 1, a: 2 }, banana: 3 }
    middle: 2
}",
        );
        assert_eq!(decl.config.keys().collect::<Vec<_>>(), vec!["zebra", "apple", "middle"]);
        let apple = decl.config.get("apple").and_then(ConfigValue::as_mapping).expect("map");
        assert_eq!(apple.keys().collect::<Vec<_>>(), vec!["mango", "kiwi", "banana"]);
        let kiwi = apple.get("kiwi").and_then(ConfigValue::as_mapping).expect("map");
        assert_eq!(kiwi.keys().collect::<Vec<_>>(), vec!["z", "a"]);
    }

    #[test]
    fn deep_nesting_has_no_limit() {
        let depth = 64;
        let mut input = String::from("deep = a b { ");
        for _ in 0..depth {
            input.push_str("k: { ");
        }
        input.push_str("leaf: true ");
        for _ in 0..=depth {
            input.push_str("} ");
        }
        let decl = single(&input);
        let mut current = &decl.config;
        for _ in 0..depth {
            current = current.get("k").and_then(ConfigValue::as_mapping).expect("nested");
        }
        assert_eq!(current.get("leaf"), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn very_deep_lists_parse_without_native_recursion() {
        let depth = 20_000;
        let input = format!("a = output t {{ k: {}{} }}", "[".repeat(depth), "]".repeat(depth));
        let decl = single(&input);
        let mut current = decl.config.get("k").expect("k");
        for _ in 1..depth {
            current = current.as_list().and_then(<[ConfigValue]>::first).expect("nested list");
        }
        assert_eq!(current.as_list().map(<[ConfigValue]>::len), Some(0));
    }

    #[test]
    fn unclosed_nested_list_reports_context() {
        let err = parse_declarations("a = x y { k: [[1, 2]").unwrap_err();
        assert!(err.to_string().contains("inside list"), "got: {err}");
    }

    #[test]
    fn quoted_keys_and_commas_accepted() {
        let decl = single(r#"x = a b { "content-type": "json", trailing: 1, }"#);
        assert_eq!(decl.config.keys().collect::<Vec<_>>(), vec!["content-type", "trailing"]);
    }

    #[test]
    fn reserved_names_fail_fast() {
        for name in ["true", "TRUE", "False"] {
            let input = format!("{name} = llm openai {{ }}");
            let err = parse_declarations(&input).unwrap_err();
            assert!(is_forbidden(&err, ForbiddenReason::Reserved), "{name}: {err}");
        }
    }

    #[test]
    fn duplicate_name_fails_before_block_is_parsed() {
        // The second block is malformed; the duplicate name must win.
        let input = "a = x y { }\na = x y { broken";
        let err = parse_declarations(input).unwrap_err();
        assert!(is_forbidden(&err, ForbiddenReason::Duplicate), "got: {err}");
    }

    #[test]
    fn duplicate_key_is_parse_error() {
        let err = parse_declarations("a = x y { k: 1, k: 2 }").unwrap_err();
        assert!(matches!(err, WoodworkError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains("duplicate key"), "got: {err}");
    }

    #[test]
    fn missing_brace_is_parse_error() {
        let err = parse_declarations("a = x y {\n k: 1\n").unwrap_err();
        assert!(matches!(err, WoodworkError::Parse { line: 2, .. }), "got: {err}");
    }

    #[test]
    fn missing_type_is_parse_error() {
        let err = parse_declarations("a = x { }").unwrap_err();
        assert!(err.to_string().contains("component type"), "got: {err}");
    }

    #[test]
    fn missing_colon_is_parse_error() {
        let err = parse_declarations(r#"a = x y { k "v" }"#).unwrap_err();
        assert!(matches!(err, WoodworkError::Parse { .. }), "got: {err}");
    }

    #[test]
    fn multiple_declarations_keep_document_order() {
        let decls = parse_declarations(
            r#"// components
store = memory local { }
llm = llm openai { memory: store }
out = output console { }"#,
        )
        .expect("should parse");
        let names: Vec<_> = decls.iter().map(|d| d.variable.as_str()).collect();
        assert_eq!(names, vec!["store", "llm", "out"]);
        assert_eq!(decls[1].line, 3);
    }
}
