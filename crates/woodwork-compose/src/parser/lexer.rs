//! Tokenization of configuration text using `nom`.
//!
//! Produces a stream of [`Spanned`] [`Token`]s from raw input for the grammar
//! parser to consume. Whitespace, `//` comments and `#` comments are
//! discarded between tokens.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace1, not_line_ending},
    combinator::{opt, recognize, value},
    multi::many0,
    sequence::{delimited, preceded},
};
use woodwork_common::error::{Result, WoodworkError};

use crate::value::Number;

/// A token in the configuration language.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// An identifier (declaration name, kind, key, or component reference).
    Identifier(String),
    /// A quoted string literal.
    StringLiteral(String),
    /// A numeric literal.
    Number(Number),
    /// A boolean literal, matched case-insensitively.
    Bool(bool),
    /// A `$NAME` or `${NAME}` environment reference.
    EnvVar(String),
    /// `{` opening brace.
    BraceOpen,
    /// `}` closing brace.
    BraceClose,
    /// `[` opening bracket.
    BracketOpen,
    /// `]` closing bracket.
    BracketClose,
    /// `=` binding a declaration name.
    Equals,
    /// `:` separating a key from its value.
    Colon,
    /// `,` separator.
    Comma,
}

/// A token together with the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Source line of the token's first character.
    pub line: usize,
}

/// Skippable items: whitespace or line comments.
fn skip_trivia(input: &str) -> IResult<&str, ()> {
    let slash_comment = value((), preceded(tag("//"), not_line_ending));
    let hash_comment = value((), preceded(char('#'), not_line_ending));
    let ws = value((), multispace1);
    let (input, _) = many0(alt((ws, slash_comment, hash_comment))).parse(input)?;
    Ok((input, ()))
}

fn unterminated(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Char))
}

/// Parses a string literal delimited by `quote`, with basic escape support.
fn quoted(input: &str, quote: char) -> IResult<&str, Token> {
    let (input, _) = char(quote)(input)?;
    let mut result = String::new();
    let mut chars = input.char_indices();
    loop {
        match chars.next() {
            Some((idx, c)) if c == quote => {
                let remaining = &input[idx + c.len_utf8()..];
                return Ok((remaining, Token::StringLiteral(result)));
            }
            Some((_, '\\')) => match chars.next() {
                Some((_, 'n')) => result.push('\n'),
                Some((_, 't')) => result.push('\t'),
                Some((_, '\\')) => result.push('\\'),
                Some((_, '"')) => result.push('"'),
                Some((_, '\'')) => result.push('\''),
                Some((_, c)) => {
                    result.push('\\');
                    result.push(c);
                }
                None => return Err(unterminated(input)),
            },
            Some((_, c)) => result.push(c),
            None => return Err(unterminated(input)),
        }
    }
}

fn string_literal(input: &str) -> IResult<&str, Token> {
    if input.starts_with('\'') {
        quoted(input, '\'')
    } else {
        quoted(input, '"')
    }
}

/// Parses an integer or decimal literal with an optional leading minus.
fn number_literal(input: &str) -> IResult<&str, Token> {
    let (rest, text) = recognize((
        opt(char('-')),
        digit1,
        opt((char('.'), digit1)),
    ))
    .parse(input)?;
    let number = if text.contains('.') {
        text.parse::<f64>().map(Number::Float).ok()
    } else {
        text.parse::<i64>().map(Number::Integer).ok()
    };
    number.map_or_else(
        || {
            Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Digit,
            )))
        },
        |n| Ok((rest, Token::Number(n))),
    )
}

const fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

const fn is_env_name(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parses an identifier or a boolean literal.
fn identifier_or_bool(input: &str) -> IResult<&str, Token> {
    let (input, word) = recognize((take_while1(is_ident_start), take_while(is_ident_continue)))
        .parse(input)?;
    let token = if word.eq_ignore_ascii_case("true") {
        Token::Bool(true)
    } else if word.eq_ignore_ascii_case("false") {
        Token::Bool(false)
    } else {
        Token::Identifier(word.to_string())
    };
    Ok((input, token))
}

/// Parses `$NAME` or `${NAME}`.
fn env_reference(input: &str) -> IResult<&str, Token> {
    let (input, _) = char('$')(input)?;
    let (input, name) = alt((
        delimited(char('{'), take_while1(is_env_name), char('}')),
        take_while1(is_env_name),
    ))
    .parse(input)?;
    Ok((input, Token::EnvVar(name.to_string())))
}

/// Parses a punctuation token.
fn symbol(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::BraceOpen, char('{')),
        value(Token::BraceClose, char('}')),
        value(Token::BracketOpen, char('[')),
        value(Token::BracketClose, char(']')),
        value(Token::Equals, char('=')),
        value(Token::Colon, char(':')),
        value(Token::Comma, char(',')),
    ))
    .parse(input)
}

/// Parses a single token (after trivia has been skipped).
fn single_token(input: &str) -> IResult<&str, Token> {
    alt((
        string_literal,
        env_reference,
        symbol,
        number_literal,
        identifier_or_bool,
    ))
    .parse(input)
}

/// Line counter that only scans the text consumed since its last call.
struct LineTracker<'a> {
    source: &'a str,
    offset: usize,
    line: usize,
}

impl<'a> LineTracker<'a> {
    const fn new(source: &'a str) -> Self {
        Self {
            source,
            offset: 0,
            line: 1,
        }
    }

    /// Line of the first character of `remaining`, which must be a suffix
    /// of the source no shorter than at the previous call.
    fn at(&mut self, remaining: &str) -> usize {
        let offset = self.source.len() - remaining.len();
        if offset > self.offset {
            self.line += self.source[self.offset..offset].matches('\n').count();
            self.offset = offset;
        }
        self.line
    }
}

/// Tokenizes configuration text into a vector of spanned tokens.
///
/// # Errors
///
/// Returns a parse error if the input contains characters that cannot be
/// tokenized or an unterminated string literal.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let mut tokens = Vec::new();
    let mut remaining = input;
    let mut lines = LineTracker::new(input);

    loop {
        let (rest, ()) = skip_trivia(remaining).map_err(|e| WoodworkError::Parse {
            message: format!("lexer error skipping whitespace: {e}"),
            line: lines.at(remaining),
        })?;
        remaining = rest;

        if remaining.is_empty() {
            break;
        }

        let line = lines.at(remaining);
        let (rest, token) = single_token(remaining).map_err(|_| WoodworkError::Parse {
            message: format!(
                "unexpected input at: \"{}\"",
                remaining.chars().take(20).collect::<String>()
            ),
            line,
        })?;
        tokens.push(Spanned { token, line });
        remaining = rest;
    }

    tracing::debug!(count = tokens.len(), "tokenized configuration");
    Ok(tokens)
}
