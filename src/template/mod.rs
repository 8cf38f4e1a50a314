//! Text template compilation.
//!
//! A template is literal text interleaved with `{{ expression }}` blocks. An
//! expression is a call into the fixed callback surface (`header("x-id")`,
//! `substring(body(), 0, 8)`, ...), a string or integer literal, or a lookup
//! into the parsed body context. Call results can be drilled into with `.`
//! selectors (`context().user.name`).
//!
//! Compilation validates callback names and arities, so a template that
//! compiles at configuration load cannot hit an unknown callback at render
//! time. Compiled templates are immutable and shared across streams.

mod instance;

pub use instance::{LazyBody, RenderError, TransformerInstance};

/// How bare lookup paths inside expressions address the body context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ElementNotation {
    /// `user.name` — keys separated by dots, array elements by index.
    #[default]
    Dot,
    /// `/user/name` — JSON Pointer form.
    Pointer,
}

/// Errors raised while compiling a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("expression is missing its closing '}}}}'")]
    UnclosedExpression,
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("function '{name}' does not take {count} arguments")]
    BadArity { name: String, count: usize },
    #[error("unexpected character '{0}' in expression")]
    UnexpectedChar(char),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unexpected trailing characters in expression")]
    TrailingCharacters,
    #[error("invalid integer literal '{0}'")]
    InvalidInteger(String),
}

/// A compiled template, ready to render against a
/// [`TransformerInstance`]. Holds no references to any message.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub(crate) segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Literal(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Str(String),
    Int(i64),
    Call { name: String, args: Vec<Expr> },
    Root(RootPath),
    Select { base: Box<Expr>, path: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RootPath {
    Key(String),
    Pointer(String),
}

/// Arities accepted for each callback. Unknown names are compile errors.
fn callback_arities(name: &str) -> Option<&'static [usize]> {
    Some(match name {
        "header" | "request_header" | "extraction" | "env" | "clusterMetadata"
        | "base64_encode" | "base64_decode" => &[1],
        "context" | "body" => &[0],
        "substring" => &[2, 3],
        "replace_with_random" => &[2],
        _ => return None,
    })
}

impl Template {
    /// Compile `source` with the given element notation.
    pub fn parse(source: &str, notation: ElementNotation) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let inner = &rest[open + 2..];
            let close = find_expression_end(inner).ok_or(TemplateError::UnclosedExpression)?;
            let expr = ExprParser::new(&inner[..close], notation).parse()?;
            segments.push(Segment::Expr(expr));
            rest = &inner[close + 2..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }
}

/// Find the `}}` closing the expression, skipping over string literals.
fn find_expression_end(src: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

struct ExprParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    notation: ElementNotation,
}

impl<'a> ExprParser<'a> {
    fn new(src: &'a str, notation: ElementNotation) -> Self {
        Self {
            bytes: src.as_bytes(),
            pos: 0,
            notation,
        }
    }

    fn parse(mut self) -> Result<Expr, TemplateError> {
        let expr = self.parse_expr()?;
        self.skip_whitespace();
        if self.pos < self.bytes.len() {
            return Err(TemplateError::TrailingCharacters);
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, TemplateError> {
        let primary = self.parse_primary()?;

        // Postfix selectors: `.key` segments drilling into the value.
        let mut path = Vec::new();
        while self.peek() == Some(b'.') {
            self.pos += 1;
            path.push(self.parse_segment()?);
        }

        if path.is_empty() {
            Ok(primary)
        } else if let Expr::Root(RootPath::Key(first)) = primary {
            let mut segments = vec![first];
            segments.extend(path);
            Ok(join_root(segments))
        } else {
            Ok(Expr::Select {
                base: Box::new(primary),
                path,
            })
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, TemplateError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(TemplateError::UnexpectedEnd),
            Some(b'"') => self.parse_string(),
            Some(b'-') => self.parse_integer(),
            Some(c) if c.is_ascii_digit() => self.parse_integer(),
            Some(b'/') if self.notation == ElementNotation::Pointer => self.parse_pointer(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.parse_ident_or_call(),
            Some(c) => Err(TemplateError::UnexpectedChar(c as char)),
        }
    }

    fn parse_ident_or_call(&mut self) -> Result<Expr, TemplateError> {
        let name = self.parse_segment()?;
        if self.peek() == Some(b'(') {
            self.pos += 1;
            let args = self.parse_args()?;
            let arities =
                callback_arities(&name).ok_or_else(|| TemplateError::UnknownFunction(name.clone()))?;
            if !arities.contains(&args.len()) {
                return Err(TemplateError::BadArity {
                    name,
                    count: args.len(),
                });
            }
            Ok(Expr::Call { name, args })
        } else {
            Ok(Expr::Root(RootPath::Key(name)))
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, TemplateError> {
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b')') {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b')') => {
                    self.pos += 1;
                    return Ok(args);
                }
                Some(c) => return Err(TemplateError::UnexpectedChar(c as char)),
                None => return Err(TemplateError::UnexpectedEnd),
            }
        }
    }

    fn parse_string(&mut self) -> Result<Expr, TemplateError> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.next() {
                None => return Err(TemplateError::UnterminatedString),
                Some(b'"') => return Ok(Expr::Str(value)),
                Some(b'\\') => match self.next() {
                    Some(b'"') => value.push('"'),
                    Some(b'\\') => value.push('\\'),
                    Some(b'n') => value.push('\n'),
                    Some(b't') => value.push('\t'),
                    Some(c) => value.push(c as char),
                    None => return Err(TemplateError::UnterminatedString),
                },
                Some(c) => value.push(c as char),
            }
        }
    }

    fn parse_integer(&mut self) -> Result<Expr, TemplateError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or_default();
        text.parse()
            .map(Expr::Int)
            .map_err(|_| TemplateError::InvalidInteger(text.to_string()))
    }

    fn parse_pointer(&mut self) -> Result<Expr, TemplateError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !is_delimiter(c)) {
            self.pos += 1;
        }
        let pointer = std::str::from_utf8(&self.bytes[start..self.pos])
            .unwrap_or_default()
            .to_string();
        Ok(Expr::Root(RootPath::Pointer(pointer)))
    }

    fn parse_segment(&mut self) -> Result<String, TemplateError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !is_delimiter(c) && c != b'.') {
            self.pos += 1;
        }
        if self.pos == start {
            return match self.peek() {
                Some(c) => Err(TemplateError::UnexpectedChar(c as char)),
                None => Err(TemplateError::UnexpectedEnd),
            };
        }
        Ok(std::str::from_utf8(&self.bytes[start..self.pos])
            .unwrap_or_default()
            .to_string())
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}

fn is_delimiter(c: u8) -> bool {
    c.is_ascii_whitespace() || matches!(c, b'(' | b')' | b',' | b'"')
}

fn join_root(segments: Vec<String>) -> Expr {
    let mut iter = segments.into_iter();
    let base = Expr::Root(RootPath::Key(iter.next().unwrap_or_default()));
    let path: Vec<String> = iter.collect();
    if path.is_empty() {
        base
    } else {
        Expr::Select {
            base: Box::new(base),
            path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> Result<Template, TemplateError> {
        Template::parse(source, ElementNotation::Dot)
    }

    #[test]
    fn test_parse_literal_only() {
        let template = parse("plain text").unwrap();
        assert_eq!(template.segments.len(), 1);
        assert_eq!(
            template.segments[0],
            Segment::Literal("plain text".to_string())
        );
    }

    #[test]
    fn test_parse_call() {
        let template = parse(r#"{{ header("x-id") }}"#).unwrap();
        assert_eq!(template.segments.len(), 1);
        assert_eq!(
            template.segments[0],
            Segment::Expr(Expr::Call {
                name: "header".to_string(),
                args: vec![Expr::Str("x-id".to_string())],
            })
        );
    }

    #[test]
    fn test_parse_mixed_segments() {
        let template = parse(r#"a {{ body() }} b {{ env("HOME") }} c"#).unwrap();
        assert_eq!(template.segments.len(), 5);
    }

    #[test]
    fn test_parse_call_with_selector() {
        let template = parse("{{ context().user.name }}").unwrap();
        let Segment::Expr(Expr::Select { base, path }) = &template.segments[0] else {
            panic!("expected selector expression");
        };
        assert!(matches!(&**base, Expr::Call { name, .. } if name == "context"));
        assert_eq!(path, &vec!["user".to_string(), "name".to_string()]);
    }

    #[test]
    fn test_parse_bare_path() {
        let template = parse("{{ user.name }}").unwrap();
        let Segment::Expr(Expr::Select { base, path }) = &template.segments[0] else {
            panic!("expected selector expression");
        };
        assert!(matches!(&**base, Expr::Root(RootPath::Key(k)) if k == "user"));
        assert_eq!(path, &vec!["name".to_string()]);
    }

    #[test]
    fn test_parse_pointer_path() {
        let template = Template::parse("{{ /user/name }}", ElementNotation::Pointer).unwrap();
        assert_eq!(
            template.segments[0],
            Segment::Expr(Expr::Root(RootPath::Pointer("/user/name".to_string())))
        );
    }

    #[test]
    fn test_parse_nested_call() {
        let template = parse(r#"{{ base64_encode(header("x-id")) }}"#).unwrap();
        let Segment::Expr(Expr::Call { name, args }) = &template.segments[0] else {
            panic!("expected call");
        };
        assert_eq!(name, "base64_encode");
        assert!(matches!(&args[0], Expr::Call { name, .. } if name == "header"));
    }

    #[test]
    fn test_parse_substring_arities() {
        assert!(parse(r#"{{ substring("abc", 1) }}"#).is_ok());
        assert!(parse(r#"{{ substring("abc", 1, 2) }}"#).is_ok());
        assert_eq!(
            parse(r#"{{ substring("abc") }}"#),
            Err(TemplateError::BadArity {
                name: "substring".to_string(),
                count: 1,
            })
        );
    }

    #[test]
    fn test_unknown_function_rejected() {
        assert_eq!(
            parse("{{ frobnicate() }}"),
            Err(TemplateError::UnknownFunction("frobnicate".to_string()))
        );
    }

    #[test]
    fn test_wrong_arity_rejected() {
        assert_eq!(
            parse(r#"{{ header("a", "b") }}"#),
            Err(TemplateError::BadArity {
                name: "header".to_string(),
                count: 2,
            })
        );
    }

    #[test]
    fn test_unclosed_expression() {
        assert_eq!(
            parse("{{ header(\"x\")"),
            Err(TemplateError::UnclosedExpression)
        );
    }

    #[test]
    fn test_string_escapes() {
        let template = parse(r#"{{ header("a\"b") }}"#).unwrap();
        let Segment::Expr(Expr::Call { args, .. }) = &template.segments[0] else {
            panic!("expected call");
        };
        assert_eq!(args[0], Expr::Str("a\"b".to_string()));
    }

    #[test]
    fn test_closing_braces_inside_string() {
        let template = parse(r#"{{ header("}}") }}"#).unwrap();
        let Segment::Expr(Expr::Call { args, .. }) = &template.segments[0] else {
            panic!("expected call");
        };
        assert_eq!(args[0], Expr::Str("}}".to_string()));
    }

    #[test]
    fn test_negative_integer_literal() {
        let template = parse(r#"{{ substring("abc", -1) }}"#).unwrap();
        let Segment::Expr(Expr::Call { args, .. }) = &template.segments[0] else {
            panic!("expected call");
        };
        assert_eq!(args[1], Expr::Int(-1));
    }
}
