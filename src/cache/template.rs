//! Key templates.
//!
//! A template is literal text with three kinds of placeholder:
//!
//! - `${args[N]}` renders the textual form of argument `N`
//! - `${sign(args)}` renders the [`ArgumentSignature`] of all arguments
//! - `${it}` renders the current element when iterating a collection argument
//!
//! Placeholders are matched literally: no whitespace, nesting or expressions.
//! A `$` that is not followed by `{` is ordinary text.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::error::TemplateError;
use super::invocation::Invocation;
use super::signature::ArgumentSignature;

const OPEN: &str = "${";
const CLOSE: char = '}';

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Arg(usize),
    Signature,
    Item,
}

/// A parsed, immutable key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(source: impl Into<String>) -> Result<Self, TemplateError> {
        let source = source.into();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source.as_str();
        let mut offset = 0;

        while let Some(pos) = rest.find(OPEN) {
            literal.push_str(&rest[..pos]);
            let start = offset + pos;
            let body = &rest[pos + OPEN.len()..];
            let Some(end) = body.find(CLOSE) else {
                return Err(TemplateError::Unterminated {
                    template: source.clone(),
                    offset: start,
                });
            };

            let segment = parse_expr(&source, start, &body[..end])?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(segment);

            let consumed = pos + OPEN.len() + end + CLOSE.len_utf8();
            rest = &rest[consumed..];
            offset += consumed;
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { source, segments })
    }

    /// The template text as declared.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the template has no placeholders at all.
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// True when the template references the iteration variable.
    pub fn uses_item(&self) -> bool {
        self.segments.contains(&Segment::Item)
    }

    /// Render a single key. Fails if the template needs `${it}`.
    pub fn render(&self, invocation: &Invocation) -> Result<String, TemplateError> {
        let mut signature = None;
        self.render_with(invocation, None, &mut signature)
    }

    /// Render one key per element of the collection argument at `source`.
    ///
    /// An empty collection yields no keys.
    pub fn render_each(
        &self,
        invocation: &Invocation,
        source: usize,
    ) -> Result<Vec<String>, TemplateError> {
        let Value::Array(items) = invocation.arg_at(source)? else {
            return Err(TemplateError::NotIterable { index: source });
        };

        let mut signature = None;
        items
            .iter()
            .map(|item| self.render_with(invocation, Some(item), &mut signature))
            .collect()
    }

    fn render_with(
        &self,
        invocation: &Invocation,
        item: Option<&Value>,
        signature: &mut Option<String>,
    ) -> Result<String, TemplateError> {
        let mut key = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Arg(index) => key.push_str(&textual(invocation.arg_at(*index)?)),
                Segment::Signature => key.push_str(
                    signature.get_or_insert_with(|| ArgumentSignature::compute(invocation.args())),
                ),
                Segment::Item => {
                    let Some(item) = item else {
                        return Err(TemplateError::UnboundIteration {
                            template: self.source.clone(),
                        });
                    };
                    key.push_str(&textual(item));
                }
            }
        }
        Ok(key)
    }
}

fn parse_expr(template: &str, offset: usize, expr: &str) -> Result<Segment, TemplateError> {
    if expr.is_empty() {
        return Err(TemplateError::EmptyPlaceholder {
            template: template.to_string(),
            offset,
        });
    }
    if expr == "sign(args)" {
        return Ok(Segment::Signature);
    }
    if expr == "it" {
        return Ok(Segment::Item);
    }

    let index = expr
        .strip_prefix("args[")
        .and_then(|rest| rest.strip_suffix(']'))
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse::<usize>().ok());

    index.map(Segment::Arg).ok_or_else(|| TemplateError::UnknownPlaceholder {
        template: template.to_string(),
        expr: expr.to_string(),
    })
}

/// Textual form of an argument as it appears inside a key.
///
/// Strings render unquoted; every other value renders as compact JSON, which
/// is stable because arguments are captured canonically.
pub(crate) fn textual(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

impl FromStr for KeyTemplate {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct Filter {
        name: String,
        active: bool,
    }

    fn invocation(args: Vec<Value>) -> Invocation {
        Invocation::with_values("test::method", args)
    }

    #[test]
    fn renders_positional_arguments() {
        let template = KeyTemplate::parse("department:id:${args[0]}").expect("valid template");
        let key = template
            .render(&invocation(vec![json!("D1")]))
            .expect("renders");
        assert_eq!(key, "department:id:D1");
    }

    #[test]
    fn renders_multiple_placeholders_and_literal_dollars() {
        let template =
            KeyTemplate::parse("$price:${args[1]}/${args[0]}$").expect("valid template");
        let key = template
            .render(&invocation(vec![json!(7), json!(true)]))
            .expect("renders");
        assert_eq!(key, "$price:true/7$");
    }

    #[test]
    fn literal_templates_are_detected() {
        let template = KeyTemplate::parse("department:any").expect("valid template");
        assert!(template.is_literal());
        assert_eq!(
            template.render(&invocation(vec![])).expect("renders"),
            "department:any"
        );
        assert!(!KeyTemplate::parse("x:${it}").expect("valid").is_literal());
    }

    #[test]
    fn equal_structured_arguments_render_identically() {
        let template = KeyTemplate::parse("q:${args[0]}").expect("valid template");
        let first = Invocation::new("m")
            .arg(&Filter {
                name: "ops".into(),
                active: true,
            })
            .expect("serializable");
        let second = Invocation::with_values("m", vec![json!({"active": true, "name": "ops"})]);

        let a = template.render(&first).expect("renders");
        let b = template.render(&second).expect("renders");
        assert_eq!(a, b);
        assert_eq!(a, r#"q:{"active":true,"name":"ops"}"#);
    }

    #[test]
    fn renders_signature_placeholder() {
        let template = KeyTemplate::parse("list:${sign(args)}").expect("valid template");
        let args = vec![json!({"page": 1}), json!("name")];
        let key = template.render(&invocation(args.clone())).expect("renders");
        assert_eq!(key, format!("list:{}", ArgumentSignature::compute(&args)));
    }

    #[test]
    fn render_each_expands_collection() {
        let template = KeyTemplate::parse("ns:${it}").expect("valid template");
        let keys = template
            .render_each(&invocation(vec![json!(["a", "b", "c"])]), 0)
            .expect("renders");
        assert_eq!(keys, vec!["ns:a", "ns:b", "ns:c"]);
    }

    #[test]
    fn render_each_over_empty_collection_yields_nothing() {
        let template = KeyTemplate::parse("ns:${it}").expect("valid template");
        let keys = template
            .render_each(&invocation(vec![json!([])]), 0)
            .expect("renders");
        assert!(keys.is_empty());
    }

    #[test]
    fn render_each_rejects_scalars() {
        let template = KeyTemplate::parse("ns:${it}").expect("valid template");
        let err = template
            .render_each(&invocation(vec![json!("a")]), 0)
            .expect_err("scalar is not iterable");
        assert_eq!(err, TemplateError::NotIterable { index: 0 });
    }

    #[test]
    fn item_without_iteration_is_an_error() {
        let template = KeyTemplate::parse("ns:${it}").expect("valid template");
        let err = template
            .render(&invocation(vec![json!(["a"])]))
            .expect_err("no iteration source");
        assert!(matches!(err, TemplateError::UnboundIteration { .. }));
    }

    #[test]
    fn out_of_range_argument_is_an_error() {
        let template = KeyTemplate::parse("k:${args[1]}").expect("valid template");
        let err = template
            .render(&invocation(vec![json!("a")]))
            .expect_err("index 1 missing");
        assert_eq!(err, TemplateError::ArgumentOutOfRange { index: 1, len: 1 });
    }

    #[test]
    fn malformed_placeholders_fail_to_parse() {
        assert!(matches!(
            KeyTemplate::parse("k:${args[0]"),
            Err(TemplateError::Unterminated { offset: 2, .. })
        ));
        assert!(matches!(
            KeyTemplate::parse("k:${}"),
            Err(TemplateError::EmptyPlaceholder { .. })
        ));
        for bad in [
            "k:${ args[0] }",
            "k:${args[-1]}",
            "k:${args[+1]}",
            "k:${args[]}",
            "k:${args[0].id}",
            "k:${sign(args[0])}",
        ] {
            assert!(
                matches!(
                    KeyTemplate::parse(bad),
                    Err(TemplateError::UnknownPlaceholder { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn null_and_numbers_have_stable_text() {
        let template = KeyTemplate::parse("${args[0]}|${args[1]}|${args[2]}").expect("valid");
        let key = template
            .render(&invocation(vec![json!(null), json!(1.5), json!([1, "x"])]))
            .expect("renders");
        assert_eq!(key, r#"null|1.5|[1,"x"]"#);
    }
}
