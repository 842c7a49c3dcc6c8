//! Attribute values and references.
//!
//! Attribute values are either literals or expressions over other resources'
//! outputs. A whole-string `${resource.output}` is a [`Reference`]; a string
//! with references embedded in text is a template. `$${` escapes a literal
//! `${`.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Declared attributes of a resource, keyed by attribute name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Attributes with every reference replaced by a concrete value.
pub type ResolvedAttributes = BTreeMap<String, Value>;

/// A reference to a computed output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical identifier of the referenced resource.
    pub resource: String,
    /// Name of the output on that resource.
    pub output: String,
}

/// A fragment of a string template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// Literal text.
    Text(String),
    /// An embedded reference.
    Reference(Reference),
}

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// A plain JSON value with no references.
    Literal(Value),
    /// A whole-value reference to another resource's output.
    Reference(Reference),
    /// A string with embedded references.
    Template(Vec<TemplatePart>),
    /// A list containing at least one non-literal element.
    List(Vec<AttributeValue>),
    /// A map containing at least one non-literal value.
    Map(BTreeMap<String, AttributeValue>),
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }

    /// Parses the inside of `${...}`.
    fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        let Some((resource, output)) = expr.split_once('.') else {
            return Err(format!("reference '{expr}' must have the form resource.output"));
        };

        if resource.is_empty() || !resource.chars().all(is_id_char) {
            return Err(format!("invalid resource name '{resource}' in reference '{expr}'"));
        }

        if output.is_empty()
            || !output
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(format!("invalid output name '{output}' in reference '{expr}'"));
        }

        Ok(Self::new(resource, output))
    }
}

/// Characters allowed in logical resource identifiers.
#[must_use]
pub const fn is_id_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'
}

impl AttributeValue {
    /// Builds a literal value.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Builds a reference value.
    #[must_use]
    pub fn reference(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Reference(Reference::new(resource, output))
    }

    /// Parses a declared JSON value, recognising references inside strings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed expression.
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => parse_string(s),
            Value::Array(items) => {
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(Self::is_literal) {
                    let items = parsed.into_iter().filter_map(Self::into_literal).collect();
                    Ok(Self::Literal(Value::Array(items)))
                } else {
                    Ok(Self::List(parsed))
                }
            }
            Value::Object(map) => {
                let mut parsed = BTreeMap::new();
                for (key, item) in map {
                    parsed.insert(key.clone(), Self::parse(item)?);
                }
                if parsed.values().all(Self::is_literal) {
                    let map = parsed
                        .into_iter()
                        .filter_map(|(key, item)| item.into_literal().map(|v| (key, v)))
                        .collect();
                    Ok(Self::Literal(Value::Object(map)))
                } else {
                    Ok(Self::Map(parsed))
                }
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// Unwraps a literal, with escapes already applied.
    fn into_literal(self) -> Option<Value> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Returns true if the value contains no references.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Returns the literal value, if this is a literal.
    #[must_use]
    pub const fn as_literal(&self) -> Option<&Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// Collects every reference in declaration order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Reference(r) = part {
                        out.push(r);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolves the value using `lookup` for every reference.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not satisfy.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, Reference>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Reference(r) => {
                            let value = lookup(r).ok_or_else(|| r.clone())?;
                            match value {
                                Value::String(s) => out.push_str(&s),
                                other => out.push_str(&other.to_string()),
                            }
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), item.resolve(lookup)?);
                }
                Ok(Value::Object(out))
            }
        }
    }
}

/// Parses a string into a literal, reference or template.
fn parse_string(s: &str) -> Result<AttributeValue, String> {
    let mut parts: Vec<TemplatePart> = Vec::new();
    let mut text = String::new();
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        text.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(after) = tail.strip_prefix("$${") {
            text.push_str("${");
            rest = after;
        } else if let Some(after) = tail.strip_prefix("${") {
            let Some(end) = after.find('}') else {
                return Err(format!("unterminated reference in '{s}'"));
            };
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            parts.push(TemplatePart::Reference(Reference::parse(&after[..end])?));
            rest = &after[end + 1..];
        } else {
            text.push('$');
            rest = &tail[1..];
        }
    }
    text.push_str(rest);

    if parts.is_empty() {
        return Ok(AttributeValue::Literal(Value::String(text)));
    }
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }

    if let [TemplatePart::Reference(r)] = parts.as_slice() {
        return Ok(AttributeValue::Reference(r.clone()));
    }

    Ok(AttributeValue::Template(parts))
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.output)
    }
}
