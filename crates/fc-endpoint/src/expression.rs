//! Message expressions for dynamic policy values and endpoint properties
//!
//! Syntax is `${source:path}`:
//! - `${ctx:name}` reads a message property
//! - `${header:name}` reads an envelope header
//! - `${body:/json/pointer}` reads from the JSON body (RFC 6901 pointer)

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::context::MessageContext;
use crate::error::EndpointError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionSource {
    Property,
    Header,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    raw: String,
    source: ExpressionSource,
    path: String,
}

impl Expression {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix("${")
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| EndpointError::Expression(format!("'{}' is not of the form ${{source:path}}", raw)))?;

        let (source, path) = inner
            .split_once(':')
            .ok_or_else(|| EndpointError::Expression(format!("'{}' is missing a source prefix", raw)))?;

        let source = match source.trim() {
            "ctx" | "property" => ExpressionSource::Property,
            "header" | "trp" => ExpressionSource::Header,
            "body" => ExpressionSource::Body,
            other => {
                return Err(EndpointError::Expression(format!(
                    "unknown expression source '{}' in '{}'",
                    other, raw
                )))
            }
        };

        let path = path.trim().to_string();
        if path.is_empty() && source != ExpressionSource::Body {
            return Err(EndpointError::Expression(format!("'{}' has an empty path", raw)));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            source,
            path,
        })
    }

    pub fn source(&self) -> ExpressionSource {
        self.source
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Evaluate against a message; `None` when the referenced value is absent
    pub fn evaluate(&self, ctx: &MessageContext) -> Option<Value> {
        match self.source {
            ExpressionSource::Property => ctx.property(&self.path).cloned(),
            ExpressionSource::Header => ctx
                .envelope()
                .headers
                .get(&self.path)
                .map(|v| Value::String(v.clone())),
            ExpressionSource::Body => {
                let body = ctx.envelope().json_view()?;
                body.pointer(&self.path).cloned()
            }
        }
    }

    /// Evaluate and render as text, the way property values are attached to headers
    pub fn evaluate_text(&self, ctx: &MessageContext) -> Option<String> {
        self.evaluate(ctx).map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }
}

impl FromStr for Expression {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
