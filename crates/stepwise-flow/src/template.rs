use stepwise_core::error::{Result, StepwiseError};

use crate::facts::FactStore;

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Fact(String),
}

/// A step prompt with `{fact}` placeholders.
///
/// `{{` and `}}` produce literal braces. Parsing happens once, when the
/// registry is built, so rendering never sees malformed syntax.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(source: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(StepwiseError::Registry(format!(
                            "unclosed placeholder at byte {} in prompt template",
                            pos
                        )));
                    }
                    let name = name.trim();
                    if !is_identifier(name) {
                        return Err(StepwiseError::Registry(format!(
                            "invalid placeholder '{{{}}}' in prompt template",
                            name
                        )));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Fact(name.to_string()));
                }
                '}' => {
                    return Err(StepwiseError::Registry(format!(
                        "unmatched '}}' at byte {} in prompt template",
                        pos
                    )));
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Fact names referenced by the template, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Fact(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every placeholder. Fails on the first unbound fact rather
    /// than rendering it blank.
    pub fn render(&self, step: &str, facts: &FactStore) -> Result<String> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Fact(name) => match facts.get(name) {
                    Some(serde_json::Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {
                        return Err(StepwiseError::TemplateBinding {
                            step: step.to_string(),
                            fact: name.clone(),
                        })
                    }
                },
            }
        }
        Ok(out)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
