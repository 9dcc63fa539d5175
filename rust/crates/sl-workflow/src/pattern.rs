//! Format-with-placeholders templates
//!
//! `provides` patterns and the `pattern` input option use the same template
//! form: literal text with `{name}` placeholders. A template can be matched
//! against a candidate name (extracting placeholder values) or expanded with
//! a set of bound values.

use regex::Regex;
use std::collections::BTreeMap;

use sl_core::{Error, Result};

/// A parsed placeholder template such as `a_{i}.txt`
#[derive(Debug, Clone)]
pub struct Template {
    text: String,
    parts: Vec<Part>,
    regex: Regex,
}

#[derive(Debug, Clone)]
enum Part {
    Literal(String),
    Placeholder(String),
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => {
                                return Err(Error::Parse {
                                    message: format!("unterminated placeholder in '{}'", text),
                                })
                            }
                        }
                    }
                    if name.is_empty()
                        || !name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        return Err(Error::Parse {
                            message: format!("invalid placeholder '{{{}}}' in '{}'", name, text),
                        });
                    }
                    parts.push(Part::Placeholder(name));
                }
                '}' => {
                    return Err(Error::Parse {
                        message: format!("unbalanced '}}' in '{}'", text),
                    })
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        let regex = Self::build_regex(&parts)?;
        Ok(Self {
            text: text.to_string(),
            parts,
            regex,
        })
    }

    fn build_regex(parts: &[Part]) -> Result<Regex> {
        let mut pattern = String::from("^");
        for part in parts {
            match part {
                Part::Literal(text) => pattern.push_str(&regex::escape(text)),
                Part::Placeholder(name) => {
                    pattern.push_str(&format!("(?P<{}>.+?)", name));
                }
            }
        }
        pattern.push('$');
        Regex::new(&pattern).map_err(|e| Error::Parse {
            message: format!("bad pattern: {}", e),
        })
    }

    /// Source text of the template
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Placeholder names in order of appearance
    pub fn placeholders(&self) -> Vec<&str> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Placeholder(name) => Some(name.as_str()),
                Part::Literal(_) => None,
            })
            .collect()
    }

    /// Match a candidate name, extracting placeholder values
    pub fn matches(&self, name: &str) -> Option<BTreeMap<String, String>> {
        let caps = self.regex.captures(name)?;
        let mut bound = BTreeMap::new();
        for placeholder in self.placeholders() {
            bound.insert(
                placeholder.to_string(),
                caps.name(placeholder)?.as_str().to_string(),
            );
        }
        Some(bound)
    }

    /// Expand the template with bound values; every placeholder must be bound
    pub fn expand(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Placeholder(name) => match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(Error::Eval(format!(
                            "unbound placeholder '{{{}}}' in '{}'",
                            name, self.text
                        )))
                    }
                },
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_extracts_placeholders() {
        let t = Template::parse("a_{i}.txt").unwrap();
        let bound = t.matches("a_2.txt").unwrap();
        assert_eq!(bound.get("i").map(String::as_str), Some("2"));
        assert!(t.matches("b_2.txt").is_none());
    }

    #[test]
    fn test_match_multiple_placeholders() {
        let t = Template::parse("{sample}_{lane}.fastq").unwrap();
        let bound = t.matches("s1_L001.fastq").unwrap();
        assert_eq!(bound.get("sample").map(String::as_str), Some("s1"));
        assert_eq!(bound.get("lane").map(String::as_str), Some("L001"));
    }

    #[test]
    fn test_expand() {
        let t = Template::parse("out_{i}_{j}.csv").unwrap();
        let mut vars = BTreeMap::new();
        vars.insert("i".to_string(), "0".to_string());
        vars.insert("j".to_string(), "a".to_string());
        assert_eq!(t.expand(&vars).unwrap(), "out_0_a.csv");
    }

    #[test]
    fn test_expand_unbound_fails() {
        let t = Template::parse("out_{i}.csv").unwrap();
        assert!(t.expand(&BTreeMap::new()).is_err());
    }

    #[test]
    fn test_escaped_braces() {
        let t = Template::parse("literal_{{x}}.txt").unwrap();
        assert!(t.placeholders().is_empty());
        assert!(t.matches("literal_{x}.txt").is_some());
    }

    #[test]
    fn test_bad_templates_rejected() {
        assert!(Template::parse("open_{i.txt").is_err());
        assert!(Template::parse("bad_}close").is_err());
        assert!(Template::parse("empty_{}").is_err());
    }
}
