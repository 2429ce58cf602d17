//! Output filename templates.
//!
//! A template such as
//! `SubjectID-{PatientID}/{Modality}_{SeriesInstanceUID}_{IMAGE_ID}.nii.gz`
//! is parsed once into literal and placeholder segments. The same parse
//! drives both rendering an output path and compiling the matcher that
//! recovers the fields from a written path.

use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed filename template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl FilenameTemplate {
    /// Parses `{Name}` placeholders. `{{` and `}}` stand for literal braces.
    pub fn parse(template: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::Template {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

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
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(invalid("nested '{' inside placeholder")),
                            Some(ch) => name.push(ch),
                            None => return Err(invalid("unclosed '{'")),
                        }
                    }
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(invalid("empty placeholder"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                }
                '}' => return Err(invalid("unmatched '}'")),
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in template order, without duplicates.
    pub fn fields(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Field(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitutes every placeholder with the value returned by `lookup`.
    pub fn render<'a, F>(&self, lookup: F) -> Result<String>
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => {
                    let value = lookup(name).ok_or_else(|| Error::MissingField(name.clone()))?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }

    /// Compiles the inverse of [`render`](Self::render).
    pub fn matcher(&self) -> Result<PathMatcher> {
        let mut pattern = String::from("^");
        let mut groups = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => pattern.push_str(&regex::escape(text)),
                Segment::Field(name) => {
                    pattern.push_str("(.*?)");
                    groups.push(name.clone());
                }
            }
        }
        pattern.push('$');

        Ok(PathMatcher {
            regex: Regex::new(&pattern)?,
            groups,
            fields: self.fields().into_iter().map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for FilenameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Recovers template fields from a rendered, `/`-separated relative path.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    regex: Regex,
    /// Field name for each capture group, in group order.
    groups: Vec<String>,
    fields: Vec<String>,
}

impl PathMatcher {
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Returns `(field, value)` pairs in template order, or `None` when the
    /// path was not produced by the template. A field repeated in the
    /// template must capture the same value every time.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(path)?;
        let mut values: Vec<(String, String)> = Vec::with_capacity(self.fields.len());
        for (n, name) in self.groups.iter().enumerate() {
            let value = caps.get(n + 1).map_or("", |m| m.as_str());
            match values.iter().find(|(field, _)| field == name) {
                Some((_, seen)) if seen != value => return None,
                Some(_) => {}
                None => values.push((name.clone(), value.to_string())),
            }
        }
        Some(values)
    }
}
