//! Brace-range object-name templates.
//!
//! A template names a contiguous range of objects:
//! `prefix{0001..0100}suffix` expands to `prefix0001suffix` through
//! `prefix0100suffix`, preserving the zero-padding of the start bound.
//! Templates must parse on the originator; a parse failure is a
//! user-visible error, never a silent empty selection.

use std::fmt;

use thiserror::Error;

/// Template parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template has no '{{' range")]
    NoRange,
    #[error("unterminated '{{' in template")]
    Unterminated,
    #[error("bad range bounds {0:?} (expected start..end)")]
    BadBounds(String),
    #[error("range start {start} exceeds end {end}")]
    StartAfterEnd { start: u64, end: u64 },
    #[error("nested or repeated ranges are not supported")]
    MultipleRanges,
}

/// A parsed brace-range template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub prefix: String,
    pub suffix: String,
    pub start: u64,
    pub end: u64,
    /// Zero-padding width, taken from the start bound as written.
    pub width: usize,
}

impl Template {
    /// Parse `prefix{start..end}suffix`. A single range per template.
    pub fn parse(s: &str) -> Result<Self, TemplateError> {
        let open = s.find('{').ok_or(TemplateError::NoRange)?;
        let close = s[open..]
            .find('}')
            .map(|i| open + i)
            .ok_or(TemplateError::Unterminated)?;
        let (prefix, rest) = (&s[..open], &s[open + 1..close]);
        let suffix = &s[close + 1..];
        if suffix.contains('{') || suffix.contains('}') {
            return Err(TemplateError::MultipleRanges);
        }

        let (lo, hi) = rest
            .split_once("..")
            .ok_or_else(|| TemplateError::BadBounds(rest.to_string()))?;
        let start: u64 = lo
            .parse()
            .map_err(|_| TemplateError::BadBounds(rest.to_string()))?;
        let end: u64 = hi
            .parse()
            .map_err(|_| TemplateError::BadBounds(rest.to_string()))?;
        if start > end {
            return Err(TemplateError::StartAfterEnd { start, end });
        }

        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            start,
            end,
            width: lo.len(),
        })
    }

    /// Number of names the template expands to.
    pub fn count(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Iterate all expanded names in range order.
    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        (self.start..=self.end)
            .map(move |i| format!("{}{:0width$}{}", self.prefix, i, self.suffix, width = self.width))
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{{:0w$}..{:0w$}}}{}",
            self.prefix,
            self.start,
            self.end,
            self.suffix,
            w = self.width
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_expand() {
        let t = Template::parse("test/a-{0010..0012}").unwrap();
        assert_eq!(t.count(), 3);
        let names: Vec<String> = t.iter().collect();
        assert_eq!(names, vec!["test/a-0010", "test/a-0011", "test/a-0012"]);
    }

    #[test]
    fn test_padding_preserved() {
        let t = Template::parse("obj{08..11}.bin").unwrap();
        let names: Vec<String> = t.iter().collect();
        assert_eq!(names, vec!["obj08.bin", "obj09.bin", "obj10.bin", "obj11.bin"]);
    }

    #[test]
    fn test_unpadded_range() {
        let t = Template::parse("x{8..11}").unwrap();
        let names: Vec<String> = t.iter().collect();
        assert_eq!(names, vec!["x8", "x9", "x10", "x11"]);
    }

    #[test]
    fn test_parse_errors_are_visible() {
        assert_eq!(Template::parse("no-range"), Err(TemplateError::NoRange));
        assert_eq!(Template::parse("a{1..2"), Err(TemplateError::Unterminated));
        assert!(matches!(
            Template::parse("a{one..2}"),
            Err(TemplateError::BadBounds(_))
        ));
        assert_eq!(
            Template::parse("a{5..2}"),
            Err(TemplateError::StartAfterEnd { start: 5, end: 2 })
        );
        assert_eq!(
            Template::parse("a{1..2}b{3..4}"),
            Err(TemplateError::MultipleRanges)
        );
    }

    #[test]
    fn test_display_roundtrip() {
        let t = Template::parse("p{001..010}s").unwrap();
        assert_eq!(t.to_string(), "p{001..010}s");
        assert_eq!(Template::parse(&t.to_string()).unwrap(), t);
    }
}
