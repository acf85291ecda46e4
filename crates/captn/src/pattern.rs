//! Tag-Pattern Inducer (C2): derive a pattern from a reference tag that
//! confines which remote tags are even considered comparable. See
//! SPEC_FULL.md §4.2.

use regex::Regex;

use crate::version::parse;

/// A regex built from a reference tag by replacing every run of digits with
/// `\d+` and escaping everything else literally. Non-digit metadata in the
/// reference tag (e.g. `-alpine`) is preserved literally and therefore
/// confines matches to tags sharing that same suffix — this is intentional
/// (§9: "induced pattern is sensitive to non-digit metadata").
#[derive(Debug, Clone)]
pub struct TagPattern {
    regex: Regex,
}

impl TagPattern {
    /// Build the pattern from the currently-running tag. Returns `None`
    /// when the reference tag doesn't parse as a Version at all, per
    /// §4.2: "If the reference tag is non-parseable, no updates are
    /// considered for that container."
    pub fn induce(reference_tag: &str) -> Option<TagPattern> {
        parse(reference_tag)?;

        let mut pattern = String::with_capacity(reference_tag.len() * 2);
        pattern.push('^');

        let mut chars = reference_tag.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                pattern.push_str(r"\d+");
                while chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                    chars.next();
                }
            } else {
                pattern.push_str(&regex::escape(&c.to_string()));
            }
        }
        pattern.push('$');

        Regex::new(&pattern).ok().map(|regex| TagPattern { regex })
    }

    /// Does `tag` match the induced shape, and if so what `Version` does it
    /// parse as? A tag can match the literal digit-placeholder shape but
    /// still fail to parse (e.g. the digit run overflows `u64`) — in that
    /// case this correctly returns `None`.
    pub fn matches(&self, tag: &str) -> Option<crate::types::Version> {
        if !self.regex.is_match(tag) {
            return None;
        }
        parse(tag)
    }
}
