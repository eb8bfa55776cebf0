use std::{fmt, ops::Deref, sync::Arc};

/// Dotted name of a supervisor or child, such as `bridge.printer_0`.
///
/// Only contains alphanumeric characters, underscores, and periods.
///
/// Names are scoped one level deep: a child named `worker` registered on a supervisor named `bridge_sup` is named
/// `bridge_sup.worker`. A nested supervisor keeps the identifier it was created with, so its own children are named
/// after that identifier rather than the full path from the root. The same name is used for the child's thread and
/// for the `process_name` field of its log events.
///
/// Invalid characters, such as hyphens or spaces, are replaced with underscores.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub(crate) fn root<N: AsRef<str>>(name: N) -> Option<Self> {
        let sanitized = sanitize_segment(name.as_ref())?;
        Some(Self(sanitized.into()))
    }

    pub(crate) fn scoped<N: AsRef<str>>(parent: &Name, name: N) -> Option<Self> {
        let sanitized = sanitize_segment(name.as_ref())?;
        Some(Self(format!("{}.{}", parent.0, sanitized).into()))
    }

    /// Returns the last segment of the name.
    pub fn leaf(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_segment_valid(name: &str) -> bool {
    name.starts_with(|c: char| c.is_alphanumeric())
        && name.ends_with(|c: char| c.is_alphanumeric())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn sanitize_segment(name: &str) -> Option<String> {
    if is_segment_valid(name) {
        return Some(name.to_string());
    }

    // Replace invalid characters with underscores, collapsing runs into a single one.
    let mut sanitized = String::with_capacity(name.len());
    let mut last_was_underscore = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            sanitized.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            sanitized.push('_');
            last_was_underscore = true;
        }
    }

    let trimmed = sanitized.trim_matches(|c: char| !c.is_alphanumeric());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
