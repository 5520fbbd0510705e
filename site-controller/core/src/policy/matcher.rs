use crate::k8s::{Labels, Selector};
use regex::Regex;

/// Selects the namespaces a cluster policy applies to.
#[derive(Clone, Debug)]
pub enum NamespaceMatcher {
    Wildcard,
    Exact(String),
    Regex(Regex),
    LabelSelector(Selector),
}

/// One entry of a policy allow-list.
#[derive(Clone, Debug)]
pub enum AllowEntry {
    Wildcard,
    Exact(String),
    Regex(Regex),
}

/// Characters that mark an allow-list entry as a pattern. Dots are common in
/// hostnames so they are matched literally.
const PATTERN_CHARS: &[char] = &['\\', '^', '$', '|', '?', '*', '+', '(', ')', '[', ']', '{', '}'];

// === impl NamespaceMatcher ===

impl NamespaceMatcher {
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        if entry == "*" {
            return Self::Wildcard;
        }

        if looks_like_selector(entry) {
            if let Ok(selector) = entry.parse::<Selector>() {
                return Self::LabelSelector(selector);
            }
        }

        // Namespace names never contain dots, so a dot marks a pattern.
        if !entry.contains(PATTERN_CHARS) && !entry.contains('.') {
            return Self::Exact(entry.to_string());
        }
        match anchored(entry) {
            Some(re) => Self::Regex(re),
            None => Self::Exact(entry.to_string()),
        }
    }

    pub fn matches(&self, namespace: &str, labels: &Labels) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(name) => name == namespace,
            Self::Regex(re) => re.is_match(namespace),
            Self::LabelSelector(selector) => selector.matches(labels),
        }
    }
}

fn looks_like_selector(entry: &str) -> bool {
    entry.contains('=')
        || entry.starts_with('!')
        || entry.contains(" in ")
        || entry.contains(" notin ")
}

// === impl AllowEntry ===

impl AllowEntry {
    pub fn parse(entry: &str) -> Self {
        let entry = entry.trim();
        if entry == "*" {
            return Self::Wildcard;
        }
        if !entry.contains(PATTERN_CHARS) {
            return Self::Exact(entry.to_string());
        }
        match anchored(entry) {
            Some(re) => Self::Regex(re),
            None => Self::Exact(entry.to_string()),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Exact(v) => v == value,
            Self::Regex(re) => re.is_match(value),
        }
    }

    /// Matches an exposed resource given as `type/name`. When the type is
    /// unknown, an exact entry for any type with the same name matches.
    pub fn matches_resource(&self, kind: &str, name: &str) -> bool {
        if kind.is_empty() {
            return match self {
                Self::Exact(v) => v
                    .rsplit_once('/')
                    .map_or(v == name, |(_, entry_name)| entry_name == name),
                _ => self.matches(name) || self.matches(&format!("/{name}")),
            };
        }
        self.matches(&format!("{kind}/{name}"))
    }
}

/// Compiles a pattern that must match the whole value.
fn anchored(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => Some(re),
        Err(error) => {
            tracing::warn!(%pattern, %error, "Treating invalid pattern as a literal");
            None
        }
    }
}
