use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of resources by their labels.
///
/// Parses from the textual selector syntax accepted by `kubectl -l`, e.g.
/// `env=prod,tier!=cache,region in (us-east,us-west),!legacy`.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("label selector is empty")]
    Empty,

    #[error("invalid label selector term {0:?}")]
    InvalidTerm(String),
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut match_labels = Map::new();
        let mut exprs = Expressions::new();
        for term in split_terms(s) {
            let term = term.trim();
            let invalid = || ParseError::InvalidTerm(term.to_string());

            if let Some((key, values)) = split_set(term, " notin ") {
                exprs.push(Expression::new(key, Operator::NotIn, values).ok_or_else(invalid)?);
            } else if let Some((key, values)) = split_set(term, " in ") {
                exprs.push(Expression::new(key, Operator::In, values).ok_or_else(invalid)?);
            } else if let Some(key) = term.strip_prefix('!') {
                exprs.push(
                    Expression::new(key, Operator::DoesNotExist, vec![]).ok_or_else(invalid)?,
                );
            } else if let Some((key, value)) = term.split_once("!=") {
                exprs.push(
                    Expression::new(key, Operator::NotIn, vec![value]).ok_or_else(invalid)?,
                );
            } else if let Some((key, value)) =
                term.split_once("==").or_else(|| term.split_once('='))
            {
                let (key, value) = (key.trim(), value.trim());
                if !is_valid_key(key) || !is_valid_value(value) {
                    return Err(invalid());
                }
                match_labels.insert(key.to_string(), value.to_string());
            } else {
                exprs.push(Expression::new(term, Operator::Exists, vec![]).ok_or_else(invalid)?);
            }
        }

        Ok(Self {
            match_labels: Some(match_labels).filter(|m| !m.is_empty()),
            match_expressions: Some(exprs).filter(|e| !e.is_empty()),
        })
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

/// Splits a selector on commas that are not enclosed in a value set.
fn split_terms(s: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&s[start..]);
    terms
}

fn split_set<'t>(term: &'t str, op: &str) -> Option<(&'t str, Vec<&'t str>)> {
    let (key, rest) = term.split_once(op)?;
    let rest = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
    let values = rest.split(',').map(str::trim).collect();
    Some((key.trim(), values))
}

fn is_valid_key(key: &str) -> bool {
    key.chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric())
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn is_valid_value(value: &str) -> bool {
    value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    fn new(key: &str, operator: Operator, values: Vec<&str>) -> Option<Self> {
        let key = key.trim();
        if !is_valid_key(key) || !values.iter().all(|v| is_valid_value(v)) {
            return None;
        }
        if matches!(operator, Operator::In | Operator::NotIn) && values.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(str::to_string).collect(),
        })
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => labels
                .get(&self.key)
                .map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => labels
                .get(&self.key)
                .map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "foo".into(),
                    operator: Operator::In,
                    values: Some("bar".to_string()).into_iter().collect(),
                })),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "foo".into(),
                    operator: Operator::NotIn,
                    values: Some("bar".to_string()).into_iter().collect(),
                })),
                Labels::from_iter(vec![("foo", "bar")]),
                false,
                "excluded value",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn parse_selectors() {
        let labels = Labels::from_iter(vec![
            ("env", "prod"),
            ("region", "us-east"),
            ("team", "payments"),
        ]);

        for (selector, matches) in [
            ("env=prod", true),
            ("env==prod", true),
            ("env=dev", false),
            ("env!=dev", true),
            ("env=prod,team=payments", true),
            ("region in (us-east, us-west)", true),
            ("region notin (us-east)", false),
            ("team", true),
            ("!legacy", true),
            ("!team", false),
            ("env=prod,region in (eu-west,eu-central)", false),
        ] {
            let parsed = selector.parse::<Selector>().expect("selector must parse");
            assert_eq!(parsed.matches(&labels), matches, "{selector}");
        }
    }

    #[test]
    fn parse_rejects_invalid_terms() {
        assert_eq!("".parse::<Selector>(), Err(ParseError::Empty));
        for invalid in ["^team-.*$", "a=b=c", "region in us-east", "env=pro d", "*"] {
            assert!(
                invalid.parse::<Selector>().is_err(),
                "{invalid} must not parse"
            );
        }
    }
}
