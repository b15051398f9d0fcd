//! Registry of known event definitions

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use super::Event;
use crate::error::{Error, Result};
use crate::identifiers::EntityIdentifiers;
use crate::rights::Rights;

/// Definition of a named event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    name: String,
    description: String,
    visibility: Rights,
}

impl Definition {
    /// Event name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Rights required to see events of this definition
    pub fn visibility(&self) -> &Rights {
        &self.visibility
    }

    /// Create an event of this definition, occurring now
    pub fn new_event(
        &self,
        identifiers: Vec<EntityIdentifiers>,
        data: Option<serde_json::Value>,
    ) -> Event {
        Event::new(self.name.clone(), identifiers, data, self.visibility.clone())
    }
}

/// Process-wide set of event definitions
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    inner: Arc<DashMap<String, Definition>>,
}

impl Definitions {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Define an event, replacing any earlier definition of the same name
    pub fn define(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        visibility: Rights,
    ) -> Definition {
        let definition = Definition {
            name: name.into(),
            description: description.into(),
            visibility,
        };
        self.inner
            .insert(definition.name.clone(), definition.clone());
        definition
    }

    /// Look up a definition by name
    pub fn lookup(&self, name: &str) -> Option<Definition> {
        self.inner.get(name).map(|d| d.clone())
    }

    /// All defined event names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.iter().map(|d| d.key().clone()).collect();
        names.sort();
        names
    }

    /// Expand subscription name patterns against the defined names
    ///
    /// - no patterns: `None`, meaning all events
    /// - `/expr/`: names matching the regular expression
    /// - patterns with `*` or `?`: names matching the glob
    /// - anything else: the exact name, which must be defined
    ///
    /// A pattern that matches no defined name fails with `InvalidArgument`.
    pub fn expand_patterns(&self, patterns: &[String]) -> Result<Option<Vec<String>>> {
        if patterns.is_empty() {
            return Ok(None);
        }

        let defined = self.names();
        let mut expanded = BTreeSet::new();
        for pattern in patterns {
            let matched: Vec<&String> = if let Some(expr) = regex_pattern(pattern) {
                let re = Regex::new(expr).map_err(|e| {
                    Error::invalid_argument(
                        "name_pattern",
                        format!("invalid event name pattern `{pattern}`: {e}"),
                    )
                })?;
                defined.iter().filter(|name| re.is_match(name)).collect()
            } else if pattern.contains(['*', '?']) {
                let re = glob_regex(pattern)?;
                defined.iter().filter(|name| re.is_match(name)).collect()
            } else {
                defined.iter().filter(|name| *name == pattern).collect()
            };

            if matched.is_empty() {
                return Err(Error::invalid_argument(
                    "unknown_event_name",
                    format!("unknown event `{pattern}`"),
                ));
            }
            expanded.extend(matched.into_iter().cloned());
        }

        Ok(Some(expanded.into_iter().collect()))
    }
}

fn regex_pattern(pattern: &str) -> Option<&str> {
    if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        Some(&pattern[1..pattern.len() - 1])
    } else {
        None
    }
}

fn glob_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| {
        Error::invalid_argument(
            "name_pattern",
            format!("invalid event name pattern `{pattern}`: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rights::Right;

    fn registry() -> Definitions {
        let definitions = Definitions::new();
        for name in [
            "as.up.data.forward",
            "as.up.join.forward",
            "gs.gateway.connect",
            "gs.gateway.disconnect",
            "gs.status.receive",
        ] {
            definitions.define(name, name, Rights::default());
        }
        definitions
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_patterns_mean_all() {
        assert_eq!(registry().expand_patterns(&[]).unwrap(), None);
    }

    #[test]
    fn test_exact_names() {
        let names = registry()
            .expand_patterns(&patterns(&["gs.gateway.connect"]))
            .unwrap();
        assert_eq!(names, Some(patterns(&["gs.gateway.connect"])));
    }

    #[test]
    fn test_glob_patterns() {
        let names = registry()
            .expand_patterns(&patterns(&["gs.gateway.*"]))
            .unwrap()
            .unwrap();
        assert_eq!(names, patterns(&["gs.gateway.connect", "gs.gateway.disconnect"]));
    }

    #[test]
    fn test_regex_patterns_and_dedup() {
        let names = registry()
            .expand_patterns(&patterns(&["/^as\\.up\\./", "as.up.data.forward"]))
            .unwrap()
            .unwrap();
        assert_eq!(names, patterns(&["as.up.data.forward", "as.up.join.forward"]));
    }

    #[test]
    fn test_unknown_name_fails() {
        let err = registry()
            .expand_patterns(&patterns(&["gs.gateway.connect", "ns.nothing"]))
            .unwrap_err();
        assert_eq!(err.name(), "unknown_event_name");

        let err = registry()
            .expand_patterns(&patterns(&["js.*"]))
            .unwrap_err();
        assert_eq!(err.name(), "unknown_event_name");
    }

    #[test]
    fn test_invalid_regex_fails() {
        let err = registry().expand_patterns(&patterns(&["/([/"])).unwrap_err();
        assert_eq!(err.name(), "name_pattern");
    }

    #[test]
    fn test_definition_stamps_visibility() {
        let definitions = Definitions::new();
        let definition = definitions.define(
            "as.up.data.forward",
            "forward data message",
            Rights::new([Right::RightApplicationTrafficRead]),
        );
        let event = definition.new_event(vec![EntityIdentifiers::application("foo")], None);
        assert_eq!(event.name, "as.up.data.forward");
        assert!(event.visibility.contains(Right::RightApplicationTrafficRead));
        assert_eq!(
            definitions.lookup("as.up.data.forward").unwrap().description(),
            "forward data message"
        );
    }
}
