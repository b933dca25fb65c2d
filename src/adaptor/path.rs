//! Path rewriting.
//!
//! Only one rule applies per request. Precedence:
//! `replace` → `addPrefix` → `trimPrefix` → `regexpReplace`.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::AdaptorError;

/// Regular expression substitution; `replace` may reference groups as `${1}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegexpReplace {
    pub regexp: String,
    pub replace: String,
}

/// Path rewrite rule as configured.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PathAdaptSpec {
    pub replace: Option<String>,
    pub add_prefix: Option<String>,
    pub trim_prefix: Option<String>,
    pub regexp_replace: Option<RegexpReplace>,
}

#[derive(Debug, Clone)]
enum Rule {
    Replace(String),
    AddPrefix(String),
    TrimPrefix(String),
    Regexp { regex: Regex, replace: String },
    Keep,
}

/// Compiled path rewrite rule.
#[derive(Debug, Clone)]
pub struct PathAdaptor {
    rule: Rule,
}

impl PathAdaptor {
    pub fn new(spec: &PathAdaptSpec) -> Result<Self, AdaptorError> {
        let non_empty = |s: &Option<String>| s.as_ref().filter(|s| !s.is_empty()).cloned();

        let rule = if let Some(replace) = non_empty(&spec.replace) {
            Rule::Replace(replace)
        } else if let Some(prefix) = non_empty(&spec.add_prefix) {
            Rule::AddPrefix(prefix)
        } else if let Some(prefix) = non_empty(&spec.trim_prefix) {
            Rule::TrimPrefix(prefix)
        } else if let Some(rr) = &spec.regexp_replace {
            let regex = Regex::new(&rr.regexp).map_err(|source| AdaptorError::Regex {
                pattern: rr.regexp.clone(),
                source,
            })?;
            Rule::Regexp {
                regex,
                replace: rr.replace.clone(),
            }
        } else {
            Rule::Keep
        };

        Ok(Self { rule })
    }

    /// Rewrite `path` according to the compiled rule.
    pub fn adapt(&self, path: &str) -> String {
        match &self.rule {
            Rule::Replace(replace) => replace.clone(),
            Rule::AddPrefix(prefix) => format!("{}{}", prefix, path),
            Rule::TrimPrefix(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string(),
            Rule::Regexp { regex, replace } => regex.replace_all(path, replace.as_str()).into_owned(),
            Rule::Keep => path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adaptor(spec: PathAdaptSpec) -> PathAdaptor {
        PathAdaptor::new(&spec).unwrap()
    }

    #[test]
    fn test_replace_wins() {
        let pa = adaptor(PathAdaptSpec {
            replace: Some("/fixed".into()),
            add_prefix: Some("/v1".into()),
            ..Default::default()
        });
        assert_eq!(pa.adapt("/users"), "/fixed");
    }

    #[test]
    fn test_prefixes() {
        let add = adaptor(PathAdaptSpec {
            add_prefix: Some("/v1".into()),
            ..Default::default()
        });
        assert_eq!(add.adapt("/users"), "/v1/users");

        let trim = adaptor(PathAdaptSpec {
            trim_prefix: Some("/api".into()),
            ..Default::default()
        });
        assert_eq!(trim.adapt("/api/users"), "/users");
        assert_eq!(trim.adapt("/other"), "/other");
    }

    #[test]
    fn test_regexp_replace() {
        let pa = adaptor(PathAdaptSpec {
            regexp_replace: Some(RegexpReplace {
                regexp: r"^/users/(\d+)$".into(),
                replace: "/profiles/${1}".into(),
            }),
            ..Default::default()
        });
        assert_eq!(pa.adapt("/users/42"), "/profiles/42");
        assert_eq!(pa.adapt("/users/abc"), "/users/abc");
    }

    #[test]
    fn test_invalid_regexp() {
        let err = PathAdaptor::new(&PathAdaptSpec {
            regexp_replace: Some(RegexpReplace {
                regexp: "(".into(),
                replace: String::new(),
            }),
            ..Default::default()
        });
        assert!(matches!(err, Err(AdaptorError::Regex { .. })));
    }

    #[test]
    fn test_empty_spec_keeps_path() {
        assert_eq!(adaptor(PathAdaptSpec::default()).adapt("/a/b"), "/a/b");
    }
}
