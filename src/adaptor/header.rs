//! Header rewriting: `del`, then `set`, then `add`.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::AdaptorError;

/// Header rewrite rule as configured.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeaderAdaptSpec {
    pub del: Vec<String>,
    pub set: BTreeMap<String, String>,
    pub add: BTreeMap<String, String>,
}

/// Compiled header rewrite rule.
#[derive(Debug, Clone, Default)]
pub struct HeaderAdaptor {
    del: Vec<HeaderName>,
    set: Vec<(HeaderName, HeaderValue)>,
    add: Vec<(HeaderName, HeaderValue)>,
}

fn header_name(name: &str) -> Result<HeaderName, AdaptorError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| AdaptorError::HeaderName(name.to_string()))
}

fn header_pairs(
    pairs: &BTreeMap<String, String>,
) -> Result<Vec<(HeaderName, HeaderValue)>, AdaptorError> {
    pairs
        .iter()
        .map(|(name, value)| {
            let value = HeaderValue::from_str(value)
                .map_err(|_| AdaptorError::HeaderValue(name.clone()))?;
            Ok((header_name(name)?, value))
        })
        .collect()
}

impl HeaderAdaptor {
    pub fn new(spec: &HeaderAdaptSpec) -> Result<Self, AdaptorError> {
        Ok(Self {
            del: spec.del.iter().map(|n| header_name(n)).collect::<Result<_, _>>()?,
            set: header_pairs(&spec.set)?,
            add: header_pairs(&spec.add)?,
        })
    }

    pub fn adapt(&self, headers: &mut HeaderMap) {
        for name in &self.del {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.add {
            headers.append(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_del_set_add() {
        let spec = HeaderAdaptSpec {
            del: vec!["X-Remove".into()],
            set: BTreeMap::from([("X-Set".to_string(), "new".to_string())]),
            add: BTreeMap::from([("X-Multi".to_string(), "two".to_string())]),
        };
        let adaptor = HeaderAdaptor::new(&spec).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-remove", HeaderValue::from_static("gone"));
        headers.insert("x-set", HeaderValue::from_static("old"));
        headers.insert("x-multi", HeaderValue::from_static("one"));
        adaptor.adapt(&mut headers);

        assert!(headers.get("x-remove").is_none());
        assert_eq!(headers["x-set"], "new");
        let multi: Vec<_> = headers.get_all("x-multi").iter().collect();
        assert_eq!(multi, ["one", "two"]);
    }

    #[test]
    fn test_invalid_header_name() {
        let spec = HeaderAdaptSpec {
            del: vec!["bad header".into()],
            ..Default::default()
        };
        assert!(matches!(
            HeaderAdaptor::new(&spec),
            Err(AdaptorError::HeaderName(_))
        ));
    }
}
