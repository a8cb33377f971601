use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Shared in-memory location for one chat screen: a path plus query
/// parameters. Mutations use replace semantics — no navigation history is
/// kept, so updating a parameter never pollutes "back" state.
#[derive(Debug, Clone)]
pub struct Router {
    inner: Arc<Mutex<Location>>,
}

#[derive(Debug)]
struct Location {
    path: String,
    params: BTreeMap<String, String>,
}

impl Router {
    pub fn new(path: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Location {
                path: path.to_string(),
                params: BTreeMap::new(),
            })),
        }
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().params.get(key).cloned()
    }

    /// Set or remove a single query parameter, leaving every other
    /// parameter untouched.
    pub fn replace_query_param(&self, key: &str, value: Option<&str>) {
        let mut location = self.inner.lock().unwrap();
        match value {
            Some(value) => {
                location.params.insert(key.to_string(), value.to_string());
            }
            None => {
                location.params.remove(key);
            }
        }
    }

    /// Rendered location, e.g. `/ask-buddy?historyId=c1`.
    pub fn display(&self) -> String {
        let location = self.inner.lock().unwrap();
        if location.params.is_empty() {
            return location.path.clone();
        }
        let query = location
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", location.path, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_preserves_other_params() {
        let router = Router::new("/ask-buddy");
        router.replace_query_param("tab", Some("insights"));
        router.replace_query_param("historyId", Some("c1"));

        router.replace_query_param("historyId", None);
        assert_eq!(router.query_param("historyId"), None);
        assert_eq!(router.query_param("tab"), Some("insights".to_string()));
    }

    #[test]
    fn test_display() {
        let router = Router::new("/market-transaction");
        assert_eq!(router.display(), "/market-transaction");

        router.replace_query_param("historyId", Some("abc"));
        assert_eq!(router.display(), "/market-transaction?historyId=abc");
    }

    #[test]
    fn test_shared_handles_see_updates() {
        let router = Router::new("/ask-buddy");
        let other = router.clone();
        other.replace_query_param("historyId", Some("c9"));
        assert_eq!(router.query_param("historyId"), Some("c9".to_string()));
    }
}
