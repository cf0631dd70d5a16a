/// Immutable route table: path prefix -> upstream base URL, matched by
/// longest prefix.
#[derive(Debug, Clone)]
pub struct RouteTable {
    /// Sorted by prefix length descending; ties keep configured order.
    routes: Vec<(String, String)>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<(String, String)>) -> Self {
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { routes }
    }

    /// The upstream whose configured prefix is the longest prefix of
    /// `path`.
    pub fn match_path(&self, path: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, upstream)| upstream.as_str())
    }

    pub fn upstreams(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.routes
            .iter()
            .map(|(_, upstream)| upstream.clone())
            .filter(|u| seen.insert(u.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
