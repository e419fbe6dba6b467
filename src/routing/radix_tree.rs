use crate::config::{FileServerConfig, RouteEntry, TcpProxyConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// What a matched route dispatches to. `Upstream` carries no data of its
/// own — the matching route's `path` is also the key the upstream
/// `ClusterStore` is indexed by, so the dispatcher looks the cluster up by
/// the route it already has in hand.
#[derive(Debug)]
pub enum RouteTarget {
    Upstream,
    FileServer(Arc<FileServerConfig>),
    TcpProxy(Arc<TcpProxyConfig>),
}

/// A compiled route — the runtime domain object produced from a
/// `RouteEntry`. The DTO is consumed during compilation and not retained.
#[derive(Debug)]
pub struct CompiledRoute {
    pub path: String,
    pub target: RouteTarget,
}

impl CompiledRoute {
    fn from_entry(entry: RouteEntry) -> Option<Arc<Self>> {
        let target = if entry.upstream.is_some() {
            RouteTarget::Upstream
        } else if let Some(fs) = entry.file_server {
            RouteTarget::FileServer(Arc::new(fs))
        } else if let Some(tcp) = entry.tcp_proxy {
            RouteTarget::TcpProxy(Arc::new(tcp))
        } else {
            tracing::error!(path = %entry.path, "route has no upstream/file_server/tcp_proxy target, dropping");
            return None;
        };
        Some(Arc::new(Self {
            path: entry.path,
            target,
        }))
    }
}

/// A node in the compressed radix tree. Each node represents one or more
/// path segments; a node may carry a terminal route, meaning the path up
/// to and including that node is a registered prefix.
#[derive(Debug, Default)]
struct Node {
    segments: Vec<String>,
    children: HashMap<String, Node>,
    route: Option<Arc<CompiledRoute>>,
}

impl Node {
    fn new(segments: Vec<String>) -> Self {
        Self {
            segments,
            ..Default::default()
        }
    }
}

/// Compressed radix tree over route path prefixes. A lookup finds the
/// registered route whose path is the longest prefix of the request path;
/// ties (two routes ending at the same node — only possible by re-inserting
/// the same path) are broken by insertion order, i.e. the first insert
/// wins and later ones are dropped with a warning.
#[derive(Debug, Default)]
pub struct RadixTree {
    root: Node,
}

impl RadixTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: RouteEntry) {
        let Some(route) = CompiledRoute::from_entry(entry) else {
            return;
        };
        let path = route.path.clone();
        let segments = split_path_segments(&path);
        insert_recursive(&mut self.root, &segments, 0, route);
    }

    /// Longest-prefix match. Returns the deepest node along the request
    /// path that carries a terminal route.
    pub fn match_path<'a>(&'a self, path: &str) -> Option<&'a Arc<CompiledRoute>> {
        let segments = split_path_segments(path);
        let mut best: Option<&Arc<CompiledRoute>> = None;
        match_recursive(&self.root, &segments, 0, &mut best);
        best
    }

    pub fn all_routes(&self) -> Vec<&Arc<CompiledRoute>> {
        let mut result = Vec::new();
        collect_routes(&self.root, &mut result);
        result
    }
}

fn split_path_segments(path: &str) -> Vec<&str> {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        return vec![];
    }
    trimmed.split('/').collect()
}

fn common_prefix_len(a: &[String], b: &[&str]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x.as_str() == **y).count()
}

fn insert_recursive(node: &mut Node, segments: &[&str], offset: usize, route: Arc<CompiledRoute>) {
    let remaining = &segments[offset..];

    if remaining.is_empty() {
        if node.route.is_some() {
            tracing::warn!(path = %route.path, "duplicate route path, keeping first registration");
        } else {
            node.route = Some(route);
        }
        return;
    }

    let first = remaining[0];

    if let Some(child) = node.children.get_mut(first) {
        let common = common_prefix_len(&child.segments, remaining);
        if common == child.segments.len() {
            insert_recursive(child, segments, offset + common, route);
        } else {
            split_and_insert(child, common, segments, offset, route);
        }
    } else {
        let mut new_node = Node::new(remaining.iter().map(|s| s.to_string()).collect());
        new_node.route = Some(route);
        node.children.insert(first.to_string(), new_node);
    }
}

fn split_and_insert(
    child: &mut Node,
    common_len: usize,
    segments: &[&str],
    offset: usize,
    route: Arc<CompiledRoute>,
) {
    let old_suffix: Vec<String> = child.segments[common_len..].to_vec();
    let old_children = std::mem::take(&mut child.children);
    let old_route = child.route.take();

    let mut old_node = Node::new(old_suffix.clone());
    old_node.children = old_children;
    old_node.route = old_route;

    child.segments.truncate(common_len);
    child.children.clear();

    let old_first = old_suffix[0].clone();
    child.children.insert(old_first, old_node);

    let new_remaining = &segments[offset + common_len..];
    if new_remaining.is_empty() {
        if child.route.is_some() {
            tracing::warn!(path = %route.path, "duplicate route path, keeping first registration");
        } else {
            child.route = Some(route);
        }
    } else {
        let new_first = new_remaining[0];
        if let Some(existing) = child.children.get_mut(new_first) {
            insert_recursive(existing, segments, offset + common_len, route);
        } else {
            let mut new_node = Node::new(new_remaining.iter().map(|s| s.to_string()).collect());
            new_node.route = Some(route);
            child.children.insert(new_first.to_string(), new_node);
        }
    }
}

fn match_recursive<'a>(
    node: &'a Node,
    segments: &[&str],
    offset: usize,
    best: &mut Option<&'a Arc<CompiledRoute>>,
) {
    if let Some(ref route) = node.route {
        *best = Some(route);
    }

    let remaining = &segments[offset..];
    if remaining.is_empty() {
        return;
    }

    let first = remaining[0];
    if let Some(child) = node.children.get(first) {
        let child_len = child.segments.len();
        if remaining.len() >= child_len
            && child.segments.iter().zip(remaining.iter()).all(|(a, b)| a == b)
        {
            match_recursive(child, segments, offset + child_len, best);
        }
    }
}

fn collect_routes<'a>(node: &'a Node, result: &mut Vec<&'a Arc<CompiledRoute>>) {
    if let Some(ref route) = node.route {
        result.push(route);
    }
    for child in node.children.values() {
        collect_routes(child, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UpstreamRouteConfig, UpstreamServerSpec};

    fn upstream_entry(path: &str) -> RouteEntry {
        RouteEntry {
            path: path.to_string(),
            upstream: Some(UpstreamRouteConfig {
                servers: vec![UpstreamServerSpec {
                    host: "127.0.0.1".into(),
                    port: 8080,
                    weight: 1,
                }],
                strategy: "round_robin".into(),
                health_check: None,
            }),
            file_server: None,
            tcp_proxy: None,
        }
    }

    #[test]
    fn test_exact_match() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/api"));
        let route = tree.match_path("/api").unwrap();
        assert_eq!(route.path, "/api");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/api"));
        tree.insert(upstream_entry("/api/v1"));
        let route = tree.match_path("/api/v1/users").unwrap();
        assert_eq!(route.path, "/api/v1");

        let route = tree.match_path("/api/v2/users").unwrap();
        assert_eq!(route.path, "/api");
    }

    #[test]
    fn test_root_catch_all() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/"));
        tree.insert(upstream_entry("/api"));
        assert_eq!(tree.match_path("/anything").unwrap().path, "/");
        assert_eq!(tree.match_path("/api/foo").unwrap().path, "/api");
    }

    #[test]
    fn test_no_match_without_catch_all() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/api"));
        assert!(tree.match_path("/other").is_none());
    }

    #[test]
    fn test_node_splitting() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/a/b/c"));
        tree.insert(upstream_entry("/a/b/d"));
        assert_eq!(tree.match_path("/a/b/c").unwrap().path, "/a/b/c");
        assert_eq!(tree.match_path("/a/b/d").unwrap().path, "/a/b/d");
        assert!(tree.match_path("/a/b").is_none());
    }

    #[test]
    fn test_duplicate_path_keeps_first() {
        let mut tree = RadixTree::new();
        tree.insert(RouteEntry {
            path: "/api".into(),
            file_server: Some(FileServerConfig {
                root: "/var/www".into(),
                index_files: vec!["index.html".into()],
                directory_listing: false,
                cache_control: None,
            }),
            upstream: None,
            tcp_proxy: None,
        });
        tree.insert(upstream_entry("/api"));
        let route = tree.match_path("/api").unwrap();
        assert!(matches!(route.target, RouteTarget::FileServer(_)));
    }

    #[test]
    fn test_query_string_ignored() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/api"));
        assert_eq!(tree.match_path("/api?x=1").unwrap().path, "/api");
    }

    #[test]
    fn test_all_routes_collects_every_entry() {
        let mut tree = RadixTree::new();
        tree.insert(upstream_entry("/api"));
        tree.insert(upstream_entry("/static"));
        assert_eq!(tree.all_routes().len(), 2);
    }
}
