use crate::config::RouteEntry;
use crate::routing::radix_tree::RadixTree;
use std::sync::Arc;

pub use crate::routing::radix_tree::{CompiledRoute, RouteTarget};

/// The route table: a single compressed radix tree over path prefixes.
/// Longest-prefix-match, readers never block each other — the table is
/// rebuilt wholesale on every config reload and the whole tree swapped in
/// via `ArcSwap` at the call site, matching the "many readers, rare
/// writers" discipline for this resource.
pub struct RouteTable {
    tree: RadixTree,
    route_count: usize,
}

impl RouteTable {
    pub fn new(routes: &[RouteEntry]) -> Self {
        let mut tree = RadixTree::new();
        for route in routes {
            tree.insert(route.clone());
        }
        let route_count = tree.all_routes().len();
        tracing::info!("routing: compiled route table, count={}", route_count);
        Self { tree, route_count }
    }

    pub fn match_route(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.tree.match_path(path).cloned()
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }

    pub fn all_routes(&self) -> Vec<&Arc<CompiledRoute>> {
        self.tree.all_routes()
    }
}
