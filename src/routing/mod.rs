mod matcher;
mod radix_tree;

pub use matcher::{CompiledRoute, RouteTable, RouteTarget};
