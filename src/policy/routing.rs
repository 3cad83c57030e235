use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{node::Node, statement::Statement};

/// Lazy, single-pass sequence of candidate nodes for one request.
pub type QueryPlan<'a> = Box<dyn Iterator<Item = Arc<Node>> + Send + 'a>;

/// Orders the nodes a request may be sent to.
///
/// A plan is built once per request and consumed at most once. It only yields
/// nodes that are reachable at the moment they are pulled.
pub trait LoadBalancingPolicy: Send + Sync + fmt::Debug {
    fn new_query_plan<'a>(&'a self, statement: &'a Statement, nodes: &'a [Arc<Node>])
    -> QueryPlan<'a>;
}

/// Rotates the starting node on every plan. With a local datacenter set, nodes of
/// that datacenter come first and the others follow as fallbacks.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    local_datacenter: Option<String>,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.local_datacenter = Some(datacenter.into());
        self
    }

    fn is_local(&self, node: &Node) -> bool {
        match &self.local_datacenter {
            None => true,
            Some(local) => node.datacenter() == Some(local.as_str()),
        }
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn new_query_plan<'a>(
        &'a self,
        _statement: &'a Statement,
        nodes: &'a [Arc<Node>],
    ) -> QueryPlan<'a> {
        if nodes.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % nodes.len();
        let rotated = move || nodes[start..].iter().chain(&nodes[..start]);

        let local = rotated().filter(move |node| self.is_local(node));
        let remote = rotated().filter(move |node| !self.is_local(node));
        Box::new(
            local
                .chain(remote)
                .filter(|node| node.is_up())
                .map(Arc::clone),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn node(port: u16, datacenter: &str) -> Arc<Node> {
        let address: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        Arc::new(Node::new(address).with_datacenter(datacenter))
    }

    fn ports(plan: QueryPlan<'_>) -> Vec<u16> {
        plan.map(|node| node.address().port()).collect()
    }

    #[test]
    fn plans_rotate_over_all_nodes() {
        let nodes = vec![node(1, "dc1"), node(2, "dc1"), node(3, "dc1")];
        let policy = RoundRobinPolicy::new();
        let statement = Statement::new("select");

        assert_eq!(ports(policy.new_query_plan(&statement, &nodes)), [1, 2, 3]);
        assert_eq!(ports(policy.new_query_plan(&statement, &nodes)), [2, 3, 1]);
        assert_eq!(ports(policy.new_query_plan(&statement, &nodes)), [3, 1, 2]);
    }

    #[test]
    fn local_datacenter_comes_first() {
        let nodes = vec![node(1, "dc2"), node(2, "dc1"), node(3, "dc2"), node(4, "dc1")];
        let policy = RoundRobinPolicy::new().with_local_datacenter("dc1");
        let statement = Statement::new("select");

        assert_eq!(
            ports(policy.new_query_plan(&statement, &nodes)),
            [2, 4, 1, 3]
        );
    }

    #[test]
    fn down_nodes_are_skipped_when_pulled() {
        let nodes = vec![node(1, "dc1"), node(2, "dc1")];
        let policy = RoundRobinPolicy::new();
        let statement = Statement::new("select");

        let mut plan = policy.new_query_plan(&statement, &nodes);
        assert_eq!(plan.next().unwrap().address().port(), 1);
        nodes[1].mark_down();
        assert!(plan.next().is_none());
    }

    #[test]
    fn no_nodes_means_empty_plan() {
        let policy = RoundRobinPolicy::new();
        let statement = Statement::new("select");

        assert!(policy.new_query_plan(&statement, &[]).next().is_none());
    }
}
