//! Oplog filters. Drop an entry if any filter in the chain returns true;
//! the chain short-circuits on the first hit, so cheap checks go first.
//! Filters are pure predicates: the order only matters for cost.

use crate::oplog::OplogEntry;
use std::collections::HashSet;

/// Namespace allow/deny matcher shared by the oplog filter chain and the
/// full-sync namespace enumeration. Rules are database names or full
/// `db.coll` namespaces; a database rule covers every collection under it.
#[derive(Debug, Default, Clone)]
pub struct NamespaceFilter {
    white: Vec<String>,
    black: Vec<String>,
}

impl NamespaceFilter {
    pub fn new(white: Vec<String>, black: Vec<String>) -> NamespaceFilter {
        NamespaceFilter { white, black }
    }

    pub fn is_empty(&self) -> bool {
        self.white.is_empty() && self.black.is_empty()
    }

    /// true means drop.
    pub fn filter_ns(&self, ns: &str) -> bool {
        if !self.white.is_empty() && !self.white.iter().any(|rule| ns_matches(rule, ns)) {
            return true;
        }
        self.black.iter().any(|rule| ns_matches(rule, ns))
    }
}

fn ns_matches(rule: &str, ns: &str) -> bool {
    if ns == rule {
        return true;
    }
    match ns.strip_prefix(rule) {
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub enum OplogFilter {
    /// Entries produced by the replicator itself or by system databases:
    /// admin, local, config and the checkpoint context database.
    Autologous { context_db: String },
    Noop,
    /// Keep only entries tagged with one of the listed gids. Entries
    /// without a tag are dropped too: an empty tag is not an allowed
    /// origin.
    Gid(HashSet<String>),
    /// Drop DDL when only DML should be replayed.
    Ddl,
    Namespace(NamespaceFilter),
}

impl OplogFilter {
    /// true means drop.
    pub fn filter(&self, log: &OplogEntry) -> bool {
        match self {
            OplogFilter::Autologous { context_db } => {
                let ns = log.ns.as_str();
                ns.starts_with("admin.")
                    || ns.starts_with("local.")
                    || ns.starts_with("config.")
                    || (!context_db.is_empty()
                        && ns_matches(context_db, ns))
            }
            OplogFilter::Noop => log.op.is_noop(),
            OplogFilter::Gid(gids) => {
                if gids.is_empty() {
                    return false;
                }
                !gids.contains(log.g.as_deref().unwrap_or(""))
            }
            OplogFilter::Ddl => log.op.is_command(),
            OplogFilter::Namespace(ns_filter) => ns_filter.filter_ns(&log.ns),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FilterChain {
    filters: Vec<OplogFilter>,
}

impl FilterChain {
    pub fn new(filters: Vec<OplogFilter>) -> FilterChain {
        FilterChain { filters }
    }

    /// true means drop; short-circuits on the first filter that hits.
    pub fn iterate_filter(&self, log: &OplogEntry) -> bool {
        self.filters.iter().any(|f| f.filter(log))
    }
}
