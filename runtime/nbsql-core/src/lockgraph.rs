//! Blocking-chain forest built from a flat snapshot of lock waits.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use nbsql_db::BackendPid;

/// One `blocker -> blocked` edge as reported by the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    pub blocking_pid: BackendPid,
    pub blocked_pid: BackendPid,
    #[serde(default)]
    pub lock_mode: String,
    #[serde(default)]
    pub locked_object: String,
    #[serde(default)]
    pub blocking_user: String,
    #[serde(default)]
    pub blocking_query: String,
    #[serde(default)]
    pub blocked_user: String,
    #[serde(default)]
    pub blocked_query: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRole {
    Root,
    Blocker,
    Waiter,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LockNode {
    pub pid: BackendPid,
    pub role: LockRole,
    pub user: String,
    pub query: String,
    pub lock_mode: String,
    pub locked_object: String,
    /// Set on the node that closes a loop back into its own path.
    pub cycle: bool,
    /// Set when this pid was already expanded earlier under the same root;
    /// its children are listed there.
    pub repeated: bool,
    pub children: Vec<LockNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LockForest {
    pub roots: Vec<LockNode>,
    /// Pids holding a lock someone waits on, in first-seen order.
    pub blockers: Vec<BackendPid>,
    /// Pids waiting on a lock, in first-seen order.
    pub waiters: Vec<BackendPid>,
    pub has_cycle: bool,
}

impl LockForest {
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

struct Meta<'a> {
    user: &'a str,
    query: &'a str,
    lock_mode: &'a str,
    locked_object: &'a str,
}

struct Graph<'a> {
    edges: HashMap<BackendPid, Vec<BackendPid>>,
    meta: HashMap<BackendPid, Meta<'a>>,
}

impl Graph<'_> {
    fn node(&self, pid: BackendPid, role: LockRole) -> LockNode {
        let (user, query, lock_mode, locked_object) = match self.meta.get(&pid) {
            Some(meta) => (meta.user, meta.query, meta.lock_mode, meta.locked_object),
            None => ("", "", "", ""),
        };
        LockNode {
            pid,
            role,
            user: user.to_string(),
            query: query.to_string(),
            lock_mode: lock_mode.to_string(),
            locked_object: locked_object.to_string(),
            cycle: false,
            repeated: false,
            children: Vec::new(),
        }
    }

    fn role_below_root(&self, pid: BackendPid) -> LockRole {
        if self.edges.contains_key(&pid) {
            LockRole::Blocker
        } else {
            LockRole::Waiter
        }
    }

    fn expand(&self, pid: BackendPid, role: LockRole, walk: &mut Walk) -> LockNode {
        let mut node = self.node(pid, role);
        walk.reached.insert(pid);
        walk.expanded.insert(pid);
        walk.path.push(pid);
        if let Some(children) = self.edges.get(&pid) {
            for &child in children {
                let role = self.role_below_root(child);
                if walk.path.contains(&child) {
                    walk.has_cycle = true;
                    node.children.push(LockNode {
                        cycle: true,
                        ..self.node(child, role)
                    });
                } else if walk.expanded.contains(&child) {
                    node.children.push(LockNode {
                        repeated: true,
                        ..self.node(child, role)
                    });
                } else {
                    node.children.push(self.expand(child, role, walk));
                }
            }
        }
        walk.path.pop();
        node
    }
}

#[derive(Default)]
struct Walk {
    path: Vec<BackendPid>,
    /// Pids fully expanded under the current root.
    expanded: HashSet<BackendPid>,
    reached: HashSet<BackendPid>,
    has_cycle: bool,
}

impl Walk {
    fn root(&mut self, graph: &Graph<'_>, pid: BackendPid) -> LockNode {
        self.expanded.clear();
        graph.expand(pid, LockRole::Root, self)
    }
}

/// Builds the blocking forest for one poll.
///
/// Pids that never wait are roots. Whatever is still unreached afterwards
/// sits on a cycle with no way in, so the first such pid (in row order)
/// becomes a synthetic root; this repeats until every pid is placed.
/// Within one root each pid is expanded once, so the forest stays
/// proportional to the number of edges.
pub fn build(rows: &[LockRow]) -> LockForest {
    let mut order: Vec<BackendPid> = Vec::new();
    let mut seen: HashSet<BackendPid> = HashSet::new();
    let mut blocked: HashSet<BackendPid> = HashSet::new();
    let mut edges: HashMap<BackendPid, Vec<BackendPid>> = HashMap::new();
    let mut blocker_meta: HashMap<BackendPid, Meta<'_>> = HashMap::new();
    let mut waiter_meta: HashMap<BackendPid, Meta<'_>> = HashMap::new();

    for row in rows {
        for pid in [row.blocking_pid, row.blocked_pid] {
            if seen.insert(pid) {
                order.push(pid);
            }
        }
        blocked.insert(row.blocked_pid);
        let children = edges.entry(row.blocking_pid).or_default();
        if !children.contains(&row.blocked_pid) {
            children.push(row.blocked_pid);
        }
        blocker_meta.entry(row.blocking_pid).or_insert(Meta {
            user: &row.blocking_user,
            query: &row.blocking_query,
            lock_mode: &row.lock_mode,
            locked_object: &row.locked_object,
        });
        waiter_meta.entry(row.blocked_pid).or_insert(Meta {
            user: &row.blocked_user,
            query: &row.blocked_query,
            lock_mode: &row.lock_mode,
            locked_object: &row.locked_object,
        });
    }

    let blockers: Vec<BackendPid> = order
        .iter()
        .copied()
        .filter(|pid| edges.contains_key(pid))
        .collect();
    let waiters: Vec<BackendPid> = order
        .iter()
        .copied()
        .filter(|pid| blocked.contains(pid))
        .collect();

    // Blocker-side fields win over anything seen from the blocked side.
    for (pid, meta) in waiter_meta {
        blocker_meta.entry(pid).or_insert(meta);
    }
    let graph = Graph {
        edges,
        meta: blocker_meta,
    };
    let mut forest = LockForest {
        blockers,
        waiters,
        ..LockForest::default()
    };
    let mut walk = Walk::default();
    for &pid in order.iter().filter(|pid| !blocked.contains(pid)) {
        forest.roots.push(walk.root(&graph, pid));
    }
    for &pid in &order {
        if !walk.reached.contains(&pid) {
            forest.roots.push(walk.root(&graph, pid));
        }
    }
    forest.has_cycle = walk.has_cycle;
    forest
}
