//! Hierarchy reconstruction from flat rows
//!
//! **Algorithm:**
//! 1. Declare each row's parent per the session's hierarchy mode
//!    (parent reference, path prefix, level column, or flat)
//! 2. Resolve parents not found in the batch against the catalog; anything
//!    still unresolved is an orphan (structural error, never re-rooted).
//!    In level mode a row without a recognised level cannot be placed and is
//!    a structural error too
//! 3. Detect cycles by walking parent chains with three-colour marking
//! 4. Compute depths and a parent-before-child order by iterative preorder
//!    traversal; rows deeper than the depth cap are structural errors
//!
//! Nothing here recurses, so hostile parent chains cannot exhaust the stack.
//! The display tree is built bottom-up and truncated by depth and per-node
//! child caps; the caps never affect the commit order.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

use crate::capabilities::{CatalogError, CatalogStore};
use crate::error::Result;
use crate::models::finding::{DEPTH_EXCEEDED, HIERARCHY_CYCLE, LEVEL_UNRESOLVED, ORPHAN_PARENT};
use crate::models::{HierarchyMode, MappedRow, Severity, ValidationFinding};

/// Parent as declared by the row, before catalog resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared {
    Root,
    /// Position (not row index) of the parent within the batch
    InBatch(usize),
    /// Reference to look up in the catalog
    External(String),
    /// Level column value that ranks nowhere (empty when missing)
    Unranked(String),
}

/// Resolved parent link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum ParentLink {
    Root,
    InBatch(usize),
    Catalog(Uuid),
    Unresolved(String),
    Unranked(String),
}

/// Structural analysis of a batch, indexed by row position
#[derive(Debug, Clone)]
pub struct HierarchyPlan {
    pub links: Vec<ParentLink>,
    /// Display/commit key of each row (for logs and the preview)
    pub keys: Vec<Option<String>>,
    /// Child positions in row order (cycle members excluded)
    pub children: Vec<Vec<usize>>,
    /// Tops of attached trees: rows whose parent is root or a catalog record
    pub roots: Vec<usize>,
    /// Tops of detached subtrees: orphans, unranked rows, and rows whose
    /// parent is in a cycle
    pub detached: Vec<usize>,
    pub cyclic: Vec<usize>,
    /// 1-based depth within attached trees
    pub depth: Vec<Option<usize>>,
    /// Every position exactly once, parents strictly before children
    pub order: Vec<usize>,
    pub findings: Vec<ValidationFinding>,
}

/// Declare parents for each row
///
/// `key_field` names the row key in modes that have no key of their own
/// (level and flat); the parent-reference mode keys by its configured field.
pub fn declare_parents(
    rows: &[MappedRow],
    mode: &HierarchyMode,
    key_field: &str,
) -> (Vec<Declared>, Vec<Option<String>>) {
    match mode {
        HierarchyMode::ParentReference {
            key_field: reference_key,
            parent_field,
        } => {
            let keys: Vec<Option<String>> =
                rows.iter().map(|r| r.get(reference_key).map(str::to_string)).collect();
            let mut by_key: HashMap<&str, usize> = HashMap::new();
            for (pos, key) in keys.iter().enumerate() {
                if let Some(key) = key {
                    by_key.entry(key.as_str()).or_insert(pos);
                }
            }

            let declared = rows
                .iter()
                .map(|row| match row.get(parent_field) {
                    None => Declared::Root,
                    Some(parent) => match by_key.get(parent) {
                        Some(&pos) => Declared::InBatch(pos),
                        None => Declared::External(parent.to_string()),
                    },
                })
                .collect();
            (declared, keys)
        }
        HierarchyMode::Path {
            path_field,
            separator,
        } => {
            let sep = if separator.is_empty() { "/" } else { separator.as_str() };
            let paths: Vec<Option<Vec<String>>> = rows
                .iter()
                .map(|r| {
                    r.get(path_field).map(|p| {
                        p.split(sep)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let keys: Vec<Option<String>> = paths
                .iter()
                .map(|p| p.as_ref().filter(|s| !s.is_empty()).map(|s| s.join(sep)))
                .collect();

            let mut by_path: HashMap<&str, usize> = HashMap::new();
            for (pos, key) in keys.iter().enumerate() {
                if let Some(key) = key {
                    by_path.entry(key.as_str()).or_insert(pos);
                }
            }

            let declared = paths
                .iter()
                .map(|segments| match segments {
                    Some(segments) if segments.len() > 1 => {
                        let parent = segments[..segments.len() - 1].join(sep);
                        match by_path.get(parent.as_str()) {
                            Some(&pos) => Declared::InBatch(pos),
                            None => Declared::External(parent),
                        }
                    }
                    _ => Declared::Root,
                })
                .collect();
            (declared, keys)
        }
        HierarchyMode::Level { level_field } => {
            let mut declared = Vec::with_capacity(rows.len());
            let mut stack: Vec<(u32, usize)> = Vec::new();
            for (pos, row) in rows.iter().enumerate() {
                let level = row.get(level_field).unwrap_or_default();
                let Some(rank) = level_rank(level) else {
                    declared.push(Declared::Unranked(level.to_string()));
                    continue;
                };
                while stack.last().map(|(r, _)| *r >= rank).unwrap_or(false) {
                    stack.pop();
                }
                declared.push(match stack.last() {
                    Some(&(_, parent)) => Declared::InBatch(parent),
                    None => Declared::Root,
                });
                stack.push((rank, pos));
            }
            let keys = rows.iter().map(|r| r.get(key_field).map(str::to_string)).collect();
            (declared, keys)
        }
        HierarchyMode::Flat => {
            let keys = rows.iter().map(|r| r.get(key_field).map(str::to_string)).collect();
            (vec![Declared::Root; rows.len()], keys)
        }
    }
}

/// Numeric level (1 = top) or a level-of-description term
fn level_rank(value: &str) -> Option<u32> {
    if let Ok(n) = value.trim().parse::<u32>() {
        return Some(n);
    }
    let rank = match value.trim().to_lowercase().as_str() {
        "fonds" | "collection" => 1,
        "subfonds" | "record group" => 2,
        "series" => 3,
        "subseries" => 4,
        "file" => 5,
        "item" => 6,
        "part" | "sub-item" => 7,
        _ => return None,
    };
    Some(rank)
}

/// Look up external references in the catalog
///
/// A reference that parses as a UUID is treated as a record id, anything else
/// as a source reference. Not-found is an orphan; any other catalog error is
/// returned.
pub async fn resolve_external(
    declared: &[Declared],
    catalog: &dyn CatalogStore,
) -> Result<HashMap<String, Uuid>> {
    let wanted: BTreeSet<&str> = declared
        .iter()
        .filter_map(|d| match d {
            Declared::External(r) => Some(r.as_str()),
            _ => None,
        })
        .collect();

    let mut resolved = HashMap::new();
    for reference in wanted {
        let found = match Uuid::parse_str(reference) {
            Ok(id) => match catalog.fetch_record(id).await {
                Ok(record) => Some(record.id),
                Err(CatalogError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
            Err(_) => catalog.find_by_reference(reference).await?,
        };
        if let Some(id) = found {
            resolved.insert(reference.to_string(), id);
        }
    }
    Ok(resolved)
}

/// Resolve links, detect cycles, order rows
pub fn plan(
    session_id: Uuid,
    rows: &[MappedRow],
    declared: Vec<Declared>,
    keys: Vec<Option<String>>,
    resolved: &HashMap<String, Uuid>,
    parent_field: Option<&str>,
    max_depth: usize,
) -> HierarchyPlan {
    let n = rows.len();
    let links: Vec<ParentLink> = declared
        .into_iter()
        .map(|d| match d {
            Declared::Root => ParentLink::Root,
            Declared::InBatch(p) => ParentLink::InBatch(p),
            Declared::External(r) => match resolved.get(&r) {
                Some(id) => ParentLink::Catalog(*id),
                None => ParentLink::Unresolved(r),
            },
            Declared::Unranked(level) => ParentLink::Unranked(level),
        })
        .collect();

    let in_cycle = find_cycles(&links);

    let mut children = vec![Vec::new(); n];
    let mut roots = Vec::new();
    let mut detached = Vec::new();
    let mut cyclic = Vec::new();
    for (pos, link) in links.iter().enumerate() {
        if in_cycle[pos] {
            cyclic.push(pos);
            continue;
        }
        match link {
            ParentLink::Root | ParentLink::Catalog(_) => roots.push(pos),
            ParentLink::Unresolved(_) | ParentLink::Unranked(_) => detached.push(pos),
            ParentLink::InBatch(p) if in_cycle[*p] => detached.push(pos),
            ParentLink::InBatch(p) => children[*p].push(pos),
        }
    }

    let mut depth = vec![None; n];
    let mut order = Vec::with_capacity(n);
    let mut findings = Vec::new();

    for (tops, attached) in [(&roots, true), (&detached, false)] {
        for &top in tops {
            let mut stack = vec![(top, 1usize)];
            while let Some((pos, d)) = stack.pop() {
                order.push(pos);
                if attached {
                    depth[pos] = Some(d);
                    if d == max_depth + 1 {
                        findings.push(ValidationFinding::error(
                            session_id,
                            rows[pos].index,
                            None,
                            DEPTH_EXCEEDED,
                            format!("hierarchy deeper than {} levels", max_depth),
                        ));
                    }
                }
                for &child in children[pos].iter().rev() {
                    stack.push((child, d + 1));
                }
            }
        }
    }
    order.extend(cyclic.iter().copied());

    for (pos, link) in links.iter().enumerate() {
        match link {
            ParentLink::Unresolved(reference) => findings.push(ValidationFinding::error(
                session_id,
                rows[pos].index,
                parent_field,
                ORPHAN_PARENT,
                format!("parent '{}' not found in batch or catalog", reference),
            )),
            ParentLink::Unranked(level) if level.is_empty() => {
                findings.push(ValidationFinding::error(
                    session_id,
                    rows[pos].index,
                    parent_field,
                    LEVEL_UNRESOLVED,
                    "row has no level to place it by",
                ))
            }
            ParentLink::Unranked(level) => findings.push(ValidationFinding::error(
                session_id,
                rows[pos].index,
                parent_field,
                LEVEL_UNRESOLVED,
                format!("level '{}' has no place in the hierarchy", level),
            )),
            _ => {}
        }
    }
    for &pos in &cyclic {
        findings.push(ValidationFinding::error(
            session_id,
            rows[pos].index,
            parent_field,
            HIERARCHY_CYCLE,
            "row is part of a parent reference cycle",
        ));
    }
    findings.sort_by_key(|f| f.row_index);

    HierarchyPlan {
        links,
        keys,
        children,
        roots,
        detached,
        cyclic,
        depth,
        order,
        findings,
    }
}

/// Marks rows whose parent chain loops back on itself
fn find_cycles(links: &[ParentLink]) -> Vec<bool> {
    const WHITE: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut color = vec![WHITE; links.len()];
    let mut in_cycle = vec![false; links.len()];

    for start in 0..links.len() {
        if color[start] != WHITE {
            continue;
        }
        let mut path = Vec::new();
        let mut cur = start;
        loop {
            match color[cur] {
                WHITE => {
                    color[cur] = ON_PATH;
                    path.push(cur);
                    match links[cur] {
                        ParentLink::InBatch(parent) => cur = parent,
                        _ => break,
                    }
                }
                ON_PATH => {
                    if let Some(at) = path.iter().position(|&p| p == cur) {
                        for &p in &path[at..] {
                            in_cycle[p] = true;
                        }
                    }
                    break;
                }
                _ => break,
            }
        }
        for &p in &path {
            color[p] = DONE;
        }
    }
    in_cycle
}

/// Full structural pass: declare, resolve against the catalog, plan
pub async fn analyze(
    session_id: Uuid,
    rows: &[MappedRow],
    mode: &HierarchyMode,
    key_field: &str,
    catalog: &dyn CatalogStore,
    max_depth: usize,
) -> Result<HierarchyPlan> {
    let (declared, keys) = declare_parents(rows, mode, key_field);
    let resolved = resolve_external(&declared, catalog).await?;
    let parent_field = match mode {
        HierarchyMode::ParentReference { parent_field, .. } => Some(parent_field.as_str()),
        HierarchyMode::Path { path_field, .. } => Some(path_field.as_str()),
        HierarchyMode::Level { level_field } => Some(level_field.as_str()),
        HierarchyMode::Flat => None,
    };
    Ok(plan(session_id, rows, declared, keys, &resolved, parent_field, max_depth))
}

// ============================================================================
// Display tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Ok,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewNode {
    pub row_index: usize,
    pub key: Option<String>,
    pub title: Option<String>,
    pub level: Option<String>,
    pub status: NodeStatus,
    /// Existing catalog record this node will be placed under
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_parent: Option<Uuid>,
    pub children: Vec<PreviewNode>,
    /// Children not shown (per-node cap or depth cap)
    pub hidden_children: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewTree {
    pub roots: Vec<PreviewNode>,
    /// Orphan subtrees (and subtrees hanging off cycles); excluded from commit
    pub detached: Vec<PreviewNode>,
    /// Row indexes of cycle members
    pub cyclic_rows: Vec<usize>,
    pub total_rows: usize,
    /// Rows with no error findings
    pub eligible_rows: usize,
    pub child_cap: usize,
}

/// Build the display tree
///
/// `findings` should be the session's full finding set so node status
/// reflects field-level problems as well as structural ones.
pub fn build_tree(
    rows: &[MappedRow],
    plan: &HierarchyPlan,
    findings: &[ValidationFinding],
    child_cap: usize,
    max_depth: usize,
) -> PreviewTree {
    let mut worst: BTreeMap<usize, Severity> = BTreeMap::new();
    for f in findings {
        let entry = worst.entry(f.row_index).or_insert(f.severity);
        if f.severity == Severity::Error {
            *entry = Severity::Error;
        }
    }
    let status_of = |row_index: usize| match worst.get(&row_index) {
        Some(Severity::Error) => NodeStatus::Error,
        Some(Severity::Warning) => NodeStatus::Warning,
        None => NodeStatus::Ok,
    };

    let build = |tops: &[usize]| -> Vec<PreviewNode> {
        // Preorder over the visible part only
        let mut visible = Vec::new();
        let mut stack: Vec<(usize, usize)> = tops.iter().rev().map(|&t| (t, 1)).collect();
        while let Some((pos, d)) = stack.pop() {
            visible.push((pos, d));
            if d < max_depth {
                for &child in plan.children[pos].iter().take(child_cap).rev() {
                    stack.push((child, d + 1));
                }
            }
        }

        let mut built: Vec<Option<PreviewNode>> = vec![None; rows.len()];
        for &(pos, d) in visible.iter().rev() {
            let all = &plan.children[pos];
            let (children, hidden) = if d < max_depth {
                let shown: Vec<PreviewNode> = all
                    .iter()
                    .take(child_cap)
                    .filter_map(|&c| built[c].take())
                    .collect();
                (shown, all.len().saturating_sub(child_cap))
            } else {
                (Vec::new(), all.len())
            };

            let row = &rows[pos];
            built[pos] = Some(PreviewNode {
                row_index: row.index,
                key: plan.keys[pos].clone(),
                title: row.get("title").map(str::to_string),
                level: row.get("levelOfDescription").map(str::to_string),
                status: status_of(row.index),
                catalog_parent: match plan.links[pos] {
                    ParentLink::Catalog(id) => Some(id),
                    _ => None,
                },
                children,
                hidden_children: hidden,
            });
        }

        tops.iter().filter_map(|&t| built[t].take()).collect()
    };

    let error_rows: BTreeSet<usize> = worst
        .iter()
        .filter(|(_, s)| **s == Severity::Error)
        .map(|(i, _)| *i)
        .collect();

    PreviewTree {
        roots: build(&plan.roots),
        detached: build(&plan.detached),
        cyclic_rows: plan.cyclic.iter().map(|&p| rows[p].index).collect(),
        total_rows: rows.len(),
        eligible_rows: rows.iter().filter(|r| !error_rows.contains(&r.index)).count(),
        child_cap,
    }
}
