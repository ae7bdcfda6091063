//! The TODO data model: hierarchical items, dependency validation, replan
//! child insertion, and dependency substitution.
//!
//! Two rules matter everywhere in this module:
//!
//! 1. Dependencies are validated by **insertion-order index**, never by
//!    comparing id strings numerically (`1.9` sorts before `1.10` as a
//!    string and after it as a number; neither ordering is the one that
//!    matters). An item may only depend on items that appear earlier in
//!    the `items` vec.
//! 2. A replanned parent never reaches `completed`. Dependents are
//!    unblocked by substituting the parent id with the ids of its direct
//!    children.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tool::{ExecutionRecord, ToolCall, Verification};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ItemId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hierarchical dotted item id: `3`, `3.1`, `3.1.2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Valid ids are non-empty dot-separated positive integers.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .split('.')
                .all(|c| !c.is_empty() && c.parse::<u64>().map(|n| n > 0).unwrap_or(false))
    }

    /// The id of this item's parent (`3.1.2` → `3.1`), or `None` for a
    /// top-level item.
    pub fn parent(&self) -> Option<ItemId> {
        self.0.rfind('.').map(|idx| ItemId(self.0[..idx].to_string()))
    }

    /// The id of the `n`-th child (`3` → `3.n`).
    pub fn child(&self, n: u32) -> ItemId {
        ItemId(format!("{}.{n}", self.0))
    }

    /// Whether this id lies anywhere under `other` in the hierarchy.
    pub fn is_descendant_of(&self, other: &ItemId) -> bool {
        self.0.len() > other.0.len()
            && self.0.starts_with(other.0.as_str())
            && self.0.as_bytes()[other.0.len()] == b'.'
    }

    /// The final dotted component as an integer (`3.1.2` → `2`).
    pub fn last_component(&self) -> Option<u64> {
        self.0.rsplit('.').next()?.parse().ok()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Item
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Planning,
    Executing,
    Verifying,
    Completed,
    Failed,
    Skipped,
    Replanned,
    Blocked,
}

impl ItemStatus {
    /// Terminal for the item itself: nothing will run it again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped
        )
    }

    /// Settled for scheduling purposes: terminal, or replaced by children.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == ItemStatus::Replanned
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Planning => "planning",
            ItemStatus::Executing => "executing",
            ItemStatus::Verifying => "verifying",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Replanned => "replanned",
            ItemStatus::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

/// A single step of a TODO; the unit the executor schedules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Short natural-language instruction (internal English form).
    pub action: String,
    /// The same instruction in the user's language, when it differs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_user: Option<String>,
    /// Natural-language statement the verifier evaluates against.
    pub success_criteria: String,
    /// Ids that must reach `completed` before this item may start.
    #[serde(default)]
    pub dependencies: Vec<ItemId>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub replan_count: u32,
    #[serde(default)]
    pub blocked_check_count: u32,
    /// Capability providers chosen for this item (0–2 entries).
    #[serde(default)]
    pub selected_providers: Vec<String>,
    /// The planned call sequence (filled by the tool-planning stage).
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Collected provider outputs, in planned order.
    #[serde(default)]
    pub execution_results: Vec<ExecutionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl Item {
    pub fn new(id: ItemId, action: impl Into<String>, success_criteria: impl Into<String>) -> Self {
        Self {
            id,
            action: action.into(),
            action_user: None,
            success_criteria: success_criteria.into(),
            dependencies: Vec::new(),
            status: ItemStatus::Pending,
            attempt_count: 0,
            replan_count: 0,
            blocked_check_count: 0,
            selected_providers: Vec::new(),
            tool_calls: Vec::new(),
            execution_results: Vec::new(),
            verification: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<ItemId>) -> Self {
        self.dependencies = deps;
        self
    }
}

/// Lightweight item snapshot carried inside progress events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemView {
    pub id: ItemId,
    pub action: String,
    pub status: ItemStatus,
}

impl From<&Item> for ItemView {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            action: item.action.clone(),
            status: item.status,
        }
    }
}

/// A child item draft produced by the adjust/replan stages. Sibling
/// dependencies refer to earlier drafts in the same batch by 1-based
/// ordinal; the parent's own dependencies are copied onto every child.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemDraft {
    pub action: String,
    pub success_criteria: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Todo
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The ordered plan produced by the planning stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub items: Vec<Item>,
    /// The originating user message.
    pub user_message: String,
    pub created_at: DateTime<Utc>,
}

impl Todo {
    /// Construct a validated Todo. Fails with `plan-invalid` when ids are
    /// duplicated or malformed, or a dependency is unknown or forward.
    pub fn new(user_message: impl Into<String>, items: Vec<Item>) -> Result<Self> {
        let todo = Self {
            items,
            user_message: user_message.into(),
            created_at: Utc::now(),
        };
        todo.validate()?;
        Ok(todo)
    }

    /// Re-check the structural invariants. Called at construction and after
    /// every child insertion.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (idx, item) in self.items.iter().enumerate() {
            if !item.id.is_valid() {
                return Err(Error::PlanInvalid(format!("malformed item id '{}'", item.id)));
            }
            if !seen.insert(item.id.clone()) {
                return Err(Error::PlanInvalid(format!("duplicate item id '{}'", item.id)));
            }
            for dep in &item.dependencies {
                match self.index_of(dep) {
                    None => {
                        return Err(Error::PlanInvalid(format!(
                            "item '{}' depends on unknown id '{dep}'",
                            item.id
                        )));
                    }
                    // Backward references only, by insertion order.
                    Some(dep_idx) if dep_idx >= idx => {
                        return Err(Error::PlanInvalid(format!(
                            "item '{}' depends on '{dep}' which does not precede it",
                            item.id
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// Insertion-order index of an item.
    pub fn index_of(&self, id: &ItemId) -> Option<usize> {
        self.items.iter().position(|i| &i.id == id)
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.iter().find(|i| &i.id == id)
    }

    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut Item> {
        self.items.iter_mut().find(|i| &i.id == id)
    }

    /// Direct children of `parent`, in insertion order.
    pub fn direct_children(&self, parent: &ItemId) -> Vec<&Item> {
        self.items
            .iter()
            .filter(|i| i.id.parent().as_ref() == Some(parent))
            .collect()
    }

    /// Insert child items for `parent` immediately after its current
    /// descendant block. Children receive ids `P.n, P.n+1, …` continuing
    /// from any existing children, inherit the parent's dependencies, and
    /// may additionally depend on earlier siblings of the same batch.
    ///
    /// Returns the assigned child ids.
    pub fn insert_children(&mut self, parent: &ItemId, drafts: Vec<ItemDraft>) -> Result<Vec<ItemId>> {
        let parent_idx = self
            .index_of(parent)
            .ok_or_else(|| Error::PlanInvalid(format!("unknown parent id '{parent}'")))?;
        let parent_deps = self.items[parent_idx].dependencies.clone();

        let first_ordinal = self
            .direct_children(parent)
            .iter()
            .filter_map(|c| c.id.last_component())
            .max()
            .unwrap_or(0) as u32
            + 1;

        // Insertion point: past the parent's existing descendant block.
        let mut insert_at = parent_idx + 1;
        while insert_at < self.items.len() && self.items[insert_at].id.is_descendant_of(parent) {
            insert_at += 1;
        }

        let mut assigned = Vec::with_capacity(drafts.len());
        for (offset, draft) in drafts.into_iter().enumerate() {
            let id = parent.child(first_ordinal + offset as u32);
            let mut deps = parent_deps.clone();
            for ordinal in draft.depends_on {
                let sibling_idx = ordinal.checked_sub(1).map(|o| o as usize);
                match sibling_idx.and_then(|o| assigned.get(o)).cloned() {
                    Some(sibling) => deps.push(sibling),
                    None => {
                        return Err(Error::PlanInvalid(format!(
                            "child of '{parent}' references sibling ordinal {ordinal} which is not an earlier sibling"
                        )));
                    }
                }
            }
            let item = Item::new(id.clone(), draft.action, draft.success_criteria)
                .with_dependencies(deps);
            self.items.insert(insert_at, item);
            insert_at += 1;
            assigned.push(id);
        }

        self.validate()?;
        Ok(assigned)
    }

    /// Replace a `replanned` dependency of `item` with the ids of the
    /// dependency's direct children. Returns `true` when a substitution
    /// was made.
    pub fn substitute_dependency(&mut self, item: &ItemId, dep: &ItemId) -> Result<bool> {
        let children: Vec<ItemId> = self
            .direct_children(dep)
            .iter()
            .map(|c| c.id.clone())
            .collect();
        if children.is_empty() {
            return Ok(false);
        }

        let item = self
            .get_mut(item)
            .ok_or_else(|| Error::Internal(format!("substitute on unknown item '{item}'")))?;
        let Some(pos) = item.dependencies.iter().position(|d| d == dep) else {
            return Ok(false);
        };
        item.dependencies.splice(pos..pos + 1, children);
        Ok(true)
    }

    /// Dependencies of `item` that have not reached `completed`.
    pub fn unresolved_deps(&self, item: &Item) -> Vec<ItemId> {
        item.dependencies
            .iter()
            .filter(|dep| {
                self.get(dep)
                    .map(|d| d.status != ItemStatus::Completed)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    /// Whether every item has settled (completed, failed, skipped, or
    /// replaced by children).
    pub fn all_settled(&self) -> bool {
        self.items.iter().all(|i| i.status.is_settled())
    }

    /// Aggregate status counts for the final summary.
    pub fn status_counts(&self) -> TodoCounts {
        let mut counts = TodoCounts::default();
        for item in &self.items {
            counts.total += 1;
            match item.status {
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
                ItemStatus::Skipped => counts.skipped += 1,
                ItemStatus::Replanned => counts.replanned += 1,
                _ => counts.unfinished += 1,
            }
        }
        counts
    }

    /// Snapshot of all items for progress events.
    pub fn views(&self) -> Vec<ItemView> {
        self.items.iter().map(ItemView::from).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TodoCounts {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub replanned: usize,
    pub unfinished: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ItemId {
        ItemId::from(s)
    }

    fn two_item_todo() -> Todo {
        Todo::new(
            "read then write",
            vec![
                Item::new(id("1"), "read /tmp/x", "contents returned"),
                Item::new(id("2"), "write /tmp/y", "file written")
                    .with_dependencies(vec![id("1")]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn item_id_validity() {
        assert!(id("1").is_valid());
        assert!(id("3.1.2").is_valid());
        assert!(!id("").is_valid());
        assert!(!id("a").is_valid());
        assert!(!id("1..2").is_valid());
        assert!(!id("0").is_valid());
        assert!(!id("1.").is_valid());
    }

    #[test]
    fn item_id_hierarchy() {
        assert_eq!(id("3.1").parent(), Some(id("3")));
        assert_eq!(id("3").parent(), None);
        assert_eq!(id("3").child(2), id("3.2"));
        assert!(id("3.1").is_descendant_of(&id("3")));
        assert!(id("3.1.2").is_descendant_of(&id("3")));
        assert!(!id("31").is_descendant_of(&id("3")));
        assert!(!id("3").is_descendant_of(&id("3")));
        assert_eq!(id("3.1.2").last_component(), Some(2));
    }

    #[test]
    fn construction_rejects_duplicate_ids() {
        let err = Todo::new(
            "m",
            vec![
                Item::new(id("1"), "a", "c"),
                Item::new(id("1"), "b", "c"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "plan-invalid");
    }

    #[test]
    fn construction_rejects_forward_dependency() {
        let err = Todo::new(
            "m",
            vec![
                Item::new(id("1"), "a", "c").with_dependencies(vec![id("2")]),
                Item::new(id("2"), "b", "c"),
            ],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "plan-invalid");
    }

    #[test]
    fn construction_rejects_unknown_dependency() {
        let err = Todo::new(
            "m",
            vec![Item::new(id("1"), "a", "c").with_dependencies(vec![id("9")])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "plan-invalid");
    }

    #[test]
    fn construction_rejects_self_dependency() {
        let err = Todo::new(
            "m",
            vec![Item::new(id("1"), "a", "c").with_dependencies(vec![id("1")])],
        )
        .unwrap_err();
        assert_eq!(err.kind(), "plan-invalid");
    }

    #[test]
    fn insert_children_assigns_hierarchical_ids() {
        let mut todo = two_item_todo();
        let ids = todo
            .insert_children(
                &id("1"),
                vec![
                    ItemDraft {
                        action: "step one".into(),
                        success_criteria: "ok".into(),
                        depends_on: vec![],
                    },
                    ItemDraft {
                        action: "step two".into(),
                        success_criteria: "ok".into(),
                        depends_on: vec![1],
                    },
                ],
            )
            .unwrap();
        assert_eq!(ids, vec![id("1.1"), id("1.2")]);

        // Children sit between parent and the dependent item.
        let order: Vec<&str> = todo.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["1", "1.1", "1.2", "2"]);

        // Second child depends on first sibling.
        assert_eq!(todo.get(&id("1.2")).unwrap().dependencies, vec![id("1.1")]);
    }

    #[test]
    fn insert_children_continues_numbering() {
        let mut todo = two_item_todo();
        todo.insert_children(
            &id("1"),
            vec![ItemDraft {
                action: "first".into(),
                success_criteria: "ok".into(),
                depends_on: vec![],
            }],
        )
        .unwrap();
        let ids = todo
            .insert_children(
                &id("1"),
                vec![ItemDraft {
                    action: "second".into(),
                    success_criteria: "ok".into(),
                    depends_on: vec![],
                }],
            )
            .unwrap();
        assert_eq!(ids, vec![id("1.2")]);
        let order: Vec<&str> = todo.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["1", "1.1", "1.2", "2"]);
    }

    #[test]
    fn insert_children_copies_parent_dependencies() {
        let mut todo = two_item_todo();
        let ids = todo
            .insert_children(
                &id("2"),
                vec![ItemDraft {
                    action: "retry write".into(),
                    success_criteria: "ok".into(),
                    depends_on: vec![],
                }],
            )
            .unwrap();
        assert_eq!(todo.get(&ids[0]).unwrap().dependencies, vec![id("1")]);
    }

    #[test]
    fn insert_children_rejects_forward_sibling_reference() {
        let mut todo = two_item_todo();
        let err = todo
            .insert_children(
                &id("1"),
                vec![ItemDraft {
                    action: "a".into(),
                    success_criteria: "ok".into(),
                    depends_on: vec![2],
                }],
            )
            .unwrap_err();
        assert_eq!(err.kind(), "plan-invalid");
    }

    #[test]
    fn substitution_rewrites_dependency_to_children() {
        let mut todo = two_item_todo();
        todo.get_mut(&id("1")).unwrap().status = ItemStatus::Replanned;
        todo.insert_children(
            &id("1"),
            vec![
                ItemDraft {
                    action: "a".into(),
                    success_criteria: "ok".into(),
                    depends_on: vec![],
                },
                ItemDraft {
                    action: "b".into(),
                    success_criteria: "ok".into(),
                    depends_on: vec![],
                },
            ],
        )
        .unwrap();

        let substituted = todo.substitute_dependency(&id("2"), &id("1")).unwrap();
        assert!(substituted);
        assert_eq!(
            todo.get(&id("2")).unwrap().dependencies,
            vec![id("1.1"), id("1.2")]
        );

        // Invariant: substituted deps still precede the dependent in
        // insertion order.
        todo.validate().unwrap();
        let dep_idx = todo.index_of(&id("1.2")).unwrap();
        let item_idx = todo.index_of(&id("2")).unwrap();
        assert!(dep_idx < item_idx);
    }

    #[test]
    fn substitution_without_children_is_a_noop() {
        let mut todo = two_item_todo();
        assert!(!todo.substitute_dependency(&id("2"), &id("1")).unwrap());
        assert_eq!(todo.get(&id("2")).unwrap().dependencies, vec![id("1")]);
    }

    #[test]
    fn unresolved_deps_tracks_completion() {
        let mut todo = two_item_todo();
        let item = todo.get(&id("2")).unwrap().clone();
        assert_eq!(todo.unresolved_deps(&item), vec![id("1")]);
        todo.get_mut(&id("1")).unwrap().status = ItemStatus::Completed;
        assert!(todo.unresolved_deps(&item).is_empty());
    }

    #[test]
    fn all_settled_counts_replanned_as_settled() {
        let mut todo = two_item_todo();
        todo.get_mut(&id("1")).unwrap().status = ItemStatus::Replanned;
        todo.get_mut(&id("2")).unwrap().status = ItemStatus::Skipped;
        assert!(todo.all_settled());
    }

    #[test]
    fn json_roundtrip_preserves_hierarchy() {
        let mut todo = two_item_todo();
        todo.get_mut(&id("1")).unwrap().status = ItemStatus::Replanned;
        todo.insert_children(
            &id("1"),
            vec![ItemDraft {
                action: "a".into(),
                success_criteria: "ok".into(),
                depends_on: vec![],
            }],
        )
        .unwrap();

        let json = serde_json::to_string(&todo).unwrap();
        let parsed: Todo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.items.len(), todo.items.len());
        for (a, b) in todo.items.iter().zip(parsed.items.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.status, b.status);
            assert_eq!(a.dependencies, b.dependencies);
        }
        parsed.validate().unwrap();
    }

    #[test]
    fn status_counts_aggregate() {
        let mut todo = two_item_todo();
        todo.get_mut(&id("1")).unwrap().status = ItemStatus::Completed;
        todo.get_mut(&id("2")).unwrap().status = ItemStatus::Failed;
        let counts = todo.status_counts();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.unfinished, 0);
    }
}
