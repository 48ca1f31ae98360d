//! Hierarchical queues
//!
//! Queues form a tree addressed by dot-separated names under `root`, e.g.
//! `root.kmeans.app1`. Only leaves hold tasks; inner queues exist to group
//! leaves for fair sharing. Names are accepted with or without the `root.`
//! prefix.

use accelet_core::{AcceletError, AcceletResult, Allocation, TaskId, TaskRef};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use crate::schedulable::SchedulableTask;

/// Name of the queue at the top of the tree
pub const ROOT_QUEUE: &str = "root";

/// One node of the queue tree
#[derive(Debug)]
pub struct SchedulableQueue {
    name: String,
    parent: Option<String>,
    /// Full names of the children, in creation order
    children: Vec<String>,
    is_leaf: bool,
    pending: VecDeque<SchedulableTask>,
    running: Vec<SchedulableTask>,
}

impl SchedulableQueue {
    fn new(name: String, parent: Option<String>, is_leaf: bool) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            is_leaf,
            pending: VecDeque::new(),
            running: Vec::new(),
        }
    }

    /// Full name, including the `root.` prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last segment of the name
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &SchedulableTask> {
        self.pending.iter()
    }

    pub fn running(&self) -> impl Iterator<Item = &SchedulableTask> {
        self.running.iter()
    }

    /// No tasks and no children
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty() && self.children.is_empty()
    }

    /// Next task to be offered a core
    pub fn head(&self) -> Option<&SchedulableTask> {
        self.pending.front()
    }

    pub fn push_pending(&mut self, task: SchedulableTask) {
        self.pending.push_back(task);
    }

    /// Move the head from pending to running with its assigned core
    pub fn promote_head(&mut self, allocation: Allocation) -> Option<TaskRef> {
        let mut task = self.pending.pop_front()?;
        task.set_allocation(allocation);
        let handle = task.task().clone();
        self.running.push(task);
        Some(handle)
    }

    pub fn remove_pending(&mut self, task_id: &TaskId) -> Option<SchedulableTask> {
        let pos = self.pending.iter().position(|t| t.task_id() == task_id)?;
        self.pending.remove(pos)
    }

    pub fn remove_running(&mut self, task_id: &TaskId) -> Option<SchedulableTask> {
        let pos = self.running.iter().position(|t| t.task_id() == task_id)?;
        Some(self.running.remove(pos))
    }

    pub fn find_running(&self, task_id: &TaskId) -> Option<&SchedulableTask> {
        self.running.iter().find(|t| t.task_id() == task_id)
    }
}

/// Pending and running counts of one leaf queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueLength {
    pub queue: String,
    pub pending: usize,
    pub running: usize,
}

/// Owns the queue tree
#[derive(Debug)]
pub struct QueueManager {
    queues: HashMap<String, SchedulableQueue>,
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueManager {
    /// Create a tree holding only the root queue
    pub fn new() -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            ROOT_QUEUE.to_string(),
            SchedulableQueue::new(ROOT_QUEUE.to_string(), None, false),
        );
        Self { queues }
    }

    /// A name segment must be non-empty and carry no surrounding whitespace
    pub fn is_queue_name_valid(name: &str) -> bool {
        !name.is_empty() && name.trim() == name
    }

    /// Validate `name` and return its full form
    fn qualify(name: &str) -> AcceletResult<String> {
        if let Some(bad) = name.split('.').find(|s| !Self::is_queue_name_valid(s)) {
            return Err(AcceletError::Config(format!(
                "Illegal queue name {:?}: segment {:?} is empty or padded with whitespace",
                name, bad
            )));
        }
        if name == ROOT_QUEUE || name.starts_with("root.") {
            Ok(name.to_string())
        } else {
            Ok(format!("{}.{}", ROOT_QUEUE, name))
        }
    }

    /// Leaf queue called `name`, created with its missing ancestors if `create`.
    ///
    /// Returns `None` when the queue is absent and `create` is false, when
    /// `name` is an inner queue, or when an ancestor is already a leaf.
    pub fn get_leaf_queue(
        &mut self,
        name: &str,
        create: bool,
    ) -> AcceletResult<Option<&mut SchedulableQueue>> {
        self.get_queue(name, create, true)
    }

    /// Inner queue called `name`, created with its missing ancestors if `create`
    pub fn get_parent_queue(
        &mut self,
        name: &str,
        create: bool,
    ) -> AcceletResult<Option<&mut SchedulableQueue>> {
        self.get_queue(name, create, false)
    }

    fn get_queue(
        &mut self,
        name: &str,
        create: bool,
        leaf: bool,
    ) -> AcceletResult<Option<&mut SchedulableQueue>> {
        let full = Self::qualify(name)?;

        match self.queues.get(&full).map(|q| q.is_leaf) {
            Some(is_leaf) if is_leaf == leaf => return Ok(self.queues.get_mut(&full)),
            Some(_) => return Ok(None),
            None if !create => return Ok(None),
            None => {}
        }

        // every ancestor of the new queue must be an inner queue
        let ancestors: Vec<String> = ancestors_of(&full);
        if ancestors
            .iter()
            .any(|a| self.queues.get(a).is_some_and(|q| q.is_leaf))
        {
            return Ok(None);
        }

        for pair in ancestors.windows(2) {
            if !self.queues.contains_key(&pair[1]) {
                self.attach(pair[1].clone(), &pair[0], false);
            }
        }
        let parent = ancestors.last().cloned().unwrap_or_else(|| ROOT_QUEUE.to_string());
        self.attach(full.clone(), &parent, leaf);

        Ok(self.queues.get_mut(&full))
    }

    fn attach(&mut self, name: String, parent: &str, is_leaf: bool) {
        if let Some(p) = self.queues.get_mut(parent) {
            p.children.push(name.clone());
        }
        info!(queue = %name, leaf = is_leaf, "Created queue");
        self.queues.insert(
            name.clone(),
            SchedulableQueue::new(name, Some(parent.to_string()), is_leaf),
        );
    }

    /// Existing queue of any kind
    pub fn get(&self, name: &str) -> Option<&SchedulableQueue> {
        let full = Self::qualify(name).ok()?;
        self.queues.get(&full)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SchedulableQueue> {
        let full = Self::qualify(name).ok()?;
        self.queues.get_mut(&full)
    }

    /// All leaf queues in tree order
    pub fn leaf_queues(&self) -> Vec<&SchedulableQueue> {
        let mut leaves = Vec::new();
        let mut stack = vec![ROOT_QUEUE];
        while let Some(name) = stack.pop() {
            let Some(queue) = self.queues.get(name) else {
                continue;
            };
            if queue.is_leaf {
                leaves.push(queue);
            }
            stack.extend(queue.children.iter().rev().map(String::as_str));
        }
        leaves
    }

    /// Number of queues, root included
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Remove `name` and detach it from its parent if it holds nothing.
    ///
    /// The root queue is never removed.
    pub fn remove_queue_if_empty(&mut self, name: &str) -> bool {
        let Ok(full) = Self::qualify(name) else {
            return false;
        };
        if full == ROOT_QUEUE {
            return false;
        }
        let parent = match self.queues.get(&full) {
            Some(queue) if queue.is_empty() => queue.parent.clone(),
            _ => return false,
        };

        self.queues.remove(&full);
        if let Some(p) = parent.and_then(|p| self.queues.get_mut(&p)) {
            p.children.retain(|c| *c != full);
        }
        debug!(queue = %full, "Removed empty queue");
        true
    }

    /// (pending, running) over the subtree rooted at `name`
    fn subtree_load(&self, name: &str) -> (usize, usize) {
        let Some(queue) = self.queues.get(name) else {
            return (0, 0);
        };
        queue
            .children
            .iter()
            .map(|c| self.subtree_load(c))
            .fold((queue.pending.len(), queue.running.len()), |acc, l| {
                (acc.0 + l.0, acc.1 + l.1)
            })
    }

    fn is_active(&self, name: &str) -> bool {
        let (pending, running) = self.subtree_load(name);
        pending + running > 0
    }

    /// Share of the node this queue is entitled to.
    ///
    /// At each level the share is split evenly across siblings that have
    /// work; an idle queue is counted as if it had work.
    pub fn fair_share(&self, name: &str) -> Option<f64> {
        let full = Self::qualify(name).ok()?;
        let mut queue = self.queues.get(&full)?;
        let mut share = 1.0;
        while let Some(parent) = queue.parent.as_deref().and_then(|p| self.queues.get(p)) {
            let mut active = parent
                .children
                .iter()
                .filter(|c| self.is_active(c))
                .count();
            if !self.is_active(&queue.name) {
                active += 1;
            }
            share /= active as f64;
            queue = parent;
        }
        Some(share)
    }

    /// Leaf queues in the order a scheduling pass visits them.
    ///
    /// Siblings are visited by ascending `running / weight`, where the weight
    /// belongs to the workload the subtree serves; equal ratios keep creation
    /// order.
    pub fn scheduling_order<F>(&self, weight: F) -> Vec<String>
    where
        F: Fn(&str) -> f32,
    {
        let mut order = Vec::new();
        self.visit(ROOT_QUEUE, &weight, &mut order);
        order
    }

    fn visit<F>(&self, name: &str, weight: &F, order: &mut Vec<String>)
    where
        F: Fn(&str) -> f32,
    {
        let Some(queue) = self.queues.get(name) else {
            return;
        };
        if queue.is_leaf {
            order.push(queue.name.clone());
            return;
        }

        let mut children: Vec<(f32, &str)> = queue
            .children
            .iter()
            .map(|c| {
                let (_, running) = self.subtree_load(c);
                (running as f32 / weight(workload_of(c)), c.as_str())
            })
            .collect();
        children.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (_, child) in children {
            self.visit(child, weight, order);
        }
    }

    /// Pending and running counts of every leaf
    pub fn queue_lengths(&self) -> Vec<QueueLength> {
        self.leaf_queues()
            .into_iter()
            .map(|q| QueueLength {
                queue: q.name.clone(),
                pending: q.pending.len(),
                running: q.running.len(),
            })
            .collect()
    }
}

/// Full names of the proper ancestors of `full`, root first
fn ancestors_of(full: &str) -> Vec<String> {
    let segments: Vec<&str> = full.split('.').collect();
    (1..segments.len())
        .map(|n| segments[..n].join("."))
        .collect()
}

/// Workload served by a queue: its first segment under root
fn workload_of(full: &str) -> &str {
    full.split('.').nth(1).unwrap_or(full)
}
