//! Accelerator card bookkeeping: total capability, used capability and which
//! task holds which core

use accelet_core::{
    AcceleratorConfig, AcceleratorResource, AcceleratorResourceSet, AcceletResult, TaskId,
    WorkerType,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// One physical accelerator card as seen by the scheduler
pub struct Accelerator {
    card_id: String,
    card_index: usize,
    core_index_base: i32,
    worker: WorkerType,
    /// Every core of the card, fixed at construction
    total: AcceleratorResourceSet,
    /// Cores currently assigned to tasks
    used: AcceleratorResourceSet,
    /// Owner of each assigned core
    launched: HashMap<TaskId, AcceleratorResource>,
}

impl Accelerator {
    /// Build a card from configuration, numbering its cores from `core_index_base`
    pub fn new(
        config: &AcceleratorConfig,
        card_index: usize,
        core_index_base: i32,
    ) -> AcceletResult<Self> {
        let total: AcceleratorResourceSet = config.resources(core_index_base)?.into_iter().collect();

        info!(
            card = %config.id,
            worker = %config.worker,
            cores = total.num(),
            core_index_base = core_index_base,
            "Accelerator initialized"
        );

        Ok(Self {
            card_id: config.id.clone(),
            card_index,
            core_index_base,
            worker: config.worker,
            total,
            used: AcceleratorResourceSet::new(),
            launched: HashMap::new(),
        })
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn card_index(&self) -> usize {
        self.card_index
    }

    pub fn core_index_base(&self) -> i32 {
        self.core_index_base
    }

    pub fn worker(&self) -> WorkerType {
        self.worker
    }

    /// Total capability of the card
    pub fn resource_capability(&self) -> &AcceleratorResourceSet {
        &self.total
    }

    /// Capability currently assigned to tasks
    pub fn used_capability(&self) -> &AcceleratorResourceSet {
        &self.used
    }

    /// Whether `resource` is one of this card's cores
    pub fn owns(&self, resource: &AcceleratorResource) -> bool {
        self.total.contains_resource(resource)
    }

    /// Unused cores of `workload`, highest frequency first.
    ///
    /// Cores of equal frequency keep configuration order.
    pub fn available_cores(&self, workload: &str) -> Vec<AcceleratorResource> {
        let mut used: Vec<&AcceleratorResource> = self.used.of_workload(workload).collect();
        let mut available = Vec::new();
        for resource in self.total.of_workload(workload) {
            match used.iter().position(|u| *u == resource) {
                Some(pos) => {
                    used.swap_remove(pos);
                }
                None => available.push(resource.clone()),
            }
        }
        available.sort_by(|a, b| b.core_frequency.cmp(&a.core_frequency));
        available
    }

    /// Mark `resource` as used by `owner`.
    ///
    /// # Panics
    ///
    /// Panics if the core is not available on this card or `owner` already
    /// holds a core here. Either means the scheduler double-booked hardware.
    pub fn assign(&mut self, owner: &TaskId, resource: AcceleratorResource) {
        if let Some(held) = self.launched.get(owner) {
            panic!(
                "task {} already holds {} on card {}",
                owner, held, self.card_id
            );
        }
        if !self.available_cores(&resource.workload).contains(&resource) {
            panic!(
                "assigning unavailable core {} on card {}",
                resource, self.card_id
            );
        }

        debug!(card = %self.card_id, task_id = %owner, resource = %resource, "Assigning core");
        self.used.add(resource.clone());
        self.launched.insert(owner.clone(), resource);
        debug_assert!(self.total.contains(&self.used));
    }

    /// Return the core held by `owner` to the available pool
    ///
    /// # Panics
    ///
    /// Panics if `owner` holds no core on this card, i.e. on a double release.
    pub fn release(&mut self, owner: &TaskId) -> AcceleratorResource {
        let resource = match self.launched.remove(owner) {
            Some(resource) => resource,
            None => panic!(
                "task {} holds no core on card {}; double release",
                owner, self.card_id
            ),
        };
        if !self.used.remove(&resource) {
            panic!(
                "core {} of task {} missing from used set of card {}",
                resource, owner, self.card_id
            );
        }

        debug!(card = %self.card_id, task_id = %owner, resource = %resource, "Released core");
        resource
    }

    /// Core held by `owner`, if any
    pub fn assigned_resource(&self, owner: &TaskId) -> Option<&AcceleratorResource> {
        self.launched.get(owner)
    }

    /// Number of tasks holding a core on this card
    pub fn launched_tasks(&self) -> usize {
        self.launched.len()
    }

    pub fn report(&self) -> AcceleratorReport {
        AcceleratorReport {
            card_id: self.card_id.clone(),
            card_index: self.card_index,
            worker: self.worker,
            total: self.total.clone(),
            used: self.used.clone(),
            launched_tasks: self.launched.len(),
        }
    }
}

/// Point-in-time view of one card
#[derive(Debug, Clone, Serialize)]
pub struct AcceleratorReport {
    pub card_id: String,
    pub card_index: usize,
    pub worker: WorkerType,
    pub total: AcceleratorResourceSet,
    pub used: AcceleratorResourceSet,
    pub launched_tasks: usize,
}
