//! Accelerator resource model

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Core id meaning "not bound to any core yet"
pub const UNASSIGNED_CORE: i32 = -1;

/// Kind of physical device backing an accelerator card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    #[default]
    Fpga,
    Gpu,
    Cpu,
    Asic,
}

impl std::fmt::Display for WorkerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerType::Fpga => write!(f, "FPGA"),
            WorkerType::Gpu => write!(f, "GPU"),
            WorkerType::Cpu => write!(f, "CPU"),
            WorkerType::Asic => write!(f, "ASIC"),
        }
    }
}

/// A requested or offered slice of accelerator capacity.
///
/// Equality is structural over every field, so the same workload at two
/// different frequencies is two different resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AcceleratorResource {
    /// Workload the core is programmed for (e.g. "kmeans")
    pub workload: String,
    /// Core id, `UNASSIGNED_CORE` for "any core"
    pub core_id: i32,
    /// Core clock frequency in MHz
    pub core_frequency: i32,
    /// Core memory in MB
    pub core_memory: i64,
}

impl AcceleratorResource {
    /// Create a new resource
    pub fn new(
        workload: impl Into<String>,
        core_id: i32,
        core_frequency: i32,
        core_memory: i64,
    ) -> Self {
        Self {
            workload: workload.into(),
            core_id,
            core_frequency,
            core_memory,
        }
    }

    /// A request for any core of `workload`
    pub fn unassigned(workload: impl Into<String>) -> Self {
        Self::new(workload, UNASSIGNED_CORE, -1, -1)
    }

    /// Whether this resource is still unbound to a core
    pub fn is_unassigned(&self) -> bool {
        self.core_id == UNASSIGNED_CORE
    }

    /// True iff both share a workload and `a` has strictly less core memory than `b`
    pub fn less_than(a: &AcceleratorResource, b: &AcceleratorResource) -> bool {
        a.workload == b.workload && a.core_memory < b.core_memory
    }

    /// Same resource rebound to another core id
    pub fn with_core_id(mut self, core_id: i32) -> Self {
        self.core_id = core_id;
        self
    }
}

impl std::fmt::Display for AcceleratorResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<workload: {}, core: {}, frequency: {}MHz, memory: {}MB>",
            self.workload, self.core_id, self.core_frequency, self.core_memory
        )
    }
}

/// Multiset of resources kept in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorResourceSet {
    resources: Vec<AcceleratorResource>,
}

impl AcceleratorResourceSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resource; duplicates are kept
    pub fn add(&mut self, resource: AcceleratorResource) {
        self.resources.push(resource);
    }

    /// Append several resources
    pub fn add_all<I>(&mut self, resources: I)
    where
        I: IntoIterator<Item = AcceleratorResource>,
    {
        self.resources.extend(resources);
    }

    /// Remove one element equal to `resource`, returning whether one was found
    pub fn remove(&mut self, resource: &AcceleratorResource) -> bool {
        match self.resources.iter().position(|r| r == resource) {
            Some(idx) => {
                self.resources.remove(idx);
                true
            }
            None => false,
        }
    }

    /// True iff every resource of `other` has an equal element in this set.
    ///
    /// An empty `other` is always contained.
    pub fn contains(&self, other: &AcceleratorResourceSet) -> bool {
        other
            .resources
            .iter()
            .all(|wanted| self.resources.iter().any(|r| r == wanted))
    }

    /// Whether a single resource is present
    pub fn contains_resource(&self, resource: &AcceleratorResource) -> bool {
        self.resources.iter().any(|r| r == resource)
    }

    /// Distinct workload names present
    pub fn workloads(&self) -> BTreeSet<String> {
        self.resources.iter().map(|r| r.workload.clone()).collect()
    }

    /// Number of resources
    pub fn num(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// All resources in insertion order
    pub fn all_resources(&self) -> &[AcceleratorResource] {
        &self.resources
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AcceleratorResource> {
        self.resources.iter()
    }

    /// Resources of one workload in insertion order
    pub fn of_workload<'a>(
        &'a self,
        workload: &'a str,
    ) -> impl Iterator<Item = &'a AcceleratorResource> + 'a {
        self.resources.iter().filter(move |r| r.workload == workload)
    }
}

impl FromIterator<AcceleratorResource> for AcceleratorResourceSet {
    fn from_iter<I: IntoIterator<Item = AcceleratorResource>>(iter: I) -> Self {
        Self {
            resources: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a AcceleratorResourceSet {
    type Item = &'a AcceleratorResource;
    type IntoIter = std::slice::Iter<'a, AcceleratorResource>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kmeans(freq: i32) -> AcceleratorResource {
        AcceleratorResource::new("kmeans", 0, freq, 65536)
    }

    #[test]
    fn test_resource_equality() {
        assert_eq!(kmeans(200), kmeans(200));
        assert_ne!(kmeans(200), kmeans(250));
        assert_ne!(
            AcceleratorResource::new("kmeans", 0, 200, 1024),
            AcceleratorResource::new("kmeans", 0, 200, 2048)
        );
        assert_ne!(
            AcceleratorResource::new("kmeans", 0, 200, 1024),
            AcceleratorResource::new("loopback", 0, 200, 1024)
        );
        assert_ne!(kmeans(200), kmeans(200).with_core_id(3));
    }

    #[test]
    fn test_unassigned() {
        let ask = AcceleratorResource::unassigned("loopback");
        assert!(ask.is_unassigned());
        assert!(!kmeans(200).is_unassigned());
    }

    #[test]
    fn test_less_than() {
        let small = AcceleratorResource::new("kmeans", 0, 200, 128);
        let big = AcceleratorResource::new("kmeans", 1, 100, 256);
        let other = AcceleratorResource::new("loopback", 0, 200, 1024);

        assert!(AcceleratorResource::less_than(&small, &big));
        assert!(!AcceleratorResource::less_than(&big, &small));
        assert!(!AcceleratorResource::less_than(&small, &small));
        assert!(!AcceleratorResource::less_than(&small, &other));
    }

    #[test]
    fn test_set_keeps_duplicates() {
        let mut set = AcceleratorResourceSet::new();
        set.add(kmeans(200));
        set.add_all(vec![kmeans(200), kmeans(100)]);

        assert_eq!(set.num(), 3);
        assert_eq!(set.all_resources()[2], kmeans(100));
        assert_eq!(set.workloads().len(), 1);
    }

    #[test]
    fn test_set_contains() {
        let set: AcceleratorResourceSet = vec![
            AcceleratorResource::new("logistic", -1, -1, 65536),
            AcceleratorResource::new("kmeans", -1, -1, 65536),
        ]
        .into_iter()
        .collect();

        assert!(set.contains(&AcceleratorResourceSet::new()));
        assert!(set.contains(&set.clone()));

        let subset: AcceleratorResourceSet =
            std::iter::once(AcceleratorResource::new("logistic", -1, -1, 65536)).collect();
        assert!(set.contains(&subset));
        assert!(!AcceleratorResourceSet::new().contains(&set));

        let foreign: AcceleratorResourceSet =
            std::iter::once(AcceleratorResource::new("loopback", -1, -1, 65536)).collect();
        assert!(!set.contains(&foreign));
    }

    #[test]
    fn test_set_remove_one() {
        let mut set: AcceleratorResourceSet = vec![kmeans(200), kmeans(200)].into_iter().collect();
        assert!(set.remove(&kmeans(200)));
        assert_eq!(set.num(), 1);
        assert!(!set.remove(&kmeans(100)));
    }

    #[test]
    fn test_worker_type_display() {
        assert_eq!(WorkerType::Fpga.to_string(), "FPGA");
        assert_eq!(WorkerType::Gpu.to_string(), "GPU");
    }
}
