/*
 * SPDX-FileCopyrightText: 2025 Tommaso Fontana
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! NUMA topology detection and per-thread memory binding.
//!
//! With the `numa` feature the topology comes from hwloc (via `hwlocality`)
//! and workers bind their allocations to their node; otherwise the Linux
//! sysfs interface is parsed directly, and locality relies on CPU pinning
//! plus first-touch placement. Systems where neither works are treated as a
//! single node holding every CPU.

/// A NUMA node and the CPUs it hosts.
#[derive(Debug, Clone)]
pub struct NumaNode {
    pub node_id: usize,
    pub cpus: Vec<usize>,
}

/// The detected NUMA layout.
#[derive(Debug, Clone)]
pub struct NumaTopology {
    nodes: Vec<NumaNode>,
    logical_cpus: usize,
}

impl NumaTopology {
    /// Detects the topology, falling back to a single synthetic node.
    pub fn detect() -> Self {
        let logical_cpus = num_cpus::get();

        #[cfg(feature = "numa")]
        match detect_hwloc(logical_cpus) {
            Ok(nodes) if !nodes.is_empty() => {
                log::debug!("hwloc reports {} NUMA node(s)", nodes.len());
                return Self {
                    nodes,
                    logical_cpus,
                };
            }
            Ok(_) => {}
            Err(e) => log::debug!("hwloc topology detection failed: {e:#}"),
        }

        match detect_sysfs() {
            Ok(nodes) if !nodes.is_empty() => {
                log::debug!("sysfs reports {} NUMA node(s)", nodes.len());
                Self {
                    nodes,
                    logical_cpus,
                }
            }
            _ => {
                log::debug!("no NUMA topology available, assuming a single node");
                Self {
                    nodes: vec![NumaNode {
                        node_id: 0,
                        cpus: (0..logical_cpus).collect(),
                    }],
                    logical_cpus,
                }
            }
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn logical_cpus(&self) -> usize {
        self.logical_cpus
    }

    pub fn is_uma(&self) -> bool {
        self.nodes.len() == 1
    }

    /// The node hosting `cpu`; CPUs missing from the topology land on node 0.
    pub fn node_of_cpu(&self, cpu: usize) -> usize {
        self.nodes
            .iter()
            .find(|n| n.cpus.contains(&cpu))
            .map(|n| n.node_id)
            .unwrap_or(0)
    }
}

#[cfg(feature = "numa")]
fn detect_hwloc(logical_cpus: usize) -> anyhow::Result<Vec<NumaNode>> {
    use hwlocality::object::types::ObjectType;
    use hwlocality::Topology;

    let topology = Topology::new()?;
    let mut nodes = Vec::new();
    for node in topology.objects_with_type(ObjectType::NUMANode) {
        let (Some(node_id), Some(cpuset)) = (node.os_index(), node.cpuset()) else {
            continue;
        };
        let cpus = (0..logical_cpus).filter(|&cpu| cpuset.is_set(cpu)).collect();
        nodes.push(NumaNode { node_id, cpus });
    }
    nodes.sort_by_key(|n| n.node_id);
    Ok(nodes)
}

/// Parses `/sys/devices/system/node/node*/cpulist`.
fn detect_sysfs() -> anyhow::Result<Vec<NumaNode>> {
    let node_path = std::path::Path::new("/sys/devices/system/node");
    anyhow::ensure!(node_path.exists(), "no sysfs NUMA information");

    let mut nodes = Vec::new();
    for entry in std::fs::read_dir(node_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id) = name.strip_prefix("node") else {
            continue;
        };
        let Ok(node_id) = id.parse::<usize>() else {
            continue;
        };
        let cpulist = std::fs::read_to_string(entry.path().join("cpulist"))?;
        nodes.push(NumaNode {
            node_id,
            cpus: parse_cpulist(cpulist.trim()),
        });
    }
    nodes.sort_by_key(|n| n.node_id);
    Ok(nodes)
}

/// Parses a kernel cpulist such as `0-3,8,10-11`.
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for range in list.split(',') {
        let range = range.trim();
        if range.is_empty() {
            continue;
        }
        match range.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = range.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Binds the calling thread's memory allocation to `node_id`.
#[cfg(feature = "numa")]
pub(crate) fn bind_current_thread(node_id: usize) -> anyhow::Result<()> {
    use hwlocality::memory::binding::{MemoryBindingFlags, MemoryBindingPolicy};
    use hwlocality::object::types::ObjectType;
    use hwlocality::Topology;

    let topology = Topology::new()?;
    let node = topology
        .objects_with_type(ObjectType::NUMANode)
        .find(|n| n.os_index() == Some(node_id))
        .ok_or_else(|| anyhow::anyhow!("NUMA node {node_id} not in topology"))?;
    let nodeset = node
        .nodeset()
        .ok_or_else(|| anyhow::anyhow!("NUMA node {node_id} has no nodeset"))?;
    topology
        .bind_memory(nodeset, MemoryBindingPolicy::Bind, MemoryBindingFlags::THREAD)
        .map_err(|e| anyhow::anyhow!("bind_memory failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4-5"), vec![0, 2, 4, 5]);
        assert_eq!(parse_cpulist(""), Vec::<usize>::new());
    }

    #[test]
    fn test_detect() {
        let t = NumaTopology::detect();
        assert!(t.num_nodes() >= 1);
        assert!(t.logical_cpus() >= 1);
        // Every CPU maps to some node.
        for cpu in 0..t.logical_cpus() {
            let _ = t.node_of_cpu(cpu);
        }
    }
}
