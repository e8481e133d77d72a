//! NUMA节点列表的构建
//!
//! 数据来源 <sysfs>/devices/system/node/node<N>/cpumap。
//! 始终存在一个编号为-1的"未指定"节点，收留没有NUMA信息的package；
//! 它的掩码随挂入的package逐步累积。

use cpumask::CpuMask;
use log::warn;

use crate::config::BalanceConfig;
use crate::libs::sysfs;

use super::{CpuTree, ObjHandle, TopoKind, TopoObj};

/// 未指定NUMA节点的编号
pub const UNSPECIFIED_NODE: i32 = -1;

impl CpuTree {
    pub(super) fn build_numa_node_list(&mut self, config: &BalanceConfig) {
        self.nodes.push(TopoObj::new(
            TopoKind::Node,
            UNSPECIFIED_NODE,
            CpuMask::new(self.nbits),
        ));

        let node_dir = config.sysfs_root.join("devices/system/node");
        let Ok(entries) = std::fs::read_dir(&node_dir) else {
            return;
        };

        let mut numbers = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(num) = rest.parse::<i32>() {
                    numbers.push(num);
                }
            }
        }
        numbers.sort_unstable();

        for num in numbers {
            let cpumap = node_dir.join(format!("node{}/cpumap", num));
            let mut mask = match sysfs::read_trimmed(&cpumap)
                .and_then(|text| CpuMask::parse(&text, self.nbits).ok())
            {
                Some(mask) => mask,
                None => {
                    warn!("numa node {} has no usable cpumap, skipping", num);
                    continue;
                }
            };
            mask.bit_and(&self.unbanned_cpus);
            self.nodes.push(TopoObj::new(TopoKind::Node, num, mask));
            self.numa_avail = true;
        }
    }

    /// 按编号查找NUMA节点；-1返回未指定节点
    pub fn get_numa_node(&self, nodeid: i32) -> Option<ObjHandle> {
        self.nodes
            .iter()
            .position(|n| n.number == nodeid)
            .map(|index| ObjHandle {
                kind: TopoKind::Node,
                index,
            })
    }

    /// 把package挂到nodeid对应的节点下；未知节点退回未指定节点
    pub(super) fn add_package_to_node(&mut self, package: ObjHandle, nodeid: i32) {
        let node = self
            .get_numa_node(nodeid)
            .or_else(|| self.get_numa_node(UNSPECIFIED_NODE))
            .expect("unspecified numa node always exists");

        if !self.obj(node).children.contains(&package) {
            self.obj_mut(node).children.push(package);
            self.obj_mut(package).parent = Some(node);

            // 未指定节点没有cpumap，掩码由挂入的package累积
            if self.obj(node).number == UNSPECIFIED_NODE {
                let package_mask = self.obj(package).mask.clone();
                self.obj_mut(node).mask.bit_or(&package_mask);
            }
        }
    }
}
