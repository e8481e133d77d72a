pub mod numa;

use std::path::{Path, PathBuf};

use cpumask::CpuMask;
use log::{info, warn};

use crate::config::BalanceConfig;
use crate::irq::{IrqDatabase, IrqNumber};
use crate::libs::sysfs;

/// 拓扑对象的层级，自顶向下
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoKind {
    Node,
    Package,
    Cache,
    Cpu,
}

impl TopoKind {
    /// 下一层的类型；Cpu是叶子
    pub fn child_kind(&self) -> Option<TopoKind> {
        match self {
            TopoKind::Node => Some(TopoKind::Package),
            TopoKind::Package => Some(TopoKind::Cache),
            TopoKind::Cache => Some(TopoKind::Cpu),
            TopoKind::Cpu => None,
        }
    }
}

/// 指向树中某个对象的句柄（层级+下标）
///
/// 树在rescan时整体重建，句柄不能跨rescan保存。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjHandle {
    pub kind: TopoKind,
    pub index: usize,
}

/// 拓扑树中的一个节点：NUMA节点、物理package、缓存域或逻辑CPU
#[derive(Debug, Clone)]
pub struct TopoObj {
    pub kind: TopoKind,
    /// 内核赋予的编号（NUMA节点号、physical_package_id、缓存域序号、CPU号）
    pub number: i32,
    /// 本对象之下所有未被ban的CPU
    pub mask: CpuMask,
    pub parent: Option<ObjHandle>,
    pub children: Vec<ObjHandle>,
    /// 直接放置在本对象上的中断
    pub interrupts: Vec<IrqNumber>,
    /// 本周期计算出的负载，纳秒
    pub load: u64,
    /// 上一周期的(irq+softirq) jiffies计数，只在CPU层使用
    pub last_load: u64,
}

impl TopoObj {
    fn new(kind: TopoKind, number: i32, mask: CpuMask) -> Self {
        Self {
            kind,
            number,
            mask,
            parent: None,
            children: Vec::new(),
            interrupts: Vec::new(),
            load: 0,
            last_load: 0,
        }
    }
}

/// NUMA节点→package→缓存域→CPU的层次结构
///
/// 各层对象保存在独立的数组里，树边用`ObjHandle`表示，
/// 避免父子之间的循环引用。
#[derive(Debug)]
pub struct CpuTree {
    pub nbits: usize,
    pub nodes: Vec<TopoObj>,
    pub packages: Vec<TopoObj>,
    pub cache_domains: Vec<TopoObj>,
    pub cpus: Vec<TopoObj>,
    /// 含被ban槽位在内的CPU槽位数（与/proc/interrupts的列数对应）
    pub core_count: usize,
    pub package_count: usize,
    pub cache_domain_count: usize,
    pub banned_cpus: CpuMask,
    pub unbanned_cpus: CpuMask,
    pub numa_avail: bool,
}

impl CpuTree {
    /// 从sysfs构建整棵树
    pub fn build(config: &BalanceConfig, banned_cpus: CpuMask, nbits: usize) -> Self {
        let unbanned_cpus = banned_cpus.complement();
        let mut tree = Self {
            nbits,
            nodes: Vec::new(),
            packages: Vec::new(),
            cache_domains: Vec::new(),
            cpus: Vec::new(),
            core_count: 0,
            package_count: 0,
            cache_domain_count: 0,
            banned_cpus,
            unbanned_cpus,
            numa_avail: false,
        };
        tree.build_numa_node_list(config);
        tree.parse_cpu_tree(config);
        return tree;
    }

    pub fn obj(&self, handle: ObjHandle) -> &TopoObj {
        &self.level(handle.kind)[handle.index]
    }

    pub fn obj_mut(&mut self, handle: ObjHandle) -> &mut TopoObj {
        &mut self.level_mut(handle.kind)[handle.index]
    }

    pub fn level(&self, kind: TopoKind) -> &[TopoObj] {
        match kind {
            TopoKind::Node => &self.nodes,
            TopoKind::Package => &self.packages,
            TopoKind::Cache => &self.cache_domains,
            TopoKind::Cpu => &self.cpus,
        }
    }

    pub fn level_mut(&mut self, kind: TopoKind) -> &mut Vec<TopoObj> {
        match kind {
            TopoKind::Node => &mut self.nodes,
            TopoKind::Package => &mut self.packages,
            TopoKind::Cache => &mut self.cache_domains,
            TopoKind::Cpu => &mut self.cpus,
        }
    }

    pub fn level_len(&self, kind: TopoKind) -> usize {
        self.level(kind).len()
    }

    /// 在线且未被ban的CPU数量
    pub fn get_cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn find_cpu_core(&self, cpunr: i32) -> Option<ObjHandle> {
        self.cpus
            .iter()
            .position(|c| c.number == cpunr)
            .map(|index| ObjHandle {
                kind: TopoKind::Cpu,
                index,
            })
    }

    /// CPU层以上的负载在每个周期重新累计
    pub fn reset_load_above_cpus(&mut self) {
        for kind in [TopoKind::Cache, TopoKind::Package, TopoKind::Node] {
            for obj in self.level_mut(kind).iter_mut() {
                obj.load = 0;
            }
        }
    }

    /// 遍历系统所有CPU，数据来源 <sysfs>/devices/system/cpu/cpu<N>
    fn parse_cpu_tree(&mut self, config: &BalanceConfig) {
        let cpu_dir = config.sysfs_root.join("devices/system/cpu");
        let mut cpu_numbers = Vec::new();
        let Ok(entries) = std::fs::read_dir(&cpu_dir) else {
            warn!("cannot read {}, topology is empty", cpu_dir.display());
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // cpufreq/cpuidle等目录不统计，仅统计cpu<N>目录
            if let Some(rest) = name.strip_prefix("cpu") {
                if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(num) = rest.parse::<i32>() {
                        cpu_numbers.push(num);
                    }
                }
            }
        }
        cpu_numbers.sort_unstable();

        for num in cpu_numbers {
            self.do_one_cpu(config, num, &cpu_dir.join(format!("cpu{}", num)));
        }
    }

    fn do_one_cpu(&mut self, config: &BalanceConfig, cpu_number: i32, path: &Path) {
        // 跳过下线的CPU
        if let Some(online) = sysfs::read_trimmed(&path.join("online")) {
            if online.starts_with('0') {
                return;
            }
        }

        let mut cpu_mask = CpuMask::new(self.nbits);
        cpu_mask.set(cpu_number as usize, true);

        // 被ban的CPU不进入树，但槽位要计数
        if cpu_mask.intersects(&self.banned_cpus) {
            self.core_count += 1;
            return;
        }

        let package_mask = self
            .read_mask(&path.join("topology/core_siblings"))
            .unwrap_or_else(|| cpu_mask.clone());
        let packageid: i32 = sysfs::read_int(&path.join("topology/physical_package_id")).unwrap_or(0);

        let cache_mask = self
            .deepest_cache_mask(config, path)
            .unwrap_or_else(|| cpu_mask.clone());

        let nodeid = if self.numa_avail {
            Self::cpu_node_id(path)
        } else {
            -1
        };

        // 从各掩码中去掉被ban的CPU，中断永远不会被指向它们
        let mut cache_mask = cache_mask;
        let mut package_mask = package_mask;
        cache_mask.bit_and(&self.unbanned_cpus);
        package_mask.bit_and(&self.unbanned_cpus);

        let cpu = ObjHandle {
            kind: TopoKind::Cpu,
            index: self.cpus.len(),
        };
        self.cpus
            .push(TopoObj::new(TopoKind::Cpu, cpu_number, cpu_mask));

        let cache = self.add_cpu_to_cache_domain(cpu, cache_mask);
        let package = self.add_cache_domain_to_package(cache, packageid, package_mask);
        self.add_package_to_node(package, nodeid);

        self.core_count += 1;
    }

    /// 最深可用的缓存层：遍历cache/index{1,2,…}/shared_cpu_map，
    /// 受deepest_cache配置封顶
    fn deepest_cache_mask(&self, config: &BalanceConfig, path: &Path) -> Option<CpuMask> {
        let mut deepest: Option<PathBuf> = None;
        let mut index = 1u32;
        loop {
            let candidate = path.join(format!("cache/index{}/shared_cpu_map", index));
            if !candidate.exists() {
                break;
            }
            deepest = Some(candidate);
            if index == config.deepest_cache {
                break;
            }
            index += 1;
        }
        return self.read_mask(&deepest?);
    }

    /// CPU目录下的node<K>条目给出其NUMA节点号
    fn cpu_node_id(path: &Path) -> i32 {
        let Ok(entries) = std::fs::read_dir(path) else {
            return -1;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(id) = rest.parse::<i32>() {
                    return id;
                }
            }
        }
        return -1;
    }

    fn read_mask(&self, path: &Path) -> Option<CpuMask> {
        let text = sysfs::read_trimmed(path)?;
        match CpuMask::parse(&text, self.nbits) {
            Ok(mask) => Some(mask),
            Err(e) => {
                warn!("unparseable cpu mask in {}: {}", path.display(), e);
                None
            }
        }
    }

    /// 把CPU挂到共享同一缓存掩码的缓存域下，不存在则新建
    fn add_cpu_to_cache_domain(&mut self, cpu: ObjHandle, cache_mask: CpuMask) -> ObjHandle {
        let index = match self
            .cache_domains
            .iter()
            .position(|c| c.mask == cache_mask)
        {
            Some(index) => index,
            None => {
                let number = self.cache_domain_count as i32;
                self.cache_domains
                    .push(TopoObj::new(TopoKind::Cache, number, cache_mask));
                self.cache_domain_count += 1;
                self.cache_domains.len() - 1
            }
        };
        let cache = ObjHandle {
            kind: TopoKind::Cache,
            index,
        };
        if !self.cache_domains[index].children.contains(&cpu) {
            self.cache_domains[index].children.push(cpu);
            self.obj_mut(cpu).parent = Some(cache);
        }
        return cache;
    }

    /// 把缓存域挂到对应package下，不存在则新建
    fn add_cache_domain_to_package(
        &mut self,
        cache: ObjHandle,
        packageid: i32,
        package_mask: CpuMask,
    ) -> ObjHandle {
        let index = match self.packages.iter().position(|p| p.mask == package_mask) {
            Some(index) => {
                if self.packages[index].number != packageid {
                    warn!("package_mask with different physical_package_id found!");
                }
                index
            }
            None => {
                self.packages
                    .push(TopoObj::new(TopoKind::Package, packageid, package_mask));
                self.package_count += 1;
                self.packages.len() - 1
            }
        };
        let package = ObjHandle {
            kind: TopoKind::Package,
            index,
        };
        if !self.packages[index].children.contains(&cache) {
            self.packages[index].children.push(cache);
            self.obj_mut(cache).parent = Some(package);
        }
        return package;
    }

    /// debug模式下打印整棵树
    pub fn dump(&self, db: &IrqDatabase) {
        for node in &self.nodes {
            info!(
                "NUMA node {}: cpu mask is {} (load {})",
                node.number, node.mask, node.load
            );
        }
        for package in &self.packages {
            info!(
                "Package {}: numa_node is {} cpu mask is {} (load {})",
                package.number,
                self.parent_node_number(package),
                package.mask,
                package.load
            );
            self.dump_irqs(db, &package.interrupts, 2);
            for cache in &package.children {
                let cache_obj = self.obj(*cache);
                info!(
                    "        Cache domain {}: cpu mask is {} (load {})",
                    cache_obj.number, cache_obj.mask, cache_obj.load
                );
                self.dump_irqs(db, &cache_obj.interrupts, 10);
                for cpu in &cache_obj.children {
                    let cpu_obj = self.obj(*cpu);
                    info!(
                        "                CPU number {} (load {})",
                        cpu_obj.number, cpu_obj.load
                    );
                    self.dump_irqs(db, &cpu_obj.interrupts, 18);
                }
            }
        }
    }

    fn parent_node_number(&self, package: &TopoObj) -> i32 {
        package
            .parent
            .map(|node| self.obj(node).number)
            .unwrap_or(-1)
    }

    fn dump_irqs(&self, db: &IrqDatabase, irqs: &[IrqNumber], indent: usize) {
        for irq in irqs {
            if let Some(info) = db.get_irq_info(*irq) {
                info!(
                    "{:indent$}Interrupt {} node_num is {} ({}/{})",
                    "",
                    info.irq.data(),
                    info.numa_node,
                    info.class.as_str(),
                    info.load,
                    indent = indent
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::FakeMachine;

    #[test]
    fn test_two_package_machine() {
        let machine = FakeMachine::two_packages();
        let config = machine.config();
        let tree = CpuTree::build(&config, CpuMask::new(4), 4);

        assert_eq!(tree.core_count, 4);
        assert_eq!(tree.package_count, 2);
        assert_eq!(tree.cache_domain_count, 2);
        assert_eq!(tree.get_cpu_count(), 4);
        assert_eq!(tree.nodes.len(), 2); // node0 + 未指定节点

        // 每个CPU都有cache→package→node的父链
        for index in 0..tree.cpus.len() {
            let cpu = &tree.cpus[index];
            let cache = tree.obj(cpu.parent.unwrap());
            assert_eq!(cache.kind, TopoKind::Cache);
            let package = tree.obj(cache.parent.unwrap());
            assert_eq!(package.kind, TopoKind::Package);
            let node = tree.obj(package.parent.unwrap());
            assert_eq!(node.kind, TopoKind::Node);
            // 父对象的掩码覆盖子对象
            assert!(cache.mask.get(cpu.number as usize));
            assert!(package.mask.get(cpu.number as usize));
        }
    }

    #[test]
    fn test_offline_cpu_is_skipped() {
        let mut machine = FakeMachine::two_packages();
        machine.set_online(3, false);
        let config = machine.config();
        let tree = CpuTree::build(&config, CpuMask::new(4), 4);

        // 下线的CPU既不进树也不计入槽位
        assert_eq!(tree.core_count, 3);
        assert_eq!(tree.get_cpu_count(), 3);
        assert!(tree.find_cpu_core(3).is_none());
    }

    #[test]
    fn test_banned_cpu_counted_but_not_placed() {
        let machine = FakeMachine::two_packages();
        let config = machine.config();
        let banned = CpuMask::parse("3", 4).unwrap(); // ban CPU0和CPU1
        let tree = CpuTree::build(&config, banned, 4);

        assert_eq!(tree.core_count, 4);
        assert_eq!(tree.get_cpu_count(), 2);
        assert!(tree.find_cpu_core(0).is_none());
        assert!(tree.find_cpu_core(2).is_some());
        // package0被整个ban掉后不再出现
        assert_eq!(tree.package_count, 1);
        // 所有掩码都不含被ban的CPU
        for package in &tree.packages {
            assert!(!package.mask.intersects(&tree.banned_cpus));
        }
        assert_eq!(
            tree.unbanned_cpus.iter_cpu().collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_rebuild_is_stable() {
        let machine = FakeMachine::two_packages();
        let config = machine.config();
        let a = CpuTree::build(&config, CpuMask::new(4), 4);
        let b = CpuTree::build(&config, CpuMask::new(4), 4);
        assert_eq!(
            (a.package_count, a.cache_domain_count, a.core_count),
            (b.package_count, b.cache_domain_count, b.core_count)
        );
    }

    #[test]
    fn test_deepest_cache_cap() {
        let machine = FakeMachine::two_packages();
        let mut config = machine.config();
        // index2共享整个package，index1只有CPU自己；
        // 封顶到1之后每个CPU各自成为一个缓存域
        config.deepest_cache = 1;
        let tree = CpuTree::build(&config, CpuMask::new(4), 4);
        assert_eq!(tree.cache_domain_count, 4);
    }

    #[test]
    fn test_numa_node_binding() {
        let machine = FakeMachine::two_packages();
        let config = machine.config();
        let tree = CpuTree::build(&config, CpuMask::new(4), 4);
        // 所有package都挂在node0下
        let node0 = tree.get_numa_node(0).unwrap();
        assert_eq!(tree.obj(node0).children.len(), 2);
    }
}
