pub mod classify;
pub mod policy;

use std::collections::BTreeMap;

use cpumask::CpuMask;
use log::info;

use crate::topology::ObjHandle;

// 软件视角的全局中断号
int_like!(IrqNumber, u32);

/// 中断的投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqType {
    Legacy,
    Msi,
    Msix,
    VirtEvent,
}

/// 中断所属的设备类别，顺序决定平衡时的优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum IrqClass {
    Other = 0,
    Legacy,
    Storage,
    Timer,
    Ethernet,
    Gbit,
    TenGbit,
    VirtEvent,
}

impl IrqClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IrqClass::Other => "other",
            IrqClass::Legacy => "legacy",
            IrqClass::Storage => "storage",
            IrqClass::Timer => "timer",
            IrqClass::Ethernet => "ethernet",
            IrqClass::Gbit => "gbit-ethernet",
            IrqClass::TenGbit => "10gbit-ethernet",
            IrqClass::VirtEvent => "virt-event",
        }
    }

    /// 类别到默认平衡层级的固定映射
    pub fn default_level(&self) -> BalanceLevel {
        match self {
            IrqClass::Other => BalanceLevel::Package,
            IrqClass::Legacy => BalanceLevel::Cache,
            _ => BalanceLevel::Core,
        }
    }
}

/// 中断被钉住的拓扑深度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceLevel {
    /// 完全不碰这个中断
    None,
    Package,
    Cache,
    #[default]
    Core,
}

bitflags! {
    pub struct IrqStatusFlags: u32 {
        const BANNED = 1 << 0;
    }
}

/// 单个中断的记录
#[derive(Debug, Clone)]
pub struct IrqInfo {
    pub irq: IrqNumber,
    pub irq_type: IrqType,
    pub class: IrqClass,
    pub level: BalanceLevel,
    /// NUMA节点号，-1表示未知/无NUMA
    pub numa_node: i32,
    /// 设备本地CPU集合（已去掉被ban的CPU）
    pub cpumask: CpuMask,
    pub affinity_hint: CpuMask,
    /// 当前被放置到的拓扑对象（层级与level一致）
    pub assigned_obj: Option<ObjHandle>,
    pub irq_count: u64,
    pub last_irq_count: u64,
    /// 本周期分得的负载切片，纳秒
    pub load: u64,
    /// 本周期内是否被迁移过
    pub moved: bool,
    pub flags: IrqStatusFlags,
}

impl IrqInfo {
    pub fn new(irq: IrqNumber, nr_cpus: usize) -> Self {
        Self {
            irq,
            irq_type: IrqType::Legacy,
            class: IrqClass::Other,
            level: BalanceLevel::default(),
            numa_node: -1,
            cpumask: CpuMask::full(nr_cpus),
            affinity_hint: CpuMask::new(nr_cpus),
            assigned_obj: None,
            irq_count: 0,
            last_irq_count: 0,
            load: 0,
            moved: false,
            flags: IrqStatusFlags::empty(),
        }
    }

    /// 本周期的计数增量
    pub fn count_delta(&self) -> u64 {
        self.irq_count.saturating_sub(self.last_irq_count)
    }
}

/// /proc/interrupts一行解析出的临时记录，只携带尽力而为的分类，
/// 等待sysfs扫描提供权威信息
#[derive(Debug, Clone, Copy)]
pub struct IrqStub {
    pub irq: IrqNumber,
    pub irq_type: IrqType,
    pub class: IrqClass,
}

/// 被跟踪中断的数据库
///
/// 一个中断号要么在interrupts表里，要么在banned表里，不会同时存在；
/// rebalance_queue只保存等待放置的中断号。
#[derive(Debug, Default)]
pub struct IrqDatabase {
    interrupts: BTreeMap<IrqNumber, IrqInfo>,
    banned: BTreeMap<IrqNumber, IrqInfo>,
    pub rebalance_queue: Vec<IrqNumber>,
}

impl IrqDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// 把一个中断加入禁止列表；重复调用是无害的
    pub fn add_banned_irq(&mut self, irq: IrqNumber, nr_cpus: usize) {
        if self.banned.contains_key(&irq) {
            return;
        }
        let mut info = IrqInfo::new(irq, nr_cpus);
        info.flags.insert(IrqStatusFlags::BANNED);
        self.banned.insert(irq, info);
    }

    pub fn is_banned(&self, irq: IrqNumber) -> bool {
        self.banned.contains_key(&irq)
    }

    /// 同时在两张表里查找
    pub fn get_irq_info(&self, irq: IrqNumber) -> Option<&IrqInfo> {
        self.interrupts.get(&irq).or_else(|| self.banned.get(&irq))
    }

    pub fn get_irq_info_mut(&mut self, irq: IrqNumber) -> Option<&mut IrqInfo> {
        if let Some(info) = self.interrupts.get_mut(&irq) {
            return Some(info);
        }
        return self.banned.get_mut(&irq);
    }

    /// 插入一条新记录；重复插入是no-op并打INFO日志
    pub fn insert(&mut self, info: IrqInfo) -> bool {
        if self.get_irq_info(info.irq).is_some() {
            info!("dropping duplicate entry for irq {}", info.irq.data());
            return false;
        }
        self.interrupts.insert(info.irq, info);
        return true;
    }

    pub fn len(&self) -> usize {
        self.interrupts.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut IrqInfo> {
        self.interrupts.values_mut()
    }

    pub fn irq_numbers(&self) -> Vec<IrqNumber> {
        self.interrupts.keys().copied().collect()
    }

    /// 清空所有表和队列（rescan时整库重建）
    pub fn clear(&mut self) {
        self.interrupts.clear();
        self.banned.clear();
        self.rebalance_queue.clear();
    }

    /// 每个周期开始时清掉上一周期的负载切片
    pub fn clear_irq_stats(&mut self) {
        for info in self.iter_mut() {
            info.load = 0;
        }
    }

    pub fn clear_moved_flags(&mut self) {
        for info in self.iter_mut() {
            info.moved = false;
        }
    }

    /// 队列排序：类别升序、负载降序、中断号升序
    ///
    /// 原始的比较器不是全序关系，这里采用确定的字典序。
    pub fn sort_rebalance_queue(&mut self) {
        let keys: BTreeMap<IrqNumber, (IrqClass, u64)> = self
            .rebalance_queue
            .iter()
            .filter_map(|irq| {
                self.get_irq_info(*irq)
                    .map(|info| (*irq, (info.class, info.load)))
            })
            .collect();
        self.rebalance_queue.sort_by(|a, b| {
            let ka = keys.get(a).copied().unwrap_or((IrqClass::Other, 0));
            let kb = keys.get(b).copied().unwrap_or((IrqClass::Other, 0));
            ka.0.cmp(&kb.0)
                .then(kb.1.cmp(&ka.1))
                .then(a.cmp(b))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_banned_irq_is_idempotent() {
        let mut db = IrqDatabase::new();
        db.add_banned_irq(IrqNumber::new(5), 4);
        db.add_banned_irq(IrqNumber::new(5), 4);
        assert!(db.is_banned(IrqNumber::new(5)));
        assert_eq!(db.banned.len(), 1);
        // 被ban的中断不会进入interrupts表
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn test_get_irq_info_searches_both_tables() {
        let mut db = IrqDatabase::new();
        db.insert(IrqInfo::new(IrqNumber::new(1), 4));
        db.add_banned_irq(IrqNumber::new(2), 4);
        assert!(db.get_irq_info(IrqNumber::new(1)).is_some());
        assert!(db.get_irq_info(IrqNumber::new(2)).is_some());
        assert!(db.get_irq_info(IrqNumber::new(3)).is_none());
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut db = IrqDatabase::new();
        assert!(db.insert(IrqInfo::new(IrqNumber::new(9), 4)));
        assert!(!db.insert(IrqInfo::new(IrqNumber::new(9), 4)));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_default_level_mapping() {
        assert_eq!(IrqClass::Other.default_level(), BalanceLevel::Package);
        assert_eq!(IrqClass::Legacy.default_level(), BalanceLevel::Cache);
        assert_eq!(IrqClass::Storage.default_level(), BalanceLevel::Core);
        assert_eq!(IrqClass::Ethernet.default_level(), BalanceLevel::Core);
        assert_eq!(IrqClass::VirtEvent.default_level(), BalanceLevel::Core);
    }

    #[test]
    fn test_sort_rebalance_queue() {
        let mut db = IrqDatabase::new();
        let mk = |n: u32, class: IrqClass, load: u64| {
            let mut info = IrqInfo::new(IrqNumber::new(n), 4);
            info.class = class;
            info.load = load;
            info
        };
        db.insert(mk(1, IrqClass::Ethernet, 10));
        db.insert(mk(2, IrqClass::Other, 50));
        db.insert(mk(3, IrqClass::Ethernet, 90));
        db.insert(mk(4, IrqClass::Ethernet, 90));
        db.rebalance_queue = vec![
            IrqNumber::new(1),
            IrqNumber::new(2),
            IrqNumber::new(3),
            IrqNumber::new(4),
        ];
        db.sort_rebalance_queue();
        // 类别升序在前，同类别负载降序，同负载按中断号
        assert_eq!(
            db.rebalance_queue,
            vec![
                IrqNumber::new(2),
                IrqNumber::new(3),
                IrqNumber::new(4),
                IrqNumber::new(1),
            ]
        );
    }
}
