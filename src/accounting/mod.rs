//! 内核计数器的采集与负载折算
//!
//! 每个周期读一次/proc/interrupts和/proc/stat，把CPU测得的
//! (irq+softirq)时间换算成纳秒负载，再沿拓扑树自底向上传播，
//! 并按计数增量把每个对象的负载切分给它直接持有的中断。

use log::warn;

use crate::config::BalanceConfig;
use crate::irq::{IrqClass, IrqDatabase, IrqNumber, IrqStub, IrqType};
use crate::topology::{CpuTree, ObjHandle, TopoKind};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// 解析/proc/interrupts，把数字开头的行收集成临时stub列表
///
/// 行尾的名字字段只能提供尽力而为的分类：xen-dyn-event属于虚拟
/// 事件通道，其余一律按Legacy/Other，等sysfs扫描来纠正。
pub fn collect_full_irq_list(config: &BalanceConfig) -> Vec<IrqStub> {
    let mut stubs = Vec::new();
    let path = config.procfs_root.join("interrupts");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return stubs;
    };

    let mut lines = content.lines();
    // 第一行是CPU编号表头，不需要
    if lines.next().is_none() {
        return stubs;
    }

    for line in lines {
        let trimmed = line.trim_start();
        // 以字母开头的行是NMI/LOC之类的专用计数器，到此为止
        if !trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            break;
        }
        let Some((number, _rest)) = trimmed.split_once(':') else {
            continue;
        };
        let Ok(number) = number.trim().parse::<u32>() else {
            continue;
        };

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let chip = if tokens.len() >= 2 {
            tokens[tokens.len() - 2]
        } else {
            ""
        };

        let (irq_type, class) = if chip.contains("xen-dyn-event") {
            (IrqType::VirtEvent, IrqClass::VirtEvent)
        } else {
            (IrqType::Legacy, IrqClass::Other)
        };
        stubs.push(IrqStub {
            irq: IrqNumber::new(number),
            irq_type,
            class,
        });
    }
    return stubs;
}

/// 计数器解析的跨周期状态
#[derive(Debug, Default)]
pub struct Accounting {
    /// /proc/interrupts里出现过"MSI"字样
    pub(crate) proc_int_has_msi: bool,
    /// sysfs扫描确实产出过MSI/MSI-X类型的中断
    pub(crate) msi_found_in_sysfs: bool,
}

impl Accounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析/proc/interrupts，刷新每个中断的计数
    ///
    /// 返回true表示发现了不一致（列数变化或未知中断），调用方
    /// 应当安排一次rescan；本次解析到此为止。
    pub fn parse_proc_interrupts(
        &mut self,
        config: &BalanceConfig,
        db: &mut IrqDatabase,
        core_count: usize,
    ) -> bool {
        let path = config.procfs_root.join("interrupts");
        let Ok(content) = std::fs::read_to_string(&path) else {
            warn!("cannot read {}", path.display());
            return false;
        };

        let mut need_rescan = false;
        let mut lines = content.lines();
        if lines.next().is_none() {
            return false;
        }

        for line in lines {
            if !self.proc_int_has_msi && line.contains("MSI") {
                self.proc_int_has_msi = true;
            }

            let trimmed = line.trim_start();
            if !trimmed.starts_with(|c: char| c.is_ascii_digit()) {
                break;
            }
            let Some((number, rest)) = trimmed.split_once(':') else {
                continue;
            };
            let Ok(number) = number.trim().parse::<u32>() else {
                continue;
            };

            // 各CPU列求和；列数和CPU槽位数不一致说明发生了热插拔
            let mut count: u64 = 0;
            let mut cpunr: usize = 0;
            for token in rest.split_whitespace() {
                let Ok(value) = token.parse::<u64>() else {
                    break;
                };
                count += value;
                cpunr += 1;
            }
            if cpunr != core_count {
                need_rescan = true;
                break;
            }

            let Some(info) = db.get_irq_info_mut(IrqNumber::new(number)) else {
                need_rescan = true;
                break;
            };
            info.last_irq_count = info.irq_count;
            info.irq_count = count;

            if matches!(info.irq_type, IrqType::Msi | IrqType::Msix) {
                self.msi_found_in_sysfs = true;
            }
        }

        if self.proc_int_has_msi && !self.msi_found_in_sysfs && !need_rescan {
            warn!("MSI interrupts found in /proc/interrupts");
            warn!("But none found in sysfs, you need to update your kernel");
            warn!("Until then, IRQs will be improperly classified");
            // 置位以免每个周期都重复这条警告
            self.msi_found_in_sysfs = true;
        }
        return need_rescan;
    }
}

/// 解析/proc/stat的cpu行并传播负载
///
/// 第6、7个数值字段是irq和softirq的jiffies计数；第一个周期只
/// 建立基线不计算负载。
pub fn parse_proc_stat(
    config: &BalanceConfig,
    tree: &mut CpuTree,
    db: &mut IrqDatabase,
    cycle_count: u64,
    hz: u64,
) {
    let path = config.procfs_root.join("stat");
    let Ok(content) = std::fs::read_to_string(&path) else {
        warn!("cannot open {}, balancing is broken", path.display());
        return;
    };

    let mut lines = content.lines();
    // 第一行是所有CPU的汇总
    if lines.next().is_none() {
        warn!("cannot read {}, balancing is broken", path.display());
        return;
    }

    let mut cpucount = 0usize;
    for line in lines {
        if !line.starts_with("cpu") {
            break;
        }
        let Some(name) = line.split_whitespace().next() else {
            break;
        };
        let Ok(cpunr) = name[3..].parse::<i32>() else {
            break;
        };

        if tree.banned_cpus.get(cpunr as usize) {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            break;
        }
        let (Ok(irq_load), Ok(softirq_load)) = (fields[6].parse::<u64>(), fields[7].parse::<u64>())
        else {
            break;
        };

        let Some(cpu) = tree.find_cpu_core(cpunr) else {
            break;
        };
        cpucount += 1;

        let obj = tree.obj_mut(cpu);
        let total = irq_load + softirq_load;
        if cycle_count > 0 {
            // jiffies差值换算成纳秒，提升整数分辨率
            let delta = total.saturating_sub(obj.last_load);
            obj.load = delta * (NSEC_PER_SEC / hz.max(1));
        }
        obj.last_load = total;
    }

    if cpucount != tree.get_cpu_count() {
        warn!("didn't collect load info for all cpus, balancing is broken");
        return;
    }

    propagate_loads(tree, db);
}

/// 把CPU层的负载逐层向上累计，并切分给各对象直接持有的中断
pub fn propagate_loads(tree: &mut CpuTree, db: &mut IrqDatabase) {
    tree.reset_load_above_cpus();
    for kind in [TopoKind::Cpu, TopoKind::Cache, TopoKind::Package, TopoKind::Node] {
        compute_irq_branch_load_share(tree, db, kind);
    }
}

fn compute_irq_branch_load_share(tree: &mut CpuTree, db: &mut IrqDatabase, kind: TopoKind) {
    for index in 0..tree.level_len(kind) {
        let handle = ObjHandle { kind, index };

        // CPU测到的负载由贡献它的子对象均摊；叶子除1
        let divisor = tree.obj(handle).children.len().max(1) as u64;
        tree.obj_mut(handle).load /= divisor;

        let irqs = tree.obj(handle).interrupts.clone();
        if !irqs.is_empty() {
            let local = get_parent_branch_irq_count_share(tree, db, handle).max(1);
            let slice = tree.obj(handle).load / local;
            for irq in &irqs {
                if let Some(info) = db.get_irq_info_mut(*irq) {
                    // 每个中断至少有1的负载
                    info.load = (info.count_delta() * slice).max(1);
                }
            }
        }

        let load = tree.obj(handle).load;
        if let Some(parent) = tree.obj(handle).parent {
            tree.obj_mut(parent).load += load;
        }
    }
}

/// 估算上层对象的中断计数里归属本分支的份额：父分支的份额按
/// 本层对象数稀释，再加上本对象直接持有的中断的计数增量
fn get_parent_branch_irq_count_share(
    tree: &CpuTree,
    db: &IrqDatabase,
    handle: ObjHandle,
) -> u64 {
    let obj = tree.obj(handle);
    let mut total: u64 = 0;

    if let Some(parent) = obj.parent {
        total = get_parent_branch_irq_count_share(tree, db, parent)
            / tree.level_len(handle.kind).max(1) as u64;
    }

    for irq in &obj.interrupts {
        total += db.get_irq_info(*irq).map(|i| i.count_delta()).unwrap_or(0);
    }
    return total;
}
