//! 放置引擎
//!
//! 对rebalance队列里的每个中断，从NUMA节点层开始沿树下降，
//! 每一步都选择与候选掩码相交且负载最小的子对象，直到到达
//! 该中断的平衡层级为止。

use cpumask::CpuMask;
use log::warn;

use crate::config::{BalanceConfig, HintPolicy};
use crate::irq::{BalanceLevel, IrqDatabase, IrqNumber};
use crate::topology::{CpuTree, ObjHandle, TopoKind};

impl BalanceLevel {
    /// 该层级对应的拓扑对象类型；None不放置
    fn target_kind(&self) -> Option<TopoKind> {
        match self {
            BalanceLevel::None => None,
            BalanceLevel::Package => Some(TopoKind::Package),
            BalanceLevel::Cache => Some(TopoKind::Cache),
            BalanceLevel::Core => Some(TopoKind::Cpu),
        }
    }
}

/// 把一个中断从当前位置拔下来，放回rebalance队列
pub fn force_rebalance_irq(tree: &mut CpuTree, db: &mut IrqDatabase, irq: IrqNumber) {
    let Some(info) = db.get_irq_info_mut(irq) else {
        return;
    };
    if info.level == BalanceLevel::None {
        return;
    }

    if let Some(obj) = info.assigned_obj.take() {
        tree.obj_mut(obj).interrupts.retain(|i| *i != irq);
        info.moved = true;
    }
    if !db.rebalance_queue.contains(&irq) {
        db.rebalance_queue.push(irq);
    }
}

/// 根据负载差决定哪些已放置的中断需要迁移
///
/// 只有迁移能严格缩小该层级的负载差时才动手：负载差大于中断
/// 自身的负载，就把最重对象上负载最小的那个合适中断重新排队。
/// 负载相等时永远不迁移，避免来回震荡。
pub fn update_migration_status(tree: &mut CpuTree, db: &mut IrqDatabase) {
    db.clear_moved_flags();

    for kind in [TopoKind::Package, TopoKind::Cache, TopoKind::Cpu] {
        let objs = tree.level(kind);
        if objs.len() < 2 {
            continue;
        }

        let min_load = objs.iter().map(|o| o.load).min().unwrap_or(0);
        let Some(max_index) = objs
            .iter()
            .enumerate()
            .max_by_key(|(_, o)| o.load)
            .map(|(i, _)| i)
        else {
            continue;
        };
        let spread = objs[max_index].load.saturating_sub(min_load);
        if spread == 0 {
            continue;
        }

        // 最重对象上负载最小、且搬走后差距会缩小的中断
        let candidate = objs[max_index]
            .interrupts
            .iter()
            .filter_map(|irq| db.get_irq_info(*irq).map(|info| (*irq, info.load)))
            .filter(|(_, load)| spread > *load)
            .min_by_key(|(irq, load)| (*load, *irq));

        if let Some((irq, _)) = candidate {
            force_rebalance_irq(tree, db, irq);
        }
    }
}

/// 放置rebalance队列里的全部中断
pub fn calculate_placement(config: &BalanceConfig, tree: &mut CpuTree, db: &mut IrqDatabase) {
    db.sort_rebalance_queue();
    let queue = std::mem::take(&mut db.rebalance_queue);

    for irq in queue {
        if !place_irq(config, tree, db, irq) {
            // 没放下去的留到下个周期再试
            db.rebalance_queue.push(irq);
        }
    }
}

fn place_irq(
    config: &BalanceConfig,
    tree: &mut CpuTree,
    db: &mut IrqDatabase,
    irq: IrqNumber,
) -> bool {
    let Some(info) = db.get_irq_info(irq) else {
        return true;
    };
    let Some(target_kind) = info.level.target_kind() else {
        // level为None的中断不放置也不碰内核的亲和性
        return true;
    };

    let mut candidate = candidate_mask(config, info.cpumask.clone(), &info.affinity_hint);
    candidate.bit_and(&tree.unbanned_cpus);
    if info.numa_node >= 0 {
        if let Some(node) = tree.get_numa_node(info.numa_node) {
            candidate.bit_and(&tree.obj(node).mask);
        }
    }

    let numa_node = info.numa_node;
    let chosen = match descend(tree, target_kind, &candidate) {
        Some(handle) => handle,
        None => {
            // 候选掩码跟拓扑完全不相交，放宽到全部未ban的CPU再试
            warn!(
                "irq {} (numa_node {}): no topology object intersects its mask, widening to all unbanned cpus",
                irq.data(),
                numa_node
            );
            match descend(tree, target_kind, &tree.unbanned_cpus) {
                Some(handle) => handle,
                None => return false,
            }
        }
    };

    tree.obj_mut(chosen).interrupts.push(irq);
    if let Some(info) = db.get_irq_info_mut(irq) {
        info.assigned_obj = Some(chosen);
        info.moved = true;
    }
    return true;
}

/// 按亲和性提示策略得出初始候选掩码
fn candidate_mask(config: &BalanceConfig, local_cpus: CpuMask, hint: &CpuMask) -> CpuMask {
    match config.hint_policy {
        HintPolicy::Exact if !hint.is_empty() => hint.clone(),
        HintPolicy::Subset if !hint.is_empty() => {
            let mut inter = local_cpus.clone();
            inter.bit_and(hint);
            if inter.is_empty() {
                local_cpus
            } else {
                inter
            }
        }
        _ => local_cpus,
    }
}

/// 从NUMA节点层下降到目标层级，每步取交集内负载最小的子对象
fn descend(tree: &CpuTree, target_kind: TopoKind, candidate: &CpuMask) -> Option<ObjHandle> {
    let roots: Vec<ObjHandle> = (0..tree.nodes.len())
        .map(|index| ObjHandle {
            kind: TopoKind::Node,
            index,
        })
        .collect();

    let mut current = best_among(tree, &roots, candidate)?;
    loop {
        if current.kind == target_kind {
            return Some(current);
        }
        let children = &tree.obj(current).children;
        current = best_among(tree, children, candidate)?;
    }
}

/// 与候选掩码相交的对象里负载最小者；负载相同取编号最小的
fn best_among(tree: &CpuTree, handles: &[ObjHandle], candidate: &CpuMask) -> Option<ObjHandle> {
    handles
        .iter()
        .filter(|h| tree.obj(**h).mask.intersects(candidate))
        .min_by_key(|h| {
            let obj = tree.obj(**h);
            (obj.load, obj.number)
        })
        .copied()
}
