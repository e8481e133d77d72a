//! 把放置结果写入内核：/proc/irq/<n>/smp_affinity

use cpumask::CpuMask;
use log::{debug, warn};

use crate::config::{BalanceConfig, HintPolicy, PowerThreshold};
use crate::error::{BalanceError, Result};
use crate::irq::{IrqDatabase, IrqNumber};
use crate::topology::CpuTree;

/// 为本周期移动过的每个中断提交亲和性掩码
pub fn activate_mappings(config: &BalanceConfig, tree: &CpuTree, db: &mut IrqDatabase) {
    for irq in db.irq_numbers() {
        let Some(info) = db.get_irq_info(irq) else {
            continue;
        };
        if !info.moved {
            continue;
        }
        let Some(obj) = info.assigned_obj else {
            continue;
        };

        let mut mask = tree.obj(obj).mask.clone();

        // 提示策略决定最终写下去的掩码形状
        match config.hint_policy {
            HintPolicy::Exact if !info.affinity_hint.is_empty() => {
                mask = info.affinity_hint.clone();
                mask.bit_and(&tree.unbanned_cpus);
            }
            HintPolicy::Subset if !info.affinity_hint.is_empty() => {
                let mut inter = mask.clone();
                inter.bit_and(&info.affinity_hint);
                if !inter.is_empty() {
                    mask = inter;
                }
            }
            _ => {}
        }

        exclude_idle_cpus(config, tree, &mut mask);

        if mask.is_empty() {
            warn!("irq {}: refusing to write an empty affinity mask", irq.data());
            continue;
        }

        match set_irq_affinity(config, irq, &mask) {
            Ok(()) => debug!("irq {} affinity set to {}", irq.data(), mask),
            Err(e) => warn!("cannot set affinity of irq {}: {}", irq.data(), e),
        }

        if let Some(info) = db.get_irq_info_mut(irq) {
            info.moved = false;
        }
    }
}

/// 节能：当掩码里空闲CPU达到阈值时把它们排除掉，至少保留一个CPU
fn exclude_idle_cpus(config: &BalanceConfig, tree: &CpuTree, mask: &mut CpuMask) {
    let PowerThreshold::Threshold(threshold) = config.power_thresh else {
        return;
    };

    let idle: Vec<usize> = mask
        .iter_cpu()
        .filter(|cpu| {
            tree.find_cpu_core(*cpu as i32)
                .map(|h| tree.obj(h).load == 0)
                .unwrap_or(false)
        })
        .collect();

    if (idle.len() as u64) >= threshold && idle.len() < mask.weight() {
        for cpu in idle {
            mask.set(cpu, false);
        }
    }
}

/// 改变一个中断亲和性的唯一出口
pub fn set_irq_affinity(config: &BalanceConfig, irq: IrqNumber, mask: &CpuMask) -> Result<()> {
    let path = config
        .procfs_root
        .join(format!("irq/{}/smp_affinity", irq.data()));
    std::fs::write(&path, format!("{}\n", mask)).map_err(|e| BalanceError::io(&path, e))
}
