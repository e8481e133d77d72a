//! 中断分类：扫描PCI设备目录，结合用户策略给每个中断定类别和平衡层级

use std::path::Path;

use cpumask::CpuMask;
use log::{info, warn};

use crate::accounting;
use crate::config::BalanceConfig;
use crate::libs::sysfs;
use crate::topology::CpuTree;

use super::policy::{check_for_irq_ban, get_irq_user_policy, UserIrqPolicy};
use super::{IrqClass, IrqDatabase, IrqInfo, IrqNumber, IrqStub, IrqType};

/// PCI主类别码（PCI规范附录D）到中断类别的映射。
/// 超出表长或class文件缺失的设备一律按Other处理。
const CLASS_CODES: [IrqClass; 18] = [
    IrqClass::Other,    // 0x00 未定类
    IrqClass::Storage,  // 0x01 大容量存储
    IrqClass::Ethernet, // 0x02 网络控制器
    IrqClass::Other,    // 0x03 显示控制器
    IrqClass::Other,    // 0x04 多媒体
    IrqClass::Other,    // 0x05 内存控制器
    IrqClass::Legacy,   // 0x06 桥设备
    IrqClass::Other,    // 0x07 简单通信控制器
    IrqClass::Other,    // 0x08 基础系统外设
    IrqClass::Legacy,   // 0x09 输入设备
    IrqClass::Other,    // 0x0a 扩展坞
    IrqClass::Other,    // 0x0b 处理器
    IrqClass::Legacy,   // 0x0c 串行总线
    IrqClass::Ethernet, // 0x0d 无线控制器
    IrqClass::Storage,  // 0x0e 智能IO控制器
    IrqClass::Other,    // 0x0f 卫星通信
    IrqClass::Other,    // 0x10 加密设备
    IrqClass::Other,    // 0x11 信号处理
];

/// 重建整个中断数据库
///
/// 顺序保证sysfs的分类结果优先于/proc/interrupts的尽力推断：
/// 先扫PCI设备目录，剩下没被匹配到的行再用add_new_irq兜底收录。
pub fn rebuild_irq_db(config: &BalanceConfig, tree: &CpuTree, db: &mut IrqDatabase) {
    db.clear();

    // 命令行指定的ban在重建后依然有效
    for irq in &config.banned_irqs {
        db.add_banned_irq(IrqNumber::new(*irq), tree.nbits);
    }

    let tmp_irqs = accounting::collect_full_irq_list(config);

    let devdir = config.sysfs_root.join("bus/pci/devices");
    if let Ok(entries) = std::fs::read_dir(&devdir) {
        for entry in entries.flatten() {
            build_one_dev_entry(config, tree, db, &entry.file_name().to_string_lossy());
        }
    }

    for stub in &tmp_irqs {
        if db.get_irq_info(stub.irq).is_none() {
            add_new_irq(config, tree, db, stub.irq, Some(stub));
        }
    }
}

/// 收录一个只在/proc/interrupts里出现过的中断
///
/// 设备目录未知，只能以sysfs根路径调用策略脚本；之后用stub里的
/// 类型/类别覆盖默认值并重算平衡层级。
pub fn add_new_irq(
    config: &BalanceConfig,
    tree: &CpuTree,
    db: &mut IrqDatabase,
    irq: IrqNumber,
    hint: Option<&IrqStub>,
) {
    if db.get_irq_info(irq).is_some() {
        return;
    }

    let pol = get_irq_user_policy(config, tree, &config.sysfs_root, irq);
    if pol.ban == Some(true) {
        db.add_banned_irq(irq, tree.nbits);
        return;
    }

    if !add_one_irq_to_db(config, tree, db, &config.sysfs_root, irq, &pol) {
        warn!("add_new_irq: failed to add irq {}", irq.data());
        return;
    }

    let explicit_level = pol.level;
    if let Some(info) = db.get_irq_info_mut(irq) {
        if let Some(stub) = hint {
            info.irq_type = stub.irq_type;
            info.class = stub.class;
        }
        if explicit_level.is_none() {
            info.level = info.class.default_level();
        }
    }
}

/// 为一个PCI设备目录建立中断记录（MSI-X的全部向量或单个传统中断）
pub fn build_one_dev_entry(
    config: &BalanceConfig,
    tree: &CpuTree,
    db: &mut IrqDatabase,
    dirname: &str,
) {
    let devpath = config.sysfs_root.join("bus/pci/devices").join(dirname);

    if let Ok(entries) = std::fs::read_dir(devpath.join("msi_irqs")) {
        for entry in entries.flatten() {
            let Ok(irqnum) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            if irqnum == 0 {
                continue;
            }
            let irq = IrqNumber::new(irqnum);
            if db.get_irq_info(irq).is_some() {
                continue;
            }
            let pol = get_irq_user_policy(config, tree, &devpath, irq);
            if pol.ban == Some(true) || check_for_irq_ban(config, &devpath, irq) {
                db.add_banned_irq(irq, tree.nbits);
                continue;
            }
            if add_one_irq_to_db(config, tree, db, &devpath, irq, &pol) {
                if let Some(info) = db.get_irq_info_mut(irq) {
                    info.irq_type = IrqType::Msix;
                }
            }
        }
        return;
    }

    // 没有PCI设备使用0号中断
    let Some(irqnum) = sysfs::read_int::<u32>(&devpath.join("irq")) else {
        return;
    };
    if irqnum == 0 {
        return;
    }
    let irq = IrqNumber::new(irqnum);
    if db.get_irq_info(irq).is_some() {
        return;
    }
    let pol = get_irq_user_policy(config, tree, &devpath, irq);
    if pol.ban == Some(true) || check_for_irq_ban(config, &devpath, irq) {
        db.add_banned_irq(irq, tree.nbits);
        return;
    }
    if add_one_irq_to_db(config, tree, db, &devpath, irq, &pol) {
        if let Some(info) = db.get_irq_info_mut(irq) {
            info.irq_type = IrqType::Legacy;
        }
    }
}

/// 读取设备目录，填好一条IrqInfo并插入数据库
fn add_one_irq_to_db(
    config: &BalanceConfig,
    tree: &CpuTree,
    db: &mut IrqDatabase,
    devpath: &Path,
    irq: IrqNumber,
    pol: &UserIrqPolicy,
) -> bool {
    if db.get_irq_info(irq).is_some() {
        info!(
            "dropping duplicate entry for irq {} on path {}",
            irq.data(),
            devpath.display()
        );
        return false;
    }
    if db.is_banned(irq) {
        info!("skipping banned irq {}", irq.data());
        return false;
    }

    let mut new = IrqInfo::new(irq, tree.nbits);

    if let Some(class) = sysfs::read_hex(&devpath.join("class")) {
        // 只看主类别码
        let major = (class >> 16) as usize;
        if major < CLASS_CODES.len() {
            new.class = CLASS_CODES[major];
        }
    }
    new.level = pol.level.unwrap_or_else(|| new.class.default_level());

    let sysfs_node = if tree.numa_avail {
        sysfs::read_int::<i32>(&devpath.join("numa_node")).unwrap_or(-1)
    } else {
        -1
    };
    new.numa_node = pol.numa_node.unwrap_or(sysfs_node);

    // 设备本地CPU集合，读不到就当作全部CPU；去掉被ban的
    if let Some(text) = sysfs::read_trimmed(&devpath.join("local_cpus")) {
        if let Ok(mask) = CpuMask::parse(&text, tree.nbits) {
            new.cpumask = mask;
        }
    }
    new.cpumask.bit_and(&tree.unbanned_cpus);

    let hint_path = config
        .procfs_root
        .join(format!("irq/{}/affinity_hint", irq.data()));
    if let Some(text) = sysfs::read_trimmed(&hint_path) {
        if let Ok(mask) = CpuMask::parse(&text, tree.nbits) {
            new.affinity_hint = mask;
        }
    }

    info!("adding irq {} to database", irq.data());
    return db.insert(new);
}
