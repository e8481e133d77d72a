//! 测试用的假机器：在临时目录里搭出sysfs/procfs的目录结构

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use crate::config::BalanceConfig;

pub struct FakeMachine {
    dir: TempDir,
}

impl FakeMachine {
    /// 4个CPU、2个package（cpu0/1和cpu2/3）、每个package一个共享
    /// 缓存域（index2）、一个覆盖全部CPU的NUMA节点node0
    pub fn two_packages() -> Self {
        let machine = Self::two_packages_no_numa();
        machine.write_sys("devices/system/node/node0/cpumap", "f\n");
        for cpu in 0..4 {
            fs::create_dir_all(
                machine
                    .sys_path(&format!("devices/system/cpu/cpu{}/node0", cpu)),
            )
            .unwrap();
        }
        return machine;
    }

    /// 同样的机器，但没有任何NUMA信息
    pub fn two_packages_no_numa() -> Self {
        let machine = Self {
            dir: TempDir::new().unwrap(),
        };
        let cpu_masks = ["1", "2", "4", "8"];
        for cpu in 0..4usize {
            let base = format!("devices/system/cpu/cpu{}", cpu);
            let (siblings, pkg) = if cpu < 2 { ("3", "0") } else { ("c", "1") };
            machine.write_sys(&format!("{}/online", base), "1\n");
            machine.write_sys(&format!("{}/topology/core_siblings", base), siblings);
            machine.write_sys(&format!("{}/topology/physical_package_id", base), pkg);
            machine.write_sys(
                &format!("{}/cache/index1/shared_cpu_map", base),
                cpu_masks[cpu],
            );
            machine.write_sys(&format!("{}/cache/index2/shared_cpu_map", base), siblings);
        }
        return machine;
    }

    pub fn config(&self) -> BalanceConfig {
        BalanceConfig {
            sysfs_root: self.dir.path().join("sys"),
            procfs_root: self.dir.path().join("proc"),
            ..Default::default()
        }
    }

    pub fn set_online(&mut self, cpu: usize, online: bool) {
        self.write_sys(
            &format!("devices/system/cpu/cpu{}/online", cpu),
            if online { "1\n" } else { "0\n" },
        );
    }

    /// 摆一个PCI设备进去；irq为None时只生成msi_irqs目录
    pub fn add_pci_device(
        &self,
        bdf: &str,
        class: &str,
        numa_node: Option<i32>,
        local_cpus: Option<&str>,
        msi_irqs: &[u32],
        irq: Option<u32>,
    ) {
        let base = format!("bus/pci/devices/{}", bdf);
        self.write_sys(&format!("{}/class", base), class);
        if let Some(node) = numa_node {
            self.write_sys(&format!("{}/numa_node", base), &node.to_string());
        }
        if let Some(mask) = local_cpus {
            self.write_sys(&format!("{}/local_cpus", base), mask);
        }
        for msi in msi_irqs {
            self.write_sys(&format!("{}/msi_irqs/{}", base, msi), "");
        }
        if let Some(irq) = irq {
            self.write_sys(&format!("{}/irq", base), &irq.to_string());
        }
    }

    pub fn pci_devpath(&self, bdf: &str) -> PathBuf {
        self.sys_path(&format!("bus/pci/devices/{}", bdf))
    }

    pub fn write_affinity_hint(&self, irq: u32, mask: &str) {
        self.write_proc(&format!("irq/{}/affinity_hint", irq), mask);
    }

    pub fn write_proc_interrupts(&self, content: &str) {
        self.write_proc("interrupts", content);
    }

    pub fn write_proc_stat(&self, content: &str) {
        self.write_proc("stat", content);
    }

    pub fn smp_affinity_path(&self, irq: u32) -> PathBuf {
        self.proc_path(&format!("irq/{}/smp_affinity", irq))
    }

    pub fn write_sys(&self, rel: &str, content: &str) {
        Self::write(self.sys_path(rel), content);
    }

    pub fn write_proc(&self, rel: &str, content: &str) {
        Self::write(self.proc_path(rel), content);
    }

    pub fn sys_path(&self, rel: &str) -> PathBuf {
        self.dir.path().join("sys").join(rel)
    }

    pub fn proc_path(&self, rel: &str) -> PathBuf {
        self.dir.path().join("proc").join(rel)
    }

    fn write(path: PathBuf, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }
}
