//! 守护进程上下文与周期性控制循环
//!
//! 单线程循环，每个周期内的阶段严格串行：解析→传播→迁移→放置→提交。
//! 外界只通过两个原子标志跟循环交互：shutdown（收尾退出）和
//! rescan（下个周期重建拓扑）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cpumask::CpuMask;
use log::{info, warn};

use crate::accounting::{self, Accounting};
use crate::activate;
use crate::config::BalanceConfig;
use crate::error::Result;
use crate::irq::{classify, IrqDatabase};
use crate::placement;
use crate::topology::CpuTree;

/// 两次平衡之间的间隔
pub const SLEEP_INTERVAL: Duration = Duration::from_secs(10);

lazy_static! {
    /// 每秒的时钟滴答数，进程生命周期内探测一次
    pub static ref HZ: u64 = detect_hz();
}

fn detect_hz() -> u64 {
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        warn!("unable to determine HZ, defaulting to 100");
        return 100;
    }
    return hz as u64;
}

/// 守护进程的全部可变状态
pub struct Balancer {
    pub config: BalanceConfig,
    pub nr_cpus: usize,
    pub banned_cpus: CpuMask,
    pub tree: CpuTree,
    pub db: IrqDatabase,
    pub accounting: Accounting,
    pub cycle_count: u64,
    pub hz: u64,
    pub sleep_interval: Duration,
    need_rescan: bool,
    shutdown: Arc<AtomicBool>,
    rescan_request: Arc<AtomicBool>,
}

impl Balancer {
    pub fn new(
        config: BalanceConfig,
        shutdown: Arc<AtomicBool>,
        rescan_request: Arc<AtomicBool>,
    ) -> Result<Self> {
        let nr_cpus = probe_nr_cpus(&config);
        let banned_cpus = match &config.banned_cpus_text {
            Some(text) => CpuMask::parse(text, nr_cpus)?,
            None => CpuMask::new(nr_cpus),
        };

        let tree = CpuTree::build(&config, banned_cpus.clone(), nr_cpus);
        let mut balancer = Self {
            config,
            nr_cpus,
            banned_cpus,
            tree,
            db: IrqDatabase::new(),
            accounting: Accounting::new(),
            cycle_count: 0,
            hz: *HZ,
            sleep_interval: SLEEP_INTERVAL,
            need_rescan: false,
            shutdown,
            rescan_request,
        };
        classify::rebuild_irq_db(&balancer.config, &balancer.tree, &mut balancer.db);
        return Ok(balancer);
    }

    /// 含被ban槽位在内的CPU槽位数
    pub fn core_count(&self) -> usize {
        self.tree.core_count
    }

    /// 启动（或重建）后的准备：全部中断入队，解析一轮建立计数基线
    pub fn prime(&mut self) {
        for irq in self.db.irq_numbers() {
            placement::force_rebalance_irq(&mut self.tree, &mut self.db, irq);
        }
        self.parse_counters();
    }

    /// 周期性主循环；shutdown后最多再完成一个周期
    pub fn run(&mut self) -> Result<()> {
        self.prime();

        while !self.shutdown.load(Ordering::Relaxed) {
            self.sleep_approx(self.sleep_interval);
            self.run_cycle();
            if self.config.oneshot {
                break;
            }
        }
        return Ok(());
    }

    /// 一个完整的平衡周期
    pub fn run_cycle(&mut self) {
        if self.config.debug {
            info!("-----------------------------------------------------------------------------");
        }
        self.db.clear_irq_stats();

        // 外部的rescan请求只在第一个周期完成之后才被接受
        if self.rescan_request.swap(false, Ordering::Relaxed) && self.cycle_count > 0 {
            self.need_rescan = true;
        }

        self.parse_counters();

        // CPU热插拔在解析时被发现，整棵树推倒重建
        if self.need_rescan {
            self.rescan();
        }

        if self.cycle_count > 0 {
            placement::update_migration_status(&mut self.tree, &mut self.db);
        }
        placement::calculate_placement(&self.config, &mut self.tree, &mut self.db);
        activate::activate_mappings(&self.config, &self.tree, &mut self.db);

        if self.config.debug {
            self.tree.dump(&self.db);
        }
        self.cycle_count += 1;
    }

    fn rescan(&mut self) {
        self.need_rescan = false;
        self.cycle_count = 0;
        info!("rescanning cpu topology");

        self.tree = CpuTree::build(&self.config, self.banned_cpus.clone(), self.nr_cpus);
        self.db = IrqDatabase::new();
        classify::rebuild_irq_db(&self.config, &self.tree, &mut self.db);
        self.prime();

        // 多等一个周期再采一轮样，保证增量是干净的
        self.sleep_approx(self.sleep_interval);
        self.db.clear_irq_stats();
        self.parse_counters();
    }

    fn parse_counters(&mut self) {
        if self
            .accounting
            .parse_proc_interrupts(&self.config, &mut self.db, self.tree.core_count)
        {
            self.need_rescan = true;
        }
        accounting::parse_proc_stat(
            &self.config,
            &mut self.tree,
            &mut self.db,
            self.cycle_count,
            self.hz,
        );
    }

    /// 分片睡眠，shutdown时尽快醒来
    fn sleep_approx(&self, total: Duration) {
        let slice = Duration::from_millis(100);
        let mut remaining = total;
        while !remaining.is_zero() && !self.shutdown.load(Ordering::Relaxed) {
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

/// 启动时探测一次CPU容量：观察到的最大CPU编号加一
fn probe_nr_cpus(config: &BalanceConfig) -> usize {
    let cpu_dir = config.sysfs_root.join("devices/system/cpu");
    let mut max_id: usize = 0;
    if let Ok(entries) = std::fs::read_dir(&cpu_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("cpu") {
                if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(num) = rest.parse::<usize>() {
                        max_id = max_id.max(num);
                    }
                }
            }
        }
    }
    return max_id + 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::IrqNumber;
    use crate::test_fixtures::FakeMachine;
    use crate::topology::TopoKind;

    const STAT_4CPU: &str = "cpu  0 0 0 0 0 0 0 0\n\
                             cpu0 0 0 0 0 0 0 0 0\n\
                             cpu1 0 0 0 0 0 0 0 0\n\
                             cpu2 0 0 0 0 0 0 0 0\n\
                             cpu3 0 0 0 0 0 0 0 0\n";

    fn eth_machine() -> FakeMachine {
        let machine = FakeMachine::two_packages();
        machine.add_pci_device("0000:00:04.0", "0x020000", Some(0), Some("f"), &[42], None);
        machine.write_proc_interrupts(
            "            CPU0 CPU1 CPU2 CPU3\n 42:   1 1 1 1   PCI-MSI   eth0\n",
        );
        machine.write_proc_stat(STAT_4CPU);
        machine.write_proc("irq/42/smp_affinity", "f\n");
        return machine;
    }

    fn balancer_for(machine: &FakeMachine) -> Balancer {
        let mut config = machine.config();
        config.oneshot = true;
        let mut balancer = Balancer::new(
            config,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        balancer.sleep_interval = Duration::ZERO;
        balancer.hz = 100;
        return balancer;
    }

    #[test]
    fn test_probe_nr_cpus() {
        let machine = FakeMachine::two_packages();
        assert_eq!(probe_nr_cpus(&machine.config()), 4);
    }

    #[test]
    fn test_banned_cpus_env_mask() {
        let machine = eth_machine();
        let mut config = machine.config();
        config.oneshot = true;
        config.banned_cpus_text = Some("3".to_string());
        let balancer = Balancer::new(
            config,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        assert_eq!(
            balancer.tree.unbanned_cpus.iter_cpu().collect::<Vec<_>>(),
            vec![2, 3]
        );
    }

    #[test]
    fn test_invalid_banned_cpus_is_fatal() {
        let machine = eth_machine();
        let mut config = machine.config();
        config.banned_cpus_text = Some("not-a-mask".to_string());
        assert!(Balancer::new(
            config,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        )
        .is_err());
    }

    #[test]
    fn test_one_cycle_places_and_writes() {
        let machine = eth_machine();
        let mut balancer = balancer_for(&machine);

        balancer.run().unwrap();

        let info = balancer.db.get_irq_info(IrqNumber::new(42)).unwrap();
        let obj = info.assigned_obj.unwrap();
        assert_eq!(obj.kind, TopoKind::Cpu);
        let written =
            std::fs::read_to_string(machine.smp_affinity_path(42)).unwrap();
        assert!(!written.trim().is_empty());
        assert_eq!(balancer.cycle_count, 1);
    }

    #[test]
    fn test_hotplug_triggers_rescan_and_rebuild() {
        let mut machine = eth_machine();
        let mut balancer = balancer_for(&machine);
        balancer.prime();
        balancer.run_cycle();
        assert_eq!(balancer.core_count(), 4);

        // cpu3下线，/proc/interrupts掉到3列
        machine.set_online(3, false);
        machine.write_proc_interrupts(
            "            CPU0 CPU1 CPU2\n 42:   1 1 1   PCI-MSI   eth0\n",
        );
        machine.write_proc_stat(
            "cpu  0 0 0 0 0 0 0 0\n\
             cpu0 0 0 0 0 0 0 0 0\n\
             cpu1 0 0 0 0 0 0 0 0\n\
             cpu2 0 0 0 0 0 0 0 0\n",
        );

        balancer.run_cycle();

        assert_eq!(balancer.core_count(), 3);
        // 重建后中断保留了sysfs的分类，并被重新放置
        let info = balancer.db.get_irq_info(IrqNumber::new(42)).unwrap();
        assert_eq!(info.irq_type, crate::irq::IrqType::Msix);
        assert!(info.assigned_obj.is_some());
    }

    #[test]
    fn test_rescan_request_ignored_before_first_cycle() {
        let machine = eth_machine();
        let rescan = Arc::new(AtomicBool::new(true));
        let mut config = machine.config();
        config.oneshot = true;
        let mut balancer = Balancer::new(
            config,
            Arc::new(AtomicBool::new(false)),
            Arc::clone(&rescan),
        )
        .unwrap();
        balancer.sleep_interval = Duration::ZERO;
        balancer.hz = 100;

        balancer.prime();
        balancer.run_cycle();

        // 请求在第一个周期之前到达，被丢弃；计数照常推进
        assert_eq!(balancer.cycle_count, 1);
        assert!(!rescan.load(Ordering::Relaxed));
    }

    #[test]
    fn test_shutdown_flag_stops_loop() {
        let machine = eth_machine();
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut config = machine.config();
        config.oneshot = false;
        let mut balancer = Balancer::new(
            config,
            Arc::clone(&shutdown),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        balancer.sleep_interval = Duration::ZERO;
        balancer.hz = 100;

        // shutdown已置位，run只做准备工作就返回
        balancer.run().unwrap();
        assert_eq!(balancer.cycle_count, 0);
    }
}
