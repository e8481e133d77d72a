use std::path::PathBuf;
use std::str::FromStr;

use clap::{ArgAction, Parser, ValueEnum};

use crate::error::{BalanceError, Result};

/// 亲和性提示（affinity hint）的使用策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum HintPolicy {
    /// 严格按内核提供的affinity_hint设置
    Exact,
    /// 取hint与设备本地CPU集合的交集
    #[default]
    Subset,
    /// 忽略hint
    Ignore,
}

/// 节能阈值：达到阈值后允许把空闲CPU排除在亲和性掩码之外
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerThreshold {
    #[default]
    Off,
    Threshold(u64),
}

impl FromStr for PowerThreshold {
    type Err = String;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("off") {
            return Ok(PowerThreshold::Off);
        }
        s.parse::<u64>()
            .map(PowerThreshold::Threshold)
            .map_err(|_| format!("expected an integer or \"off\", got {:?}", s))
    }
}

/// 命令行参数
///
/// 长短选项名与经典的irqbalance保持一致，因此`-h`被让给了
/// `--hintpolicy`，帮助信息只能通过`--help`查看。
#[derive(Debug, Parser)]
#[command(name = "irqbalanced", disable_help_flag = true)]
pub struct CommandLine {
    /// 只运行一个平衡周期后退出
    #[arg(short = 'o', long)]
    pub oneshot: bool,

    /// 输出调试日志（隐含--foreground）
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// 不要以守护进程方式运行
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// 亲和性提示的使用策略
    #[arg(short = 'h', long, value_enum, default_value = "subset")]
    pub hintpolicy: HintPolicy,

    /// 节能阈值（整数或off）
    #[arg(short = 'p', long, default_value = "off")]
    pub powerthresh: PowerThreshold,

    /// 禁止平衡指定的IRQ，可多次指定
    #[arg(short = 'i', long = "banirq", action = ArgAction::Append)]
    pub banirq: Vec<u32>,

    /// 旧式ban脚本，退出码非0表示禁止该IRQ（已废弃，请改用--policyscript）
    #[arg(short = 'b', long)]
    pub banscript: Option<PathBuf>,

    /// 每IRQ策略脚本
    #[arg(short = 'l', long)]
    pub policyscript: Option<PathBuf>,

    /// 缓存层级深度上限
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub deepestcache: Option<u32>,

    /// PID文件路径
    #[arg(short = 's', long)]
    pub pid: Option<PathBuf>,

    #[arg(long, action = ArgAction::HelpLong)]
    pub help: Option<bool>,
}

/// 守护进程的全部配置
///
/// sysfs/procfs根路径默认指向真实内核接口，测试环境可以替换成
/// 构造出来的目录树。
#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub oneshot: bool,
    pub debug: bool,
    pub foreground: bool,
    pub hint_policy: HintPolicy,
    pub power_thresh: PowerThreshold,
    pub banned_irqs: Vec<u32>,
    pub banscript: Option<PathBuf>,
    pub policyscript: Option<PathBuf>,
    pub deepest_cache: u32,
    pub pidfile: Option<PathBuf>,
    /// 来自IRQBALANCE_BANNED_CPUS的原始掩码串，容量确定后再解析
    pub banned_cpus_text: Option<String>,
    pub sysfs_root: PathBuf,
    pub procfs_root: PathBuf,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            oneshot: false,
            debug: false,
            foreground: false,
            hint_policy: HintPolicy::Subset,
            power_thresh: PowerThreshold::Off,
            banned_irqs: Vec::new(),
            banscript: None,
            policyscript: None,
            deepest_cache: u32::MAX,
            pidfile: None,
            banned_cpus_text: None,
            sysfs_root: PathBuf::from("/sys"),
            procfs_root: PathBuf::from("/proc"),
        }
    }
}

impl BalanceConfig {
    pub fn from_command_line(cli: CommandLine) -> Self {
        Self {
            oneshot: cli.oneshot,
            debug: cli.debug,
            // debug模式必须留在前台
            foreground: cli.foreground || cli.debug,
            hint_policy: cli.hintpolicy,
            power_thresh: cli.powerthresh,
            banned_irqs: cli.banirq,
            banscript: cli.banscript,
            policyscript: cli.policyscript,
            deepest_cache: cli.deepestcache.unwrap_or(u32::MAX),
            pidfile: cli.pid,
            ..Default::default()
        }
    }

    /// 合入环境变量。任何非空值的IRQBALANCE_ONESHOT/IRQBALANCE_DEBUG
    /// 等价于对应的命令行开关。
    pub fn apply_env(&mut self) {
        self.apply_env_values(
            std::env::var("IRQBALANCE_BANNED_CPUS").ok(),
            std::env::var("IRQBALANCE_ONESHOT").is_ok(),
            std::env::var("IRQBALANCE_DEBUG").is_ok(),
        );
    }

    pub fn apply_env_values(&mut self, banned_cpus: Option<String>, oneshot: bool, debug: bool) {
        if let Some(mask) = banned_cpus {
            self.banned_cpus_text = Some(mask);
        }
        if oneshot {
            self.oneshot = true;
        }
        if debug {
            self.debug = true;
            self.foreground = true;
        }
    }

    /// 校验组合配置；启动时失败直接退出
    pub fn validate(&self) -> Result<()> {
        if let Some(script) = &self.policyscript {
            if !script.exists() {
                return Err(BalanceError::Config(format!(
                    "policy script {} does not exist",
                    script.display()
                )));
            }
        }
        return Ok(());
    }
}
