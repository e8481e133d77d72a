//! 用户策略钩子
//!
//! 策略脚本以`<script> <devpath> <irq>`方式调用，stdout按key=value
//! 逐行解析；旧式ban脚本只看退出码。脚本失败一律降级为"无覆盖"。

use std::path::Path;
use std::process::Command;

use log::{info, warn};

use crate::config::BalanceConfig;
use crate::topology::CpuTree;

use super::{BalanceLevel, IrqNumber};

/// 策略脚本给出的覆盖项；None表示沿用系统默认
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserIrqPolicy {
    pub ban: Option<bool>,
    pub level: Option<BalanceLevel>,
    pub numa_node: Option<i32>,
}

/// 调用策略脚本，取得一个中断的用户策略
pub fn get_irq_user_policy(
    config: &BalanceConfig,
    tree: &CpuTree,
    devpath: &Path,
    irq: IrqNumber,
) -> UserIrqPolicy {
    let mut pol = UserIrqPolicy::default();

    let Some(script) = &config.policyscript else {
        return pol;
    };

    let output = match Command::new(script)
        .arg(devpath)
        .arg(irq.data().to_string())
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            warn!(
                "unable to execute user policy script {}: {}",
                script.display(),
                e
            );
            return pol;
        }
    };

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        parse_user_policy_key(tree, line, &mut pol);
    }
    return pol;
}

fn parse_user_policy_key(tree: &CpuTree, line: &str, pol: &mut UserIrqPolicy) {
    if line.trim().is_empty() {
        return;
    }
    let Some((key, value)) = line.split_once('=') else {
        warn!("bad format for policy, ignoring: {}", line);
        return;
    };
    let key = key.trim();
    let value = value.trim();

    if key.eq_ignore_ascii_case("ban") {
        if value.eq_ignore_ascii_case("false") {
            pol.ban = Some(false);
        } else if value.eq_ignore_ascii_case("true") {
            pol.ban = Some(true);
        } else {
            warn!("unknown value for ban policy: {}", value);
        }
    } else if key.eq_ignore_ascii_case("balance_level") {
        let level = [
            ("none", BalanceLevel::None),
            ("package", BalanceLevel::Package),
            ("cache", BalanceLevel::Cache),
            ("core", BalanceLevel::Core),
        ]
        .into_iter()
        .find(|(name, _)| value.eq_ignore_ascii_case(name));
        match level {
            Some((_, level)) => pol.level = Some(level),
            None => warn!("bad value for balance_level policy: {}", value),
        }
    } else if key.eq_ignore_ascii_case("numa_node") {
        match value.parse::<i32>() {
            Ok(idx) if tree.get_numa_node(idx).is_some() => pol.numa_node = Some(idx),
            Ok(idx) => warn!("numa node {} doesn't exist", idx),
            Err(_) => warn!("bad value for numa_node policy: {}", value),
        }
    } else {
        warn!("unknown key returned, ignoring: {}", key);
    }
}

/// 旧式ban脚本：退出码非0表示禁止该中断
pub fn check_for_irq_ban(config: &BalanceConfig, devpath: &Path, irq: IrqNumber) -> bool {
    let Some(script) = &config.banscript else {
        return false;
    };

    let status = match Command::new(script)
        .arg(devpath)
        .arg(irq.data().to_string())
        .status()
    {
        Ok(status) => status,
        Err(_) => {
            warn!(
                "{} failed, please check the --banscript option",
                script.display()
            );
            return false;
        }
    };

    if !status.success() {
        info!("irq {} is banned by {}", irq.data(), script.display());
        return true;
    }
    return false;
}
