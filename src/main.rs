//! irqbalanced: 周期性地重新分配硬件中断的CPU亲和性，
//! 在尊重缓存与NUMA拓扑的前提下摊平中断处理负载。

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;

#[macro_use]
mod libs;

mod accounting;
mod activate;
mod config;
mod daemon;
mod error;
mod irq;
mod placement;
#[cfg(test)]
mod test_fixtures;
mod topology;

use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, warn, LevelFilter};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use simple_logger::SimpleLogger;

use crate::config::{BalanceConfig, CommandLine};
use crate::daemon::Balancer;

fn main() {
    let cli = match CommandLine::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // 用法错误统一以状态码1退出
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let mut config = BalanceConfig::from_command_line(cli);
    config.apply_env();

    let level = if config.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = SimpleLogger::new().with_level(level).init();

    if let Err(e) = run(config) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(config: BalanceConfig) -> anyhow::Result<()> {
    config.validate()?;

    if config.banscript.is_some() {
        warn!("--banscript is deprecated, please use --policyscript instead");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let rescan = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .with_context(|| "registering SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .with_context(|| "registering SIGTERM handler")?;
    signal_hook::flag::register(SIGHUP, Arc::clone(&rescan))
        .with_context(|| "registering SIGHUP handler")?;

    let mut balancer = Balancer::new(config.clone(), shutdown, rescan)?;
    if config.debug {
        balancer.tree.dump(&balancer.db);
    }

    // 单核系统上做平衡没有意义
    if balancer.core_count() < 2 {
        warn!("balancing is ineffective on systems with a single cpu, shutting down");
        return Ok(());
    }

    if !config.foreground {
        daemonize()?;
        write_pidfile(&config)?;
    }

    balancer.run()?;

    if !config.foreground {
        remove_pidfile(&config);
    }
    return Ok(());
}

fn daemonize() -> anyhow::Result<()> {
    if unsafe { libc::daemon(0, 0) } != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| "daemonizing");
    }
    return Ok(());
}

fn write_pidfile(config: &BalanceConfig) -> anyhow::Result<()> {
    if let Some(path) = &config.pidfile {
        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;
    }
    return Ok(());
}

fn remove_pidfile(config: &BalanceConfig) {
    if let Some(path) = &config.pidfile {
        let _ = fs::remove_file(path);
    }
}
