//! # 日志
//!
//! `log` crate 的控制台后端，按级别着色。
//!
//! ## 日志格式
//!
//! ```text
//! LEVEL [T0001] [CPU0] [TH3] [module::name] [file.rs:42] message
//! ```
//!
//! 不在任何 CPU 上（调度器启动前）时 CPU 显示为 `-`，没有当前线程时
//! 线程显示为 `-`。
//!
//! ## 颜色方案
//!
//! - ERROR: 红色 (31)
//! - WARN: 亮黄色 (93)
//! - INFO: 蓝色 (34)
//! - DEBUG: 绿色 (32)
//! - TRACE: 暗灰色 (90)

use crate::kprintln;
use crate::processor::PerCpuState;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record};

struct SimpleLogger;

/// 日志序号，标识输出顺序
static SEQUENCE: AtomicUsize = AtomicUsize::new(0);

/// 可能缺失的 ID，缺失时显示为 `-`
struct Id(Option<usize>);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{}", id),
            None => f.write_str("-"),
        }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31,
            Level::Warn => 93,
            Level::Info => 34,
            Level::Debug => 32,
            Level::Trace => 90,
        };
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        let cpu = Id(PerCpuState::current_id());
        let thread = Id(PerCpuState::current_thread_id());
        let file = record
            .file()
            .map(|file| file.rsplit('/').next().unwrap_or(file))
            .unwrap_or("unknown");
        kprintln!(
            "\u{1B}[{}m{:>5} [T{:>4}] [CPU{}] [TH{}] [{}] [{}:{}] {}\u{1B}[0m",
            color,
            record.level(),
            seq,
            cpu,
            thread,
            record.target(),
            file,
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// 编译期环境变量 `LOG` 选择的日志级别，缺省为 INFO
pub fn level_from_env() -> LevelFilter {
    match option_env!("LOG") {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        Some("OFF") => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// 安装日志后端
///
/// 可以重复调用；只有第一次调用会安装后端，每次调用都会更新级别。
pub fn init() {
    init_with_level(level_from_env());
}

pub fn init_with_level(level: LevelFilter) {
    static LOGGER: SimpleLogger = SimpleLogger;
    // 已经安装过时 set_logger 返回错误，忽略即可
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
