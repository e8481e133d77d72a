//! 逻辑CPU位图。
//!
//! 容量在构造时确定（启动时由探测到的最大CPU编号决定），
//! 文本格式与内核的cpumask格式兼容：以逗号分隔的若干组16进制数，
//! 每组最多8个数字，最低位的组在最后，如 `ff,0000ffff`。

mod mask;
mod parse;

pub use mask::{CpuMask, CpuMaskIter};
pub use parse::MaskParseError;

/// 每个16进制组所覆盖的位数（内核格式固定为32位一组）
pub(crate) const CHUNK_BITS: usize = u32::BITS as usize;
