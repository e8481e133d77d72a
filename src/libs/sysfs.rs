//! sysfs/procfs小文件的读取辅助函数
//!
//! 这些文件都很小（与CPU数量同阶），一次read即可读完；
//! 文件不存在属于正常情况，调用方用文档化的默认值代替。

use std::fs;
use std::path::Path;

/// 读取整个文件并去掉首尾空白；文件不存在或不可读时返回None
pub fn read_trimmed(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    return Some(content.trim().to_string());
}

/// 读取一个10进制整数
pub fn read_int<T: std::str::FromStr>(path: &Path) -> Option<T> {
    read_trimmed(path)?.parse().ok()
}

/// 读取一个16进制整数，接受可选的`0x`前缀（PCI的class文件带前缀）
pub fn read_hex(path: &Path) -> Option<u32> {
    let s = read_trimmed(path)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    return u32::from_str_radix(s, 16).ok();
}
