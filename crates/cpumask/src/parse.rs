use core::fmt;

use crate::mask::CpuMask;

/// 位图文本解析失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskParseError {
    text: String,
}

impl MaskParseError {
    fn new(text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
        }
    }
}

impl fmt::Display for MaskParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cpu mask string: {:?}", self.text)
    }
}

impl std::error::Error for MaskParseError {}

impl CpuMask {
    /// 解析内核格式的CPU位图字符串
    ///
    /// 接受前导空白和sysfs输出时附带的结尾换行；各组以逗号分隔，
    /// 最低位的组在最后。置位超出`nbits`容量的部分被丢弃。
    pub fn parse(s: &str, nbits: usize) -> Result<CpuMask, MaskParseError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MaskParseError::new(s));
        }

        let mut mask = CpuMask::new(nbits);
        let nwords = mask.words().len();

        // 从最低位组开始倒序填充
        for (i, group) in trimmed.rsplit(',').enumerate() {
            if group.is_empty() || group.len() > 8 {
                return Err(MaskParseError::new(s));
            }
            let value = u32::from_str_radix(group, 16).map_err(|_| MaskParseError::new(s))?;
            if i < nwords {
                mask.words_mut()[i] = value;
            }
        }
        mask.trim_tail();
        return Ok(mask);
    }
}

/// 按内核格式输出：最高位组不补零，其余组固定8位16进制
pub(crate) fn format_mask(mask: &CpuMask, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let words = mask.words();
    for (i, word) in words.iter().enumerate().rev() {
        if i == words.len() - 1 {
            write!(f, "{:x}", word)?;
        } else {
            write!(f, ",{:08x}", word)?;
        }
    }
    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_groups() {
        // 48个CPU容量下，"ff,0000ffff"表示0-15和32-39号CPU
        let mask = CpuMask::parse("ff,0000ffff\n", 48).unwrap();
        let cpus: Vec<usize> = mask.iter_cpu().collect();
        let expected: Vec<usize> = (0..16).chain(32..40).collect();
        assert_eq!(cpus, expected);
    }

    #[test]
    fn test_format_round_trip() {
        let mask = CpuMask::parse("ff,0000ffff\n", 48).unwrap();
        assert_eq!(mask.to_string(), "ff,0000ffff");
    }

    #[test]
    fn test_parse_single_group() {
        let mask = CpuMask::parse("  3\n", 4).unwrap();
        assert_eq!(mask.iter_cpu().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(mask.to_string(), "3");
    }

    #[test]
    fn test_parse_drops_bits_beyond_capacity() {
        let mask = CpuMask::parse("ffffffff", 4).unwrap();
        assert_eq!(mask.weight(), 4);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CpuMask::parse("", 8).is_err());
        assert!(CpuMask::parse("zz", 8).is_err());
        assert!(CpuMask::parse("1,,2", 8).is_err());
        assert!(CpuMask::parse("123456789", 64).is_err());
    }

    #[test]
    fn test_format_zero() {
        assert_eq!(CpuMask::new(48).to_string(), "0,00000000");
    }

    #[test]
    fn test_format_uses_all_groups() {
        let mut mask = CpuMask::new(64);
        mask.set(0, true);
        assert_eq!(mask.to_string(), "0,00000001");
        mask.set(63, true);
        assert_eq!(mask.to_string(), "80000000,00000001");
    }
}
