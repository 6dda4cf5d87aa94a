//! 单次扫描的文件特征快照
//!
//! `FileFeatures` 由 probe 创建一次，之后只读；检测器只能看到这里的数据，
//! 不会再次访问文件系统。
use std::path::{Path, PathBuf};

use crate::probe::decode_signature;
use crate::types::SignatureTag;

/// 扩展名声明的文件类别；归类表见 `rules::ExtensionClasses`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionClass {
    /// Windows 可执行/可加载模块（应带 PE 头）
    Executable,
    /// 原生库与目标文件：PE/ELF/Mach-O 都算正常
    Native,
    Script,
    Archive,
    Document,
    Image,
    Text,
    Other,
}

/// 规范化扩展名：小写、不含前导点，无扩展名时为空串
pub fn normalize_extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// 文件特征快照（不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFeatures {
    path: PathBuf,
    size: u64,
    extension: String,
    header: Box<[u8]>,
    signature: SignatureTag,
}

impl FileFeatures {
    /// 由路径、元数据大小与有界文件头构建快照；扩展名与签名在此一次性解析
    pub fn from_parts(path: impl Into<PathBuf>, size: u64, header: Vec<u8>) -> Self {
        let path = path.into();
        let extension = normalize_extension(&path);
        let signature = decode_signature(&header);
        Self { path, size, extension, header: header.into_boxed_slice(), signature }
    }

    /// 不透明标识，检测器不得据此重新读取文件
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// 文件开头的有界采样
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn signature(&self) -> SignatureTag {
        self.signature
    }

    /// 文件头采样是否短于文件本身
    pub fn header_truncated(&self) -> bool {
        (self.header.len() as u64) < self.size
    }

    /// 判定文件头是否“明显是二进制”
    /// 策略（保守，尽量不误杀文本）：
    /// - 只要包含任何 NUL 字节（0x00）即认为二进制；
    /// - 否则计算可打印 ASCII 比例（包含 tab/CR/LF），低于 25% 则认为二进制。
    pub fn is_probably_binary(&self) -> bool {
        let buf = &self.header[..];
        if buf.is_empty() { return false; }
        if buf.iter().any(|&b| b == 0) { return true; }
        let printable = buf.iter().filter(|&&b| matches!(b, 0x09 | 0x0A | 0x0D) || (0x20..=0x7E).contains(&b)).count();
        let ratio = printable as f32 / (buf.len() as f32);
        ratio < 0.25
    }

    /// 文件头的 Shannon 熵（比特/字节，0.0..=8.0）；空采样为 0
    pub fn header_entropy(&self) -> f64 {
        shannon_entropy(&self.header)
    }
}

pub(crate) fn shannon_entropy(buf: &[u8]) -> f64 {
    if buf.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in buf {
        counts[b as usize] += 1;
    }
    let total = buf.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}
