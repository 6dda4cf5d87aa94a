//! 文件探测：有界读取 + 魔数识别
//!
//! - 文件大小取自元数据，内容最多读取 `header_cap` 字节；
//! - 只接受常规文件，符号链接最多解析一层（防止循环与路径穿越）；
//! - 不写入、不执行；截断或未知的文件头一律归为 `Unknown`。
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ProbeError;
use crate::features::FileFeatures;
use crate::types::SignatureTag;

/// 魔数表版本；表内容变化时递增，并体现在 analysis_version 中
pub const MAGIC_TABLE_VERSION: u32 = 1;

/// 魔数表（按前缀匹配，先匹配者优先）
const MAGIC_TABLE: &[(&[u8], SignatureTag)] = &[
    (b"MZ", SignatureTag::Pe),
    (b"\x7FELF", SignatureTag::Elf),
    (&[0xFE, 0xED, 0xFA, 0xCE], SignatureTag::MachO),
    (&[0xFE, 0xED, 0xFA, 0xCF], SignatureTag::MachO),
    (&[0xCE, 0xFA, 0xED, 0xFE], SignatureTag::MachO),
    (&[0xCF, 0xFA, 0xED, 0xFE], SignatureTag::MachO),
    (b"#!", SignatureTag::Script),
    (b"<?php", SignatureTag::Script),
    (b"PK\x03\x04", SignatureTag::Archive),
    (b"PK\x05\x06", SignatureTag::Archive),
    (b"PK\x07\x08", SignatureTag::Archive),
    (&[0x1F, 0x8B], SignatureTag::Archive),
    (b"7z\xBC\xAF\x27\x1C", SignatureTag::Archive),
    (b"Rar!\x1A\x07", SignatureTag::Archive),
    (&[0xFD, b'7', b'z', b'X', b'Z', 0x00], SignatureTag::Archive),
    (b"%PDF-", SignatureTag::Pdf),
    (&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1], SignatureTag::Ole),
    (b"\x89PNG\r\n\x1A\n", SignatureTag::Image),
    (&[0xFF, 0xD8, 0xFF], SignatureTag::Image),
    (b"GIF87a", SignatureTag::Image),
    (b"GIF89a", SignatureTag::Image),
];

/// 按魔数表识别文件头；任何长度（包括空）的输入都安全
pub fn decode_signature(header: &[u8]) -> SignatureTag {
    MAGIC_TABLE
        .iter()
        .find(|(magic, _)| header.starts_with(magic))
        .map(|(_, tag)| *tag)
        .unwrap_or(SignatureTag::Unknown)
}

/// 探测单个文件，返回特征快照
pub fn probe(path: &Path, header_cap: usize) -> Result<FileFeatures, ProbeError> {
    let (target, md) = resolve_regular_file(path)?;
    let size = md.len();

    let file = File::open(&target).map_err(|e| map_io(path, e))?;
    // 容量按文件大小与上限取小，避免为小文件分配整块缓冲
    let capacity = usize::try_from(size).unwrap_or(usize::MAX).min(header_cap);
    let mut header = Vec::with_capacity(capacity);
    file.take(header_cap as u64)
        .read_to_end(&mut header)
        .map_err(|e| map_io(path, e))?;

    let features = FileFeatures::from_parts(path, size, header);
    debug!(
        path = %path.display(),
        size,
        sampled = features.header().len(),
        truncated = features.header_truncated(),
        "probed file"
    );
    Ok(features)
}

/// 解析到常规文件：最多跟随一层符号链接
fn resolve_regular_file(path: &Path) -> Result<(PathBuf, Metadata), ProbeError> {
    let md = fs::symlink_metadata(path).map_err(|e| map_io(path, e))?;
    let (target, md) = if md.file_type().is_symlink() {
        let link = fs::read_link(path).map_err(|e| map_io(path, e))?;
        let target = if link.is_relative() {
            path.parent().unwrap_or_else(|| Path::new("")).join(link)
        } else {
            link
        };
        let tmd = fs::symlink_metadata(&target).map_err(|e| map_io(path, e))?;
        if tmd.file_type().is_symlink() {
            return Err(not_found(path));
        }
        (target, tmd)
    } else {
        (path.to_path_buf(), md)
    };

    // 目录、FIFO、设备等都不是可扫描的常规文件（读取 FIFO 可能永久阻塞）
    if !md.is_file() {
        return Err(not_found(path));
    }
    Ok((target, md))
}

fn not_found(path: &Path) -> ProbeError {
    ProbeError::NotFound { path: path.to_path_buf() }
}

fn map_io(path: &Path, e: io::Error) -> ProbeError {
    match e.kind() {
        io::ErrorKind::NotFound => not_found(path),
        _ => ProbeError::Unreadable { path: path.to_path_buf(), source: e },
    }
}
