//! 批量扫描与并行调度
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::engine::ScanEngine;
use crate::error::ScanError;
use crate::options::{ScanConfig, ScanStats};
use crate::types::{OutputItem, ScanResult};

/// 收集待扫描文件（不跟随符号链接），按路径排序保证输出顺序可复现
/// - `root` 为文件时直接返回它本身；
/// - 非递归时只看第一层。
pub fn collect_files(root: &Path, recursive: bool) -> Vec<PathBuf> {
    if root.is_file() {
        return vec![root.to_path_buf()];
    }
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// 扫描文件列表并将结果以 JSON 数组流式写入 `out`
/// - 输出顺序与 `files` 顺序一致（与线程数无关）；
/// - 单个文件失败写成 `{path, error, kind}` 元素，不中断批次。
pub fn scan_and_write(
    engine: &ScanEngine,
    files: &[PathBuf],
    out: &mut dyn Write,
    config: &ScanConfig,
    threads: Option<usize>,
) -> Result<ScanStats> {
    let threads = threads.unwrap_or_else(num_cpus::get);
    let mut stats = ScanStats::default();

    if threads <= 1 || files.len() <= 1 {
        let mut writer = JsonArrayWriter::begin(out)?;
        for path in files {
            let res = engine.scan(path, config);
            writer.write(path, &res, &mut stats)?;
        }
        writer.finish()?;
        return Ok(stats);
    }

    scan_and_write_parallel(engine, files, out, config, &mut stats, threads)?;
    Ok(stats)
}

/// 并行调度：
/// - Rayon 线程池并行扫描，结果经通道送回当前线程；
/// - 当前线程按下标重排并流式写 JSON，保证稳定顺序。
fn scan_and_write_parallel(
    engine: &ScanEngine,
    files: &[PathBuf],
    out: &mut dyn Write,
    config: &ScanConfig,
    stats: &mut ScanStats,
    threads: usize,
) -> Result<()> {
    use crossbeam_channel as channel;
    use rayon::prelude::*;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("build rayon pool")?;

    type Msg = (usize /*idx*/, Result<ScanResult, ScanError>);
    let (tx, rx) = channel::bounded::<Msg>(256);

    std::thread::scope(|s| -> Result<()> {
        // Receiver 归本闭包所有：写出失败提前返回时随之释放，扫描线程的 send 随即失败退出
        let rx = rx;
        let scanner = s.spawn(move || {
            pool.install(|| {
                files.par_iter().enumerate().for_each_with(tx, |tx, (idx, path)| {
                    let _ = tx.send((idx, engine.scan(path, config)));
                });
            });
            // 结束后 Sender 全部被丢弃，Receiver 将收到关闭信号
        });

        let mut writer = JsonArrayWriter::begin(&mut *out)?;
        let mut next_idx: usize = 0;
        let mut buffer: BTreeMap<usize, Result<ScanResult, ScanError>> = BTreeMap::new();

        while let Ok((idx, res)) = rx.recv() {
            buffer.insert(idx, res);
            // 从 next_idx 开始顺序冲刷
            while let Some(res) = buffer.remove(&next_idx) {
                writer.write(&files[next_idx], &res, stats)?;
                next_idx += 1;
            }
        }

        if scanner.join().is_err() {
            anyhow::bail!("scan worker panicked");
        }
        writer.finish()?;
        Ok(())
    })
}

/// 流式 JSON 数组写出器
struct JsonArrayWriter<'w> {
    out: &'w mut dyn Write,
    first: bool,
}

impl<'w> JsonArrayWriter<'w> {
    fn begin(out: &'w mut dyn Write) -> Result<Self> {
        write!(out, "[")?;
        Ok(Self { out, first: true })
    }

    fn write(&mut self, path: &Path, res: &Result<ScanResult, ScanError>, stats: &mut ScanStats) -> Result<()> {
        let path = path.to_string_lossy();
        let item = match res {
            Ok(result) => {
                stats.files_scanned += 1;
                OutputItem { path: &path, result: Some(result), error: None, kind: None }
            }
            Err(e) => {
                stats.files_failed += 1;
                OutputItem { path: &path, result: None, error: Some(e.to_string()), kind: Some(e.kind()) }
            }
        };
        if !self.first { write!(self.out, ",")?; } else { self.first = false; }
        serde_json::to_writer(&mut *self.out, &item)?;
        stats.outputs_written += 1;
        Ok(())
    }

    fn finish(self) -> Result<()> {
        write!(self.out, "]")?;
        Ok(())
    }
}
