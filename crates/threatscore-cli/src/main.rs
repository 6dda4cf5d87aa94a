use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use threatscore_core::{
    collect_files, scan_and_write, ProbeError, ScanConfig, ScanEngine, ScanError, ScoringPolicy, DEFAULT_HEADER_CAP,
};
use tracing::{debug, error, info};

const EXIT_INPUT: u8 = 2;
const EXIT_TIMEOUT: u8 = 3;
const EXIT_INTERNAL: u8 = 4;
const EXIT_CONFIG: u8 = 5;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "threatscore", version, about = "静态文件威胁评分")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 扫描单个文件，向 stdout 输出一个 JSON 对象
    Scan {
        /// 待扫描文件
        path: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// 批量扫描目录，输出 JSON 数组
    Batch {
        /// 输入目录（或单个文件）
        #[arg(long)]
        input: PathBuf,

        /// 递归进入子目录
        #[arg(long)]
        recursive: bool,

        /// 输出文件；缺省写到 stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// 线程数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// 评分策略表路径（TOML）；缺省使用内置表
    #[arg(long)]
    policy: Option<PathBuf>,

    /// 文件头最多读取的字节数
    #[arg(long, default_value_t = DEFAULT_HEADER_CAP)]
    header_cap: usize,

    /// 单个检测器的时间预算（毫秒，0 = 调用线程内直接执行）
    #[arg(long, default_value_t = 200)]
    detector_timeout_ms: u64,

    /// 整次扫描的时间预算（毫秒，0 = 不限制）
    #[arg(long, default_value_t = 1000)]
    scan_timeout_ms: u64,

    /// 只启用指定检测器（可重复）
    #[arg(long = "enable", value_name = "ID")]
    enable: Vec<String>,
}

impl CommonArgs {
    fn config(&self) -> ScanConfig {
        ScanConfig {
            header_cap_bytes: self.header_cap,
            per_detector_timeout_ms: self.detector_timeout_ms,
            scan_timeout_ms: self.scan_timeout_ms,
            enabled_detectors: if self.enable.is_empty() { None } else { Some(self.enable.iter().cloned().collect()) },
        }
    }

    /// 加载策略表并构建引擎；`--enable` 中出现未注册的 id 视为配置错误
    fn engine(&self) -> Result<ScanEngine> {
        let policy = match &self.policy {
            Some(path) => ScoringPolicy::load(path)?,
            None => ScoringPolicy::builtin(),
        };
        let engine = ScanEngine::new(policy)?;
        let registered = engine.registry().snapshot();
        if let Some(unknown) = self.enable.iter().find(|id| !registered.contains(id)) {
            bail!("unknown detector id: {unknown} (registered: {})", registered.ids().join(", "));
        }
        debug!(detectors = registered.len(), version = engine.analysis_version(), "engine ready");
        Ok(engine)
    }
}

fn main() -> ExitCode {
    // 日志写到 stderr，stdout 只留给 JSON 结果（RUST_LOG 控制等级）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scan { path, common } => {
            let engine = match common.engine() {
                Ok(engine) => engine,
                Err(e) => return config_failure(&e),
            };
            let result = match engine.scan(&path, &common.config()) {
                Ok(result) => result,
                Err(e) => return scan_failure(&e),
            };
            match serde_json::to_string_pretty(&result) {
                Ok(line) => {
                    println!("{line}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "serialize result failed");
                    ExitCode::from(EXIT_INTERNAL)
                }
            }
        }
        Commands::Batch { input, recursive, output, threads, common } => {
            let engine = match common.engine() {
                Ok(engine) => engine,
                Err(e) => return config_failure(&e),
            };
            if let Err(e) = check_batch_input(&input) {
                return scan_failure(&e);
            }
            match run_batch(&engine, &input, recursive, output, &threads, &common.config()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{e:#}");
                    ExitCode::from(EXIT_INTERNAL)
                }
            }
        }
    }
}

fn run_batch(
    engine: &ScanEngine,
    input: &Path,
    recursive: bool,
    output: Option<PathBuf>,
    threads: &str,
    config: &ScanConfig,
) -> Result<()> {
    let files = collect_files(input, recursive);
    info!(?input, files = files.len(), version = engine.analysis_version(), "starting batch scan");

    // 以缓冲方式打开输出，按 JSON 数组流式写入
    let mut out: BufWriter<Box<dyn Write>> = match &output {
        Some(path) => BufWriter::new(Box::new(File::create(path).context("create output file")?)),
        None => BufWriter::new(Box::new(io::stdout().lock())),
    };
    let stats = scan_and_write(engine, &files, &mut out, config, parse_threads(threads))
        .context("scan and write failed")?;
    out.flush().context("flush output")?;

    info!(
        files_scanned = stats.files_scanned,
        files_failed = stats.files_failed,
        outputs_written = stats.outputs_written,
        "batch finished"
    );
    Ok(())
}

/// 批量输入必须存在；缺失时与单文件扫描一样按输入错误处理
fn check_batch_input(input: &Path) -> std::result::Result<(), ScanError> {
    match input.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(ScanError::Input(ProbeError::NotFound { path: input.to_path_buf() })),
        Err(source) => Err(ScanError::Input(ProbeError::Unreadable { path: input.to_path_buf(), source })),
    }
}

/// 输出 `{"error", "kind"}` 并给出对应退出码
fn scan_failure(e: &ScanError) -> ExitCode {
    error!(error = %e, kind = e.kind(), "scan failed");
    println!("{}", error_json(e));
    ExitCode::from(exit_status(e))
}

fn error_json(e: &ScanError) -> serde_json::Value {
    json!({ "error": e.to_string(), "kind": e.kind() })
}

fn config_failure(e: &anyhow::Error) -> ExitCode {
    error!("{e:#}");
    println!("{}", json!({ "error": format!("{e:#}"), "kind": "config" }));
    ExitCode::from(EXIT_CONFIG)
}

fn exit_status(e: &ScanError) -> u8 {
    match e {
        ScanError::Input(_) => EXIT_INPUT,
        ScanError::Timeout { .. } => EXIT_TIMEOUT,
        ScanError::Cancelled | ScanError::Internal { .. } => EXIT_INTERNAL,
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") { return None; }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}
