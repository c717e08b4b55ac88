use ledgerd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

mod regtest;
mod stats;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledgerd_chainstate::LedgerAccessor;
use ledgerd_sync::{SyncConfig, SyncManager};
use tokio::sync::watch;

const DEFAULT_CONF_FILE_NAME: &str = "ledgerd.conf";
const DEFAULT_PEERS: usize = 3;
const DEFAULT_CHAIN_LENGTH: u32 = 2000;
const DEFAULT_DROP_PERCENT: u8 = 20;
const DEFAULT_SEED: u64 = 0x1ed6_e4d5;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;

struct Config {
    conf_path: PathBuf,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
    status_interval_secs: u64,
    max_runtime_secs: Option<u64>,
    peers: usize,
    chain_length: u32,
    lossy_peers: usize,
    drop_percent: u8,
    corrupt_peers: usize,
    seed: u64,
    report_json: bool,
    sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            conf_path: PathBuf::from(DEFAULT_CONF_FILE_NAME),
            log_level: logging::Level::Info,
            log_format: logging::Format::Text,
            log_timestamps: true,
            status_interval_secs: DEFAULT_STATUS_INTERVAL_SECS,
            max_runtime_secs: None,
            peers: DEFAULT_PEERS,
            chain_length: DEFAULT_CHAIN_LENGTH,
            lossy_peers: 0,
            drop_percent: DEFAULT_DROP_PERCENT,
            corrupt_peers: 0,
            seed: DEFAULT_SEED,
            report_json: false,
            sync: SyncConfig::default(),
        }
    }
}

enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub async fn run_entry() -> Result<(), String> {
    let cli = parse_args()?;
    match cli {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("ledgerd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => {
            let start_time = Instant::now();
            run_with_config(start_time, config).await
        }
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    logging::enable_capture(regtest::LOG_CAPTURE_LINES);

    let (shutdown_tx, _shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx.clone());

    log_info!(
        "Startup: regtest sync (conf={}, peers={}, chain_length={}, min_peers={}, block_window={}, block_cache={})",
        config.conf_path.display(),
        config.peers,
        config.chain_length,
        config.sync.min_peers,
        config.sync.block_window,
        config.sync.block_cache
    );
    let report = regtest::run_network(&config, start_time, &shutdown_tx).await?;

    if config.report_json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report.render_text());
    }
    if !report.completed {
        log_error!(
            "Sync incomplete: block height {} of {}",
            report.local.best_block_height,
            report.target_height
        );
        return Err(format!(
            "sync {}: block height {} of {}",
            report.outcome, report.local.best_block_height, report.target_height
        ));
    }
    log_info!("Shutdown: complete");
    Ok(())
}

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        let _ = shutdown_tx.send(true);
    });
}

fn spawn_status_logger<L: LedgerAccessor + 'static>(
    sync: Arc<SyncManager<L>>,
    start_time: Instant,
    interval_secs: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if interval_secs == 0 {
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last: Option<stats::StatsSnapshot> = None;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            match stats::snapshot_stats(sync.as_ref(), start_time) {
                Ok(snapshot) => {
                    log_info!("{}", stats::status_line(&snapshot, last.as_ref()));
                    last = Some(snapshot);
                }
                Err(err) => {
                    log_warn!("status snapshot failed: {err}");
                }
            }
        }
    });
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut config = Config::default();
    let mut conf_path: Option<PathBuf> = None;
    let mut log_level_set = false;
    let mut log_format_set = false;
    let mut log_timestamps_set = false;
    let mut status_interval_set = false;
    let mut max_runtime_set = false;
    let mut peers_set = false;
    let mut chain_length_set = false;
    let mut lossy_peers_set = false;
    let mut drop_percent_set = false;
    let mut corrupt_peers_set = false;
    let mut seed_set = false;
    let mut min_peers_set = false;
    let mut tick_set = false;
    let mut header_timeout_set = false;
    let mut block_timeout_set = false;
    let mut block_window_set = false;
    let mut block_cache_set = false;
    let mut forward_limit_set = false;
    let mut report_json_set = false;
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--log-level" | "--loglevel" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                config.log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" | "--logformat" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                config.log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" | "--logtimestamps" => {
                config.log_timestamps = true;
                log_timestamps_set = true;
            }
            "--no-log-timestamps" | "--no-logtimestamps" => {
                config.log_timestamps = false;
                log_timestamps_set = true;
            }
            "--status-interval" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --status-interval\n{}", usage()))?;
                config.status_interval_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid status interval '{value}'\n{}", usage()))?;
                status_interval_set = true;
            }
            "--max-runtime" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --max-runtime\n{}", usage()))?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid max runtime '{value}'\n{}", usage()))?;
                config.max_runtime_secs = (secs > 0).then_some(secs);
                max_runtime_set = true;
            }
            "--peers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --peers\n{}", usage()))?;
                config.peers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid peers '{value}'\n{}", usage()))?;
                peers_set = true;
            }
            "--chain-length" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --chain-length\n{}", usage()))?;
                config.chain_length = value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid chain length '{value}'\n{}", usage()))?;
                chain_length_set = true;
            }
            "--lossy-peers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --lossy-peers\n{}", usage()))?;
                config.lossy_peers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid lossy peers '{value}'\n{}", usage()))?;
                lossy_peers_set = true;
            }
            "--drop-percent" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --drop-percent\n{}", usage()))?;
                config.drop_percent = value
                    .parse::<u8>()
                    .map_err(|_| format!("invalid drop percent '{value}'\n{}", usage()))?;
                drop_percent_set = true;
            }
            "--corrupt-peers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --corrupt-peers\n{}", usage()))?;
                config.corrupt_peers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid corrupt peers '{value}'\n{}", usage()))?;
                corrupt_peers_set = true;
            }
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --seed\n{}", usage()))?;
                config.seed = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid seed '{value}'\n{}", usage()))?;
                seed_set = true;
            }
            "--min-peers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --min-peers\n{}", usage()))?;
                config.sync.min_peers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid min peers '{value}'\n{}", usage()))?;
                min_peers_set = true;
            }
            "--tick-ms" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --tick-ms\n{}", usage()))?;
                let ms = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid tick ms '{value}'\n{}", usage()))?;
                config.sync.tick_interval = Duration::from_millis(ms);
                tick_set = true;
            }
            "--header-timeout" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --header-timeout\n{}", usage()))?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid header timeout '{value}'\n{}", usage()))?;
                config.sync.header_timeout = Duration::from_secs(secs);
                header_timeout_set = true;
            }
            "--block-timeout" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --block-timeout\n{}", usage()))?;
                let secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid block timeout '{value}'\n{}", usage()))?;
                config.sync.block_timeout = Duration::from_secs(secs);
                block_timeout_set = true;
            }
            "--block-window" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --block-window\n{}", usage()))?;
                config.sync.block_window = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid block window '{value}'\n{}", usage()))?;
                block_window_set = true;
            }
            "--block-cache" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --block-cache\n{}", usage()))?;
                config.sync.block_cache = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid block cache '{value}'\n{}", usage()))?;
                block_cache_set = true;
            }
            "--forward-limit" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --forward-limit\n{}", usage()))?;
                config.sync.header_forward_limit = value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid forward limit '{value}'\n{}", usage()))?;
                forward_limit_set = true;
            }
            "--report-json" => {
                config.report_json = true;
                report_json_set = true;
            }
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let conf_explicit = conf_path.is_some();
    let conf_file = conf_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONF_FILE_NAME));
    let conf = load_conf(&conf_file)?;
    if conf.is_none() && conf_explicit {
        return Err(format!("config file {} not found", conf_file.display()));
    }
    if let Some(conf) = conf {
        let invalid = |key: &str, raw: &str| format!("invalid {key} '{raw}' in {}", conf_file.display());

        if !log_level_set {
            if let Some(raw) = conf_value(&conf, "loglevel") {
                config.log_level =
                    logging::Level::parse(raw).ok_or_else(|| invalid("loglevel", raw))?;
            }
        }
        if !log_format_set {
            if let Some(raw) = conf_value(&conf, "logformat") {
                config.log_format =
                    logging::Format::parse(raw).ok_or_else(|| invalid("logformat", raw))?;
            }
        }
        if !log_timestamps_set {
            if let Some(raw) = conf_value(&conf, "logtimestamps") {
                config.log_timestamps =
                    parse_conf_bool(raw).ok_or_else(|| invalid("logtimestamps", raw))?;
            }
        }
        if !status_interval_set {
            if let Some(raw) = conf_value(&conf, "statusinterval") {
                config.status_interval_secs = raw
                    .parse::<u64>()
                    .map_err(|_| invalid("statusinterval", raw))?;
            }
        }
        if !max_runtime_set {
            if let Some(raw) = conf_value(&conf, "maxruntime") {
                let secs = raw.parse::<u64>().map_err(|_| invalid("maxruntime", raw))?;
                config.max_runtime_secs = (secs > 0).then_some(secs);
            }
        }
        if !peers_set {
            if let Some(raw) = conf_value(&conf, "peers") {
                config.peers = raw.parse::<usize>().map_err(|_| invalid("peers", raw))?;
            }
        }
        if !chain_length_set {
            if let Some(raw) = conf_value(&conf, "chainlength") {
                config.chain_length = raw.parse::<u32>().map_err(|_| invalid("chainlength", raw))?;
            }
        }
        if !lossy_peers_set {
            if let Some(raw) = conf_value(&conf, "lossypeers") {
                config.lossy_peers = raw.parse::<usize>().map_err(|_| invalid("lossypeers", raw))?;
            }
        }
        if !drop_percent_set {
            if let Some(raw) = conf_value(&conf, "droppercent") {
                config.drop_percent = raw.parse::<u8>().map_err(|_| invalid("droppercent", raw))?;
            }
        }
        if !corrupt_peers_set {
            if let Some(raw) = conf_value(&conf, "corruptpeers") {
                config.corrupt_peers = raw
                    .parse::<usize>()
                    .map_err(|_| invalid("corruptpeers", raw))?;
            }
        }
        if !seed_set {
            if let Some(raw) = conf_value(&conf, "seed") {
                config.seed = raw.parse::<u64>().map_err(|_| invalid("seed", raw))?;
            }
        }
        if !min_peers_set {
            if let Some(raw) = conf_value(&conf, "minpeers") {
                config.sync.min_peers = raw.parse::<usize>().map_err(|_| invalid("minpeers", raw))?;
            }
        }
        if !tick_set {
            if let Some(raw) = conf_value(&conf, "tickms") {
                let ms = raw.parse::<u64>().map_err(|_| invalid("tickms", raw))?;
                config.sync.tick_interval = Duration::from_millis(ms);
            }
        }
        if !header_timeout_set {
            if let Some(raw) = conf_value(&conf, "headertimeout") {
                let secs = raw.parse::<u64>().map_err(|_| invalid("headertimeout", raw))?;
                config.sync.header_timeout = Duration::from_secs(secs);
            }
        }
        if !block_timeout_set {
            if let Some(raw) = conf_value(&conf, "blocktimeout") {
                let secs = raw.parse::<u64>().map_err(|_| invalid("blocktimeout", raw))?;
                config.sync.block_timeout = Duration::from_secs(secs);
            }
        }
        if !block_window_set {
            if let Some(raw) = conf_value(&conf, "blockwindow") {
                config.sync.block_window = raw
                    .parse::<usize>()
                    .map_err(|_| invalid("blockwindow", raw))?;
            }
        }
        if !block_cache_set {
            if let Some(raw) = conf_value(&conf, "blockcache") {
                config.sync.block_cache = raw
                    .parse::<usize>()
                    .map_err(|_| invalid("blockcache", raw))?;
            }
        }
        if !forward_limit_set {
            if let Some(raw) = conf_value(&conf, "forwardlimit") {
                config.sync.header_forward_limit = raw
                    .parse::<u32>()
                    .map_err(|_| invalid("forwardlimit", raw))?;
            }
        }
        if !report_json_set {
            if let Some(raw) = conf_value(&conf, "reportjson") {
                config.report_json = parse_conf_bool(raw).ok_or_else(|| invalid("reportjson", raw))?;
            }
        }
    }
    config.conf_path = conf_file;

    validate_config(&config)?;
    Ok(CliAction::Run(config))
}

fn validate_config(config: &Config) -> Result<(), String> {
    if config.peers == 0 {
        return Err("peers must be at least 1".to_string());
    }
    if config.chain_length == 0 {
        return Err("chain length must be at least 1".to_string());
    }
    if config.lossy_peers > config.peers {
        return Err(format!(
            "lossy peers ({}) exceeds peers ({})",
            config.lossy_peers, config.peers
        ));
    }
    if config.corrupt_peers >= config.peers {
        return Err(format!(
            "corrupt peers ({}) must leave at least one of {} peers serving valid blocks",
            config.corrupt_peers, config.peers
        ));
    }
    if config.drop_percent > 100 {
        return Err(format!("drop percent {} exceeds 100", config.drop_percent));
    }
    if config.sync.min_peers == 0 || config.sync.min_peers > config.peers {
        return Err(format!(
            "min peers must be between 1 and {} (got {})",
            config.peers, config.sync.min_peers
        ));
    }
    if config.sync.tick_interval.is_zero() {
        return Err("tick interval must be positive".to_string());
    }
    if config.sync.header_timeout.is_zero() || config.sync.block_timeout.is_zero() {
        return Err("request timeouts must be positive".to_string());
    }
    if config.sync.block_window == 0 || config.sync.block_cache == 0 {
        return Err("block window and block cache must be at least 1".to_string());
    }
    if config.sync.header_forward_limit == 0 {
        return Err("forward limit must be at least 1".to_string());
    }
    Ok(())
}

fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("{}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn conf_value<'a>(conf: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    conf.get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn usage() -> String {
    [
        "Usage:",
        "  ledgerd [options]",
        "  ledgerd <command>",
        "",
        "Runs an in-process regtest network and syncs a fresh node from its sources.",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --conf  Config file path (default: ./ledgerd.conf)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --status-interval  Seconds between status lines, 0 disables (default: 15)",
        "  --max-runtime  Give up after this many seconds, 0 waits forever (default: 0)",
        "  --peers  Number of source nodes (default: 3)",
        "  --chain-length  Height of the chain the sources serve (default: 2000)",
        "  --lossy-peers  Sources that drop a share of their responses (default: 0)",
        "  --drop-percent  Share of responses a lossy source drops (default: 20)",
        "  --corrupt-peers  Sources that serve tampered block bodies (default: 0)",
        "  --seed  Seed for node nonces and fault injection",
        "  --min-peers  Established sync peers required before header sync (default: 1)",
        "  --tick-ms  Sync ticker interval in milliseconds (default: 1000)",
        "  --header-timeout  Seconds before a header request is retried (default: 10)",
        "  --block-timeout  Seconds before a block request is retried (default: 15)",
        "  --block-window  Maximum outstanding block requests (default: 50)",
        "  --block-cache  Maximum received blocks awaiting commit (default: 500)",
        "  --forward-limit  Maximum header lead over blocks (default: 5000)",
        "  --report-json  Print the final report as JSON",
        "",
        "Config file keys (key=value, CLI flags take precedence):",
        "  loglevel logformat logtimestamps statusinterval maxruntime peers chainlength",
        "  lossypeers droppercent corruptpeers seed minpeers tickms headertimeout",
        "  blocktimeout blockwindow blockcache forwardlimit reportjson",
    ]
    .join("\n")
}
