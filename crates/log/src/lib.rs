use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

/// Log channels, toggled individually by their single-letter names.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Channel {
    /// `a`: application.
    Application = 0,
    /// `n`: news (chain progress).
    News = 1,
    /// `s`: sessions.
    Session = 2,
    /// `p`: protocol.
    Protocol = 3,
    /// `x`: proxy (wire traffic).
    Proxy = 4,
    /// `r`: remote (peer misbehavior).
    Remote = 5,
    /// `f`: fault.
    Fault = 6,
    /// `q`: quitting (shutdown path).
    Quitting = 7,
    /// `o`: objects (lifetime tracking).
    Objects = 8,
    /// `v`: verbose.
    Verbose = 9,
}

pub const ALL_CHANNELS: [Channel; 10] = [
    Channel::Application,
    Channel::News,
    Channel::Session,
    Channel::Protocol,
    Channel::Proxy,
    Channel::Remote,
    Channel::Fault,
    Channel::Quitting,
    Channel::Objects,
    Channel::Verbose,
];

impl Channel {
    pub fn letter(self) -> char {
        match self {
            Channel::Application => 'a',
            Channel::News => 'n',
            Channel::Session => 's',
            Channel::Protocol => 'p',
            Channel::Proxy => 'x',
            Channel::Remote => 'r',
            Channel::Fault => 'f',
            Channel::Quitting => 'q',
            Channel::Objects => 'o',
            Channel::Verbose => 'v',
        }
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        ALL_CHANNELS
            .iter()
            .copied()
            .find(|channel| channel.letter() == letter.to_ascii_lowercase())
    }

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Default-enabled channels: everything except objects and verbose.
pub const DEFAULT_CHANNELS: u32 =
    ((1 << 10) - 1) & !(Channel::Objects.bit() | Channel::Verbose.bit());

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    pub channels: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            channels: DEFAULT_CHANNELS,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_CHANNELS: AtomicU32 = AtomicU32::new(DEFAULT_CHANNELS);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub channel: Channel,
    pub target: &'static str,
    pub msg: String,
}

static LOG_CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static LOG_CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
    LOG_CHANNELS.store(config.channels, Ordering::Relaxed);
}

pub fn set_channel(channel: Channel, enabled: bool) {
    if enabled {
        LOG_CHANNELS.fetch_or(channel.bit(), Ordering::Relaxed);
    } else {
        LOG_CHANNELS.fetch_and(!channel.bit(), Ordering::Relaxed);
    }
}

pub fn channel_enabled(channel: Channel) -> bool {
    (LOG_CHANNELS.load(Ordering::Relaxed) & channel.bit()) != 0
}

pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        disable_capture();
        return;
    }
    LOG_CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    LOG_CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    LOG_CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_capture() {
    LOG_CAPTURE_ENABLED.store(false, Ordering::Relaxed);
}

pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = LOG_CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let len = guard.len();
    let start = len.saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn enabled(level: Level, channel: Channel) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed) && channel_enabled(channel)
}

pub fn log(level: Level, channel: Channel, target: &'static str, args: fmt::Arguments<'_>) {
    if !enabled(level, channel) {
        return;
    }

    let capture_enabled = LOG_CAPTURE_ENABLED.load(Ordering::Relaxed);
    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };
    let timestamps = LOG_TIMESTAMPS.load(Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let msg = if matches!(format, Format::Json) || capture_enabled {
        Some(args.to_string())
    } else {
        None
    };

    if LOG_STDERR_ENABLED.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        match format {
            Format::Text => {
                if timestamps {
                    let ts = Timestamp {
                        unix_seconds: now.as_secs(),
                        millis: now.subsec_millis(),
                    };
                    let _ = write!(out, "{ts} ");
                }
                let _ = write!(out, "{} [{}] {}: ", level.as_str(), channel.letter(), target);
                let _ = writeln!(out, "{args}");
            }
            Format::Json => {
                let line = json!({
                    "ts_ms": ts_ms,
                    "level": level.as_str(),
                    "channel": channel.letter().to_string(),
                    "target": target,
                    "msg": msg.as_deref().unwrap_or_default(),
                });
                let _ = writeln!(out, "{line}");
            }
        }
    }

    if capture_enabled {
        let Some(buf) = LOG_CAPTURE.get() else {
            return;
        };
        let Ok(mut guard) = buf.lock() else {
            return;
        };
        let cap = LOG_CAPTURE_CAPACITY.load(Ordering::Relaxed);
        if cap == 0 {
            return;
        }
        guard.push_back(CapturedLog {
            ts_ms,
            level,
            channel,
            target,
            msg: msg.unwrap_or_default(),
        });
        while guard.len() > cap {
            let _ = guard.pop_front();
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $channel:expr, $($arg:tt)*) => {{
        if $crate::enabled($level, $channel) {
            $crate::log($level, $channel, module_path!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $crate::Channel::Fault, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $crate::Channel::Application, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $crate::Channel::Application, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_news {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $crate::Channel::News, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_session {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $crate::Channel::Session, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_protocol {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $crate::Channel::Protocol, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_remote {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $crate::Channel::Remote, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $crate::Channel::Application, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $crate::Channel::Verbose, $($arg)*);
    }};
}

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let hour = secs_of_day / 3600;
        let minute = (secs_of_day % 3600) / 60;
        let second = secs_of_day % 60;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z",
            millis = self.millis
        )
    }
}

fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    // From Howard Hinnant's "civil_from_days" algorithm (public domain).
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = y + if m <= 2 { 1 } else { 0 };
    (year, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("nope"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("nope"), None);
    }

    #[test]
    fn channel_letters_round_trip() {
        for channel in ALL_CHANNELS {
            assert_eq!(Channel::from_letter(channel.letter()), Some(channel));
        }
        assert_eq!(Channel::from_letter('z'), None);
    }

    #[test]
    fn default_channels_exclude_noise() {
        assert_eq!(DEFAULT_CHANNELS & Channel::Objects.bit(), 0);
        assert_eq!(DEFAULT_CHANNELS & Channel::Verbose.bit(), 0);
        assert_ne!(DEFAULT_CHANNELS & Channel::Fault.bit(), 0);
    }
}
