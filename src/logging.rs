//! Line-oriented logging with timestamps, source locations, and ANSI colour.
//!
//! [`tlog!`] writes ordinary operational lines:
//!
//! ```text
//! 20261014T09:12:44.031 - src/sync.rs:212 - sync: backfill stored 14 message(s)
//! ```
//!
//! [`tlog_security!`] writes to a separate security channel. Records there are
//! anomalies worth an operator's attention (a forged rumor inside a valid
//! seal, for example), kept apart from the steady stream of undecryptable
//! noise that every relay subscription produces.
//!
//! [`tlog_debug!`] is the same as [`tlog!`] but only prints after
//! [`set_verbose`]; per-event decode noise goes there.
//!
//! Both channels default to stderr. [`set_writer`] and [`set_security_writer`]
//! redirect them; installing a custom writer disables colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);
static VERBOSE: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

static SECURITY_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Detect colour support. Call once at startup.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Replace the operational log writer.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    if let Ok(mut guard) = LOG_WRITER.lock() {
        *guard = w;
    }
}

/// Replace the security channel writer.
pub fn set_security_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    if let Ok(mut guard) = SECURITY_WRITER.lock() {
        *guard = w;
    }
}

/// Enable or disable [`tlog_debug!`] output.
pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";
const ALERT: &str = "\x1b[1;91m";
const EVENT_ID_COLOUR: &str = "\x1b[93m";

const KEY_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[94m", "\x1b[95m", "\x1b[96m", "\x1b[32m", "\x1b[34m",
    "\x1b[35m", "\x1b[36m",
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    KEY_COLOURS[(hash as usize) % KEY_COLOURS.len()]
}

const SHORT_LEN: usize = 8;

fn short(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(SHORT_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

/// Format a pubkey as `pk:1a2b3c4d`, colour-hashed on a terminal.
pub fn pubkey(hex: &str) -> String {
    let s = short(hex);
    if colour_enabled() {
        format!("{}pk:{s}{RESET}", hash_colour(hex))
    } else {
        format!("pk:{s}")
    }
}

/// Format an event id as `ev:1a2b3c4d`.
pub fn event_id(hex: &str) -> String {
    let s = short(hex);
    if colour_enabled() {
        format!("{EVENT_ID_COLOUR}ev:{s}{RESET}")
    } else {
        format!("ev:{s}")
    }
}

/// Current wall-clock time as `YYYYMMDDTHH:MM:SS.mmm` (UTC).
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Days since epoch to civil date (Hinnant).
    let z = (secs / 86400) as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + i64::from(m <= 2);

    format!("{y:04}{m:02}{d:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

fn write_line(writer: &Mutex<Box<dyn Write + Send>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(*w, "{line}");
    }
}

/// Called by [`tlog!`].
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - {file}:{line} - {msg}")
    };
    write_line(&LOG_WRITER, &formatted);
}

/// Called by [`tlog_security!`].
pub fn emit_security(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let formatted = if colour_enabled() {
        format!("{DIM}{ts}{RESET} {ALERT}SECURITY{RESET} {DIM}{file}:{line}{RESET} {msg}")
    } else {
        format!("{ts} - SECURITY - {file}:{line} - {msg}")
    };
    write_line(&SECURITY_WRITER, &formatted);
}

/// Emit an operational log line.
///
/// ```ignore
/// tlog!("sync: fetched {} event(s)", count);
/// tlog!("send: to {}", logging::pubkey(&recipient));
/// ```
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}

/// Emit an operational line only when verbose logging is on.
#[macro_export]
macro_rules! tlog_debug {
    ($($arg:tt)*) => {{
        if $crate::logging::verbose() {
            $crate::logging::emit(file!(), line!(), &format!($($arg)*));
        }
    }};
}

/// Emit a line on the security channel.
#[macro_export]
macro_rules! tlog_security {
    ($($arg:tt)*) => {{
        $crate::logging::emit_security(file!(), line!(), &format!($($arg)*));
    }};
}
