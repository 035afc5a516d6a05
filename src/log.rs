use env_logger::Env;
use log::LevelFilter;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Level that was active before the last [`disable`] call.
static SAVED_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Warn as usize);

fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install `env_logger` as a global logger.
///
/// `RUST_LOG` takes precedence over `verbosity`. Every line carries the name of the emitting
/// thread, event pump and dispatch threads are named by [`crate::debugger::Session`].
///
/// # Arguments
///
/// * `verbosity`: 0 - warnings only, 1 - info, 2 - debug, 3 and more - trace
pub fn init(verbosity: u8) {
    let level = level_from_verbosity(verbosity);
    let result = env_logger::Builder::from_env(Env::default().default_filter_or(level.as_str()))
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "[{level} {thread} {target}] {args}",
                level = record.level(),
                thread = thread.name().unwrap_or("<unnamed>"),
                target = record.target(),
                args = record.args(),
            )
        })
        .try_init();

    if result.is_ok() {
        SAVED_LEVEL.store(log::max_level() as usize, Ordering::SeqCst);
    }
}

/// Mute all log output until [`enable`] is called.
pub fn disable() {
    let current = log::max_level();
    if current != LevelFilter::Off {
        SAVED_LEVEL.store(current as usize, Ordering::SeqCst);
    }
    log::set_max_level(LevelFilter::Off);
}

/// Restore log output muted by [`disable`].
pub fn enable() {
    let level = match SAVED_LEVEL.load(Ordering::SeqCst) {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_max_level(level);
}

#[inline(always)]
pub fn is_enabled() -> bool {
    log::max_level() != LevelFilter::Off
}
