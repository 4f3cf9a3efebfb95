#![no_std]

//

use core::fmt::Arguments;

use spin::RwLock;

//

#[macro_export]
macro_rules! log {
    ($level:expr, $($t:tt)*) => {
        if $crate::_is_enabled($level) {
            $crate::_print_log($level, module_path!(), format_args!($($t)*))
        }
    };
}

#[macro_export]
macro_rules! error {
    ($($t:tt)*) => {
        $crate::log!($crate::LogLevel::Error, $($t)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($t:tt)*) => {
        $crate::log!($crate::LogLevel::Warn, $($t)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($t:tt)*) => {
        $crate::log!($crate::LogLevel::Info, $($t)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($t:tt)*) => {
        $crate::log!($crate::LogLevel::Debug, $($t)*)
    };
}

#[macro_export]
macro_rules! trace {
    ($($t:tt)*) => {
        $crate::log!($crate::LogLevel::Trace, $($t)*)
    };
}

//

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

//

impl LogLevel {
    pub const DEFAULT: Self = Self::Info;

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE ",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => Self::None,
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return None,
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::DEFAULT
    }
}

//

/// A log sink. The kernel installs one at boot; until then everything is
/// swallowed by [`NopLogger`].
pub trait Logger: Send + Sync {
    fn is_enabled(&self, level: LogLevel) -> bool;

    fn print(&self, level: LogLevel, args: Arguments);
}

//

pub fn set_logger(new_logger: &'static dyn Logger) {
    *LOGGER.write() = new_logger;
}

#[doc(hidden)]
pub fn _print_log(level: LogLevel, module: &str, args: Arguments) {
    LOGGER.read().print(
        level,
        format_args!("[{} {module}] {args}\n", level.as_str()),
    );
}

#[doc(hidden)]
pub fn _is_enabled(level: LogLevel) -> bool {
    LOGGER.read().is_enabled(level)
}

//

static LOGGER: RwLock<&'static dyn Logger> = RwLock::new(&NopLogger);

//

struct NopLogger;

impl Logger for NopLogger {
    fn is_enabled(&self, _: LogLevel) -> bool {
        false
    }

    fn print(&self, _: LogLevel, _: Arguments) {}
}
