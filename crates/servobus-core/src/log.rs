//! Context-carrying logging macros built on the `log` crate.
//!
//! Every engine subsystem (NMT-equivalent node FSM, SDO client, trajectory
//! streamer, ...) logs through one of these macros with a `LogContext`
//! describing which node/channel/transfer the record concerns, so a single
//! `RUST_LOG=servobus_core=debug` line gives enough context to follow a
//! session without grepping for node IDs by hand.

/// Metadata a call site attaches to a log record.
pub trait LogMetadata {
    fn meta(&self) -> String;
}

/// Generic context: which subsystem, which node, and (optionally) which
/// channel/transfer within it.
pub struct LogContext {
    pub subsystem: &'static str,
    pub node_id: u8,
    pub detail: Option<String>,
}

impl LogContext {
    pub fn new(subsystem: &'static str, node_id: u8) -> Self {
        Self {
            subsystem,
            node_id,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl LogMetadata for LogContext {
    fn meta(&self) -> String {
        match &self.detail {
            Some(d) => format!("subsystem={} node={} {}", self.subsystem, self.node_id, d),
            None => format!("subsystem={} node={}", self.subsystem, self.node_id),
        }
    }
}

macro_rules! sb_info {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::info!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::info!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! sb_warn {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::warn!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::warn!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! sb_error {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::error!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::error!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! sb_debug {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::debug!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::debug!($fmt $(, $($arg)+)?);
    }};
}

macro_rules! sb_trace {
    ($ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        let meta = $crate::log::LogMetadata::meta(&$ctx);
        log::trace!(concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
    }};
    ($fmt:literal $(, $($arg:tt)+)?) => {{
        log::trace!($fmt $(, $($arg)+)?);
    }};
}

pub(crate) use sb_debug;
pub(crate) use sb_error;
pub(crate) use sb_info;
pub(crate) use sb_trace;
pub(crate) use sb_warn;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_formats_with_and_without_detail() {
        let ctx = LogContext::new("sdo", 5);
        assert_eq!(ctx.meta(), "subsystem=sdo node=5");
        let ctx = LogContext::new("sdo", 5).with_detail("index=0x1018");
        assert_eq!(ctx.meta(), "subsystem=sdo node=5 index=0x1018");
    }
}
