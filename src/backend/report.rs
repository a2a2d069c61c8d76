// Diagnostic reports
//
// A `ReportSink` is handed to the instance and every device created from it.
// The runtime reports allocation fallbacks, allocation failures and
// validation-layer messages through it; nothing else is observable.

use ash::vk;
use std::sync::Arc;

/// One diagnostic message, shaped after the debug-report callback
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    pub flags: vk::DebugReportFlagsEXT,
    pub object_type: vk::DebugReportObjectTypeEXT,
    pub object: u64,
    pub location: usize,
    pub message_code: i32,
    pub prefix: &'a str,
    pub message: &'a str,
}

impl<'a> Report<'a> {
    pub fn new(flags: vk::DebugReportFlagsEXT, prefix: &'a str, message: &'a str) -> Self {
        Self {
            flags,
            object_type: vk::DebugReportObjectTypeEXT::UNKNOWN,
            object: 0,
            location: 0,
            message_code: 0,
            prefix,
            message,
        }
    }

    pub fn object(mut self, object_type: vk::DebugReportObjectTypeEXT, object: u64) -> Self {
        self.object_type = object_type;
        self.object = object;
        self
    }
}

/// Receiver of diagnostic reports.
///
/// The return value follows the Vulkan callback convention: `true` asks the
/// caller to abort the reported operation. The runtime itself ignores it.
pub trait ReportSink: Send + Sync {
    fn report(&self, report: &Report<'_>) -> bool;
}

impl<F> ReportSink for F
where
    F: Fn(&Report<'_>) -> bool + Send + Sync,
{
    fn report(&self, report: &Report<'_>) -> bool {
        self(report)
    }
}

/// Forwards reports to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, report: &Report<'_>) -> bool {
        let flags = report.flags;
        let level = if flags.contains(vk::DebugReportFlagsEXT::ERROR) {
            log::Level::Error
        } else if flags.intersects(
            vk::DebugReportFlagsEXT::WARNING | vk::DebugReportFlagsEXT::PERFORMANCE_WARNING,
        ) {
            log::Level::Warn
        } else if flags.contains(vk::DebugReportFlagsEXT::INFORMATION) {
            log::Level::Info
        } else {
            log::Level::Debug
        };

        log::log!(level, "[{}] {}", report.prefix, report.message);
        false
    }
}

pub fn log_sink() -> Arc<dyn ReportSink> {
    Arc::new(LogSink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink: Arc<dyn ReportSink> = Arc::new(move |r: &Report<'_>| {
            assert_eq!(r.prefix, "test");
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        let report = Report::new(vk::DebugReportFlagsEXT::WARNING, "test", "hello")
            .object(vk::DebugReportObjectTypeEXT::BUFFER, 7);
        assert!(!sink.report(&report));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
