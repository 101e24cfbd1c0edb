//! Log output: `[HH:MM:SS.mmm] [LEVEL] message` on stderr
//!
//! While a progress bar is attached, lines are printed with the bar
//! suspended so they do not tear its redraw.

use indicatif::ProgressBar;
use std::io::{self, Write};
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, Writer};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, MakeWriter};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

static ACTIVE_BAR: Mutex<Option<ProgressBar>> = Mutex::new(None);

pub fn attach_progress(bar: &ProgressBar) {
    if let Ok(mut slot) = ACTIVE_BAR.lock() {
        *slot = Some(bar.clone());
    }
}

pub fn detach_progress() {
    if let Ok(mut slot) = ACTIVE_BAR.lock() {
        *slot = None;
    }
}

pub struct LineFormatter;

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> format::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        write!(
            writer,
            "[{}] [{}] ",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            event.metadata().level()
        )?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Buffers one formatted event and emits it on drop
pub struct EventWriter {
    buf: Vec<u8>,
}

impl Write for EventWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let bar = ACTIVE_BAR.lock().ok().and_then(|slot| slot.clone());
        let emit = || {
            let _ = io::stderr().lock().write_all(&self.buf);
        };
        match bar {
            Some(bar) if !bar.is_finished() => bar.suspend(emit),
            _ => emit(),
        }
    }
}

pub struct StderrWriter;

impl<'a> MakeWriter<'a> for StderrWriter {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter { buf: Vec::new() }
    }
}

/// `-q` → warn, default info, `-v` debug, `-vv` trace. `RUST_LOG` wins.
pub fn level_for(verbosity: i8) -> &'static str {
    match verbosity {
        i8::MIN..=-1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

pub fn init(verbosity: i8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(LineFormatter)
        .with_writer(StderrWriter)
        .try_init();
}
