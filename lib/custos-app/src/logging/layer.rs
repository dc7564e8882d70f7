use std::fmt;

use chrono::Utc;
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.is_json() {
        Layer::new()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        Layer::new()
            .event_format(PipeFormatter::new(config.app_name()))
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    }
}

/// Human-readable formatter producing pipe-delimited lines.
///
/// Each line looks like `<timestamp> | <APP> | <LEVEL> | (<file>:<line>) | <span fields> | <event fields> | <message>`,
/// where the span and event field sections are omitted when empty.
struct PipeFormatter {
    app_name: String,
}

impl PipeFormatter {
    fn new(app_name: &str) -> Self {
        // Normalize something like "custos-worker" or "Custos Worker" into "CUSTOSWORKER".
        let app_name = app_name.to_uppercase().replace(['-', ' '], "");
        Self { app_name }
    }
}

impl<S, N> FormatEvent<S, N> for PipeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | {} | {} | ",
            Utc::now().format("%Y-%m-%d %H:%M:%S %Z"),
            self.app_name,
            metadata.level()
        )?;

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "({}:{})", file, line)?;
        } else {
            write!(writer, "(unknown:0)")?;
        }

        // Span names, outermost first, so a supervisor tree path like `supervisor{name=root} > worker{name=api}` is
        // visible on every line.
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                write!(writer, "{}{}", if first { " | " } else { " > " }, span.name())?;
                first = false;

                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}}", fields)?;
                    }
                }
            }
        }

        let mut v = PipeFieldVisitor::new(writer.by_ref());
        event.record(&mut v);
        v.finish()?;

        writeln!(writer)
    }
}

/// Field visitor that writes event fields as comma-separated `key:value` pairs.
///
/// Structured fields are written before the message, and both sections are prefixed with a pipe:
///
/// ```text
/// | key:value,key2:value2 | message
/// ```
///
/// # Errors
///
/// The first write error is captured and returned when the visitor is finished. All operations after an error are
/// no-ops.
struct PipeFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    last_result: fmt::Result,
}

impl<'writer> PipeFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            last_result: Ok(()),
        }
    }

    fn try_write(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.last_result.is_err() {
            return;
        }

        if field.name() == "message" {
            // Held until the end, since the message always comes last.
            self.last_result = f(&mut self.message);
        } else {
            let prefix = if self.fields_written == 0 { " | " } else { "," };

            self.last_result = write!(self.writer, "{}{}:", prefix, field.name());
            if self.last_result.is_err() {
                return;
            }

            self.last_result = f(&mut self.writer);
            if self.last_result.is_ok() {
                self.fields_written += 1;
            }
        }
    }
}

impl field::Visit for PipeFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.try_write(field, |w| {
            if field.name() == "message" {
                write!(w, "{:?}", value)
            } else {
                write!(w, "\"{:?}\"", value)
            }
        });
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.try_write(field, |w| {
            if field.name() == "message" {
                w.write_str(value)
            } else {
                write!(w, "\"{}\"", value)
            }
        });
    }

    fn record_f64(&mut self, field: &field::Field, value: f64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.try_write(field, |w| write!(w, "{}", value));
    }

    fn record_error(&mut self, field: &field::Field, value: &(dyn std::error::Error + 'static)) {
        self.try_write(field, |w| write!(w, "\"{}\"", value));
    }
}

impl VisitOutput<fmt::Result> for PipeFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.last_result?;

        if !self.message.is_empty() {
            write!(self.writer, " | {}", self.message)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use tracing_subscriber::{layer::SubscriberExt as _, Registry};

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_with(config: &LoggingConfiguration, f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let subscriber = Registry::default().with(build_formatting_layer(config, capture.clone()));
        tracing::subscriber::with_default(subscriber, f);
        let bytes = capture.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn pipe_format_fields_then_message() {
        let config = LoggingConfiguration::with_level("info", "custos-test").unwrap();
        let output = capture_with(&config, || {
            let span = tracing::info_span!("supervisor", name = "root");
            let _entered = span.enter();
            tracing::info!(child = "api", attempt = 2, "Restarting child.");
        });

        assert!(output.contains(" | CUSTOSTEST | INFO | "), "{}", output);
        assert!(output.contains("supervisor"), "{}", output);
        assert!(output.contains(" | child:\"api\",attempt:2 | Restarting child."), "{}", output);
        assert!(output.ends_with('\n'));
    }

    #[test]
    fn message_only() {
        let config = LoggingConfiguration::with_level("info", "custos").unwrap();
        let output = capture_with(&config, || tracing::warn!("plain"));
        assert!(output.trim_end().ends_with(") | plain"), "{}", output);
    }
}
