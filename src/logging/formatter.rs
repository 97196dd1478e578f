use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::Layer as LayerTrait,
    registry::LookupSpan,
};

use crate::logging::config::LogFormat;

/// Стертый тип слоя: формат выбирается в рантайме.
pub type BoxedLayer<S> = Box<dyn LayerTrait<S> + Send + Sync>;

/// Оформление строки события.
#[derive(Debug, Clone, Copy)]
pub struct LayerStyle {
    pub ansi: bool,
    pub target: bool,
    pub thread_names: bool,
    pub line_numbers: bool,
}

/// Собирает fmt-слой заданного формата поверх `writer`.
pub fn build_layer<S, W>(
    format: LogFormat,
    style: LayerStyle,
    writer: W,
) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(style.ansi)
        .with_target(style.target)
        .with_thread_names(style.thread_names)
        .with_line_number(style.line_numbers);

    match format {
        LogFormat::Json => Box::new(
            base.event_format(fmt::format().json().with_current_span(true)),
        ),
        LogFormat::Pretty => Box::new(
            base.event_format(fmt::format().pretty())
                .with_span_events(FmtSpan::CLOSE),
        ),
        LogFormat::Compact => Box::new(base.event_format(fmt::format().compact())),
    }
}
