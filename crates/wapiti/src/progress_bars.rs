use {
    indicatif::ProgressStyle,
    std::io::{Read, Write},
    tracing_indicatif::span_ext::IndicatifSpanExt,
};

pub fn io_progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{span_child_prefix}{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})")
        .expect("template is valid")
        .progress_chars("=> ")
}

pub fn count_progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{span_child_prefix}{spinner} {msg} [{bar:30}] {pos}/{len}")
        .expect("template is valid")
        .progress_chars("=> ")
}

pub struct SpanHookedRead<R> {
    inner: R,
    span: tracing::Span,
}

impl<R: Read> Read for SpanHookedRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).inspect(|read| {
            self.span.pb_inc(*read as u64);
        })
    }
}

pub struct SpanHookedWrite<W> {
    inner: W,
    span: tracing::Span,
}

impl<W: Write> Write for SpanHookedWrite<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf).inspect(|wrote| {
            self.span.pb_inc(*wrote as u64);
        })
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[extension_traits::extension(pub trait IndicatifWrapIoExt)]
impl tracing::Span {
    /// attaches a byte-style bar to this span and feeds it from every read that
    /// passes through
    fn wrap_read<R: Read>(&self, total: u64, reader: R) -> SpanHookedRead<R> {
        self.pb_set_style(&io_progress_style());
        self.pb_set_length(total);
        SpanHookedRead {
            inner: reader,
            span: self.clone(),
        }
    }
    fn wrap_write<W: Write>(&self, total: u64, writer: W) -> SpanHookedWrite<W> {
        self.pb_set_style(&io_progress_style());
        self.pb_set_length(total);
        SpanHookedWrite {
            inner: writer,
            span: self.clone(),
        }
    }
}
