use std::io;
use std::io::Write;

use super::FlushWriter;
use super::ResponseWriter;
use crate::configuration::MultipartConfig;

/// Writes every flushed part as
///
/// ```text
/// --<boundary>\r\ncontent-type: <content type>\r\n\r\n<part>\r\n
/// ```
///
/// and ends the stream with `--<boundary>--\r\n` on [`MultipartWriter::finish`]. This is
/// a simplified framing rather than full MIME multipart: parts carry no other headers.
pub struct MultipartWriter<W> {
    inner: W,
    boundary: String,
    content_type: String,
    part: Vec<u8>,
}

impl<W: Write + Send> MultipartWriter<W> {
    pub fn new(inner: W, config: &MultipartConfig) -> Self {
        Self {
            inner,
            boundary: config.boundary.clone(),
            content_type: config.content_type.clone(),
            part: Vec::new(),
        }
    }

    /// Flushes a pending part, writes the closing boundary and hands back the inner
    /// writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_part()?;
        write!(self.inner, "--{}--\r\n", self.boundary)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn flush_part(&mut self) -> io::Result<()> {
        if self.part.is_empty() {
            return Ok(());
        }
        write!(
            self.inner,
            "--{}\r\ncontent-type: {}\r\n\r\n",
            self.boundary, self.content_type
        )?;
        self.inner.write_all(&self.part)?;
        self.inner.write_all(b"\r\n")?;
        self.part.clear();
        self.inner.flush()
    }
}

impl<W: Write + Send> ResponseWriter for MultipartWriter<W> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.part.extend_from_slice(bytes);
        Ok(())
    }

    fn as_flush_writer(&mut self) -> Option<&mut dyn FlushWriter> {
        Some(self)
    }
}

impl<W: Write + Send> FlushWriter for MultipartWriter<W> {
    fn flush(&mut self) -> io::Result<()> {
        self.flush_part()
    }
}
