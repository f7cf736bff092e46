use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Install a thread-local subscriber writing into memory, so tests can assert on the
/// emitted log lines.
///
/// Time and ANSI colours are disabled to keep the output stable.
pub fn capture_logs(min_level: LevelFilter) -> MakeCapturingWriter {
    let make_writer = MakeCapturingWriter::default();

    let guard = subscriber::set_default(
        tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer.clone())
            .with_env_filter(min_level.to_string())
            .finish(),
    );
    // stays installed for the rest of the test
    std::mem::forget(guard);

    make_writer
}

#[derive(Default, Clone)]
pub struct MakeCapturingWriter {
    writer: CapturingWriter,
}

impl MakeCapturingWriter {
    pub fn captured(&self) -> String {
        let captured = self
            .writer
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        String::from_utf8_lossy(captured.get_ref()).into_owned()
    }
}

impl<'a> MakeWriter<'a> for MakeCapturingWriter {
    type Writer = CapturingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer.clone()
    }
}

#[derive(Default, Clone)]
pub struct CapturingWriter {
    captured: Arc<Mutex<io::Cursor<Vec<u8>>>>,
}

impl Write for CapturingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
