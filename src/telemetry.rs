use std::io;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use getrandom::getrandom;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call on every request: only the
/// first call in an isolate wins.
pub fn init_console_logging(filter: &str) {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::new(filter))
    // no system clock inside a worker
    .without_time()
    .with_ansi(false)
    .with_target(false)
    .with_writer(ConsoleWriter::default)
    .try_init();
}

/// Buffers one formatted event and hands it to the worker console on drop.
#[derive(Default)]
pub struct ConsoleWriter {
  buffer: Vec<u8>
}

impl io::Write for ConsoleWriter {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.buffer.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

impl Drop for ConsoleWriter {
  fn drop(&mut self) {
    let line = String::from_utf8_lossy(&self.buffer);
    let line = line.trim_end();
    if !line.is_empty() {
      worker::console_log!("{line}");
    }
  }
}

/// Short random id used to correlate the log lines of one request.
pub fn new_request_id() -> String {
  let mut rand_buf = [0u8; 9];
  match getrandom(&mut rand_buf) {
    Ok(()) => URL_SAFE_NO_PAD.encode(rand_buf),
    Err(_) => "-".to_string()
  }
}
