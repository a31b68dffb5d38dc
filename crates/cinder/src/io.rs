//! Output handling for the `print` statement.

use std::io::Write as _;

/// Receives the output of `print` statements.
///
/// Implement this to capture or redirect script output; tests use
/// [`CollectStringPrint`], the CLI uses [`StdPrint`].
pub trait PrintWriter {
    /// Called with the rendered value of one `print` statement, without a
    /// trailing newline.
    fn stdout_write(&mut self, text: &str);

    /// Called to terminate a `print` statement's line.
    fn stdout_push(&mut self, end: char);
}

/// Writes to the process's stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
    }

    fn stdout_push(&mut self, end: char) {
        let mut stdout = std::io::stdout().lock();
        let mut buf = [0u8; 4];
        let _ = stdout.write_all(end.encode_utf8(&mut buf).as_bytes());
        let _ = stdout.flush();
    }
}

/// Collects output into a string, for tests and embedders.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    buffer: String,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn output(&self) -> &str {
        &self.buffer
    }

    #[must_use]
    pub fn into_output(self) -> String {
        self.buffer
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    fn stdout_push(&mut self, end: char) {
        self.buffer.push(end);
    }
}
