use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

const MAX_LINES: usize = 1000;

/// Log lines captured for the terminal UI instead of going to stderr.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    partial: Arc<Mutex<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() >= MAX_LINES {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let complete = {
            let mut partial = self
                .partial
                .lock()
                .map_err(|_| io::Error::other("log buffer poisoned"))?;
            partial.push_str(&text);
            let mut complete = Vec::new();
            while let Some(end) = partial.find('\n') {
                complete.push(partial[..end].to_string());
                partial.drain(..=end);
            }
            complete
        };
        for line in complete {
            self.push(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn init_stderr(filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();
}

pub fn init_captured(filter: &str, buffer: &LogBuffer) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .target(env_logger::Target::Pipe(Box::new(buffer.clone())))
        .format_timestamp_secs()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_writes() {
        let mut buffer = LogBuffer::new();
        buffer.write_all(b"first li").unwrap();
        buffer.write_all(b"ne\nsecond\nthi").unwrap();
        assert_eq!(buffer.snapshot(), vec!["first line", "second"]);
    }
}
