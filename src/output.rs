//! Output multiplexing for process logs.
//!
//! Every instance gets two readers (stdout, stderr) that pull lines off the pipe as
//! they arrive, prefix them with the padded, colorized process name, and write them
//! to one shared sink. A formatted line is written under the sink lock in a single
//! call, so lines from concurrent processes never interleave mid-line.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use strip_ansi_escapes::strip;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::process::ProcessSpec;

/// ANSI foreground colors assigned to processes in Procfile order.
pub const PALETTE: [u8; 6] = [
    32, // green
    36, // cyan
    35, // magenta
    33, // yellow
    34, // blue
    31, // red
];

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Formatting switches for the multiplexer.
#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    /// Prepend `HH:MM:SS` to each line.
    pub logtime: bool,
    /// Colorize prefixes; when off, ANSI codes in child output are stripped too.
    pub color: bool,
}

/// Shared, cloneable handle on the output sink.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

struct Shared {
    sink: Mutex<Box<dyn Write + Send>>,
    width: AtomicUsize,
    options: OutputOptions,
}

impl Multiplexer {
    pub fn new(sink: Box<dyn Write + Send>, options: OutputOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: Mutex::new(sink),
                width: AtomicUsize::new(0),
                options,
            }),
        }
    }

    pub fn stdout(options: OutputOptions) -> Self {
        Self::new(Box::new(std::io::stdout()), options)
    }

    /// Pads prefixes to the longest name in `specs`.
    pub fn fit_names(&self, specs: &[ProcessSpec]) {
        let width = specs.iter().map(|spec| spec.name.len()).max().unwrap_or(0);
        self.shared.width.store(width, Ordering::Relaxed);
    }

    /// Writes one line of child output under the process's prefix.
    pub fn line(&self, spec: &ProcessSpec, text: &str) {
        let text = sanitize_text(text, !self.shared.options.color);
        self.write(spec, &text);
    }

    /// Writes a supervisor message about a process under its prefix.
    pub fn system(&self, spec: &ProcessSpec, text: &str) {
        self.write(spec, text);
    }

    fn write(&self, spec: &ProcessSpec, text: &str) {
        let mut line = self.format_prefix(spec);
        line.push_str(text);
        line.push('\n');
        // A poisoned lock only means another writer panicked mid-write; keep going.
        let mut sink = match self.shared.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = sink.write_all(line.as_bytes());
        let _ = sink.flush();
    }

    fn format_prefix(&self, spec: &ProcessSpec) -> String {
        let options = self.shared.options;
        let width = self.shared.width.load(Ordering::Relaxed);
        let mut prefix = String::new();
        if options.logtime {
            prefix.push_str(&chrono::Local::now().format("%H:%M:%S").to_string());
            prefix.push(' ');
        }
        prefix.push_str(&format!("{:<width$} |", spec.name, width = width));
        if options.color {
            prefix = apply_color(&prefix, spec.color_index);
        }
        prefix.push(' ');
        prefix
    }
}

fn apply_color(prefix: &str, color_index: usize) -> String {
    let code = PALETTE[color_index % PALETTE.len()];
    format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
}

/// Strips ANSI escape codes when `strip_ansi` is set.
pub fn sanitize_text(text: &str, strip_ansi: bool) -> String {
    if !strip_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// Reads `reader` line by line until EOF, forwarding each line to `mux`.
///
/// Bytes are decoded lossily so a child printing invalid UTF-8 does not end the
/// stream early.
pub async fn pump<R>(reader: R, stream: StreamKind, spec: ProcessSpec, mux: Multiplexer)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                mux.line(&spec, &String::from_utf8_lossy(&buf));
            }
            Err(err) => {
                tracing::debug!(process = %spec.name, ?stream, error = %err, "read failed");
                break;
            }
        }
    }
    tracing::trace!(process = %spec.name, ?stream, "stream closed");
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl MemorySink {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

#[cfg(test)]
impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, color_index: usize) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            cmdline: String::new(),
            color_index,
            port: None,
        }
    }

    fn plain() -> OutputOptions {
        OutputOptions {
            logtime: false,
            color: false,
        }
    }

    #[test]
    fn pads_names_to_widest() {
        let sink = MemorySink::default();
        let mux = Multiplexer::new(Box::new(sink.clone()), plain());
        let web = spec("web", 0);
        let worker = spec("worker", 1);
        mux.fit_names(&[web.clone(), worker.clone()]);
        mux.line(&web, "listening");
        mux.line(&worker, "polling");
        assert_eq!(
            sink.lines(),
            vec!["web    | listening", "worker | polling"]
        );
    }

    #[test]
    fn colorizes_prefix_by_index() {
        let sink = MemorySink::default();
        let mux = Multiplexer::new(
            Box::new(sink.clone()),
            OutputOptions {
                logtime: false,
                color: true,
            },
        );
        let web = spec("web", 1);
        mux.fit_names(&[web.clone()]);
        mux.system(&web, "starting");
        assert_eq!(sink.contents(), "\u{1b}[36mweb |\u{1b}[0m starting\n");
    }

    #[test]
    fn strips_child_ansi_without_color() {
        assert_eq!(sanitize_text("\u{1b}[31mred\u{1b}[0m", true), "red");
        assert_eq!(sanitize_text("\u{1b}[31mred", false), "\u{1b}[31mred");
    }

    #[test]
    fn timestamp_prefix_has_clock_format() {
        let sink = MemorySink::default();
        let mux = Multiplexer::new(
            Box::new(sink.clone()),
            OutputOptions {
                logtime: true,
                color: false,
            },
        );
        let web = spec("web", 0);
        mux.fit_names(&[web.clone()]);
        mux.line(&web, "hi");
        let line = sink.lines().remove(0);
        let (time, rest) = line.split_once(' ').unwrap();
        assert_eq!(time.len(), 8);
        assert_eq!(time.matches(':').count(), 2);
        assert_eq!(rest, "web | hi");
    }

    #[tokio::test]
    async fn pump_forwards_lines_and_survives_invalid_utf8() {
        let sink = MemorySink::default();
        let mux = Multiplexer::new(Box::new(sink.clone()), plain());
        let web = spec("web", 0);
        mux.fit_names(&[web.clone()]);
        let input: &[u8] = b"one\r\ntwo \xff\nthree";
        pump(input, StreamKind::Stdout, web, mux).await;
        assert_eq!(
            sink.lines(),
            vec!["web | one", "web | two \u{fffd}", "web | three"]
        );
    }

    #[test]
    fn concurrent_writers_never_split_lines() {
        let sink = MemorySink::default();
        let mux = Multiplexer::new(Box::new(sink.clone()), plain());
        let a = spec("a", 0);
        let b = spec("b", 1);
        mux.fit_names(&[a.clone(), b.clone()]);
        let handles: Vec<_> = [a, b]
            .into_iter()
            .map(|spec| {
                let mux = mux.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        mux.line(&spec, &format!("line {}", i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let lines = sink.lines();
        assert_eq!(lines.len(), 400);
        assert!(lines
            .iter()
            .all(|l| (l.starts_with("a | line ") || l.starts_with("b | line "))
                && l.matches('|').count() == 1));
    }
}
