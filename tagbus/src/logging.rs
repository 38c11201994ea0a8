use std::io::{self, Write};
use tokio::sync::mpsc::UnboundedSender;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Forwards formatted log lines over a channel so an embedding process
/// (the web gateway ships logs to operator browsers) can consume them.
struct ForwardWriter {
    tx: UnboundedSender<String>,
}

impl Write for ForwardWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf).to_string();
        let _ = self.tx.send(line);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Initialize logging. With a channel, output is forwarded there
/// (unstyled) instead of standard output.
pub fn init_logging(forward: Option<UnboundedSender<String>>) {
    match forward {
        Some(tx) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(move || ForwardWriter { tx: tx.clone() });
            tracing_subscriber::registry().with(layer).init();
        }
        None => tracing_subscriber::fmt::init(),
    }
}
