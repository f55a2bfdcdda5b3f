use anyhow::{Context, Result};
use log::debug;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use crate::types::ProbeResult;

pub const CSV_HEADER: &str = "IP,ORIGIN,CERT_DOMAIN,CERT_ISSUER,GEO_CODE";

struct SinkState<W> {
    writer: BufWriter<W>,
    rows: u64,
    closed: bool,
}

/// CSV sink shared by all workers.
///
/// Each row goes out under the lock in a single `write_all`, so rows never interleave.
/// Writes after [`ResultSink::close`] are dropped.
pub struct ResultSink<W> {
    state: Mutex<SinkState<W>>,
}

impl ResultSink<File> {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .await
            .with_context(|| format!("failed to create output file: {}", path.display()))?;
        ResultSink::new(file)
            .await
            .with_context(|| format!("failed to write CSV header to {}", path.display()))
    }
}

impl<W: AsyncWrite + Unpin + Send> ResultSink<W> {
    /// Wrap a writer and emit the CSV header.
    pub async fn new(writer: W) -> io::Result<Self> {
        let mut writer = BufWriter::new(writer);
        writer.write_all(format!("{CSV_HEADER}\n").as_bytes()).await?;
        Ok(Self {
            state: Mutex::new(SinkState {
                writer,
                rows: 0,
                closed: false,
            }),
        })
    }

    /// Append one row. Returns `false` if the sink was already closed.
    pub async fn write_result(&self, result: &ProbeResult) -> io::Result<bool> {
        let mut line = result.to_csv_line();
        line.push('\n');
        let mut state = self.state.lock().await;
        if state.closed {
            debug!("sink closed, dropping row for {}", result.address);
            return Ok(false);
        }
        state.writer.write_all(line.as_bytes()).await?;
        state.rows += 1;
        Ok(true)
    }

    /// Flush and shut the writer down. Calling it again is a no-op.
    pub async fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.writer.flush().await?;
        state.writer.shutdown().await
    }

    pub async fn rows(&self) -> u64 {
        self.state.lock().await.rows
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Give back the underlying writer. Anything not flushed by `close` is lost.
    pub fn into_inner(self) -> W {
        self.state.into_inner().writer.into_inner()
    }
}
