//! Tasks that drain the engine's output pipes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;

use crate::codec::{DecodedRecord, WireCodec};
use crate::normalize::normalize;

/// Receiver of decoded engine output.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, record: DecodedRecord);

    /// The output stream ended; nothing more will be dispatched.
    fn stream_closed(&self, reason: String);
}

pub fn spawn_stdout_reader<R>(
    label: String,
    reader: R,
    codec: Arc<dyn WireCodec>,
    dispatcher: Arc<dyn Dispatch>,
    alive: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(run_stdout_reader(label, reader, codec, dispatcher, alive))
}

pub fn spawn_stderr_reader<R>(label: String, reader: R) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(run_stderr_reader(label, reader))
}

pub async fn run_stdout_reader<R>(
    label: String,
    mut reader: R,
    codec: Arc<dyn WireCodec>,
    dispatcher: Arc<dyn Dispatch>,
    alive: Arc<AtomicBool>,
) where
    R: AsyncBufRead + Unpin,
{
    let scale = codec.winrate_scale();
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "engine closed stdout".to_string(),
            Ok(_) => {
                // Engines occasionally print non-UTF-8 noise
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                tracing::trace!(engine = %label, "<< {}", line);

                match codec.decode(line) {
                    Ok(DecodedRecord::Analysis {
                        mut result,
                        skipped,
                    }) => {
                        for error in &skipped {
                            tracing::debug!(engine = %label, "Skipped candidate: {}", error.reason);
                        }
                        normalize(&mut result, scale);
                        dispatcher.dispatch(DecodedRecord::Analysis {
                            result,
                            skipped,
                        });
                    }
                    Ok(DecodedRecord::Ignored) => {}
                    Ok(record) => dispatcher.dispatch(record),
                    Err(e) => tracing::warn!(engine = %label, "{}", e),
                }
            }
            Err(e) => {
                tracing::error!(engine = %label, "Error reading engine stdout: {}", e);
                break format!("stdout read failed: {}", e);
            }
        }
    };

    alive.store(false, Ordering::SeqCst);
    tracing::info!(engine = %label, "Stdout reader exiting: {}", reason);
    dispatcher.stream_closed(reason);
}

pub async fn run_stderr_reader<R>(label: String, mut reader: R)
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                tracing::debug!(engine = %label, "stderr: {}", line.trim_end());
            }
            Err(e) => {
                tracing::debug!(engine = %label, "Error reading engine stderr: {}", e);
                break;
            }
        }
    }
    tracing::debug!(engine = %label, "Stderr reader exiting");
}
