//! Line-framed half-duplex serial I/O.
//!
//! The port runs 2400-8N1 with no flow control. Outbound commands funnel
//! through an unbounded channel into a single writer task that appends the
//! `\r` terminator; the reader accumulates bytes until a lone `\r` and
//! forwards each non-empty payload. Both halves stop on cancellation; the
//! reader additionally stops when the port handle dies.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;

/// Megatec devices talk at 2400 baud, always.
pub const BAUD_RATE: u32 = 2400;

/// Open the port 2400-8N1 without flow control.
pub fn open(port: &str) -> tokio_serial::Result<SerialStream> {
    tokio_serial::new(port, BAUD_RATE)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
}

/// Drain the command channel into the port, one `cmd + "\r"` write per
/// command. Empty commands are no-ops. Returns when the channel closes or
/// the token fires; write errors are logged and the loop continues, the
/// poll cadence is the retry mechanism.
pub async fn run_writer<W>(
    mut port: W,
    mut commands: UnboundedReceiver<String>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let command = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        if command.is_empty() {
            continue;
        }

        tracing::debug!(target: "app::serial", command = %command, "tty send");
        let mut frame = command.into_bytes();
        frame.push(b'\r');
        if let Err(e) = port.write_all(&frame).await {
            tracing::error!(target: "app::serial", error = %e, "serial write failed");
        }
    }
}

/// Accumulate bytes into `\r`-terminated lines and forward each non-empty
/// payload. Embedded CRs separate frames; empty lines are discarded. Read
/// errors are logged and reading continues; EOF (the handle went away) or
/// cancellation ends the loop.
pub async fn run_reader<R>(
    mut port: R,
    lines: UnboundedSender<String>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 128];
    let mut pending = Vec::new();

    loop {
        let n = tokio::select! {
            result = port.read(&mut chunk) => match result {
                Ok(0) => {
                    tracing::info!(target: "app::serial", "serial port closed, reader stopping");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(target: "app::serial", error = %e, "serial read failed");
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        for &byte in &chunk[..n] {
            if byte == b'\r' {
                if !pending.is_empty() {
                    let line = String::from_utf8_lossy(&pending).into_owned();
                    tracing::debug!(target: "app::serial", line = %line, "tty recv");
                    pending.clear();
                    if lines.send(line).is_err() {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }
}
