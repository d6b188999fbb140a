//! Poll loop: issue the profile's query commands once a second.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::device::CommandSet;

/// Send the profile's poll sequence every second until cancelled. Empty
/// commands are skipped; the serial writer paces the wire.
pub async fn run(
    commands: CommandSet,
    serial_tx: UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => {
                tracing::info!(target: "app::poll", "poll loop stopping");
                return;
            }
        }

        for command in commands.poll_sequence() {
            if command.is_empty() {
                continue;
            }
            if serial_tx.send(command.to_string()).is_err() {
                tracing::warn!(target: "app::poll", "serial writer gone, poll loop stopping");
                return;
            }
        }
    }
}
