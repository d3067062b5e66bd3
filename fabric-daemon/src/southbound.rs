//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use fabric_controller::error::{Error, SouthboundError};
use fabric_controller::tasks::messages::input::SouthboundEvent;
use fabric_controller::tasks::messages::output::SouthboundMsg;
use fabric_utils::task::Task;
use fabric_utils::{UnboundedReceiver, UnboundedSender};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{Instrument, debug_span, warn};

// Reads newline-delimited JSON events from standard input. The event channel
// is closed on end of input.
pub(crate) fn read_task(
    event_tx: UnboundedSender<SouthboundEvent>,
) -> Task<()> {
    let span = debug_span!("southbound").in_scope(|| debug_span!("input"));
    Task::spawn(
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(error) => {
                        Error::from(SouthboundError::Io(error)).log();
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SouthboundEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "failed to decode southbound event");
                    }
                }
            }
        }
        .instrument(span),
    )
}

// Writes controller requests to standard output as newline-delimited JSON.
pub(crate) fn write_task(
    mut msg_rx: UnboundedReceiver<SouthboundMsg>,
) -> Task<()> {
    let span = debug_span!("southbound").in_scope(|| debug_span!("output"));
    Task::spawn(
        async move {
            let mut stdout = tokio::io::stdout();
            while let Some(msg) = msg_rx.recv().await {
                let mut line = match serde_json::to_vec(&msg) {
                    Ok(line) => line,
                    Err(error) => {
                        warn!(%error, "failed to encode southbound message");
                        continue;
                    }
                };
                line.push(b'\n');
                let result = async {
                    stdout.write_all(&line).await?;
                    stdout.flush().await
                }
                .await;
                if let Err(error) = result {
                    Error::from(SouthboundError::Io(error)).log();
                    break;
                }
            }
        }
        .instrument(span),
    )
}
