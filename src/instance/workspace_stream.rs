//! Instance side of the workspace stream.
//!
//! A bidirectional WebSocket multiplexing shell I/O, Git events, file
//! changes, and run-alongside process output. On connect the handler
//! subscribes to the workspace tracker and the shell, sends `connected`,
//! then runs a single select loop: inbound control messages
//! (`shell_input`, `shell_resize`, `ping`) interleave with outbound
//! subscription traffic.
//!
//! A PTY write failure is fatal to the stream (the client reconnects and
//! replays from the shell buffer); everything else is reported as an
//! `error` message and the stream continues.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};

use super::process_manager::ProcessManager;
use crate::protocol::WorkspaceMessage;
use crate::shell::{ShellEvent, ShellSession};
use crate::workspace::WorkspaceEvent;

type Sink = SplitSink<WebSocket, Message>;

/// Serve one workspace stream connection until it closes.
pub async fn handle(socket: WebSocket, pm: Arc<ProcessManager>) {
    let (mut sink, mut stream) = socket.split();
    let session_id = pm.config().session_id.clone();

    let mut tracker_rx = pm.tracker().subscribe();
    let shell = pm.shell().cloned();
    let mut shell_sub: Option<(u64, mpsc::Receiver<Vec<u8>>)> =
        shell.as_ref().map(|s| s.subscribe());
    let mut shell_events: Option<broadcast::Receiver<ShellEvent>> =
        shell.as_ref().map(|s| s.events());

    if send(&mut sink, &WorkspaceMessage::Connected { session_id: session_id.clone() })
        .await
        .is_err()
    {
        return;
    }
    log::info!("[workspace-stream] connected for {session_id}");

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_inbound(&shell, &mut sink, text.to_string()).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("[workspace-stream] read error: {e}");
                        break;
                    }
                }
            }
            chunk = next_shell_chunk(&mut shell_sub) => {
                match chunk {
                    Some(bytes) => {
                        let msg = WorkspaceMessage::ShellOutput {
                            data: String::from_utf8_lossy(&bytes).into_owned(),
                        };
                        if send(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => shell_sub = None,
                }
            }
            event = next_shell_event(&mut shell_events) => {
                match event {
                    Some(ShellEvent::Exited { code, respawning }) => {
                        let msg = WorkspaceMessage::ShellExit {
                            exit_code: code,
                            respawning,
                        };
                        if send(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => shell_events = None,
                }
            }
            event = tracker_rx.recv() => {
                match event {
                    Ok(event) => {
                        let msg = workspace_event_to_message(event);
                        if msg.is_traced() {
                            log::debug!("[workspace-stream] {session_id}: {}", msg.to_json());
                        }
                        if send(&mut sink, &msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[workspace-stream] lagged, dropped {n} event(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    if let (Some(shell), Some((id, _))) = (&shell, &shell_sub) {
        shell.unsubscribe(*id);
    }
    log::info!("[workspace-stream] disconnected for {session_id}");
}

/// Handle an inbound control frame; `false` closes the stream.
async fn handle_inbound(
    shell: &Option<Arc<ShellSession>>,
    sink: &mut Sink,
    text: String,
) -> bool {
    let msg = match WorkspaceMessage::parse(&text) {
        Ok(msg) => msg,
        Err(e) => {
            // Malformed frames are logged and skipped.
            log::warn!("[workspace-stream] skipping malformed frame: {e}");
            return true;
        }
    };

    match msg {
        WorkspaceMessage::ShellInput { data } => {
            let result = match shell {
                Some(shell) => shell.write(data.as_bytes()),
                None => Err(anyhow::anyhow!("shell not running")),
            };
            if let Err(e) = result {
                // A full or closed PTY is fatal to the stream.
                let _ = send(sink, &WorkspaceMessage::Error { message: e.to_string() }).await;
                return false;
            }
            true
        }
        WorkspaceMessage::ShellResize { cols, rows } => {
            let result = match shell {
                Some(shell) => shell.resize(cols, rows),
                None => Err(anyhow::anyhow!("shell not running")),
            };
            if let Err(e) = result {
                let _ = send(sink, &WorkspaceMessage::Error { message: e.to_string() }).await;
            }
            true
        }
        WorkspaceMessage::Ping => send(sink, &WorkspaceMessage::Pong).await.is_ok(),
        other => {
            // Outbound-typed messages arriving inbound are ignored.
            log::trace!("[workspace-stream] ignoring inbound {:?}", other);
            true
        }
    }
}

/// Map a tracker event onto the wire.
fn workspace_event_to_message(event: WorkspaceEvent) -> WorkspaceMessage {
    match event {
        WorkspaceEvent::FileChange { path, kind } => WorkspaceMessage::FileChange {
            path: path.to_string_lossy().into_owned(),
            kind,
        },
        WorkspaceEvent::GitStatus(status) => WorkspaceMessage::GitStatus { status },
        WorkspaceEvent::GitCommit { commit_id, message } => {
            WorkspaceMessage::GitCommit { commit_id, message }
        }
        WorkspaceEvent::GitReset { target } => WorkspaceMessage::GitReset { target },
        WorkspaceEvent::ProcessOutput { process_id, data } => {
            WorkspaceMessage::ProcessOutput { process_id, data }
        }
        WorkspaceEvent::ProcessStatus {
            process_id,
            status,
            exit_code,
        } => WorkspaceMessage::ProcessStatus {
            process_id,
            status,
            exit_code,
        },
    }
}

async fn send(sink: &mut Sink, msg: &WorkspaceMessage) -> anyhow::Result<()> {
    sink.send(Message::Text(msg.to_json().into()))
        .await
        .map_err(|e| anyhow::anyhow!("workspace stream write failed: {e}"))
}

/// Await the next shell chunk, or pend forever when there is no shell.
async fn next_shell_chunk(sub: &mut Option<(u64, mpsc::Receiver<Vec<u8>>)>) -> Option<Vec<u8>> {
    match sub {
        Some((_, rx)) => rx.recv().await,
        None => futures_util::future::pending().await,
    }
}

/// Await the next shell lifecycle event, or pend forever without a shell.
async fn next_shell_event(
    events: &mut Option<broadcast::Receiver<ShellEvent>>,
) -> Option<ShellEvent> {
    match events {
        Some(rx) => loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        },
        None => futures_util::future::pending().await,
    }
}
