//! Subcommands `skillbus run` and `skillbus say`.
//!
//! Both publish utterances onto the bus and wait for the pipeline's
//! end-of-dispatch marker, then print what came back.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::warn;

use skillbus_intent::pipeline::{INTENT_FAILURE_TOPIC, UTTERANCE_HANDLED_TOPIC};
use skillbus_intent::{IntentService, UTTERANCE_TOPIC};
use skillbus_kernel::Message;

/// Upper bound on one dispatch as seen from the terminal.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Read utterances from stdin until EOF or `quit`.
pub async fn run_repl(service: &IntentService, session_id: &str) -> Result<()> {
    println!("skillbus ready (session `{session_id}`). Type an utterance, or `quit` to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            _ => {
                for reply in dispatch(service, session_id, line).await? {
                    println!("  {reply}");
                }
            }
        }
    }

    println!("bye");
    Ok(())
}

/// Dispatch one utterance and return the lines to show for it.
pub async fn dispatch(service: &IntentService, session_id: &str, utterance: &str) -> Result<Vec<String>> {
    let bus = service.bus();
    let mut firehose = bus.subscribe();

    let message = Message::new(UTTERANCE_TOPIC, json!({ "utterances": [utterance] }))
        .with_session(session_id);
    if bus
        .emit_and_wait(message, UTTERANCE_HANDLED_TOPIC, REPLY_TIMEOUT)
        .await
        .is_none()
    {
        warn!(utterance = %utterance, "no end-of-dispatch marker before timeout");
    }

    Ok(drain_replies(&mut firehose))
}

/// Everything published before the marker is already queued on the
/// firehose receiver.
fn drain_replies(firehose: &mut Receiver<Arc<Message>>) -> Vec<String> {
    let mut replies = Vec::new();
    loop {
        match firehose.try_recv() {
            Ok(message) => match message.msg_type.as_str() {
                "speak" => {
                    if let Some(text) = message.data_str("utterance") {
                        replies.push(text.to_string());
                    }
                }
                INTENT_FAILURE_TOPIC => replies.push("(nothing handled that)".to_string()),
                UTTERANCE_HANDLED_TOPIC => break,
                _ => {}
            },
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "reply printer fell behind");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    replies
}
