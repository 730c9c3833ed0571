use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

use crate::chat::{Conversation, MessageStatus, ReplyAggregator, SendOutcome};

pub const ASSISTANT_PROMPT: &str = "gemini> ";
pub const CLEARED_BANNER: &str = "--- conversation cleared ---\n";

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Clear,
    Stop,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            "/clear" => Self::Clear,
            "/stop" => Self::Stop,
            "/quit" | "/exit" => Self::Quit,
            _ => Self::Send(line.to_string()),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Turns successive conversation snapshots into terminal output.
///
/// Assistant text is printed incrementally: while commits only extend the
/// text, just the new suffix is written. A commit that rewrites the text
/// (an error replacing partial output) starts a fresh line.
#[derive(Debug, Default)]
pub struct TranscriptRenderer {
    generation: u64,
    /// Entries fully written out.
    finished: usize,
    /// Text already written for the entry at `finished`.
    written: String,
}

impl TranscriptRenderer {
    pub fn render(&mut self, conversation: &Conversation) -> String {
        let mut out = String::new();

        if conversation.generation != self.generation {
            self.generation = conversation.generation;
            self.finished = 0;
            self.written.clear();
            out.push_str(CLEARED_BANNER);
        }

        while let Some(message) = conversation.get(self.finished) {
            if message.from_user {
                // The user's own line is already on screen.
                self.finished += 1;
                continue;
            }

            if self.written.is_empty() && !message.text.is_empty() {
                out.push_str(ASSISTANT_PROMPT);
            }

            if let Some(suffix) = message.text.strip_prefix(self.written.as_str()) {
                out.push_str(suffix);
            } else {
                out.push('\n');
                out.push_str(ASSISTANT_PROMPT);
                out.push_str(&message.text);
            }
            self.written.clone_from(&message.text);

            if message.is_in_flight() {
                break;
            }

            if message.status == MessageStatus::Cancelled {
                out.push_str(" [stopped]");
            }
            if !self.written.is_empty() || message.status != MessageStatus::Done {
                out.push('\n');
            }
            self.finished += 1;
            self.written.clear();
        }

        out
    }
}

async fn render_transcript(mut messages: watch::Receiver<Conversation>) {
    let mut renderer = TranscriptRenderer::default();
    let mut stdout = tokio::io::stdout();

    while messages.changed().await.is_ok() {
        let snapshot = messages.borrow_and_update().clone();
        let output = renderer.render(&snapshot);
        if output.is_empty() {
            continue;
        }
        if stdout.write_all(output.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            tracing::warn!("stdout closed; stopping transcript renderer");
            break;
        }
    }
}

/// Runs the line-oriented chat loop until `/quit` or end of input.
pub async fn run(aggregator: ReplyAggregator) -> Result<(), AppError> {
    let renderer = tokio::spawn(render_transcript(aggregator.messages()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context(ReadInputSnafu {
        stage: "read-line",
    })? {
        match Command::parse(&line) {
            Command::Quit => break,
            Command::Clear => aggregator.clear_chat(),
            Command::Stop => {
                if !aggregator.stop_generation() {
                    eprintln!("nothing to stop");
                }
            }
            Command::Send(text) => {
                if let SendOutcome::Busy = aggregator.send_message(&text) {
                    eprintln!("still replying; wait or type /stop");
                }
            }
        }
    }

    aggregator.stop_generation();
    renderer.abort();
    Ok(())
}
