use super::{
    BanEvent,
    ChatEvent,
    ChatMessage,
    ChatTransport,
    EventSink,
    TransportError,
};
use std::sync::{
    Mutex,
    PoisonError,
    atomic::{
        AtomicBool,
        Ordering,
    },
};
use tokio::{
    io::{
        AsyncBufReadExt,
        AsyncWriteExt,
        BufReader,
    },
    sync::mpsc,
};
use tracing::{
    debug,
    info,
    warn,
};

/// One parsed stdin line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConsoleInput {
    Event(ChatEvent),
    /// `> line`: run as the owner through the bot's console entry point.
    Command(String),
}

/// Reads `user: text`, `!notice text`, `!reconnect`, `!ban user` and `> line`.
/// Blank or unrecognised lines yield `None`.
pub fn parse_console_line(line: &str, channel: &str) -> Option<ConsoleInput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(command) = line.strip_prefix('>') {
        let command = command.trim();
        return (!command.is_empty()).then(|| ConsoleInput::Command(command.to_string()));
    }
    if line == "!reconnect" {
        return Some(ConsoleInput::Event(ChatEvent::ReconnectRequested));
    }
    if let Some(message) = line.strip_prefix("!notice ") {
        return Some(ConsoleInput::Event(ChatEvent::Notice {
            channel: channel.to_string(),
            message: message.trim().to_string(),
        }));
    }
    if let Some(user_name) = line.strip_prefix("!ban ") {
        return Some(ConsoleInput::Event(ChatEvent::Ban(BanEvent {
            channel: channel.to_string(),
            user_name: user_name.trim().to_string(),
            duration: None,
        })));
    }

    let (user_name, text) = line.split_once(':')?;
    let user_name = user_name.trim();
    if user_name.is_empty() || user_name.contains(char::is_whitespace) {
        return None;
    }
    Some(ConsoleInput::Event(ChatEvent::Message(ChatMessage::new(
        channel,
        user_name,
        text.trim(),
    ))))
}

/// Local stand-in for the chat service: chat is read from stdin and our own
/// messages are printed to stdout.
pub struct StdioTransport {
    channel: String,
    events: EventSink,
    console: mpsc::UnboundedSender<String>,
    reader_started: AtomicBool,
    connected: AtomicBool,
    joined: Mutex<Vec<String>>,
}

impl StdioTransport {
    pub fn new(
        channel: impl Into<String>,
        events: EventSink,
        console: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            events,
            console,
            reader_started: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            joined: Mutex::new(Vec::new()),
        }
    }

    fn spawn_reader(&self) {
        let channel = self.channel.clone();
        let events = self.events.clone();
        let console = self.console.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_console_line(&line, &channel) {
                        Some(ConsoleInput::Event(event)) => {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Some(ConsoleInput::Command(command)) => {
                            if console.send(command).is_err() {
                                break;
                            }
                        }
                        None => debug!(%line, "ignoring unrecognised console line"),
                    },
                    Ok(None) => {
                        info!("stdin closed, no more chat input");
                        break;
                    }
                    Err(err) => {
                        warn!(?err, "failed to read stdin");
                        break;
                    }
                }
            }
        });
    }
}

impl ChatTransport for StdioTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.reader_started.swap(true, Ordering::SeqCst) {
            self.spawn_reader();
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn join(&self, channel: &str) {
        let mut joined = self.joined.lock().unwrap_or_else(PoisonError::into_inner);
        if !joined.iter().any(|c| c == channel) {
            joined.push(channel.to_string());
        }
        info!(%channel, "joined channel");
    }

    async fn say(&self, channel: &str, message: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let line = format!("#{channel} <- {message}\n");
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|err| TransportError::Io(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn parse_console_line__reads_chat_message() {
        // when
        let input = parse_console_line("demonzzbot: alice bombs: 300", "stream");

        // then
        assert_eq!(
            input,
            Some(ConsoleInput::Event(ChatEvent::Message(ChatMessage::new(
                "stream",
                "demonzzbot",
                "alice bombs: 300"
            ))))
        );
    }

    #[test]
    fn parse_console_line__reads_control_lines() {
        assert_eq!(
            parse_console_line("!reconnect", "stream"),
            Some(ConsoleInput::Event(ChatEvent::ReconnectRequested))
        );
        assert_eq!(
            parse_console_line("!notice You are sending messages too quickly", "stream"),
            Some(ConsoleInput::Event(ChatEvent::Notice {
                channel: "stream".to_string(),
                message: "You are sending messages too quickly".to_string(),
            }))
        );
        assert_eq!(
            parse_console_line("!ban alice", "stream"),
            Some(ConsoleInput::Event(ChatEvent::Ban(BanEvent {
                channel: "stream".to_string(),
                user_name: "alice".to_string(),
                duration: None,
            })))
        );
        assert_eq!(
            parse_console_line("> !status", "stream"),
            Some(ConsoleInput::Command("!status".to_string()))
        );
    }

    #[test]
    fn parse_console_line__ignores_noise() {
        assert_eq!(parse_console_line("   ", "stream"), None);
        assert_eq!(parse_console_line(">", "stream"), None);
        assert_eq!(parse_console_line("no colon here", "stream"), None);
        assert_eq!(parse_console_line("two words: hi", "stream"), None);
    }

    #[tokio::test]
    async fn say__fails_until_connected() {
        // given
        let (events, _rx) = mpsc::unbounded_channel();
        let (console, _console_rx) = mpsc::unbounded_channel();
        let transport = StdioTransport::new("stream", events, console);

        // when
        let before = transport.say("stream", "hi").await;
        transport.disconnect().await.unwrap();
        let after_disconnect = transport.say("stream", "hi").await;

        // then
        assert_eq!(before, Err(TransportError::Disconnected));
        assert_eq!(after_disconnect, Err(TransportError::Disconnected));
    }
}
