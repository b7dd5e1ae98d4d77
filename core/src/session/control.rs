//! Control socket protocol (spec §6.2): newline-delimited JSON commands over a Unix
//! domain socket the owning session process listens on. Single client at a time;
//! concurrent connects are serialized by fully draining one connection before accepting
//! the next.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use crate::pty::Signal;
use crate::session::manager::Input;

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Command {
    Input {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        key: Option<String>,
    },
    Resize { cols: u16, rows: u16 },
    Kill { signal: Option<String> },
}

#[derive(Debug, serde::Serialize)]
struct Reply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// What the control listener dispatches commands to. Implemented by `manager::LiveSession`
/// so this module stays decoupled from session-manager internals (and is independently
/// unit-testable with a fake handler).
pub trait ControlHandler: Send + Sync {
    fn input(&self, input: Input) -> crate::error::Result<()>;
    fn resize(&self, cols: u16, rows: u16) -> crate::error::Result<()>;
    fn kill(&self, signal: Signal) -> crate::error::Result<()>;
}

/// Accept loop for one session's control socket. Runs until the listener errors (e.g.
/// the socket file is removed on session cleanup).
pub async fn serve(listener: UnixListener, handler: Arc<dyn ControlHandler>) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => break,
        };
        // Fully drain this connection before accepting the next: single-client-at-a-time.
        handle_connection(stream, &handler).await;
    }
}

async fn handle_connection(stream: tokio::net::UnixStream, handler: &Arc<dyn ControlHandler>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatch(&line, handler);
        let mut out = match serde_json::to_vec(&reply) {
            Ok(v) => v,
            Err(_) => continue,
        };
        out.push(b'\n');
        if writer.write_all(&out).await.is_err() {
            break;
        }
    }
}

fn dispatch(line: &str, handler: &Arc<dyn ControlHandler>) -> Reply {
    let command: Command = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => return Reply { ok: false, error: Some(format!("invalid command: {e}")) },
    };
    let result = match command {
        Command::Input { text, key } => match (text, key) {
            (Some(text), None) => handler.input(Input::Text(text)),
            (None, Some(key)) => handler.input(Input::Key(key)),
            _ => Err(crate::Error::InvalidArgument(
                "input requires exactly one of text or key".into(),
            )),
        },
        Command::Resize { cols, rows } => handler.resize(cols, rows),
        Command::Kill { signal } => {
            let signal = signal.unwrap_or_else(|| "SIGTERM".to_string());
            match Signal::parse(&signal) {
                Ok(signal) => handler.kill(signal),
                Err(e) => Err(e),
            }
        }
    };
    match result {
        Ok(()) => Reply { ok: true, error: None },
        Err(e) => Reply { ok: false, error: Some(e.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        inputs: Mutex<Vec<Input>>,
    }

    impl ControlHandler for RecordingHandler {
        fn input(&self, input: Input) -> crate::error::Result<()> {
            self.inputs.lock().unwrap().push(input);
            Ok(())
        }
        fn resize(&self, _cols: u16, _rows: u16) -> crate::error::Result<()> {
            Ok(())
        }
        fn kill(&self, _signal: Signal) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rejects_both_text_and_key() {
        let handler: Arc<dyn ControlHandler> =
            Arc::new(RecordingHandler { inputs: Mutex::new(Vec::new()) });
        let reply = dispatch(r#"{"type":"input","text":"a","key":"enter"}"#, &handler);
        assert!(!reply.ok);
    }

    #[test]
    fn dispatches_resize() {
        let handler: Arc<dyn ControlHandler> =
            Arc::new(RecordingHandler { inputs: Mutex::new(Vec::new()) });
        let reply = dispatch(r#"{"type":"resize","cols":100,"rows":30}"#, &handler);
        assert!(reply.ok);
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let handler: Arc<dyn ControlHandler> =
            Arc::new(RecordingHandler { inputs: Mutex::new(Vec::new()) });
        let reply = dispatch(r#"{"type":"kill","signal":"SIGWHAT"}"#, &handler);
        assert!(!reply.ok);
    }
}
