//! Minimal QMP client: one JSON object per line over a Unix socket.

use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use vmpod_core::{Error, Result};

pub(crate) struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    events: VecDeque<Value>,
}

impl QmpClient {
    /// Connects, reads the greeting and leaves capability negotiation mode.
    pub(crate) async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
            events: VecDeque::new(),
        };

        let greeting = client.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(Error::Hypervisor(format!(
                "unexpected QMP greeting: {greeting}"
            )));
        }

        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Runs `command` and returns its `return` payload.
    ///
    /// Events that arrive before the reply are queued for
    /// [`wait_for_event`](Self::wait_for_event).
    pub(crate) async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        let mut request = Map::new();
        request.insert("execute".to_string(), Value::from(command));
        if let Some(arguments) = arguments {
            request.insert("arguments".to_string(), arguments);
        }

        let mut line = Value::Object(request).to_string();
        tracing::debug!(qmp = %line, "sending QMP command");
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            let message = self.read_message().await?;
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(error) = message.get("error") {
                let desc = error
                    .get("desc")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(Error::Hypervisor(format!("{command}: {desc}")));
            }
            if message.get("event").is_some() {
                tracing::debug!(event = %message, "queued QMP event");
                self.events.push_back(message);
            }
        }
    }

    /// Waits for `event` whose `data.device` equals `device`.
    pub(crate) async fn wait_for_event(
        &mut self,
        event: &str,
        device: &str,
        timeout: Duration,
    ) -> Result<()> {
        let matches = |message: &Value| {
            message.get("event").and_then(Value::as_str) == Some(event)
                && message
                    .get("data")
                    .and_then(|data| data.get("device"))
                    .and_then(Value::as_str)
                    == Some(device)
        };

        if let Some(index) = self.events.iter().position(matches) {
            self.events.remove(index);
            return Ok(());
        }

        let wait = async {
            loop {
                let message = self.read_message().await?;
                if matches(&message) {
                    return Ok(());
                }
                if message.get("event").is_some() {
                    self.events.push_back(message);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Hypervisor(format!("timed out waiting for {event} on {device}")))?
    }

    /// Asks QEMU to exit. The socket is closed right after the reply.
    pub(crate) async fn quit(&mut self) -> Result<()> {
        self.execute("quit", None).await.map(|_| ())
    }

    async fn read_message(&mut self) -> Result<Value> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(Error::Hypervisor("QMP connection closed".to_string()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|e| Error::Hypervisor(format!("malformed QMP message: {e}")));
        }
    }
}

pub(crate) fn blockdev_add(node_name: &str, path: &Path, read_only: bool) -> Value {
    json!({
        "driver": "raw",
        "node-name": node_name,
        "read-only": read_only,
        "file": {
            "driver": if path.starts_with("/dev") { "host_device" } else { "file" },
            "filename": path.display().to_string(),
        },
    })
}
