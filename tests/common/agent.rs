//! Minimal socket client speaking the line-delimited JSON protocol

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestAgent {
    pub logical_id: String,
    pub connection_id: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestAgent {
    /// Connect and consume the `CONNECTION_ESTABLISHED` greeting
    pub async fn connect(address: SocketAddr, logical_id: &str) -> Self {
        let stream = TcpStream::connect(address).await.expect("connect to conductor");
        let (reader, writer) = stream.into_split();
        let mut agent = Self {
            logical_id: logical_id.to_string(),
            connection_id: String::new(),
            lines: BufReader::new(reader).lines(),
            writer,
        };
        let greeting = agent.recv().await;
        assert_eq!(greeting["type"], "CONNECTION_ESTABLISHED");
        agent.connection_id = greeting["payload"]["connectionId"]
            .as_str()
            .expect("greeting carries a connection id")
            .to_string();
        agent
    }

    /// Connect, register and wait for the registration ack
    pub async fn register(address: SocketAddr, logical_id: &str, capabilities: &[&str]) -> Self {
        let mut agent = Self::connect(address, logical_id).await;
        let id = agent
            .send(
                "AGENT_READY",
                json!({ "role": "agent", "capabilities": capabilities }),
            )
            .await;
        let ack = agent.recv_type("SYSTEM_ACK").await;
        assert_eq!(ack["payload"]["ackId"], id.as_str());
        agent
    }

    /// Send a frame from this agent to the conductor; returns the message id
    pub async fn send(&mut self, message_type: &str, payload: Value) -> String {
        let from = self.logical_id.clone();
        self.send_as(&from, "conductor", message_type, payload).await
    }

    pub async fn send_as(&mut self, from: &str, to: &str, message_type: &str, payload: Value) -> String {
        let id = Uuid::new_v4().to_string();
        let frame = json!({
            "id": id,
            "type": message_type,
            "from": from,
            "to": to,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "payload": payload,
        });
        self.send_raw(&frame.to_string()).await;
        id
    }

    pub async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write frame");
    }

    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("frame within timeout")
            .expect("read frame")
            .expect("connection open");
        serde_json::from_str(&line).expect("frame is JSON")
    }

    /// Skip frames until one of `message_type` arrives
    pub async fn recv_type(&mut self, message_type: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == message_type {
                return frame;
            }
        }
    }

    /// Next frame, if any arrives within `wait`
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => serde_json::from_str(&line).ok(),
            _ => None,
        }
    }

    /// True once the conductor has closed the socket
    pub async fn is_closed(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}
