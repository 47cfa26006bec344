//! Minecraft RCON client, just enough to log in and send `stop`.

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::adapters::RemoteConsole;

const TYPE_LOGIN: i32 = 3;
const TYPE_COMMAND: i32 = 2;
const MAX_PACKET_LEN: i32 = 4096 + 10;
const AUTH_FAILED_ID: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub(crate) request_id: i32,
    pub(crate) kind: i32,
    pub(crate) body: String,
}

pub(crate) fn encode_packet(request_id: i32, kind: i32, body: &str) -> Vec<u8> {
    let len = 4 + 4 + body.len() + 2;
    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as i32).to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body.as_bytes());
    out.extend_from_slice(&[0, 0]);
    out
}

/// Decodes the payload that follows the length prefix.
pub(crate) fn decode_payload(payload: &[u8]) -> anyhow::Result<Packet> {
    if payload.len() < 10 {
        anyhow::bail!("rcon packet too short ({} bytes)", payload.len());
    }
    let request_id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let kind = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let body = &payload[8..payload.len() - 2];
    Ok(Packet {
        request_id,
        kind,
        body: String::from_utf8_lossy(body).to_string(),
    })
}

async fn read_packet(stream: &mut TcpStream) -> anyhow::Result<Packet> {
    let len = stream.read_i32_le().await.context("read rcon length")?;
    if !(10..=MAX_PACKET_LEN).contains(&len) {
        anyhow::bail!("rcon packet length out of range: {len}");
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("read rcon payload")?;
    decode_payload(&payload)
}

async fn write_packet(stream: &mut TcpStream, request_id: i32, kind: i32, body: &str) -> anyhow::Result<()> {
    stream
        .write_all(&encode_packet(request_id, kind, body))
        .await
        .context("write rcon packet")?;
    stream.flush().await.context("flush rcon packet")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RconClient {
    timeout: Duration,
}

impl RconClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_command(&self, address: &str, port: u16, password: &str, command: &str) -> anyhow::Result<String> {
        let mut stream = TcpStream::connect((address, port))
            .await
            .with_context(|| format!("connect rcon {address}:{port}"))?;

        let login_id = rand::thread_rng().gen_range(1..i32::MAX);
        write_packet(&mut stream, login_id, TYPE_LOGIN, password).await?;
        let reply = read_packet(&mut stream).await?;
        if reply.request_id == AUTH_FAILED_ID || reply.request_id != login_id {
            anyhow::bail!("rcon login rejected");
        }

        let command_id = login_id + 1;
        write_packet(&mut stream, command_id, TYPE_COMMAND, command).await?;
        let reply = read_packet(&mut stream).await?;
        if reply.request_id != command_id {
            anyhow::bail!("rcon reply for unexpected request {}", reply.request_id);
        }
        Ok(reply.body)
    }
}

#[async_trait::async_trait]
impl RemoteConsole for RconClient {
    async fn send_stop(&self, address: &str, port: u16, password: &str) -> anyhow::Result<String> {
        tokio::time::timeout(self.timeout, self.run_command(address, port, password, "stop"))
            .await
            .map_err(|_| anyhow::anyhow!("rcon {address}:{port} timed out after {:?}", self.timeout))?
    }
}
