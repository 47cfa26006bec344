//! Minecraft query protocol (UDP): handshake, then basic stat.

use std::time::Duration;

use anyhow::Context;
use beacon_lifecycle::ObservedStats;
use tokio::net::UdpSocket;

use crate::adapters::StatsQuery;

const MAGIC: [u8; 2] = [0xFE, 0xFD];
const TYPE_HANDSHAKE: u8 = 0x09;
const TYPE_STAT: u8 = 0x00;
const SESSION_MASK: u32 = 0x0F0F_0F0F;
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone)]
pub struct QueryClient {
    timeout: Duration,
}

impl QueryClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn exchange(socket: &UdpSocket, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        socket.send(packet).await.context("send query packet")?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let n = socket.recv(&mut buf).await.context("receive query reply")?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn query(&self, address: &str, port: u16) -> anyhow::Result<ObservedStats> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await.context("bind query socket")?;
        socket
            .connect((address, port))
            .await
            .with_context(|| format!("connect query {address}:{port}"))?;

        let session = rand::random::<u32>() & SESSION_MASK;
        let reply = Self::exchange(&socket, &handshake_packet(session)).await?;
        let token = parse_handshake_reply(&reply, session)?;
        let reply = Self::exchange(&socket, &basic_stat_packet(session, token)).await?;
        parse_basic_stat(&reply, session)
    }
}

#[async_trait::async_trait]
impl StatsQuery for QueryClient {
    async fn query_stats(&self, address: &str, port: u16) -> anyhow::Result<ObservedStats> {
        tokio::time::timeout(self.timeout, self.query(address, port))
            .await
            .map_err(|_| anyhow::anyhow!("query {address}:{port} timed out after {:?}", self.timeout))?
    }
}

pub(crate) fn handshake_packet(session: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    out.extend_from_slice(&MAGIC);
    out.push(TYPE_HANDSHAKE);
    out.extend_from_slice(&session.to_be_bytes());
    out
}

pub(crate) fn basic_stat_packet(session: u32, token: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(11);
    out.extend_from_slice(&MAGIC);
    out.push(TYPE_STAT);
    out.extend_from_slice(&session.to_be_bytes());
    out.extend_from_slice(&token.to_be_bytes());
    out
}

fn check_header(buf: &[u8], kind: u8, session: u32) -> anyhow::Result<&[u8]> {
    if buf.len() < 5 {
        anyhow::bail!("query reply too short ({} bytes)", buf.len());
    }
    if buf[0] != kind {
        anyhow::bail!("unexpected query reply type {:#04x}", buf[0]);
    }
    let got = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if got & SESSION_MASK != session {
        anyhow::bail!("query reply for foreign session {got:#010x}");
    }
    Ok(&buf[5..])
}

/// Splits off one NUL-terminated field.
fn take_cstr(buf: &[u8]) -> anyhow::Result<(String, &[u8])> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| anyhow::anyhow!("unterminated field in query reply"))?;
    Ok((String::from_utf8_lossy(&buf[..end]).to_string(), &buf[end + 1..]))
}

pub(crate) fn parse_handshake_reply(buf: &[u8], session: u32) -> anyhow::Result<i32> {
    let rest = check_header(buf, TYPE_HANDSHAKE, session)?;
    let (token, _) = take_cstr(rest)?;
    token
        .trim()
        .parse::<i32>()
        .with_context(|| format!("invalid challenge token {token:?}"))
}

pub(crate) fn parse_basic_stat(buf: &[u8], session: u32) -> anyhow::Result<ObservedStats> {
    let rest = check_header(buf, TYPE_STAT, session)?;
    let (motd, rest) = take_cstr(rest)?;
    let (_gametype, rest) = take_cstr(rest)?;
    let (_map, rest) = take_cstr(rest)?;
    let (numplayers, rest) = take_cstr(rest)?;
    let (maxplayers, _rest) = take_cstr(rest)?;

    let participant_count = numplayers
        .trim()
        .parse::<u32>()
        .with_context(|| format!("invalid numplayers {numplayers:?}"))?;
    Ok(ObservedStats {
        participant_count,
        max_participants: maxplayers.trim().parse::<u32>().ok(),
        motd: Some(motd).filter(|m| !m.is_empty()),
    })
}
