//! Byte pumps between two duplex streams

use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::flow::{FlowGate, FlowLimits};

/// Read size per chunk
const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Device,
}

#[derive(Debug)]
pub struct BridgeOutcome {
    /// Side whose outbound direction finished first
    pub ended_by: Side,
    /// Set when that direction ended on an I/O error rather than EOF
    pub error: Option<io::Error>,
}

/// Copy `reader` into `writer` until EOF, pausing reads while the gate is shut.
///
/// Chunks are written in the order they were read. After the reader hits
/// EOF the already-read chunks are still flushed before returning.
pub async fn pump<R, W>(reader: &mut R, writer: &mut W, gate: &FlowGate) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let read_side = async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            gate.ready().await;
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            gate.charge(n);
            if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                return Ok(());
            }
        }
    };

    let write_side = async move {
        let mut total = 0u64;
        while let Some(chunk) = rx.recv().await {
            writer.write_all(&chunk).await?;
            writer.flush().await?;
            gate.release(chunk.len());
            total += chunk.len() as u64;
        }
        Ok::<u64, io::Error>(total)
    };

    tokio::pin!(read_side, write_side);
    let mut reading = true;
    loop {
        tokio::select! {
            res = &mut read_side, if reading => {
                res?;
                reading = false;
            }
            res = &mut write_side => return res,
        }
    }
}

/// Bridge `client` and `device` in both directions until either direction ends.
///
/// There is no half-open state: as soon as one direction finishes, both are
/// dropped and the caller is expected to shut both streams down.
pub async fn bridge<A, B>(client: &mut A, device: &mut B, limits: &FlowLimits) -> BridgeOutcome
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut device_read, mut device_write) = tokio::io::split(device);

    let upstream = FlowGate::new(limits);
    let downstream = FlowGate::new(limits);

    tokio::select! {
        res = pump(&mut client_read, &mut device_write, &upstream) => {
            debug!("client -> device finished: {:?}", res);
            BridgeOutcome { ended_by: Side::Client, error: res.err() }
        }
        res = pump(&mut device_read, &mut client_write, &downstream) => {
            debug!("device -> client finished: {:?}", res);
            BridgeOutcome { ended_by: Side::Device, error: res.err() }
        }
    }
}
