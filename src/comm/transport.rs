use crate::encoding::bincode;
use crate::error::Result;
use crate::Rank;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write as _};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

/// A raw frame on the fabric: sender rank, wire tag (which may carry the
/// batched offset), and payload bytes. Transports move frames between ranks
/// in FIFO order per (sender, receiver) pair and know nothing about their
/// contents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub from: Rank,
    pub tag: u32,
    pub payload: Vec<u8>,
}

/// A point-to-point transport between this worker and its peers. All calls
/// are non-blocking; the message queue polls `recv` from the event loop.
pub trait Transport: Send {
    /// Queues a frame for delivery to the given rank.
    fn send(&self, to: Rank, frame: Frame) -> Result<()>;
    /// Polls for a received frame.
    fn recv(&self) -> Result<Option<Frame>>;
    /// Whether no received frames are waiting.
    fn is_idle(&self) -> bool;
}

/// An in-memory transport over crossbeam channels, connecting the workers of
/// a single process. Used by the deterministic cluster tests and by mono
/// deployments that run the whole fleet in one process.
pub struct ChannelTransport {
    rank: Rank,
    inbox: Receiver<Frame>,
    inbox_tx: Sender<Frame>,
    peers: HashMap<Rank, Sender<Frame>>,
}

/// Builds a fully connected mesh of in-memory transports for ranks 0..n.
pub fn channel_mesh(n: u32) -> Vec<ChannelTransport> {
    let channels: Vec<_> = (0..n).map(|_| unbounded()).collect();
    (0..n)
        .map(|rank| {
            let peers = (0..n)
                .filter(|&peer| peer != rank)
                .map(|peer| (peer, channels[peer as usize].0.clone()))
                .collect();
            ChannelTransport {
                rank,
                inbox: channels[rank as usize].1.clone(),
                inbox_tx: channels[rank as usize].0.clone(),
                peers,
            }
        })
        .collect()
}

impl ChannelTransport {
    /// A sender delivering frames straight into this worker's inbox, used by
    /// test harnesses to play the role of a client.
    pub fn injector(&self) -> Sender<Frame> {
        self.inbox_tx.clone()
    }
}

impl Transport for ChannelTransport {
    fn send(&self, to: Rank, frame: Frame) -> Result<()> {
        match self.peers.get(&to) {
            Some(tx) => Ok(tx.send(frame)?),
            None => Err(crate::error::Error::IO(format!(
                "rank {} has no channel to rank {to}",
                self.rank
            ))),
        }
    }

    fn recv(&self) -> Result<Option<Frame>> {
        Ok(self.inbox.try_recv().ok())
    }

    fn is_idle(&self) -> bool {
        self.inbox.is_empty()
    }
}

/// A TCP transport for multi-process fleets. One listener thread accepts
/// peer connections and forwards decoded frames into the inbox; one writer
/// thread per peer drains an outbound channel, reconnecting on failure.
/// Delivery is best-effort: frames queued while a peer is unreachable are
/// dropped with the session, which the scheduler's idempotent handlers
/// tolerate.
pub struct TcpTransport {
    inbox: Receiver<Frame>,
    peers: HashMap<Rank, Sender<Frame>>,
}

impl TcpTransport {
    pub fn new(rank: Rank, listen_addr: &str, peers: HashMap<Rank, String>) -> Result<Self> {
        let (inbox_tx, inbox) = unbounded::<Frame>();

        let listener = TcpListener::bind(listen_addr)?;
        info!("rank {rank} listening for peers on {listen_addr}");
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(socket) => {
                        let inbox_tx = inbox_tx.clone();
                        std::thread::spawn(move || Self::receive_peer(socket, inbox_tx));
                    }
                    Err(err) => error!("peer accept failed: {err}"),
                }
            }
        });

        let mut peer_txs = HashMap::new();
        for (peer, addr) in peers {
            let (tx, rx) = unbounded::<Frame>();
            peer_txs.insert(peer, tx);
            std::thread::spawn(move || Self::send_peer(peer, addr, rx));
        }

        Ok(Self { inbox, peers: peer_txs })
    }

    /// Receives frames from one inbound peer connection until it closes.
    fn receive_peer(socket: TcpStream, inbox_tx: Sender<Frame>) {
        let peer = socket.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        debug!("peer {peer} connected");
        let mut reader = BufReader::new(socket);
        loop {
            match bincode::deserialize_from::<_, Frame>(&mut reader) {
                Ok(frame) => {
                    if inbox_tx.send(frame).is_err() {
                        return;
                    }
                }
                Err(_) => {
                    debug!("peer {peer} disconnected");
                    return;
                }
            }
        }
    }

    /// Sends frames to one peer, continuously reconnecting.
    fn send_peer(peer: Rank, addr: String, rx: Receiver<Frame>) {
        loop {
            match TcpStream::connect(&addr) {
                Ok(socket) => {
                    debug!("connected to peer {peer} at {addr}");
                    if Self::send_peer_session(socket, &rx).is_none() {
                        return; // channel closed, transport dropped
                    }
                    error!("session to peer {peer} failed, reconnecting");
                }
                Err(err) => error!("failed connecting to peer {peer} at {addr}: {err}"),
            }
            std::thread::sleep(Duration::from_millis(1000));
        }
    }

    /// Sends frames over one connected session. Returns None when the
    /// outbound channel closed, Some(()) when the session itself failed.
    fn send_peer_session(socket: TcpStream, rx: &Receiver<Frame>) -> Option<()> {
        let mut writer = BufWriter::new(socket);
        for frame in rx.iter() {
            if bincode::serialize_into(&mut writer, &frame).is_err() {
                return Some(());
            }
            if writer.flush().is_err() {
                return Some(());
            }
        }
        None
    }
}

impl Transport for TcpTransport {
    fn send(&self, to: Rank, frame: Frame) -> Result<()> {
        match self.peers.get(&to) {
            Some(tx) => Ok(tx.send(frame)?),
            None => Err(crate::error::Error::IO(format!("unknown peer rank {to}"))),
        }
    }

    fn recv(&self) -> Result<Option<Frame>> {
        Ok(self.inbox.try_recv().ok())
    }

    fn is_idle(&self) -> bool {
        self.inbox.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_delivers_in_send_order() {
        let mesh = channel_mesh(3);
        for i in 0..4u8 {
            mesh[0].send(2, Frame { from: 0, tag: 26, payload: vec![i] }).unwrap();
        }
        mesh[1].send(2, Frame { from: 1, tag: 26, payload: vec![9] }).unwrap();

        let mut from_zero = Vec::new();
        let mut from_one = Vec::new();
        while let Some(frame) = mesh[2].recv().unwrap() {
            match frame.from {
                0 => from_zero.push(frame.payload[0]),
                1 => from_one.push(frame.payload[0]),
                _ => unreachable!(),
            }
        }
        assert_eq!(from_zero, vec![0, 1, 2, 3]);
        assert_eq!(from_one, vec![9]);
        assert!(mesh[2].is_idle());
    }

    #[test]
    fn mesh_has_no_self_edge() {
        let mesh = channel_mesh(2);
        assert!(mesh[0].send(0, Frame { from: 0, tag: 26, payload: vec![] }).is_err());
    }
}
