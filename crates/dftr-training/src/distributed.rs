//! Multi-process context: device binding, process group, collectives.
//!
//! One process runs per device. Rank 0 hosts a TCP rendezvous; every other rank
//! connects to it. Reductions are summed on rank 0 in rank order and broadcast back,
//! so all ranks observe bit-identical results. Messages are framed with
//! [`LengthDelimitedCodec`] over blocking sockets, since collectives run inside the
//! synchronous training loop.

use crate::config::RunConfig;
use crate::error::{TrainingError, TrainingResult};
use bytes::{Bytes, BytesMut};
use dftr_abstraction::{BatchStatistics, ParameterSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tracing::{debug, info, warn};

/// Collective operations across the processes of one run.
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Sums `buf` elementwise across all ranks in place.
    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> TrainingResult<()>;

    /// Blocks until every rank reaches the barrier.
    fn barrier(&mut self) -> TrainingResult<()> {
        let mut token = [0.0_f32];
        self.all_reduce_sum(&mut token)
    }

    /// Closes connections. Must tolerate repeated calls.
    fn shutdown(&mut self);
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: usize,
    world_size: usize,
    cls: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloAck {
    accepted: bool,
    reason: Option<String>,
}

/// Timeouts applied to the rendezvous and to every collective afterwards.
#[derive(Debug, Clone, Copy)]
pub struct GroupTimeouts {
    pub init: Duration,
    pub op: Duration,
}

const MAX_FRAME_BYTES: usize = 1 << 30;
const READ_CHUNK: usize = 64 * 1024;

/// A blocking connection carrying `u32` little-endian length-prefixed frames.
struct FramedStream {
    stream: TcpStream,
    codec: LengthDelimitedCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl FramedStream {
    fn new(stream: TcpStream) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .little_endian()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec();
        Self { stream, codec, read_buf: BytesMut::new(), write_buf: BytesMut::new() }
    }

    fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_buf.clear();
        self.codec.encode(Bytes::copy_from_slice(payload), &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf)?;
        self.stream.flush()
    }

    /// Reads until one whole frame is buffered; bytes past it stay for the next call.
    fn recv(&mut self) -> io::Result<BytesMut> {
        let mut chunk = vec![0_u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "connection closed by peer"));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn socket(&self) -> &TcpStream {
        &self.stream
    }
}

fn encode_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_f32_into(bytes: &[u8], out: &mut [f32]) -> TrainingResult<()> {
    if bytes.len() != out.len() * 4 {
        return Err(TrainingError::Distributed(format!(
            "peer sent {} values, expected {}",
            bytes.len() / 4,
            out.len()
        )));
    }
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

fn init_err(context: &str, err: impl fmt::Display) -> TrainingError {
    TrainingError::DistributedInit(format!("{context}: {err}"))
}

fn comm_err(rank: usize, err: impl fmt::Display) -> TrainingError {
    TrainingError::Distributed(format!("rank {rank}: {err}"))
}

/// Star-topology process group over TCP.
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    /// Rank 0: one stream per peer, indexed by `rank - 1`. Other ranks: the stream to rank 0.
    peers: Vec<FramedStream>,
    closed: bool,
}

impl fmt::Debug for TcpProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("connections", &self.peers.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl TcpProcessGroup {
    /// Joins the group at `addr`, hosting it when `rank == 0`.
    pub fn connect(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        cls: &str,
        timeouts: GroupTimeouts,
    ) -> TrainingResult<Self> {
        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|e| init_err(&format!("bind {addr}"), e))?;
            Self::host(listener, world_size, cls, timeouts)
        } else {
            Self::join(addr, rank, world_size, cls, timeouts)
        }
    }

    /// Rank 0: accepts `world_size - 1` peers on `listener` and validates their handshakes.
    pub fn host(listener: TcpListener, world_size: usize, cls: &str, timeouts: GroupTimeouts) -> TrainingResult<Self> {
        let deadline = Instant::now() + timeouts.init;
        listener.set_nonblocking(true).map_err(|e| init_err("listener", e))?;

        let mut slots: Vec<Option<FramedStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < slots.len() {
            let stream = match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "rendezvous connection");
                    stream
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(TrainingError::DistributedInit(format!(
                            "rendezvous timed out after {:?}: {} of {} peers joined",
                            timeouts.init,
                            joined,
                            world_size - 1
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                    continue;
                }
                Err(e) => return Err(init_err("accept", e)),
            };
            stream.set_nonblocking(false).map_err(|e| init_err("socket", e))?;
            stream.set_read_timeout(Some(timeouts.init)).map_err(|e| init_err("socket", e))?;
            stream.set_nodelay(true).map_err(|e| init_err("socket", e))?;
            let mut conn = FramedStream::new(stream);

            let hello: Hello = serde_json::from_slice(&conn.recv().map_err(|e| init_err("handshake", e))?)
                .map_err(|e| init_err("handshake", e))?;

            let rejection = if hello.world_size != world_size {
                Some(format!("peer reports world size {}, host has {}", hello.world_size, world_size))
            } else if hello.rank == 0 || hello.rank >= world_size {
                Some(format!("peer rank {} is outside 1..{}", hello.rank, world_size))
            } else if slots[hello.rank - 1].is_some() {
                Some(format!("rank {} joined twice", hello.rank))
            } else if hello.cls != cls {
                Some(format!("peer trains '{}', host trains '{}'", hello.cls, cls))
            } else {
                None
            };

            let ack = HelloAck { accepted: rejection.is_none(), reason: rejection.clone() };
            let ack = serde_json::to_vec(&ack).map_err(|e| init_err("handshake", e))?;
            conn.send(&ack).map_err(|e| init_err("handshake", e))?;

            if let Some(reason) = rejection {
                return Err(TrainingError::DistributedInit(reason));
            }
            conn.socket().set_read_timeout(Some(timeouts.op)).map_err(|e| init_err("socket", e))?;
            conn.socket().set_write_timeout(Some(timeouts.op)).map_err(|e| init_err("socket", e))?;
            slots[hello.rank - 1] = Some(conn);
            joined += 1;
        }

        let peers = slots.into_iter().flatten().collect();
        Ok(Self { rank: 0, world_size, peers, closed: false })
    }

    /// Rank > 0: connects to the host, retrying until the init timeout.
    pub fn join(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        cls: &str,
        timeouts: GroupTimeouts,
    ) -> TrainingResult<Self> {
        let deadline = Instant::now() + timeouts.init;
        let stream = loop {
            match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(init_err(&format!("rank {rank} could not reach {addr} within {:?}", timeouts.init), e));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        };
        stream.set_nodelay(true).map_err(|e| init_err("socket", e))?;
        stream.set_read_timeout(Some(timeouts.init)).map_err(|e| init_err("socket", e))?;
        let mut conn = FramedStream::new(stream);

        let hello = Hello { rank, world_size, cls: cls.to_string() };
        let hello = serde_json::to_vec(&hello).map_err(|e| init_err("handshake", e))?;
        conn.send(&hello).map_err(|e| init_err("handshake", e))?;

        let ack: HelloAck = serde_json::from_slice(&conn.recv().map_err(|e| init_err("handshake", e))?)
            .map_err(|e| init_err("handshake", e))?;
        if !ack.accepted {
            return Err(TrainingError::DistributedInit(
                ack.reason.unwrap_or_else(|| "rejected by rank 0".to_string()),
            ));
        }
        conn.socket().set_read_timeout(Some(timeouts.op)).map_err(|e| init_err("socket", e))?;
        conn.socket().set_write_timeout(Some(timeouts.op)).map_err(|e| init_err("socket", e))?;

        Ok(Self { rank, world_size, peers: vec![conn], closed: false })
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&mut self, buf: &mut [f32]) -> TrainingResult<()> {
        if self.closed {
            return Err(comm_err(self.rank, "process group already shut down"));
        }
        let rank = self.rank;
        if rank == 0 {
            let mut incoming = vec![0.0_f32; buf.len()];
            for peer in &mut self.peers {
                let bytes = peer.recv().map_err(|e| comm_err(rank, e))?;
                decode_f32_into(&bytes, &mut incoming)?;
                for (acc, v) in buf.iter_mut().zip(&incoming) {
                    *acc += *v;
                }
            }
            let reduced = encode_f32(buf);
            for peer in &mut self.peers {
                peer.send(&reduced).map_err(|e| comm_err(rank, e))?;
            }
        } else {
            let host = self.peers.first_mut().ok_or_else(|| comm_err(rank, "no connection to rank 0"))?;
            host.send(&encode_f32(buf)).map_err(|e| comm_err(rank, e))?;
            let bytes = host.recv().map_err(|e| comm_err(rank, e))?;
            decode_f32_into(&bytes, buf)?;
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        for peer in &self.peers {
            let _ = peer.socket().shutdown(std::net::Shutdown::Both);
        }
        self.peers.clear();
        self.closed = true;
    }
}

/// Rank, world size, bound device, and the group handle (absent for single-device runs).
pub struct DistributedState {
    pub rank: usize,
    pub world_size: usize,
    pub local_device: usize,
    group: Option<Box<dyn ProcessGroup>>,
}

impl fmt::Debug for DistributedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedState")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("local_device", &self.local_device)
            .field("group", &self.group.is_some())
            .finish()
    }
}

/// Owns the [`DistributedState`] for a run and tears it down exactly once.
#[derive(Debug)]
pub struct DistributedContext {
    state: DistributedState,
}

impl DistributedContext {
    /// Single-process context with no group.
    #[must_use]
    pub fn single(device: usize) -> Self {
        Self { state: DistributedState { rank: 0, world_size: 1, local_device: device, group: None } }
    }

    /// Wraps an already formed group.
    #[must_use]
    pub fn with_group(group: Box<dyn ProcessGroup>, local_device: usize) -> Self {
        let (rank, world_size) = (group.rank(), group.world_size());
        Self { state: DistributedState { rank, world_size, local_device, group: Some(group) } }
    }

    /// One device is a no-op context; more devices bind to `devices[rank]` and join the group.
    pub fn initialize(config: &RunConfig) -> TrainingResult<Self> {
        if config.world_size <= 1 {
            let device = config.devices.first().copied().unwrap_or(0);
            debug!(device, "single-device run, no process group");
            return Ok(Self::single(device));
        }

        let rank = config.local_rank;
        if rank >= config.world_size {
            return Err(TrainingError::DistributedInit(format!(
                "rank {} is not valid for world size {}",
                rank, config.world_size
            )));
        }
        let device = *config.devices.get(rank).ok_or_else(|| {
            TrainingError::DistributedInit(format!("no device assigned to rank {rank} in {:?}", config.devices))
        })?;

        info!(
            rank,
            world_size = config.world_size,
            device,
            rendezvous = %config.distributed.rendezvous,
            "joining process group"
        );
        let timeouts = GroupTimeouts { init: config.distributed.init_timeout(), op: config.distributed.op_timeout() };
        let group = TcpProcessGroup::connect(
            config.distributed.rendezvous,
            rank,
            config.world_size,
            config.cls.name(),
            timeouts,
        )?;
        info!(rank, "process group ready");
        Ok(Self::with_group(Box::new(group), device))
    }

    #[must_use]
    pub fn state(&self) -> &DistributedState {
        &self.state
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.state.rank
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.state.world_size
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.state.rank == 0
    }

    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.state.group.is_some()
    }

    /// Sums across ranks; no-op without a group.
    pub fn all_reduce_sum(&mut self, buf: &mut [f32]) -> TrainingResult<()> {
        match self.state.group.as_mut() {
            Some(group) => group.all_reduce_sum(buf),
            None => Ok(()),
        }
    }

    /// Averages every tensor of `set` across ranks.
    pub fn all_reduce_mean(&mut self, set: &mut ParameterSet) -> TrainingResult<()> {
        if self.state.group.is_none() {
            return Ok(());
        }
        let mut flat = set.flatten();
        self.all_reduce_sum(&mut flat)?;
        let inv = 1.0 / self.state.world_size as f32;
        for v in &mut flat {
            *v *= inv;
        }
        set.unflatten_from(&flat)?;
        Ok(())
    }

    /// Sums batch-norm statistics so every rank folds in the global batch.
    pub fn sync_batch_statistics(&mut self, stats: &mut [BatchStatistics]) -> TrainingResult<()> {
        if self.state.group.is_none() || stats.is_empty() {
            return Ok(());
        }
        let mut flat = Vec::with_capacity(stats.iter().map(BatchStatistics::flat_len).sum());
        for s in stats.iter() {
            s.write_flat(&mut flat);
        }
        self.all_reduce_sum(&mut flat)?;
        let mut offset = 0;
        for s in stats.iter_mut() {
            offset += s.read_flat(&flat[offset..])?;
        }
        Ok(())
    }

    pub fn barrier(&mut self) -> TrainingResult<()> {
        match self.state.group.as_mut() {
            Some(group) => group.barrier(),
            None => Ok(()),
        }
    }

    /// Releases the group. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(mut group) = self.state.group.take() {
            group.shutdown();
            info!(rank = self.state.rank, "process group torn down");
        }
    }
}

impl Drop for DistributedContext {
    fn drop(&mut self) {
        if self.state.group.is_some() {
            warn!(rank = self.state.rank, "distributed context dropped without explicit teardown");
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dftr_abstraction::Tensor;

    fn timeouts() -> GroupTimeouts {
        GroupTimeouts { init: Duration::from_secs(10), op: Duration::from_secs(10) }
    }

    #[test]
    fn test_single_context_is_noop() {
        let mut ctx = DistributedContext::single(0);
        let mut buf = vec![1.0, 2.0];
        ctx.all_reduce_sum(&mut buf).unwrap();
        assert_eq!(buf, vec![1.0, 2.0]);

        let mut set = ParameterSet::new();
        set.insert("w", Tensor::from_vec(vec![3.0]));
        ctx.all_reduce_mean(&mut set).unwrap();
        assert_eq!(set.get("w").unwrap().data(), &[3.0]);
        assert!(!ctx.is_distributed());

        ctx.teardown();
        ctx.teardown();
    }

    #[test]
    fn test_tcp_all_reduce_is_identical_on_every_rank() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peers: Vec<_> = (1..3)
            .map(|rank| {
                std::thread::spawn(move || {
                    let mut group = TcpProcessGroup::join(addr, rank, 3, "ape", timeouts()).unwrap();
                    let mut buf = vec![rank as f32, 1.0];
                    group.all_reduce_sum(&mut buf).unwrap();
                    group.shutdown();
                    buf
                })
            })
            .collect();

        let mut host = TcpProcessGroup::host(listener, 3, "ape", timeouts()).unwrap();
        let mut buf = vec![0.0, 1.0];
        host.all_reduce_sum(&mut buf).unwrap();
        host.shutdown();
        host.shutdown();

        assert_eq!(buf, vec![3.0, 3.0]);
        for peer in peers {
            assert_eq!(peer.join().unwrap(), vec![3.0, 3.0]);
        }
    }

    #[test]
    fn test_handshake_rejects_class_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || TcpProcessGroup::join(addr, 1, 2, "cat", timeouts()));

        let host = TcpProcessGroup::host(listener, 2, "ape", timeouts());
        assert!(matches!(host, Err(TrainingError::DistributedInit(_))));
        assert!(matches!(peer.join().unwrap(), Err(TrainingError::DistributedInit(_))));
    }

    fn connected_pair() -> (TcpStream, FramedStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (raw, FramedStream::new(accepted))
    }

    #[test]
    fn test_frames_sent_back_to_back_arrive_in_order() {
        let (mut raw, mut framed) = connected_pair();
        let mut wire = Vec::new();
        for payload in [&b"first"[..], &b""[..], &b"third frame"[..]] {
            wire.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            wire.extend_from_slice(payload);
        }
        raw.write_all(&wire).unwrap();

        assert_eq!(&framed.recv().unwrap()[..], b"first");
        assert!(framed.recv().unwrap().is_empty());
        assert_eq!(&framed.recv().unwrap()[..], b"third frame");
    }

    #[test]
    fn test_oversized_or_truncated_frames_are_errors() {
        let (mut raw, mut framed) = connected_pair();
        raw.write_all(&u32::MAX.to_le_bytes()).unwrap();
        assert_eq!(framed.recv().unwrap_err().kind(), ErrorKind::InvalidData);

        let (mut raw, mut framed) = connected_pair();
        raw.write_all(&8_u32.to_le_bytes()).unwrap();
        raw.write_all(b"half").unwrap();
        drop(raw);
        assert_eq!(framed.recv().unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rendezvous_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let short = GroupTimeouts { init: Duration::from_millis(100), op: Duration::from_secs(1) };
        let err = TcpProcessGroup::host(listener, 2, "ape", short).unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
