//! TCP star group: rank 0 listens, every other rank connects to it.
//!
//! Wire format (little endian):
//! - handshake, peer to root: `magic u32, rank u32, world_size u32`
//! - ack, root to peer: `magic u32, world_size u32`
//! - collective frame, both ways: `op u8, len u32, len x f32`
//!
//! Rank 0 combines contributions and sends the result back to every peer.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use super::{
    concat_in_rank_order, reduce_in_rank_order, Communicator, ProcessGroup, TopologyEnv,
};
use crate::{Error, Result};

const MAGIC: u32 = 0x5445_5353;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Barrier = 1,
    AllReduce = 2,
    AllGather = 3,
}

impl Op {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Barrier),
            2 => Some(Self::AllReduce),
            3 => Some(Self::AllGather),
            _ => None,
        }
    }
}

struct Link {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Link {
    fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
        })
    }

    fn send(&mut self, op: Op, data: &[f32]) -> Result<()> {
        self.writer.write_u8(op as u8)?;
        self.writer.write_u32::<LittleEndian>(data.len() as u32)?;
        for &v in data {
            self.writer.write_f32::<LittleEndian>(v)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn recv(&mut self, expected: Op) -> Result<Vec<f32>> {
        let raw = self.reader.read_u8()?;
        let op = Op::from_u8(raw);
        if op != Some(expected) {
            return Err(Error::Communication(format!(
                "expected {expected:?} frame, got op byte {raw}"
            )));
        }
        let len = self.reader.read_u32::<LittleEndian>()? as usize;
        let mut data = vec![0.0f32; len];
        self.reader.read_f32_into::<LittleEndian>(&mut data)?;
        Ok(data)
    }
}

enum Role {
    /// Links to ranks `1..world_size`, in rank order.
    Root(Vec<Link>),
    Peer(Link),
}

struct TcpCommunicator {
    role: Mutex<Role>,
}

impl TcpCommunicator {
    /// Run one collective round and return the combined payload.
    fn round(
        &self,
        op: Op,
        local: &[f32],
        combine: impl FnOnce(Vec<Vec<f32>>) -> Result<Vec<f32>>,
    ) -> Result<Vec<f32>> {
        let mut role = self
            .role
            .lock()
            .map_err(|_| Error::Communication("communicator lock poisoned".into()))?;
        match &mut *role {
            Role::Root(links) => {
                let mut parts = Vec::with_capacity(links.len() + 1);
                parts.push(local.to_vec());
                for link in links.iter_mut() {
                    parts.push(link.recv(op)?);
                }
                let combined = combine(parts)?;
                for link in links.iter_mut() {
                    link.send(op, &combined)?;
                }
                Ok(combined)
            }
            Role::Peer(link) => {
                link.send(op, local)?;
                link.recv(op)
            }
        }
    }
}

impl Communicator for TcpCommunicator {
    fn barrier(&self) -> Result<()> {
        self.round(Op::Barrier, &[], |_| Ok(Vec::new()))?;
        Ok(())
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        let len = buf.len();
        let reduced = self.round(Op::AllReduce, buf, |parts| {
            let mut out = vec![0.0; len];
            reduce_in_rank_order(&parts, &mut out)?;
            Ok(out)
        })?;
        if reduced.len() != len {
            return Err(Error::Communication(format!(
                "all_reduce returned {} elements, expected {len}",
                reduced.len()
            )));
        }
        buf.copy_from_slice(&reduced);
        Ok(())
    }

    fn all_gather(&self, local: &[f32]) -> Result<Vec<f32>> {
        let len = local.len();
        self.round(Op::AllGather, local, |parts| concat_in_rank_order(&parts, len))
    }
}

/// Form the group described by `env`. Blocks until every rank has joined.
pub(super) fn join(env: &TopologyEnv) -> Result<ProcessGroup> {
    let role = if env.rank == 0 {
        Role::Root(accept_peers(env)?)
    } else {
        Role::Peer(connect_to_root(env)?)
    };
    Ok(ProcessGroup::from_communicator(
        env.rank,
        env.world_size,
        Arc::new(TcpCommunicator {
            role: Mutex::new(role),
        }),
    ))
}

fn accept_peers(env: &TopologyEnv) -> Result<Vec<Link>> {
    let addr = (env.master_addr.as_str(), env.master_port);
    let listener = TcpListener::bind(addr).map_err(|e| {
        Error::Topology(format!(
            "rank 0 cannot listen on {}:{}: {e}",
            env.master_addr, env.master_port
        ))
    })?;
    listener.set_nonblocking(true)?;
    info!(
        addr = %env.master_addr,
        port = env.master_port,
        world_size = env.world_size,
        "Waiting for peers"
    );

    let deadline = Instant::now() + env.join_timeout;
    let mut slots: Vec<Option<Link>> = (1..env.world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < slots.len() {
        let stream = match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "Peer connected");
                stream
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::Topology(format!(
                        "only {joined} of {} peers joined within {:?}",
                        slots.len(),
                        env.join_timeout
                    )));
                }
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        stream.set_nonblocking(false)?;
        let mut link = Link::new(stream)?;

        let magic = link.reader.read_u32::<LittleEndian>()?;
        let rank = link.reader.read_u32::<LittleEndian>()? as usize;
        let world_size = link.reader.read_u32::<LittleEndian>()? as usize;
        if magic != MAGIC {
            return Err(Error::Topology(format!("bad handshake magic {magic:#x}")));
        }
        if world_size != env.world_size {
            return Err(Error::Topology(format!(
                "rank {rank} expects world_size {world_size}, rank 0 expects {}",
                env.world_size
            )));
        }
        if rank == 0 || rank >= env.world_size {
            return Err(Error::Topology(format!(
                "peer announced invalid rank {rank}"
            )));
        }
        if slots[rank - 1].is_some() {
            return Err(Error::Topology(format!("rank {rank} joined twice")));
        }
        slots[rank - 1] = Some(link);
        joined += 1;
    }

    // Every rank is present; release them.
    let mut links: Vec<Link> = slots.into_iter().flatten().collect();
    for link in &mut links {
        link.writer.write_u32::<LittleEndian>(MAGIC)?;
        link.writer.write_u32::<LittleEndian>(env.world_size as u32)?;
        link.writer.flush()?;
    }
    Ok(links)
}

fn connect_to_root(env: &TopologyEnv) -> Result<Link> {
    let addr = (env.master_addr.as_str(), env.master_port);
    let deadline = Instant::now() + env.join_timeout;
    let stream = loop {
        match TcpStream::connect(addr) {
            Ok(stream) => break stream,
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::Topology(format!(
                    "rank {} cannot reach {}:{} within {:?}: {e}",
                    env.rank, env.master_addr, env.master_port, env.join_timeout
                )));
            }
            Err(_) => thread::sleep(POLL_INTERVAL),
        }
    };
    let mut link = Link::new(stream)?;

    link.writer.write_u32::<LittleEndian>(MAGIC)?;
    link.writer.write_u32::<LittleEndian>(env.rank as u32)?;
    link.writer.write_u32::<LittleEndian>(env.world_size as u32)?;
    link.writer.flush()?;

    // Rank 0 closes the connection instead of acking when it rejects us.
    let ack = (|| -> std::io::Result<(u32, u32)> {
        let magic = link.reader.read_u32::<LittleEndian>()?;
        let world_size = link.reader.read_u32::<LittleEndian>()?;
        Ok((magic, world_size))
    })();
    match ack {
        Ok((MAGIC, ws)) if ws as usize == env.world_size => Ok(link),
        Ok((magic, ws)) => Err(Error::Topology(format!(
            "unexpected ack from rank 0 (magic {magic:#x}, world_size {ws})"
        ))),
        Err(e) => Err(Error::Topology(format!("rank 0 rejected the join: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn env_for(rank: usize, world_size: usize, port: u16) -> TopologyEnv {
        TopologyEnv {
            rank,
            world_size,
            master_addr: "127.0.0.1".into(),
            master_port: port,
            join_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_tcp_group_collectives() {
        let port = free_port();
        let world_size = 3;
        let results: Vec<(Vec<f32>, Vec<f32>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..world_size)
                .map(|rank| {
                    s.spawn(move || {
                        let group = join(&env_for(rank, world_size, port)).unwrap();
                        assert_eq!(group.rank(), rank);
                        group.barrier().unwrap();
                        let mut buf = vec![rank as f32, 1.0];
                        group.all_reduce_sum(&mut buf).unwrap();
                        let gathered = group.all_gather(&[rank as f32]).unwrap();
                        (buf, gathered)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (reduced, gathered) in &results {
            assert_eq!(reduced, &vec![3.0, 3.0]);
            assert_eq!(gathered, &vec![0.0, 1.0, 2.0]);
        }
    }

    #[test]
    fn test_peer_times_out_without_root() {
        let port = free_port();
        let mut env = env_for(1, 2, port);
        env.join_timeout = Duration::from_millis(200);
        let err = join(&env).err().unwrap();
        assert!(matches!(err, Error::Topology(_)));
    }

    #[test]
    fn test_root_rejects_world_size_mismatch() {
        let port = free_port();
        thread::scope(|s| {
            let root = s.spawn(move || join(&env_for(0, 2, port)).err());
            let peer = s.spawn(move || join(&env_for(1, 3, port)).err());
            let root_err = root.join().unwrap();
            assert!(matches!(root_err, Some(Error::Topology(_))));
            assert!(matches!(peer.join().unwrap(), Some(Error::Topology(_))));
        });
    }
}
