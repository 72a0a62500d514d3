use std::{
    env,
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Mutex,
    thread,
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};

use crate::TrainingError;

use super::DistributedCoordinator;

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29_500;
const CONNECT_ATTEMPTS: usize = 60;
const CONNECT_BACKOFF: Duration = Duration::from_millis(500);
const HANDSHAKE_MAGIC: u32 = 0x5250_4731;

/// Process group over plain TCP.
///
/// Rank 0 listens on the master address and every other rank connects to
/// it. A reduction gathers every buffer on rank 0, sums them there and
/// sends the result back.
#[derive(Debug)]
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    link: Link,
}

#[derive(Debug)]
enum Link {
    /// Streams to ranks `1..world_size`, in rank order.
    Root(Mutex<Vec<TcpStream>>),
    Worker(Mutex<TcpStream>),
}

impl TcpProcessGroup {
    /// Reads `MASTER_ADDR` (default 127.0.0.1), `MASTER_PORT` (default
    /// 29500) and `WORLD_SIZE` (required).
    pub fn from_env(rank: usize) -> Result<Self, TrainingError> {
        let world_size = env::var("WORLD_SIZE")
            .map_err(|_| TrainingError::distributed("WORLD_SIZE is not set"))?
            .parse::<usize>()
            .map_err(|err| TrainingError::distributed(format!("invalid WORLD_SIZE: {err}")))?;
        let host = env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string());
        let port = match env::var("MASTER_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .map_err(|err| TrainingError::distributed(format!("invalid MASTER_PORT: {err}")))?,
            Err(_) => DEFAULT_MASTER_PORT,
        };
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| {
                TrainingError::distributed(format!("cannot resolve {host}:{port}: {err}"))
            })?
            .next()
            .ok_or_else(|| TrainingError::distributed(format!("{host}:{port} has no address")))?;

        if rank == 0 {
            let listener = TcpListener::bind(addr).map_err(|err| {
                TrainingError::distributed(format!("rank 0 cannot listen on {addr}: {err}"))
            })?;
            Self::root(listener, world_size)
        } else {
            Self::worker(rank, world_size, addr)
        }
    }

    /// Rank 0: accepts one connection from each other rank.
    pub fn root(listener: TcpListener, world_size: usize) -> Result<Self, TrainingError> {
        check_world_size(0, world_size)?;
        let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (mut stream, peer) = listener
                .accept()
                .map_err(|err| TrainingError::distributed(format!("accept failed: {err}")))?;
            stream.set_nodelay(true).map_err(io_error)?;

            let mut header = [0u8; 12];
            stream.read_exact(&mut header).map_err(io_error)?;
            let mut header = &header[..];
            let magic = header.get_u32_le();
            let rank = header.get_u32_le() as usize;
            let peer_world = header.get_u32_le() as usize;
            if magic != HANDSHAKE_MAGIC || peer_world != world_size {
                return Err(TrainingError::distributed(format!(
                    "unexpected handshake from {peer} (world size {peer_world}, expected {world_size})"
                )));
            }
            let slot = rank
                .checked_sub(1)
                .and_then(|index| peers.get_mut(index))
                .ok_or_else(|| {
                    TrainingError::distributed(format!("peer {peer} claims invalid rank {rank}"))
                })?;
            if slot.replace(stream).is_some() {
                return Err(TrainingError::distributed(format!(
                    "rank {rank} connected twice"
                )));
            }
            log::debug!("rank {rank} connected from {peer}");
        }

        let peers = peers.into_iter().flatten().collect();
        Ok(Self {
            rank: 0,
            world_size,
            link: Link::Root(Mutex::new(peers)),
        })
    }

    /// Ranks `1..world_size`: connects to rank 0, retrying while it starts up.
    pub fn worker(rank: usize, world_size: usize, master: SocketAddr) -> Result<Self, TrainingError> {
        check_world_size(rank, world_size)?;
        if rank == 0 {
            return Err(TrainingError::distributed("rank 0 must use TcpProcessGroup::root"));
        }

        let mut last_error = None;
        for _ in 0..CONNECT_ATTEMPTS {
            match TcpStream::connect(master) {
                Ok(mut stream) => {
                    stream.set_nodelay(true).map_err(io_error)?;
                    let mut header = BytesMut::with_capacity(12);
                    header.put_u32_le(HANDSHAKE_MAGIC);
                    header.put_u32_le(rank as u32);
                    header.put_u32_le(world_size as u32);
                    stream.write_all(&header).map_err(io_error)?;
                    return Ok(Self {
                        rank,
                        world_size,
                        link: Link::Worker(Mutex::new(stream)),
                    });
                }
                Err(err) => {
                    last_error = Some(err);
                    thread::sleep(CONNECT_BACKOFF);
                }
            }
        }

        Err(TrainingError::distributed(format!(
            "rank {rank} could not reach {master}: {}",
            last_error.map(|err| err.to_string()).unwrap_or_default()
        )))
    }
}

impl DistributedCoordinator for TcpProcessGroup {
    fn rank(&self) -> i64 {
        self.rank as i64
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buffer: Vec<f32>) -> Result<Vec<f32>, TrainingError> {
        let poisoned = || TrainingError::distributed("process group link is poisoned");
        match &self.link {
            Link::Root(peers) => {
                let mut peers = peers.lock().map_err(|_| poisoned())?;
                let mut sum = buffer;
                for (index, stream) in peers.iter_mut().enumerate() {
                    let incoming = read_frame(stream)?;
                    if incoming.len() != sum.len() {
                        return Err(TrainingError::distributed(format!(
                            "rank {} sent {} values, expected {}",
                            index + 1,
                            incoming.len(),
                            sum.len()
                        )));
                    }
                    for (acc, value) in sum.iter_mut().zip(incoming) {
                        *acc += value;
                    }
                }
                for stream in peers.iter_mut() {
                    write_frame(stream, &sum)?;
                }
                Ok(sum)
            }
            Link::Worker(stream) => {
                let mut stream = stream.lock().map_err(|_| poisoned())?;
                write_frame(&mut stream, &buffer)?;
                read_frame(&mut stream)
            }
        }
    }
}

fn write_frame(stream: &mut TcpStream, values: &[f32]) -> Result<(), TrainingError> {
    let mut frame = BytesMut::with_capacity(8 + values.len() * 4);
    frame.put_u64_le(values.len() as u64);
    for value in values {
        frame.put_f32_le(*value);
    }
    stream.write_all(&frame).map_err(io_error)?;
    stream.flush().map_err(io_error)
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<f32>, TrainingError> {
    let mut len = [0u8; 8];
    stream.read_exact(&mut len).map_err(io_error)?;
    let len = (&len[..]).get_u64_le() as usize;

    let mut payload = vec![0u8; len * 4];
    stream.read_exact(&mut payload).map_err(io_error)?;
    let mut payload = &payload[..];
    Ok((0..len).map(|_| payload.get_f32_le()).collect())
}

fn check_world_size(rank: usize, world_size: usize) -> Result<(), TrainingError> {
    if world_size == 0 || rank >= world_size {
        return Err(TrainingError::distributed(format!(
            "rank {rank} is outside a world of size {world_size}"
        )));
    }
    Ok(())
}

fn io_error(err: std::io::Error) -> TrainingError {
    TrainingError::distributed(format!("process group i/o failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn four_ranks_average_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let workers: Vec<_> = (1..4)
            .map(|rank| {
                thread::spawn(move || {
                    let group = TcpProcessGroup::worker(rank, 4, addr).unwrap();
                    let var = Var::from_slice(&[rank as f32, 8.0], (2,), &Device::Cpu).unwrap();
                    group.all_reduce_average(&[var.clone()]).unwrap();
                    var.as_tensor().to_vec1::<f32>().unwrap()
                })
            })
            .collect();

        let root = TcpProcessGroup::root(listener, 4).unwrap();
        assert!(root.is_primary());
        let var = Var::from_slice(&[0f32, 8.0], (2,), &Device::Cpu).unwrap();
        root.all_reduce_average(&[var.clone()]).unwrap();
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.5, 8.0]);

        for worker in workers {
            assert_eq!(worker.join().unwrap(), vec![1.5, 8.0]);
        }
    }

    #[test]
    fn worker_cannot_claim_rank_zero() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(TcpProcessGroup::worker(0, 2, addr).is_err());
        assert!(TcpProcessGroup::worker(3, 2, addr).is_err());
    }
}
