use crate::ENV_JOB_ID;
use crate::ENV_MASTER_ADDR;
use crate::ENV_MASTER_PORT;
use crate::ENV_RANK;
use crate::ENV_WORLD_SIZE;
use crate::RENDEZVOUS_TIMEOUT;
use crate::error::Result;
use crate::error::VarformerError;
use byteorder::BE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use candle_core::Tensor;
use candle_core::Var;
use candle_nn::VarMap;
use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::time::Duration;
use std::time::Instant;

/// This worker's identity within the training job, read from the launcher's
/// environment. Absent variables mean a solo run: rank 0 of a world of 1.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub rank: usize,
    pub world: usize,
    pub master: String,
    pub job_id: String,
}

impl WorkerContext {
    pub fn from_env() -> Result<Self> {
        let rank = env_usize(ENV_RANK, 0)?;
        let world = env_usize(ENV_WORLD_SIZE, 1)?;
        if rank >= world {
            return Err(VarformerError::Config(format!(
                "rank {} outside world of {}",
                rank, world
            )));
        }
        let addr = std::env::var(ENV_MASTER_ADDR).unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var(ENV_MASTER_PORT).unwrap_or_else(|_| "29500".to_string());
        Ok(Self {
            rank,
            world,
            master: format!("{}:{}", addr, port),
            job_id: std::env::var(ENV_JOB_ID).unwrap_or_else(|_| "default".to_string()),
        })
    }

    pub fn solo(&self) -> bool {
        self.world == 1
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| VarformerError::Config(format!("{} must be an integer, got {:?}", key, raw))),
    }
}

/// Connects the workers of a job and averages their parameters.
///
/// Rank 0 listens on the master address and every other rank dials in,
/// identifying itself with the job id so stray workers from another job are
/// rejected. A rank that cannot complete the handshake within the rendezvous
/// window fails fast rather than training on a partial world.
///
/// `sync` averages parameters elementwise across ranks after each optimizer
/// step. Every rank blocks until the averaged values come back, so it doubles
/// as a step barrier.
pub enum Coordinator {
    Solo,
    Leader { peers: Vec<TcpStream> },
    Follower { leader: TcpStream },
}

impl Coordinator {
    pub fn rendezvous(ctx: &WorkerContext) -> Result<Self> {
        if ctx.solo() {
            return Ok(Self::Solo);
        }
        let deadline = Instant::now() + RENDEZVOUS_TIMEOUT;
        if ctx.rank == 0 {
            Self::lead(ctx, deadline)
        } else {
            Self::follow(ctx, deadline)
        }
    }

    fn lead(ctx: &WorkerContext, deadline: Instant) -> Result<Self> {
        let listener = TcpListener::bind(&ctx.master)?;
        listener.set_nonblocking(true)?;
        log::info!("rank 0 awaiting {} workers on {}", ctx.world - 1, ctx.master);
        let mut peers = Vec::with_capacity(ctx.world - 1);
        while peers.len() < ctx.world - 1 {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    let rank = greet(&stream, ctx)?;
                    log::info!("rank {} joined from {}", rank, addr);
                    peers.push((rank, stream));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() > deadline {
                        return Err(VarformerError::RendezvousTimeout(format!(
                            "{} of {} workers joined",
                            peers.len() + 1,
                            ctx.world
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
        peers.sort_by_key(|&(rank, _)| rank);
        Ok(Self::Leader {
            peers: peers.into_iter().map(|(_, stream)| stream).collect(),
        })
    }

    fn follow(ctx: &WorkerContext, deadline: Instant) -> Result<Self> {
        loop {
            match TcpStream::connect(&ctx.master) {
                Ok(mut stream) => {
                    stream.write_u32::<BE>(ctx.rank as u32)?;
                    let id = ctx.job_id.as_bytes();
                    stream.write_u32::<BE>(id.len() as u32)?;
                    stream.write_all(id)?;
                    let world = stream.read_u32::<BE>()? as usize;
                    if world != ctx.world {
                        return Err(VarformerError::ConfigMismatch(format!(
                            "leader expects world of {}, this worker was launched with {}",
                            world, ctx.world
                        )));
                    }
                    log::info!("rank {} joined job {}", ctx.rank, ctx.job_id);
                    return Ok(Self::Follower { leader: stream });
                }
                Err(e) => {
                    if Instant::now() > deadline {
                        return Err(VarformerError::RendezvousTimeout(format!(
                            "rank {} could not reach {}: {}",
                            ctx.rank, ctx.master, e
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        }
    }

    /// Replace every parameter with the elementwise mean across ranks.
    pub fn sync(&mut self, varmap: &VarMap) -> Result<()> {
        match *self {
            Self::Solo => Ok(()),
            Self::Leader { ref mut peers } => {
                let vars = ordered_vars(varmap);
                let mut sum = flatten(&vars)?;
                for peer in peers.iter_mut() {
                    let theirs = read_frame(peer)?;
                    if theirs.len() != sum.len() {
                        return Err(VarformerError::ConfigMismatch(format!(
                            "peer sent {} parameters, leader has {}",
                            theirs.len(),
                            sum.len()
                        )));
                    }
                    for (a, b) in sum.iter_mut().zip(theirs) {
                        *a += b;
                    }
                }
                let world = (peers.len() + 1) as f32;
                for value in sum.iter_mut() {
                    *value /= world;
                }
                for peer in peers.iter_mut() {
                    write_frame(peer, &sum)?;
                }
                unflatten(&vars, &sum)
            }
            Self::Follower { ref mut leader } => {
                let vars = ordered_vars(varmap);
                write_frame(leader, &flatten(&vars)?)?;
                let mean = read_frame(leader)?;
                unflatten(&vars, &mean)
            }
        }
    }
}

fn greet(mut stream: &TcpStream, ctx: &WorkerContext) -> Result<usize> {
    let rank = stream.read_u32::<BE>()? as usize;
    let len = stream.read_u32::<BE>()? as usize;
    let mut id = vec![0u8; len];
    stream.read_exact(&mut id)?;
    if id != ctx.job_id.as_bytes() {
        return Err(VarformerError::ConfigMismatch(format!(
            "worker presented job id {:?}, expected {:?}",
            String::from_utf8_lossy(&id),
            ctx.job_id
        )));
    }
    stream.write_u32::<BE>(ctx.world as u32)?;
    Ok(rank)
}

/// Name-sorted so every rank flattens parameters in the same order.
fn ordered_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap.data().lock().unwrap();
    let mut vars = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect::<Vec<_>>();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

fn flatten(vars: &[(String, Var)]) -> Result<Vec<f32>> {
    let mut flat = Vec::new();
    for &(_, ref var) in vars {
        flat.extend(var.flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(flat)
}

fn unflatten(vars: &[(String, Var)], flat: &[f32]) -> Result<()> {
    let mut offset = 0;
    for &(_, ref var) in vars {
        let count = var.elem_count();
        let chunk = flat[offset..offset + count].to_vec();
        let tensor = Tensor::from_vec(chunk, var.shape(), var.device())?;
        var.set(&tensor)?;
        offset += count;
    }
    Ok(())
}

fn write_frame(stream: &mut TcpStream, values: &[f32]) -> Result<()> {
    let mut buf = Vec::with_capacity(8 + values.len() * 4);
    buf.write_u64::<BE>(values.len() as u64)?;
    for &value in values {
        buf.write_f32::<BE>(value)?;
    }
    stream.write_all(&buf)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Vec<f32>> {
    let count = stream.read_u64::<BE>()? as usize;
    let mut bytes = vec![0u8; count * 4];
    stream.read_exact(&mut bytes)?;
    let ref mut reader = bytes.as_slice();
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(reader.read_f32::<BE>()?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_core::Device;

    fn context(rank: usize, world: usize, master: &str) -> WorkerContext {
        WorkerContext {
            rank,
            world,
            master: master.to_string(),
            job_id: "test-job".to_string(),
        }
    }

    fn free_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn constant_varmap(value: f64) -> VarMap {
        let varmap = VarMap::new();
        varmap
            .get((2, 3), "w", candle_nn::init::Init::Const(value), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
            .get(4, "b", candle_nn::init::Init::Const(value * 2.0), DType::F32, &Device::Cpu)
            .unwrap();
        varmap
    }

    fn values(varmap: &VarMap) -> Vec<f32> {
        flatten(&ordered_vars(varmap)).unwrap()
    }

    #[test]
    fn solo_sync_is_a_no_op() {
        let varmap = constant_varmap(1.0);
        let before = values(&varmap);
        Coordinator::Solo.sync(&varmap).unwrap();
        assert!(values(&varmap) == before);
    }

    #[test]
    fn two_ranks_converge_to_the_mean() {
        let master = free_port();
        let follower_master = master.clone();
        let follower = std::thread::spawn(move || {
            let varmap = constant_varmap(3.0);
            let mut coord =
                Coordinator::rendezvous(&context(1, 2, &follower_master)).unwrap();
            coord.sync(&varmap).unwrap();
            values(&varmap)
        });
        let varmap = constant_varmap(1.0);
        let mut coord = Coordinator::rendezvous(&context(0, 2, &master)).unwrap();
        coord.sync(&varmap).unwrap();
        let leader_values = values(&varmap);
        let follower_values = follower.join().unwrap();
        assert!(leader_values == follower_values);
        // name order puts "b" (value * 2) ahead of "w"
        assert!(leader_values[0] == 4.0);
        assert!(*leader_values.last().unwrap() == 2.0);
    }

    #[test]
    fn wrong_job_id_is_rejected() {
        let master = free_port();
        let follower_master = master.clone();
        let follower = std::thread::spawn(move || {
            let mut ctx = context(1, 2, &follower_master);
            ctx.job_id = "other-job".to_string();
            Coordinator::rendezvous(&ctx)
        });
        let leader = Coordinator::rendezvous(&context(0, 2, &master));
        assert!(matches!(leader, Err(VarformerError::ConfigMismatch(_))));
        let _ = follower.join();
    }

    #[test]
    fn rank_beyond_world_is_invalid() {
        unsafe {
            std::env::set_var(ENV_RANK, "5");
            std::env::set_var(ENV_WORLD_SIZE, "2");
        }
        let outcome = WorkerContext::from_env();
        unsafe {
            std::env::remove_var(ENV_RANK);
            std::env::remove_var(ENV_WORLD_SIZE);
        }
        assert!(matches!(outcome, Err(VarformerError::Config(_))));
    }
}
