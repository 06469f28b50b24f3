//! Collective communication between the workers of one model-parallel group.
//!
//! [`LocalProcessGroup`] implements the collectives in process: every rank
//! stages its tensor in host memory, waits for the others, then reads all
//! contributions. Reductions are summed in rank order on every rank, so all
//! ranks end up with bit-identical results.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

/// Collective operations over the ranks of one group.
///
/// Every rank must issue the same sequence of collectives; a call blocks until
/// all ranks reach it.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    /// Rank of the caller within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Device this rank's tensors live on.
    fn device(&self) -> &Device;

    /// Element-wise sum of `tensor` across all ranks.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Every rank's `tensor`, indexed by rank.
    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>>;

    /// `root`'s `tensor` on every rank.
    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor>;

    /// Give up on the group after this rank failed.
    ///
    /// Ranks blocked in a collective, and every later collective, return
    /// [`Error::CollectiveAborted`] until [`ProcessGroup::reset`].
    fn abort(&self);

    /// Clear an abort. Only call while no rank is inside a collective.
    fn reset(&self);
}

struct GateState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be aborted.
struct Gate {
    world_size: usize,
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl Gate {
    fn new(world_size: usize) -> Self {
        Self {
            world_size,
            state: Mutex::new(GateState {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.lock();
        if state.aborted {
            return Err(Error::CollectiveAborted);
        }
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = self
                .cvar
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if state.generation == generation {
            return Err(Error::CollectiveAborted);
        }
        Ok(())
    }

    fn abort(&self) {
        self.lock().aborted = true;
        self.cvar.notify_all();
    }

    fn reset(&self) {
        let mut state = self.lock();
        state.aborted = false;
        state.arrived = 0;
    }
}

/// Rendezvous point shared by the ranks of a [`LocalProcessGroup`].
struct Rendezvous {
    slots: Mutex<Vec<Option<Tensor>>>,
    gate: Gate,
}

/// In-process group whose ranks are threads of the same process.
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
    device: Device,
    rendezvous: Arc<Rendezvous>,
}

impl fmt::Debug for LocalProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcessGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .finish()
    }
}

impl LocalProcessGroup {
    /// Create one connected group member per device; rank `i` is bound to `devices[i]`.
    pub fn new_group(devices: &[Device]) -> Vec<LocalProcessGroup> {
        let world_size = devices.len();
        let rendezvous = Arc::new(Rendezvous {
            slots: Mutex::new(vec![None; world_size]),
            gate: Gate::new(world_size),
        });

        devices
            .iter()
            .enumerate()
            .map(|(rank, device)| LocalProcessGroup {
                rank,
                world_size,
                device: device.clone(),
                rendezvous: Arc::clone(&rendezvous),
            })
            .collect()
    }

    /// Publish `tensor` and collect every rank's contribution, in rank order.
    ///
    /// A rank that fails to stage its tensor still takes part in both barriers,
    /// so the others observe the failure instead of waiting forever. A rank
    /// that never arrives must call [`ProcessGroup::abort`] for the same reason.
    fn exchange(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        let staged = tensor.to_device(&Device::Cpu);
        {
            let mut slots = self
                .rendezvous
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots[self.rank] = staged.as_ref().ok().cloned();
        }
        self.rendezvous.gate.wait()?;

        let gathered: Vec<Option<Tensor>> = self
            .rendezvous
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        // Nobody may overwrite a slot until every rank has read them all.
        self.rendezvous.gate.wait()?;

        if let Err(e) = staged {
            return Err(e.into());
        }
        gathered
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                slot.ok_or_else(|| {
                    Error::CollectiveMismatch(format!("rank {rank} contributed no tensor"))
                })
            })
            .collect()
    }

    fn check_shapes(&self, tensors: &[Tensor]) -> Result<()> {
        let expected = tensors[self.rank].dims();
        for (rank, tensor) in tensors.iter().enumerate() {
            if tensor.dims() != expected || tensor.dtype() != tensors[self.rank].dtype() {
                return Err(Error::CollectiveMismatch(format!(
                    "rank {rank} sent {:?} {:?}, rank {} sent {:?} {:?}",
                    tensor.dims(),
                    tensor.dtype(),
                    self.rank,
                    expected,
                    tensors[self.rank].dtype()
                )));
            }
        }
        Ok(())
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        let tensors = self.exchange(tensor)?;
        self.check_shapes(&tensors)?;

        let mut sum = tensors[0].clone();
        for t in &tensors[1..] {
            sum = (sum + t)?;
        }
        Ok(sum.to_device(&self.device)?)
    }

    fn all_gather(&self, tensor: &Tensor) -> Result<Vec<Tensor>> {
        if self.world_size == 1 {
            return Ok(vec![tensor.clone()]);
        }
        let tensors = self.exchange(tensor)?;
        tensors
            .iter()
            .map(|t| Ok(t.to_device(&self.device)?))
            .collect()
    }

    fn broadcast(&self, tensor: &Tensor, root: usize) -> Result<Tensor> {
        if root >= self.world_size {
            return Err(Error::CollectiveMismatch(format!(
                "broadcast root {root} outside world of {}",
                self.world_size
            )));
        }
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        let tensors = self.exchange(tensor)?;
        Ok(tensors[root].to_device(&self.device)?)
    }

    fn abort(&self) {
        self.rendezvous.gate.abort();
    }

    fn reset(&self) {
        self.rendezvous.gate.reset();
    }
}
