//! The substrate abstraction the core runs on top of.
//!
//! `diy::mpi` wraps a handful of `MPI_*` calls behind small value types
//! (`communicator`, `request`, `status`). This module defines the same
//! narrow contract as a trait so the core never names a concrete transport,
//! plus an in-process `LocalCommunicator` that implements it over shared
//! memory for tests and single-process demos. A real deployment would swap
//! in an `mpi`-crate-backed implementation without the core changing.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::block::Proc;

/// The two logical message classes the core ever sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    Queue,
    Iexchange,
}

/// A non-blocking operation's completion handle. `test` must never block;
/// callers poll it from the same progress loop that advances other work.
pub trait Request: Send {
    fn test(&mut self) -> bool;

    fn wait(&mut self) {
        while !self.test() {
            std::thread::yield_now();
        }
    }
}

/// Completion handle for a non-blocking receive: once `test` is true,
/// `take` yields the sender's rank and the delivered bytes.
pub trait RecvRequest: Send {
    fn test(&mut self) -> bool;
    fn take(&mut self) -> (Proc, Vec<u8>);
}

/// The substrate contract consumed by `Master`, the iexchange drivers, and
/// the collective framework. Collective methods are blocking except
/// `ibarrier`/`iallreduce_or`, the two primitives the termination protocols
/// need to be non-blocking.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> Proc;
    fn size(&self) -> Proc;

    fn barrier(&self);

    /// A fresh communicator over the same ranks with an independent message
    /// space, the way `MPI_Comm_dup` isolates collective traffic for a
    /// sub-algorithm (e.g. the sampling load-balancer's auxiliary master)
    /// from the caller's own in-flight exchanges.
    fn duplicate(&self) -> Arc<dyn Communicator>;

    fn isend(&self, dest: Proc, tag: Tag, bytes: Vec<u8>) -> Box<dyn Request>;
    /// Synchronous send: like `isend`, but the request only completes once
    /// the matching receive has actually consumed the message. The local
    /// substrate below delivers both identically; the distinction matters
    /// for transports with real send buffering.
    fn issend(&self, dest: Proc, tag: Tag, bytes: Vec<u8>) -> Box<dyn Request>;

    fn irecv_any(&self, tag: Tag) -> Box<dyn RecvRequest>;
    fn irecv_from(&self, source: Proc, tag: Tag) -> Box<dyn RecvRequest>;

    /// Non-consuming probe: the size of the next ready message for `tag`
    /// from any source, without removing it from the queue.
    fn iprobe(&self, tag: Tag) -> Option<(Proc, usize)>;

    fn all_gather_bytes(&self, input: Vec<u8>) -> Vec<Vec<u8>>;
    fn gather_bytes(&self, root: Proc, input: Vec<u8>) -> Option<Vec<Vec<u8>>>;
    fn broadcast_bytes(&self, root: Proc, input: Vec<u8>) -> Vec<u8>;
    fn all_reduce_bytes(&self, input: Vec<u8>, combine: &dyn Fn(&[u8], &[u8]) -> Vec<u8>) -> Vec<u8>;
    fn reduce_bytes(&self, root: Proc, input: Vec<u8>, combine: &dyn Fn(&[u8], &[u8]) -> Vec<u8>) -> Option<Vec<u8>>;
    fn scan_bytes(&self, input: Vec<u8>, combine: &dyn Fn(&[u8], &[u8]) -> Vec<u8>) -> Vec<u8>;

    fn ibarrier(&self) -> Box<dyn Request>;
    /// A non-blocking logical-OR all-reduce of one boolean per rank, used by
    /// iexchange's collective termination variant. The returned handle's
    /// `test` reports completion; `result` is only meaningful once it does.
    fn iallreduce_or(&self, dirty: bool) -> Box<dyn OrReduceRequest>;
}

pub trait OrReduceRequest: Request {
    fn result(&self) -> bool;
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

struct OrReduceState {
    arrived: usize,
    acc: bool,
    generation: u64,
    last_result: bool,
}

struct GatherState {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
    generation: u64,
    last_result: Vec<Vec<u8>>,
}

struct DupState {
    pending: Option<Arc<Fabric>>,
    waiting: usize,
}

/// Shared state backing every `LocalCommunicator` handle over the same
/// logical communicator.
struct Fabric {
    size: Proc,
    inboxes: Vec<Mutex<BTreeMap<(Proc, Tag), VecDeque<Vec<u8>>>>>,
    barrier: Mutex<BarrierState>,
    or_reduce: Mutex<OrReduceState>,
    gather: Mutex<GatherState>,
    dup: Mutex<DupState>,
}

impl Fabric {
    fn new(size: Proc) -> Self {
        Fabric {
            size,
            inboxes: (0..size).map(|_| Mutex::new(BTreeMap::new())).collect(),
            barrier: Mutex::new(BarrierState { arrived: 0, generation: 0 }),
            or_reduce: Mutex::new(OrReduceState { arrived: 0, acc: false, generation: 0, last_result: false }),
            gather: Mutex::new(GatherState { slots: vec![None; size as usize], filled: 0, generation: 0, last_result: Vec::new() }),
            dup: Mutex::new(DupState { pending: None, waiting: 0 }),
        }
    }
}

/// An in-process handle onto one rank of a shared `Fabric`. Construct `size`
/// of these sharing one `Fabric::new(size)` to simulate a run; each is meant
/// to be driven from its own OS thread.
pub struct LocalCommunicator {
    fabric: Arc<Fabric>,
    rank: Proc,
}

impl LocalCommunicator {
    /// Builds one handle per rank, all sharing a fresh fabric.
    pub fn new_group(size: Proc) -> Vec<Arc<LocalCommunicator>> {
        let fabric = Arc::new(Fabric::new(size));
        (0..size)
            .map(|rank| Arc::new(LocalCommunicator { fabric: fabric.clone(), rank }))
            .collect()
    }
}

struct CompletedRequest;
impl Request for CompletedRequest {
    fn test(&mut self) -> bool {
        true
    }
}

struct GenerationRequest {
    fabric: Arc<Fabric>,
    my_generation: u64,
    kind: GenerationKind,
}

enum GenerationKind {
    Barrier,
    OrReduce,
}

impl Request for GenerationRequest {
    fn test(&mut self) -> bool {
        match self.kind {
            GenerationKind::Barrier => self.fabric.barrier.lock().unwrap().generation > self.my_generation,
            GenerationKind::OrReduce => self.fabric.or_reduce.lock().unwrap().generation > self.my_generation,
        }
    }
}

impl OrReduceRequest for GenerationRequest {
    fn result(&self) -> bool {
        self.fabric.or_reduce.lock().unwrap().last_result
    }
}

struct LocalRecvRequest {
    fabric: Arc<Fabric>,
    rank: Proc,
    tag: Tag,
    source: Option<Proc>,
    ready: Option<(Proc, Vec<u8>)>,
}

impl RecvRequest for LocalRecvRequest {
    fn test(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        let mut inbox = self.fabric.inboxes[self.rank as usize].lock().unwrap();
        let key = match self.source {
            Some(src) => Some((src, self.tag)),
            None => inbox
                .iter()
                .find(|((_, t), q)| *t == self.tag && !q.is_empty())
                .map(|(k, _)| *k),
        };
        if let Some(key) = key {
            if let Some(queue) = inbox.get_mut(&key) {
                if let Some(bytes) = queue.pop_front() {
                    self.ready = Some((key.0, bytes));
                    return true;
                }
            }
        }
        false
    }

    fn take(&mut self) -> (Proc, Vec<u8>) {
        self.ready.take().expect("RecvRequest::take called before test() returned true")
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Proc {
        self.rank
    }

    fn size(&self) -> Proc {
        self.fabric.size
    }

    fn barrier(&self) {
        let mut state = self.fabric.barrier.lock().unwrap();
        let my_generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.fabric.size as usize {
            state.arrived = 0;
            state.generation += 1;
        }
        drop(state);
        loop {
            if self.fabric.barrier.lock().unwrap().generation > my_generation {
                return;
            }
            std::thread::yield_now();
        }
    }

    fn duplicate(&self) -> Arc<dyn Communicator> {
        let mut dup = self.fabric.dup.lock().unwrap();
        if dup.pending.is_none() {
            dup.pending = Some(Arc::new(Fabric::new(self.fabric.size)));
        }
        let new_fabric = dup.pending.clone().unwrap();
        dup.waiting += 1;
        if dup.waiting == self.fabric.size as usize {
            dup.pending = None;
            dup.waiting = 0;
        }
        drop(dup);
        Arc::new(LocalCommunicator { fabric: new_fabric, rank: self.rank })
    }

    fn isend(&self, dest: Proc, tag: Tag, bytes: Vec<u8>) -> Box<dyn Request> {
        self.fabric.inboxes[dest as usize]
            .lock()
            .unwrap()
            .entry((self.rank, tag))
            .or_default()
            .push_back(bytes);
        Box::new(CompletedRequest)
    }

    fn issend(&self, dest: Proc, tag: Tag, bytes: Vec<u8>) -> Box<dyn Request> {
        self.isend(dest, tag, bytes)
    }

    fn irecv_any(&self, tag: Tag) -> Box<dyn RecvRequest> {
        Box::new(LocalRecvRequest { fabric: self.fabric.clone(), rank: self.rank, tag, source: None, ready: None })
    }

    fn irecv_from(&self, source: Proc, tag: Tag) -> Box<dyn RecvRequest> {
        Box::new(LocalRecvRequest { fabric: self.fabric.clone(), rank: self.rank, tag, source: Some(source), ready: None })
    }

    fn iprobe(&self, tag: Tag) -> Option<(Proc, usize)> {
        let inbox = self.fabric.inboxes[self.rank as usize].lock().unwrap();
        inbox
            .iter()
            .find(|((_, t), q)| *t == tag && !q.is_empty())
            .map(|((src, _), q)| (*src, q.front().unwrap().len()))
    }

    fn all_gather_bytes(&self, input: Vec<u8>) -> Vec<Vec<u8>> {
        let mut state = self.fabric.gather.lock().unwrap();
        let my_generation = state.generation;
        state.slots[self.rank as usize] = Some(input);
        state.filled += 1;
        if state.filled == self.fabric.size as usize {
            let result: Vec<Vec<u8>> = state.slots.iter_mut().map(|s| s.take().unwrap()).collect();
            state.last_result = result.clone();
            state.filled = 0;
            state.generation += 1;
            return result;
        }
        drop(state);
        loop {
            let state = self.fabric.gather.lock().unwrap();
            if state.generation > my_generation {
                return state.last_result.clone();
            }
            drop(state);
            std::thread::yield_now();
        }
    }

    fn gather_bytes(&self, root: Proc, input: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        let all = self.all_gather_bytes(input);
        (self.rank == root).then_some(all)
    }

    fn broadcast_bytes(&self, root: Proc, input: Vec<u8>) -> Vec<u8> {
        let placeholder = if self.rank == root { input } else { Vec::new() };
        let all = self.all_gather_bytes(placeholder);
        all.into_iter().nth(root as usize).unwrap_or_default()
    }

    fn all_reduce_bytes(&self, input: Vec<u8>, combine: &dyn Fn(&[u8], &[u8]) -> Vec<u8>) -> Vec<u8> {
        let all = self.all_gather_bytes(input);
        let mut iter = all.into_iter();
        let first = iter.next().unwrap_or_default();
        iter.fold(first, |acc, next| combine(&acc, &next))
    }

    fn reduce_bytes(&self, root: Proc, input: Vec<u8>, combine: &dyn Fn(&[u8], &[u8]) -> Vec<u8>) -> Option<Vec<u8>> {
        let folded = self.all_reduce_bytes(input, combine);
        (self.rank == root).then_some(folded)
    }

    fn scan_bytes(&self, input: Vec<u8>, combine: &dyn Fn(&[u8], &[u8]) -> Vec<u8>) -> Vec<u8> {
        let all = self.all_gather_bytes(input);
        let mut iter = all.into_iter().take(self.rank as usize + 1);
        let first = iter.next().unwrap_or_default();
        iter.fold(first, |acc, next| combine(&acc, &next))
    }

    fn ibarrier(&self) -> Box<dyn Request> {
        let mut state = self.fabric.barrier.lock().unwrap();
        let my_generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.fabric.size as usize {
            state.arrived = 0;
            state.generation += 1;
        }
        Box::new(GenerationRequest { fabric: self.fabric.clone(), my_generation, kind: GenerationKind::Barrier })
    }

    fn iallreduce_or(&self, dirty: bool) -> Box<dyn OrReduceRequest> {
        let mut state = self.fabric.or_reduce.lock().unwrap();
        let my_generation = state.generation;
        state.acc |= dirty;
        state.arrived += 1;
        if state.arrived == self.fabric.size as usize {
            state.last_result = state.acc;
            state.acc = false;
            state.arrived = 0;
            state.generation += 1;
        }
        Box::new(GenerationRequest { fabric: self.fabric.clone(), my_generation, kind: GenerationKind::OrReduce })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_preserves_order() {
        let group = LocalCommunicator::new_group(2);
        group[0].isend(1, Tag::Queue, vec![1]);
        group[0].isend(1, Tag::Queue, vec![2]);
        let mut first = group[1].irecv_any(Tag::Queue);
        let mut second = group[1].irecv_any(Tag::Queue);
        first.wait();
        second.wait();
        assert_eq!(first.take().1, vec![1]);
        assert_eq!(second.take().1, vec![2]);
    }

    #[test]
    fn all_gather_collects_every_rank() {
        let group = LocalCommunicator::new_group(4);
        thread::scope(|scope| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|comm| scope.spawn(move || comm.all_gather_bytes(vec![comm.rank() as u8])))
                .collect();
            for h in handles {
                let result = h.join().unwrap();
                assert_eq!(result, vec![vec![0], vec![1], vec![2], vec![3]]);
            }
        });
    }

    #[test]
    fn ibarrier_completes_once_every_rank_joins() {
        let group = LocalCommunicator::new_group(3);
        thread::scope(|scope| {
            for comm in group {
                scope.spawn(move || {
                    let mut req = comm.ibarrier();
                    req.wait();
                    assert!(req.test());
                });
            }
        });
    }
}
