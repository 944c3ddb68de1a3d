//! Multi-round reduction driver layered on top of a partner schedule.
//! Grounded on `diy::reduce`: blocks active in a round trade messages along
//! a link synthesized from the schedule rather than their real link, so the
//! same block type can serve several concurrent reduction topologies
//! (merge, swap, broadcast, all-reduce) without the real neighbor graph
//! knowing about any of them. The per-round network exchange reuses the
//! same send/probe/ibarrier pattern `Master::flush`'s remote branch uses,
//! since reduce targets are not generally on the caller's real link and so
//! cannot route through `Master`'s own queues.

pub mod all_to_all;
pub mod partners;

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::assigner::Assigner;
use crate::block::{Gid, Proc};
use crate::comm::Tag;
use crate::error::{Error, Result};
use crate::master::Master;
use partners::Partners;

/// The in/out link a reduction round hands to `op`: gids this block will
/// receive from and send to this round, each stamped with its owning rank.
pub struct ReduceProxy<'a> {
    gid: Gid,
    incoming: Vec<(Gid, Proc)>,
    outgoing: Vec<(Gid, Proc)>,
    recv: &'a HashMap<Gid, Vec<u8>>,
    send: &'a mut HashMap<Gid, Vec<u8>>,
}

impl<'a> ReduceProxy<'a> {
    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn incoming(&self) -> &[(Gid, Proc)] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[(Gid, Proc)] {
        &self.outgoing
    }

    pub fn enqueue(&mut self, to: Gid, bytes: Vec<u8>) {
        self.send.insert(to, bytes);
    }

    pub fn enqueue_value<T: Serialize>(&mut self, to: Gid, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.enqueue(to, bytes);
        Ok(())
    }

    pub fn dequeue(&self, from: Gid) -> &[u8] {
        self.recv.get(&from).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn dequeue_value<T: DeserializeOwned>(&self, from: Gid) -> Result<Option<T>> {
        match self.recv.get(&from) {
            Some(bytes) if !bytes.is_empty() => {
                Ok(Some(bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))?))
            }
            _ => Ok(None),
        }
    }
}

/// Runs `op` over every local block not `skip`ped, for each of
/// `partners.rounds() + 1` rounds (the extra round lets the last round's
/// `op` invocation observe the final incoming set with no further send),
/// flushing a synthesized link between rounds. Restores nothing on `master`
/// itself since reduce never touches `master`'s own round/expected state.
pub fn reduce<B, Bounds>(
    master: &mut Master<B, Bounds>,
    assigner: &dyn Assigner,
    partners: &dyn Partners,
    op: impl Fn(&mut B, &mut ReduceProxy, &dyn Partners),
    skip: impl Fn(Gid) -> bool,
) -> Result<()> {
    let storage = master.storage().clone();
    let lids = master.collection_mut().ordered_lids();
    let mut gids = Vec::with_capacity(lids.len());
    for &lid in &lids {
        gids.push(master.gid(lid)?);
    }

    let rounds = partners.rounds();
    let nblocks = assigner.nblocks();
    let mut inbox: HashMap<Gid, HashMap<Gid, Vec<u8>>> = HashMap::new();

    for round in 0..=rounds {
        let mut outbox: HashMap<Gid, HashMap<Gid, Vec<u8>>> = HashMap::new();
        for (&lid, &gid) in lids.iter().zip(gids.iter()) {
            if skip(gid) || !partners.active(round, gid, nblocks) {
                continue;
            }
            let mut in_gids = Vec::new();
            if round > 0 {
                partners.incoming(round, gid, nblocks, &mut in_gids);
            }
            let mut out_gids = Vec::new();
            if round < rounds {
                partners.outgoing(round, gid, nblocks, &mut out_gids);
            }
            let recv = inbox.remove(&gid).unwrap_or_default();
            let incoming: Vec<(Gid, Proc)> = in_gids.iter().map(|&g| (g, assigner.rank(g))).collect();
            let outgoing: Vec<(Gid, Proc)> = out_gids.iter().map(|&g| (g, assigner.rank(g))).collect();
            let mut send = HashMap::new();
            {
                let mut proxy = ReduceProxy { gid, incoming, outgoing: outgoing.clone(), recv: &recv, send: &mut send };
                let block = master.collection_mut().get_mut(lid, storage.as_ref())?;
                op(&mut *block, &mut proxy, partners);
            }
            for &(to, _) in &outgoing {
                send.entry(to).or_insert_with(Vec::new);
            }
            for (to, bytes) in send {
                outbox.entry(to).or_default().insert(gid, bytes);
            }
        }
        if round == rounds {
            break;
        }
        exchange_round(master, assigner, outbox, &mut inbox)?;
    }
    Ok(())
}

/// Routes one round's `(from, to) -> payload` map through the substrate:
/// same-rank deliveries land directly in `inbox`, cross-rank ones go out as
/// non-blocking sends, with an ibarrier closing the round once every send
/// has drained and no more arrivals are pending — the same pattern
/// `Master::flush`'s remote branch uses, since a reduction's virtual link
/// is generally not the caller's real link and can't route through
/// `Master`'s own queues.
pub(crate) fn exchange_round<B, Bounds, T>(
    master: &Master<B, Bounds>,
    assigner: &dyn Assigner,
    outbox: HashMap<Gid, HashMap<Gid, T>>,
    inbox: &mut HashMap<Gid, HashMap<Gid, T>>,
) -> Result<()>
where
    T: Serialize + DeserializeOwned,
{
    let comm = master.comm().clone();
    let own_rank = comm.rank();
    let mut in_flight: Vec<Box<dyn crate::comm::Request>> = Vec::new();
    let mut barrier_req: Option<Box<dyn crate::comm::Request>> = None;

    for (to, froms) in outbox {
        if assigner.rank(to) == own_rank {
            inbox.entry(to).or_default().extend(froms);
        } else {
            for (from, payload) in froms {
                let bytes = bincode::serialize(&(from, to, payload)).map_err(|e| Error::Serialization(e.to_string()))?;
                in_flight.push(comm.issend(assigner.rank(to), Tag::Queue, bytes));
            }
        }
    }

    loop {
        while comm.iprobe(Tag::Queue).is_some() {
            let mut req = comm.irecv_any(Tag::Queue);
            req.wait();
            let (_src, bytes) = req.take();
            let (from, to, payload): (Gid, Gid, T) =
                bincode::deserialize(&bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
            inbox.entry(to).or_default().insert(from, payload);
        }
        in_flight.retain_mut(|r| !r.test());
        match &mut barrier_req {
            None if in_flight.is_empty() => barrier_req = Some(comm.ibarrier()),
            Some(req) if req.test() => return Ok(()),
            _ => {}
        }
        std::thread::yield_now();
    }
}
