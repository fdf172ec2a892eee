// Who we upload to.
//
// Peers that aren't interested cost nothing to unchoke, so they always are.
// Among interested peers, the fastest ones (by what they give us while we
// leech, by what we give them while we seed) get the regular slots. Every few
// passes one more choked peer is unchoked at random and keeps that slot until
// the next rotation.

use std::collections::HashSet;

use rand::{Rng, seq::IndexedRandom, seq::SliceRandom};
use tracing::debug;

use crate::type_aliases::PeerHandle;

#[derive(Debug, Clone, Copy)]
pub struct ChokeCandidate {
    pub addr: PeerHandle,
    pub interested: bool,
    pub am_choking: bool,
    pub rate: u64,
}

/// Changes to apply. Peers already in the desired state are not listed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChokePlan {
    pub unchoke: Vec<PeerHandle>,
    pub choke: Vec<PeerHandle>,
}

#[derive(Debug, Default)]
pub struct Choker {
    passes: u64,
    optimistic: Option<PeerHandle>,
}

impl Choker {
    pub fn optimistic(&self) -> Option<PeerHandle> {
        self.optimistic
    }

    pub fn plan<R: Rng + ?Sized>(
        &mut self,
        peers: &[ChokeCandidate],
        max_unchoked: usize,
        optimistic_every: u64,
        rng: &mut R,
    ) -> ChokePlan {
        self.passes += 1;
        // The optimistic peer left or lost interest.
        if self
            .optimistic
            .is_some_and(|o| !peers.iter().any(|p| p.addr == o && p.interested))
        {
            self.optimistic = None;
        }

        let mut interested: Vec<&ChokeCandidate> = peers.iter().filter(|p| p.interested).collect();
        interested.shuffle(rng);
        interested.sort_by_key(|p| std::cmp::Reverse(p.rate));

        let mut unchoked: HashSet<PeerHandle> = peers
            .iter()
            .filter(|p| !p.interested)
            .map(|p| p.addr)
            .collect();
        unchoked.extend(interested.iter().take(max_unchoked).map(|p| p.addr));

        if optimistic_every > 0 && self.passes % optimistic_every == 0 {
            let choked: Vec<PeerHandle> = interested
                .iter()
                .filter(|p| p.am_choking && !unchoked.contains(&p.addr))
                .map(|p| p.addr)
                .collect();
            self.rotate_optimistic(&choked, rng);
        }
        if let Some(o) = self.optimistic {
            unchoked.insert(o);
        }

        let mut plan = ChokePlan::default();
        for p in peers {
            let want_unchoked = unchoked.contains(&p.addr);
            if want_unchoked && p.am_choking {
                plan.unchoke.push(p.addr);
            } else if !want_unchoked && !p.am_choking {
                plan.choke.push(p.addr);
            }
        }
        plan
    }

    /// Pick a new optimistic peer among `choked`, replacing the previous one.
    pub fn rotate_optimistic<R: Rng + ?Sized>(
        &mut self,
        choked: &[PeerHandle],
        rng: &mut R,
    ) -> Option<PeerHandle> {
        self.optimistic = choked.choose(rng).copied();
        if let Some(o) = self.optimistic {
            debug!(peer = %o, "optimistic unchoke");
        }
        self.optimistic
    }
}
