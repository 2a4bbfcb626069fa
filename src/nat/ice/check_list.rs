// src/nat/ice/check_list.rs
//! ICE check list management (RFC 8445 Section 6.1.2)
//!
//! Pairs are kept sorted by descending pair priority at all times, so
//! iteration order is also check order and nomination order.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, info, trace};

use super::candidate::{Candidate, CandidatePair, CandidatePairState, CandidateType};

/// Pairs are unique per (local address, remote address)
pub type PairKey = (SocketAddr, SocketAddr);

/// Upper bound on pairs per check list (RFC 8445 Section 6.1.2.5)
const MAX_PAIRS: usize = 100;

/// Check list for one ICE session
#[derive(Debug, Clone)]
pub struct CheckList {
    /// Invariant: sorted by descending priority
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<PairKey>,
    controlling: bool,
    pruned: usize,
}

impl CheckList {
    /// Create an empty check list
    pub fn new(controlling: bool) -> Self {
        Self {
            pairs: Vec::new(),
            triggered: VecDeque::new(),
            controlling,
            pruned: 0,
        }
    }

    /// Form pairs for every (local, remote) combination not yet in the list
    ///
    /// Candidates are paired per component and IP family. Local server
    /// reflexive candidates are replaced by their base since checks are
    /// always sent from the base. Returns the number of pairs added.
    pub fn form_pairs(&mut self, locals: &[Candidate], remotes: &[Candidate]) -> usize {
        let mut added = 0;

        for local in locals {
            let local = match local.typ {
                CandidateType::ServerReflexive | CandidateType::PeerReflexive => {
                    match locals.iter().find(|c| Some(c.addr) == local.related_addr && c.typ == CandidateType::Host) {
                        Some(base) => base,
                        None => continue,
                    }
                }
                _ => local,
            };

            for remote in remotes {
                if local.component_id != remote.component_id {
                    continue;
                }
                if local.addr.is_ipv4() != remote.addr.is_ipv4() {
                    continue;
                }
                if local.transport != remote.transport {
                    continue;
                }

                let pair = CandidatePair::new(local.clone(), remote.clone(), self.controlling);
                if self.insert(pair) {
                    added += 1;
                }
            }
        }

        if added > 0 {
            info!(
                "Check list: {} pairs added, {} total, {} pruned",
                added,
                self.pairs.len(),
                self.pruned
            );
        }
        added
    }

    /// Insert a pair in priority order
    ///
    /// Returns false for a duplicate (same addresses) or a redundant pair
    /// (same component and same foundations on both sides as a pair of
    /// higher priority already listed).
    pub fn insert(&mut self, pair: CandidatePair) -> bool {
        let key = pair.addresses();
        if self.get(&key).is_some() {
            return false;
        }

        let redundant = self
            .pairs
            .iter()
            .position(|p| p.foundation == pair.foundation && p.local.component_id == pair.local.component_id);

        if let Some(index) = redundant {
            if self.pairs[index].priority >= pair.priority || self.pairs[index].state != CandidatePairState::Frozen {
                trace!("Pruning redundant pair {}", pair);
                self.pruned += 1;
                return false;
            }
            // The new pair supersedes a lower-priority one that was never checked
            let replaced = self.pairs.remove(index);
            trace!("Pair {} superseded by {}", replaced, pair);
            self.pruned += 1;
        }

        if self.pairs.len() >= MAX_PAIRS {
            match self.pairs.last() {
                Some(lowest) if lowest.priority < pair.priority && lowest.state == CandidatePairState::Frozen => {
                    self.pairs.pop();
                }
                _ => {
                    debug!("Check list full, dropping {}", pair);
                    return false;
                }
            }
        }

        let pos = self.pairs.partition_point(|p| p.priority >= pair.priority);
        self.pairs.insert(pos, pair);
        true
    }

    /// Pairs in priority order
    pub fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of pairs discarded as redundant
    pub fn pruned(&self) -> usize {
        self.pruned
    }

    pub fn get(&self, key: &PairKey) -> Option<&CandidatePair> {
        self.pairs.iter().find(|p| p.addresses() == *key)
    }

    pub fn get_mut(&mut self, key: &PairKey) -> Option<&mut CandidatePair> {
        self.pairs.iter_mut().find(|p| p.addresses() == *key)
    }

    /// Set the initial states (RFC 8445 Section 6.1.2.6): for each foundation
    /// the highest-priority Frozen pair becomes Waiting
    pub fn unfreeze_initial(&mut self) {
        let mut foundations = HashSet::new();
        for pair in &self.pairs {
            if pair.state != CandidatePairState::Frozen {
                foundations.insert(pair.foundation.clone());
            }
        }
        for pair in &mut self.pairs {
            if pair.state == CandidatePairState::Frozen && foundations.insert(pair.foundation.clone()) {
                pair.state = CandidatePairState::Waiting;
            }
        }
    }

    /// Update a pair's state; success unfreezes pairs of the same foundation
    pub fn set_state(&mut self, key: &PairKey, state: CandidatePairState) -> bool {
        let foundation = match self.get_mut(key) {
            Some(pair) => {
                trace!("Pair {} -> {:?}", pair, state);
                pair.state = state;
                pair.foundation.clone()
            }
            None => return false,
        };

        if state == CandidatePairState::Succeeded {
            for pair in &mut self.pairs {
                if pair.foundation == foundation && pair.state == CandidatePairState::Frozen {
                    pair.state = CandidatePairState::Waiting;
                }
            }
        }
        true
    }

    /// Queue a triggered check (RFC 8445 Section 7.3.1.4)
    pub fn trigger(&mut self, key: PairKey) {
        let Some(pair) = self.get_mut(&key) else { return };
        match pair.state {
            CandidatePairState::Succeeded | CandidatePairState::InProgress => return,
            _ => pair.state = CandidatePairState::Waiting,
        }
        if !self.triggered.contains(&key) {
            self.triggered.push_back(key);
        }
    }

    /// Pick the next pair to check and mark it InProgress
    ///
    /// Triggered checks go first, then the highest-priority Waiting pair.
    /// When nothing is Waiting or InProgress the best Frozen pair is unfrozen.
    pub fn next_check(&mut self) -> Option<PairKey> {
        while let Some(key) = self.triggered.pop_front() {
            if let Some(pair) = self.get_mut(&key) {
                if pair.state == CandidatePairState::Waiting {
                    pair.state = CandidatePairState::InProgress;
                    return Some(key);
                }
            }
        }

        let busy = self
            .pairs
            .iter()
            .any(|p| matches!(p.state, CandidatePairState::Waiting | CandidatePairState::InProgress));
        if !busy {
            if let Some(pair) = self.pairs.iter_mut().find(|p| p.state == CandidatePairState::Frozen) {
                pair.state = CandidatePairState::Waiting;
            }
        }

        let pair = self
            .pairs
            .iter_mut()
            .find(|p| p.state == CandidatePairState::Waiting)?;
        pair.state = CandidatePairState::InProgress;
        Some(pair.addresses())
    }

    /// Recompute priorities after a role change and re-sort
    pub fn set_controlling(&mut self, controlling: bool) {
        if self.controlling == controlling {
            return;
        }
        self.controlling = controlling;
        for pair in &mut self.pairs {
            pair.recompute_priority(controlling);
        }
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Highest-priority Succeeded pair of a component
    pub fn best_succeeded(&self, component_id: u32) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.local.component_id == component_id && p.state == CandidatePairState::Succeeded)
    }

    /// Succeeded pair to nominate for a component once no higher-priority
    /// pair of that component can still succeed
    pub fn nomination_candidate(&self, component_id: u32) -> Option<&CandidatePair> {
        for pair in self.pairs.iter().filter(|p| p.local.component_id == component_id) {
            match pair.state {
                CandidatePairState::Succeeded => return Some(pair),
                CandidatePairState::Failed => continue,
                _ => return None,
            }
        }
        None
    }

    /// Every pair is Succeeded or Failed
    pub fn all_terminal(&self) -> bool {
        self.pairs.iter().all(|p| p.state.is_terminal())
    }

    /// Every pair of the list has failed (false for an empty list)
    pub fn all_failed(&self) -> bool {
        !self.pairs.is_empty() && self.pairs.iter().all(|p| p.state == CandidatePairState::Failed)
    }

    pub fn any_succeeded(&self) -> bool {
        self.pairs.iter().any(|p| p.state == CandidatePairState::Succeeded)
    }

    pub fn in_progress(&self) -> usize {
        self.pairs
            .iter()
            .filter(|p| p.state == CandidatePairState::InProgress)
            .count()
    }

    /// Whether any check can still be started
    pub fn has_pending(&self) -> bool {
        !self.triggered.is_empty()
            || self
                .pairs
                .iter()
                .any(|p| matches!(p.state, CandidatePairState::Waiting | CandidatePairState::Frozen))
    }

    /// Fail every pair that has not reached a terminal state
    pub fn fail_remaining(&mut self) {
        self.triggered.clear();
        for pair in &mut self.pairs {
            if !pair.state.is_terminal() {
                pair.state = CandidatePairState::Failed;
            }
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.pairs.clear();
        self.triggered.clear();
    }
}
