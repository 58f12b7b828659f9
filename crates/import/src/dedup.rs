//! Near-duplicate detection over normalized transactions.
//!
//! Each pair is scored on date proximity, amount equality and description
//! similarity. Pairs at or above the threshold are grouped either by
//! connected components (transitive) or so that every member pair qualifies
//! (pairwise). Nothing is deleted here; a cluster only carries a suggestion
//! until the caller resolves it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tally_core::{Transaction, TransactionId, UNCATEGORIZED};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Clustering, DedupConfig};
use crate::similarity::text_similarity;

/// Component scores of one candidate pair, kept so every cluster can be explained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairScore {
    pub a: TransactionId,
    pub b: TransactionId,
    pub date: f32,
    pub amount: f32,
    pub description: f32,
    pub total: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Resolution {
    Unresolved,
    /// Keep one member; the others are removed.
    Merged { keep: TransactionId },
    /// Not duplicates after all.
    KeptAll,
    /// Remove exactly these members.
    Discarded { ids: Vec<TransactionId> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("{0} is not a member of this cluster")]
    NotAMember(TransactionId),
    #[error("Cluster is already resolved")]
    AlreadyResolved,
    #[error("Cluster has no resolution to apply")]
    Unresolved,
    #[error("Resolution would remove every member of the cluster")]
    WouldDiscardAll,
    #[error("Transaction {0} is not in the set")]
    MissingTransaction(TransactionId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster {
    /// Stable id derived from the sorted member ids.
    pub id: String,
    pub members: Vec<TransactionId>,
    pub representative: TransactionId,
    pub pairs: Vec<PairScore>,
    pub resolution: Resolution,
}

fn cluster_id(members: &[TransactionId]) -> String {
    let mut hasher = Sha256::new();
    for id in members {
        hasher.update(id.as_str().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("dup_{hex}")
}

impl DuplicateCluster {
    pub fn contains(&self, id: &TransactionId) -> bool {
        self.members.contains(id)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution != Resolution::Unresolved
    }

    /// Record the caller's decision. Validated up front so an invalid decision
    /// leaves the cluster untouched.
    pub fn resolve(&mut self, resolution: Resolution) -> Result<(), ResolutionError> {
        if self.is_resolved() {
            return Err(ResolutionError::AlreadyResolved);
        }
        match &resolution {
            Resolution::Unresolved => return Err(ResolutionError::Unresolved),
            Resolution::Merged { keep } => {
                if !self.contains(keep) {
                    return Err(ResolutionError::NotAMember(keep.clone()));
                }
            }
            Resolution::KeptAll => {}
            Resolution::Discarded { ids } => {
                if let Some(stranger) = ids.iter().find(|id| !self.contains(id)) {
                    return Err(ResolutionError::NotAMember(stranger.clone()));
                }
                let distinct: BTreeSet<&TransactionId> = ids.iter().collect();
                if distinct.len() >= self.members.len() {
                    return Err(ResolutionError::WouldDiscardAll);
                }
            }
        }
        self.resolution = resolution;
        Ok(())
    }

    /// Ids this resolution removes from the transaction set.
    pub fn removed_ids(&self) -> Vec<TransactionId> {
        match &self.resolution {
            Resolution::Merged { keep } => self.members.iter().filter(|m| *m != keep).cloned().collect(),
            Resolution::Discarded { ids } => ids.clone(),
            Resolution::Unresolved | Resolution::KeptAll => Vec::new(),
        }
    }

    /// Produce the transaction set with this resolution applied. Either the
    /// whole resolution applies or an error is returned and nothing changes.
    pub fn apply_resolution(&self, transactions: &[Transaction]) -> Result<Vec<Transaction>, ResolutionError> {
        if !self.is_resolved() {
            return Err(ResolutionError::Unresolved);
        }
        for member in &self.members {
            if !transactions.iter().any(|t| &t.id == member) {
                return Err(ResolutionError::MissingTransaction(member.clone()));
            }
        }

        let removed: HashSet<TransactionId> = self.removed_ids().into_iter().collect();
        let mut out: Vec<Transaction> = transactions
            .iter()
            .filter(|t| !removed.contains(&t.id))
            .cloned()
            .collect();

        // A merge keeps the chosen row but adopts a category from a dropped one
        // when the survivor has none.
        if let Resolution::Merged { keep } = &self.resolution {
            let donor = transactions
                .iter()
                .filter(|t| removed.contains(&t.id) && t.category != UNCATEGORIZED)
                .map(|t| t.category.clone())
                .next();
            if let (Some(category), Some(kept)) = (donor, out.iter_mut().find(|t| &t.id == keep)) {
                if kept.category == UNCATEGORIZED {
                    kept.category = category;
                }
            }
        }
        Ok(out)
    }
}

/// Apply every resolved cluster in order; all or nothing.
pub fn apply_resolutions(
    transactions: &[Transaction],
    clusters: &[DuplicateCluster],
) -> Result<Vec<Transaction>, ResolutionError> {
    let mut current = transactions.to_vec();
    for cluster in clusters.iter().filter(|c| c.is_resolved()) {
        current = cluster.apply_resolution(&current)?;
    }
    Ok(current)
}

/// Re-attach decisions recorded for earlier runs. Cluster ids are derived
/// from member ids, so a cluster detected again with the same members picks up
/// its stored decision. Returns how many clusters were restored.
pub fn restore_resolutions(clusters: &mut [DuplicateCluster], recorded: &HashMap<String, Resolution>) -> usize {
    let mut restored = 0;
    for cluster in clusters.iter_mut().filter(|c| !c.is_resolved()) {
        let Some(resolution) = recorded.get(&cluster.id) else {
            continue;
        };
        match cluster.resolve(resolution.clone()) {
            Ok(()) => restored += 1,
            Err(e) => debug!(cluster = %cluster.id, error = %e, "Ignoring stale recorded resolution"),
        }
    }
    restored
}

pub struct DuplicateDetector {
    pub date_window_days: i64,
    pub date_weight: f32,
    pub amount_weight: f32,
    pub description_weight: f32,
    pub threshold: f32,
    pub amount_tolerance: Decimal,
    pub clustering: Clustering,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}

impl DuplicateDetector {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            date_window_days: config.date_window_days.max(0),
            date_weight: config.date_weight,
            amount_weight: config.amount_weight,
            description_weight: config.description_weight,
            threshold: config.threshold,
            amount_tolerance: config.amount_tolerance,
            clustering: config.clustering,
        }
    }

    fn weight_sum(&self) -> f32 {
        let sum = self.date_weight + self.amount_weight + self.description_weight;
        if sum > 0.0 {
            sum
        } else {
            1.0
        }
    }

    /// Weighted score of a pair in [0.0, 1.0].
    pub fn score_pair(&self, a: &Transaction, b: &Transaction) -> PairScore {
        let days = (a.date - b.date).num_days().abs();
        let date = if days > self.date_window_days {
            0.0
        } else {
            1.0 - (days as f32 / (self.date_window_days + 1) as f32)
        };
        let diff = (a.amount.value() - b.amount.value()).abs();
        let amount = if diff <= self.amount_tolerance { 1.0 } else { 0.0 };
        let description = text_similarity(&a.description, &b.description);
        let total = (self.date_weight * date + self.amount_weight * amount + self.description_weight * description)
            / self.weight_sum();

        PairScore {
            a: a.id.clone(),
            b: b.id.clone(),
            date,
            amount,
            description,
            total,
        }
    }

    /// Pairs outside the date window score zero on date; when the remaining
    /// weights cannot reach the threshold they never need scoring.
    fn window_bounds_search(&self) -> bool {
        (self.amount_weight + self.description_weight) / self.weight_sum() < self.threshold
    }

    /// Cluster every near-duplicate group within `transactions`.
    pub fn detect(&self, transactions: &[Transaction]) -> Vec<DuplicateCluster> {
        let all: Vec<&Transaction> = transactions.iter().collect();
        let prior = vec![false; all.len()];
        self.cluster(&all, &prior)
    }

    /// Cluster `new` against itself and against `prior`. Pairs made only of
    /// prior transactions are not considered again.
    pub fn detect_against(&self, new: &[Transaction], prior: &[Transaction]) -> Vec<DuplicateCluster> {
        let all: Vec<&Transaction> = new.iter().chain(prior.iter()).collect();
        let is_prior: Vec<bool> = (0..all.len()).map(|i| i >= new.len()).collect();
        self.cluster(&all, &is_prior)
    }

    fn qualifying_pairs(&self, txs: &[&Transaction], is_prior: &[bool]) -> Vec<(usize, usize, PairScore)> {
        let candidates: Vec<usize> = (0..txs.len())
            .filter(|i| txs[*i].duplicate_of().is_none())
            .collect();
        let mut by_date = candidates;
        by_date.sort_by(|a, b| txs[*a].date.cmp(&txs[*b].date).then_with(|| txs[*a].id.cmp(&txs[*b].id)));
        let bounded = self.window_bounds_search();

        let mut pairs = Vec::new();
        for (pos, &i) in by_date.iter().enumerate() {
            for &j in &by_date[pos + 1..] {
                if bounded && (txs[j].date - txs[i].date).num_days() > self.date_window_days {
                    break;
                }
                if is_prior[i] && is_prior[j] {
                    continue;
                }
                let score = self.score_pair(txs[i], txs[j]);
                if score.total >= self.threshold {
                    pairs.push((i, j, score));
                }
            }
        }
        pairs
    }

    fn cluster(&self, txs: &[&Transaction], is_prior: &[bool]) -> Vec<DuplicateCluster> {
        let pairs = self.qualifying_pairs(txs, is_prior);
        let groups = match self.clustering {
            Clustering::Transitive => transitive_groups(txs.len(), &pairs),
            Clustering::Pairwise => complete_linkage_groups(&pairs),
        };

        let mut clusters: Vec<DuplicateCluster> = groups
            .into_iter()
            .filter(|g| g.len() >= 2)
            .map(|group| self.build_cluster(txs, is_prior, &group, &pairs))
            .collect();
        clusters.sort_by(|a, b| {
            let first = |c: &DuplicateCluster| {
                txs.iter()
                    .filter(|t| c.contains(&t.id))
                    .map(|t| t.date)
                    .min()
            };
            first(a).cmp(&first(b)).then_with(|| a.members.cmp(&b.members))
        });

        info!(
            candidates = txs.len(),
            pairs = pairs.len(),
            clusters = clusters.len(),
            mode = ?self.clustering,
            "Detected duplicate clusters"
        );
        clusters
    }

    fn build_cluster(
        &self,
        txs: &[&Transaction],
        is_prior: &[bool],
        group: &BTreeSet<usize>,
        pairs: &[(usize, usize, PairScore)],
    ) -> DuplicateCluster {
        let mut members: Vec<TransactionId> = group.iter().map(|i| txs[*i].id.clone()).collect();
        members.sort();
        members.dedup();

        let representative = group
            .iter()
            .copied()
            .min_by(|a, b| {
                is_prior[*b]
                    .cmp(&is_prior[*a])
                    .then_with(|| txs[*b].description.len().cmp(&txs[*a].description.len()))
                    .then_with(|| txs[*a].id.cmp(&txs[*b].id))
            })
            .map(|i| txs[i].id.clone())
            .unwrap_or_else(|| members[0].clone());

        let cluster_pairs: Vec<PairScore> = pairs
            .iter()
            .filter(|(i, j, _)| group.contains(i) && group.contains(j))
            .map(|(_, _, s)| s.clone())
            .collect();

        let id = cluster_id(&members);
        debug!(cluster = %id, members = members.len(), representative = %representative, "Built cluster");
        DuplicateCluster {
            id,
            members,
            representative,
            pairs: cluster_pairs,
            resolution: Resolution::Unresolved,
        }
    }
}

// ── Grouping ──────────────────────────────────────────────────────────────────

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller index becomes the root so grouping is deterministic.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

fn transitive_groups(n: usize, pairs: &[(usize, usize, PairScore)]) -> Vec<BTreeSet<usize>> {
    let mut uf = UnionFind::new(n);
    for (i, j, _) in pairs {
        uf.union(*i, *j);
    }
    let mut groups: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
    for (i, j, _) in pairs {
        for x in [*i, *j] {
            let root = uf.find(x);
            groups.entry(root).or_default().insert(x);
        }
    }
    groups.into_values().collect()
}

/// Greedy complete-linkage: strongest pairs first, and two groups only join
/// when every cross pair qualifies.
fn complete_linkage_groups(pairs: &[(usize, usize, PairScore)]) -> Vec<BTreeSet<usize>> {
    let qualifying: HashSet<(usize, usize)> = pairs.iter().map(|(i, j, _)| (*i.min(j), *i.max(j))).collect();
    let linked = |a: usize, b: usize| qualifying.contains(&(a.min(b), a.max(b)));

    let mut order: Vec<&(usize, usize, PairScore)> = pairs.iter().collect();
    order.sort_by(|x, y| {
        y.2.total
            .total_cmp(&x.2.total)
            .then_with(|| (x.0, x.1).cmp(&(y.0, y.1)))
    });

    let mut group_of: HashMap<usize, usize> = HashMap::new();
    let mut groups: Vec<BTreeSet<usize>> = Vec::new();
    for (i, j, _) in order {
        match (group_of.get(i).copied(), group_of.get(j).copied()) {
            (None, None) => {
                groups.push(BTreeSet::from([*i, *j]));
                group_of.insert(*i, groups.len() - 1);
                group_of.insert(*j, groups.len() - 1);
            }
            (Some(g), None) | (None, Some(g)) => {
                let newcomer = if group_of.contains_key(i) { *j } else { *i };
                if groups[g].iter().all(|m| linked(*m, newcomer)) {
                    groups[g].insert(newcomer);
                    group_of.insert(newcomer, g);
                }
            }
            (Some(g), Some(h)) if g != h => {
                let joinable = groups[g].iter().all(|a| groups[h].iter().all(|b| linked(*a, *b)));
                if joinable {
                    let moved = std::mem::take(&mut groups[h]);
                    for m in &moved {
                        group_of.insert(*m, g);
                    }
                    groups[g].extend(moved);
                }
            }
            _ => {}
        }
    }
    groups.into_iter().filter(|g| !g.is_empty()).collect()
}
