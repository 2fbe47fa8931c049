//! Group-aware train/validation/test partitioning.
//!
//! Every row of a group (race weekend) lands in the same partition, so no
//! weekend's conditions leak between training and evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::table::MasterTable;
use crate::config::SplitConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStrategy {
    /// Latest groups are held out
    #[default]
    Temporal,
    /// Seeded hash of the group key picks the partition
    GroupHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Train,
    Validation,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Validation, Partition::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Validation => "validation",
            Partition::Test => "test",
        }
    }
}

/// Group to partition assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub strategy: SplitStrategy,
    pub assignments: BTreeMap<String, Partition>,
}

impl SplitPlan {
    pub fn partition_of(&self, group: &str) -> Option<Partition> {
        self.assignments.get(group).copied()
    }

    pub fn groups_in(&self, partition: Partition) -> Vec<&str> {
        self.assignments
            .iter()
            .filter(|(_, &p)| p == partition)
            .map(|(g, _)| g.as_str())
            .collect()
    }
}

/// One cross-validation fold: rows held out and rows trained on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFold {
    pub fold: usize,
    pub groups: Vec<String>,
    pub train_rows: Vec<usize>,
    pub test_rows: Vec<usize>,
}

/// Per-group facts gathered from the table.
struct GroupInfo<'a> {
    key: &'a str,
    earliest: DateTime<Utc>,
    rows: usize,
}

fn group_infos(master: &MasterTable) -> Vec<GroupInfo<'_>> {
    let mut by_group: BTreeMap<&str, (DateTime<Utc>, usize)> = BTreeMap::new();
    for (group, &ts) in master.group_keys.iter().zip(&master.timestamps) {
        let entry = by_group.entry(group.as_str()).or_insert((ts, 0));
        entry.0 = entry.0.min(ts);
        entry.1 += 1;
    }
    by_group
        .into_iter()
        .map(|(key, (earliest, rows))| GroupInfo {
            key,
            earliest,
            rows,
        })
        .collect()
}

/// Plans and applies group-disjoint splits.
#[derive(Debug, Clone, Copy)]
pub struct SplitPlanner<'a> {
    config: &'a SplitConfig,
}

impl<'a> SplitPlanner<'a> {
    pub fn new(config: &'a SplitConfig) -> Self {
        Self { config }
    }

    /// Assign every group in the table to a partition.
    pub fn plan(&self, master: &MasterTable) -> SplitPlan {
        let groups = group_infos(master);
        let mut assignments: BTreeMap<String, Partition> = match self.config.strategy {
            SplitStrategy::Temporal => self.temporal(groups),
            SplitStrategy::GroupHash => groups
                .iter()
                .map(|g| (g.key.to_string(), self.hashed(g.key)))
                .collect(),
        };

        for group in &self.config.validation_groups {
            if let Some(slot) = assignments.get_mut(group) {
                *slot = Partition::Validation;
            }
        }
        for group in &self.config.test_groups {
            if self.config.validation_groups.contains(group) {
                warn!(group = %group, "Group listed for both validation and test; using test");
            }
            if let Some(slot) = assignments.get_mut(group) {
                *slot = Partition::Test;
            }
        }

        debug!(
            groups = assignments.len(),
            strategy = ?self.config.strategy,
            "Planned split"
        );

        SplitPlan {
            strategy: self.config.strategy,
            assignments,
        }
    }

    fn temporal(&self, mut groups: Vec<GroupInfo<'_>>) -> BTreeMap<String, Partition> {
        groups.sort_by(|a, b| a.earliest.cmp(&b.earliest).then_with(|| a.key.cmp(b.key)));

        let n = groups.len();
        let n_test = held_out(n, self.config.test_fraction, n);
        let n_val = held_out(n, self.config.validation_fraction, n - n_test);

        groups
            .iter()
            .enumerate()
            .map(|(i, g)| {
                let partition = if i >= n - n_test {
                    Partition::Test
                } else if i >= n - n_test - n_val {
                    Partition::Validation
                } else {
                    Partition::Train
                };
                (g.key.to_string(), partition)
            })
            .collect()
    }

    fn hashed(&self, group: &str) -> Partition {
        let hash = xxh3_64_with_seed(group.as_bytes(), self.config.seed);
        // Top 53 bits as a uniform draw in [0, 1)
        let u = (hash >> 11) as f64 / (1u64 << 53) as f64;
        if u < self.config.test_fraction {
            Partition::Test
        } else if u < self.config.test_fraction + self.config.validation_fraction {
            Partition::Validation
        } else {
            Partition::Train
        }
    }

    /// Write the partition column. Fails if a group has no assignment.
    pub fn apply(&self, plan: &SplitPlan, master: &mut MasterTable) -> Result<()> {
        let partitions = master
            .group_keys
            .iter()
            .map(|group| {
                plan.partition_of(group).ok_or_else(|| {
                    PipelineError::InvalidConfig(format!(
                        "group {group} is missing from the split plan"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        master.partitions = Some(partitions);
        Ok(())
    }

    /// Check that no group's rows span more than one partition.
    pub fn validate(master: &MasterTable) -> Result<()> {
        let partitions = master
            .partitions
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidConfig("table has no partition column".into()))?;

        let mut seen: BTreeMap<&str, BTreeSet<Partition>> = BTreeMap::new();
        for (group, &partition) in master.group_keys.iter().zip(partitions) {
            seen.entry(group.as_str()).or_default().insert(partition);
        }

        match seen.into_iter().find(|(_, parts)| parts.len() > 1) {
            Some((group, parts)) => Err(PipelineError::GroupLeakage {
                group: group.to_string(),
                partitions: parts.into_iter().collect(),
            }),
            None => Ok(()),
        }
    }

    /// Group k-fold cross-validation folds.
    ///
    /// Groups are placed largest first into the fold with the fewest rows
    /// so far (ties go to the lowest fold index).
    pub fn group_folds(&self, master: &MasterTable) -> Vec<GroupFold> {
        let mut groups = group_infos(master);
        let k = self.config.folds.clamp(1, groups.len().max(1));
        groups.sort_by(|a, b| b.rows.cmp(&a.rows).then_with(|| a.key.cmp(b.key)));

        let mut fold_rows = vec![0usize; k];
        let mut fold_of: BTreeMap<&str, usize> = BTreeMap::new();
        let mut fold_groups: Vec<Vec<String>> = vec![Vec::new(); k];
        for group in &groups {
            let target = (0..k).min_by_key(|&f| (fold_rows[f], f)).unwrap_or(0);
            fold_rows[target] += group.rows;
            fold_of.insert(group.key, target);
            fold_groups[target].push(group.key.to_string());
        }

        fold_groups
            .into_iter()
            .enumerate()
            .map(|(fold, groups)| {
                let (test_rows, train_rows): (Vec<usize>, Vec<usize>) = (0..master.len())
                    .partition(|&row| fold_of.get(master.group_keys[row].as_str()) == Some(&fold));
                GroupFold {
                    fold,
                    groups,
                    train_rows,
                    test_rows,
                }
            })
            .collect()
    }
}

/// Number of groups to hold out of `available`, at least one when the
/// fraction is positive and a training group would remain.
fn held_out(total: usize, fraction: f64, available: usize) -> usize {
    if fraction <= 0.0 || available <= 1 {
        return 0;
    }
    let wanted = ((total as f64) * fraction).floor() as usize;
    wanted.max(1).min(available - 1)
}
