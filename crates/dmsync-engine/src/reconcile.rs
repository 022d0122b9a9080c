//! Key + timestamp reconciliation
//!
//! [`ReconciliationPlan::compute`] is a pure diff of two `{key -> last
//! modified}` maps. [`Reconciler`] gathers both maps for a creation-date
//! range, computes the plan and applies it in three phases: insert, then
//! update, then delete. Stopping between phases leaves the target missing
//! changes rather than missing rows, and the next run picks them up.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use dmsync_common::types::{DateRange, Key, Timestamp};
use tracing::{info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::metrics::Metrics;
use crate::partition::BucketAction;
use crate::source::{KeySetReader, PaginatedReader, RecordReader, RemoteSource, SourceQuery, DEFAULT_PAGE_SIZE};
use crate::target::{TableDef, TargetStore};
use crate::writer::{WriteStrategy, Writer};

/// Classification of every key seen on either side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// On the source only
    pub insert: BTreeSet<Key>,
    /// On both sides with different timestamps
    pub update: BTreeSet<Key>,
    /// On both sides with equal timestamps
    pub skip: BTreeSet<Key>,
    /// On the target only
    pub delete: BTreeSet<Key>,
}

impl ReconciliationPlan {
    /// Diff source state against target state.
    ///
    /// Fails with [`SyncError::DuplicateKey`] if the source yields a key twice.
    pub fn compute<I>(target: &BTreeMap<Key, Timestamp>, source: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Key, Timestamp)>,
    {
        let mut plan = Self::default();
        let mut examined = 0usize;

        for (key, updated) in source {
            if plan.contains_source_key(&key) {
                return Err(SyncError::DuplicateKey(key));
            }
            examined += 1;
            match target.get(&key) {
                None => plan.insert.insert(key),
                Some(existing) if *existing != updated => plan.update.insert(key),
                Some(_) => plan.skip.insert(key),
            };
        }

        plan.delete = target
            .keys()
            .filter(|k| !plan.contains_source_key(k))
            .cloned()
            .collect();

        plan.verify(examined)?;
        Ok(plan)
    }

    fn contains_source_key(&self, key: &Key) -> bool {
        self.insert.contains(key) || self.update.contains(key) || self.skip.contains(key)
    }

    fn verify(&self, source_keys: usize) -> Result<()> {
        let classified = self.insert.len() + self.update.len() + self.skip.len();
        if classified != source_keys {
            return Err(SyncError::PlanInvariant(format!(
                "{classified} keys classified but {source_keys} source keys examined"
            )));
        }
        if let Some(key) = self.delete.iter().find(|k| self.contains_source_key(k)) {
            return Err(SyncError::PlanInvariant(format!(
                "key {key} planned for delete was seen on the source"
            )));
        }
        Ok(())
    }

    /// Number of distinct source keys the plan covers
    pub fn source_keys(&self) -> usize {
        self.insert.len() + self.update.len() + self.skip.len()
    }

    /// Whether applying the plan would change nothing
    pub fn is_noop(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

impl std::fmt::Display for ReconciliationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "insert={} update={} skip={} delete={}",
            self.insert.len(),
            self.update.len(),
            self.skip.len(),
            self.delete.len()
        )
    }
}

/// Makes one target table match the source within a creation-date range
pub struct Reconciler {
    source: Arc<dyn RemoteSource>,
    target: Arc<dyn TargetStore>,
    table: Arc<TableDef>,
    filter: Option<String>,
    page_size: usize,
    max_rows: Option<u64>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn RemoteSource>, target: Arc<dyn TargetStore>, table: Arc<TableDef>) -> Self {
        Self {
            source,
            target,
            table,
            filter: None,
            page_size: DEFAULT_PAGE_SIZE,
            max_rows: None,
        }
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Cap on rows read by the plan pass of each range
    pub fn with_max_rows(mut self, max_rows: Option<u64>) -> Self {
        self.max_rows = max_rows;
        self
    }

    fn base_query(&self) -> SourceQuery {
        let query = SourceQuery::new(self.table.source_table.clone());
        match &self.filter {
            Some(filter) => query.with_filter(filter.clone()),
            None => query,
        }
    }

    /// Read both sides for `created` and diff them
    #[instrument(skip(self, metrics), fields(table = %self.table.name))]
    pub async fn plan(&self, created: DateRange, metrics: &Arc<Metrics>) -> Result<ReconciliationPlan> {
        let target = self.target.timestamps(&self.table, &created).await?;

        let names = &self.table.field_names;
        let query = self
            .base_query()
            .with_created(created)
            .with_fields([names.key.clone(), names.updated.clone()]);
        let mut reader = PaginatedReader::new(
            Arc::clone(&self.source),
            query,
            self.page_size,
            metrics.child("plan"),
        )?
        .with_max_rows(self.max_rows);

        let mut source = Vec::new();
        while let Some(page) = reader.next_page().await? {
            source.extend(page.into_iter().map(|r| (r.key().clone(), r.updated())));
        }

        let plan = ReconciliationPlan::compute(&target, source)?;
        info!(target_rows = target.len(), %plan, "Reconciliation plan ready");
        Ok(plan)
    }

    /// Apply `plan`: insert, then update, then delete, on one session
    #[instrument(skip_all, fields(table = %self.table.name, %plan))]
    pub async fn execute(&self, plan: &ReconciliationPlan, metrics: &Arc<Metrics>) -> Result<()> {
        metrics.add_skipped(plan.skip.len() as u64);
        if plan.is_noop() {
            return Ok(());
        }

        let mut session = self.target.session().await?;

        for (strategy, keys) in [
            (WriteStrategy::Insert, &plan.insert),
            (WriteStrategy::Update, &plan.update),
        ] {
            if keys.is_empty() {
                continue;
            }
            let phase = metrics.child(strategy.to_string());
            // Replayed rows were already counted by the plan pass
            let replay = Metrics::root(format!("{}.replay", phase.name()));
            let mut reader = KeySetReader::new(
                Arc::clone(&self.source),
                self.base_query(),
                keys.iter().cloned(),
                self.page_size,
                replay,
            )?;
            let writer = Writer::new(strategy, Arc::clone(&self.table), Arc::clone(&phase));
            let outcome = writer.drain(&mut reader, session.as_mut()).await?;

            let applied = match strategy {
                WriteStrategy::Insert => outcome.inserted,
                _ => outcome.updated,
            };
            check_phase(strategy, keys.len(), applied);
        }

        if !plan.delete.is_empty() {
            let phase = metrics.child(WriteStrategy::Delete.to_string());
            let keys: Vec<Key> = plan.delete.iter().cloned().collect();
            let writer = Writer::new(WriteStrategy::Delete, Arc::clone(&self.table), phase);
            let outcome = writer.delete_keys(session.as_mut(), &keys, self.page_size).await?;
            check_phase(WriteStrategy::Delete, keys.len(), outcome.deleted);
        }

        Ok(())
    }

    /// Plan and execute in one go
    pub async fn run(&self, created: DateRange, metrics: &Arc<Metrics>) -> Result<ReconciliationPlan> {
        metrics.start();
        let result = match self.plan(created, metrics).await {
            Ok(plan) => self.execute(&plan, metrics).await.map(|()| plan),
            Err(err) => Err(err),
        };
        metrics.finish();
        result
    }
}

/// The source keeps changing while a plan executes, so a short phase is
/// reported but never fatal
fn check_phase(strategy: WriteStrategy, planned: usize, applied: u64) {
    if applied != planned as u64 {
        warn!(phase = %strategy, planned, applied, "Phase applied a different number of rows than planned");
    }
}

#[async_trait]
impl BucketAction for Reconciler {
    async fn process(&self, bucket: DateRange, metrics: Arc<Metrics>) -> Result<()> {
        self.run(bucket, &metrics).await.map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dmsync_common::types::parse_timestamp;
    use proptest::prelude::*;

    fn ts(hour: u32) -> Timestamp {
        parse_timestamp(&format!("2024-01-01 {hour:02}:00:00")).unwrap()
    }

    fn keys(names: &[&str]) -> BTreeSet<Key> {
        names.iter().map(|n| Key::from(*n)).collect()
    }

    #[test]
    fn test_plan_classifies_every_key() {
        let target: BTreeMap<Key, Timestamp> =
            [("A", 1), ("B", 9), ("D", 4)].iter().map(|(k, h)| (Key::from(*k), ts(*h))).collect();
        let source = [("A", 1), ("B", 2), ("C", 3)].iter().map(|(k, h)| (Key::from(*k), ts(*h)));

        let plan = ReconciliationPlan::compute(&target, source).unwrap();

        assert_eq!(plan.insert, keys(&["C"]));
        assert_eq!(plan.update, keys(&["B"]));
        assert_eq!(plan.skip, keys(&["A"]));
        assert_eq!(plan.delete, keys(&["D"]));
        assert_eq!(plan.source_keys(), 3);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_duplicate_source_key_is_fatal() {
        let source = vec![(Key::from("A"), ts(1)), (Key::from("A"), ts(2))];
        let err = ReconciliationPlan::compute(&BTreeMap::new(), source).unwrap_err();
        assert!(matches!(err, SyncError::DuplicateKey(k) if k.as_str() == "A"));
    }

    #[test]
    fn test_identical_sides_are_a_noop() {
        let state: BTreeMap<Key, Timestamp> = [("A", 1), ("B", 2)].iter().map(|(k, h)| (Key::from(*k), ts(*h))).collect();
        let plan = ReconciliationPlan::compute(&state, state.clone()).unwrap();
        assert!(plan.is_noop());
        assert_eq!(plan.skip.len(), 2);
    }

    fn state() -> impl Strategy<Value = BTreeMap<Key, Timestamp>> {
        prop::collection::btree_map("[a-f]{1,2}".prop_map(Key::from), (0u32..4).prop_map(ts), 0..40)
    }

    proptest! {
        #[test]
        fn test_plan_partition_law(target in state(), source in state()) {
            let plan = ReconciliationPlan::compute(&target, source.clone()).unwrap();

            let src: BTreeSet<Key> = source.keys().cloned().collect();
            let tgt: BTreeSet<Key> = target.keys().cloned().collect();

            prop_assert_eq!(&plan.insert, &src.difference(&tgt).cloned().collect::<BTreeSet<_>>());
            prop_assert_eq!(&plan.delete, &tgt.difference(&src).cloned().collect::<BTreeSet<_>>());
            for key in src.intersection(&tgt) {
                let changed = target[key] != source[key];
                prop_assert_eq!(plan.update.contains(key), changed);
                prop_assert_eq!(plan.skip.contains(key), !changed);
            }

            let total = plan.insert.len() + plan.update.len() + plan.skip.len() + plan.delete.len();
            prop_assert_eq!(total, src.union(&tgt).count());
        }
    }
}
