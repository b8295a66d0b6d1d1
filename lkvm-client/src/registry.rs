//! In-memory view of known instances.
//!
//! The registry owns every [`Instance`]; callers get clones. Mutating a single
//! entry requires the [`NameGuard`] for that name, so two operations on the
//! same instance are always serialized while distinct names proceed in
//! parallel. Bulk reconciliation skips any name whose lock is held.
//!
//! Guarded mutations also stamp the name with a registry generation. A
//! listing is reconciled against the generation read before the tool was
//! invoked, so a name changed or evicted while the listing was in flight is
//! left alone rather than rolled back to what the tool printed earlier.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result, StateError};
use crate::types::{Instance, InstanceState, Record};

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

fn poisoned<T>(_: T) -> ClientError {
    ClientError::Internal("Lock poisoned".to_string())
}

/// Exclusive right to mutate one instance's entry.
///
/// Dropping the guard releases the name; the lock table entry is removed
/// once nobody else holds or waits on it.
pub struct NameGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl NameGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut table) = self.table.lock() {
            let idle = table
                .get(&self.name)
                .map(|lock| Arc::strong_count(lock) == 1)
                .unwrap_or(false);
            if idle {
                table.remove(&self.name);
            }
        }
    }
}

impl std::fmt::Debug for NameGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameGuard").field("name", &self.name).finish()
    }
}

/// One state change applied by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub name: String,
    pub from: InstanceState,
    pub to: InstanceState,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileDiff {
    /// Newly discovered instances
    pub added: Vec<String>,
    /// Instances whose state changed
    pub changed: Vec<StateChange>,
    /// Instances the tool reported as destroyed (evicted)
    pub removed: Vec<String>,
    /// Registered instances absent from the output (now Unknown)
    pub missing: Vec<String>,
    /// Names left alone because an operation held their lock
    pub skipped: Vec<String>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.removed.is_empty()
            && self.missing.is_empty()
            && self.skipped.is_empty()
    }
}

#[derive(Default)]
struct Entries {
    instances: BTreeMap<String, Instance>,
    /// Generation of the last guarded mutation per name. Evicted names keep
    /// theirs until a listing started after the eviction is reconciled.
    stamps: HashMap<String, u64>,
    /// Start generation of the newest listing reconciled
    reconciled: u64,
}

impl Entries {
    fn changed_since(&self, name: &str, since: u64) -> bool {
        self.stamps.get(name).is_some_and(|stamp| *stamp > since)
    }
}

/// Name-keyed registry of instances.
pub struct InstanceRegistry {
    entries: RwLock<Entries>,
    generation: AtomicU64,
    locks: LockTable,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            generation: AtomicU64::new(0),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Current mutation generation.
    ///
    /// Read this before invoking the tool for a listing and hand it to
    /// [`reconcile`](Self::reconcile) with the parsed records.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Stamp `name` as mutated now. Called with the entries write-locked.
    fn stamp(&self, entries: &mut Entries, name: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        entries.stamps.insert(name.to_string(), generation);
    }

    fn name_lock(&self, name: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut table = self.locks.lock().map_err(poisoned)?;
        Ok(table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// Wait for exclusive access to `name`.
    pub async fn lock(&self, name: &str) -> Result<NameGuard> {
        let lock = self.name_lock(name)?;
        let guard = lock.lock_owned().await;
        Ok(NameGuard {
            name: name.to_string(),
            guard: Some(guard),
            table: self.locks.clone(),
        })
    }

    /// Take `name` only if nobody holds it.
    pub fn try_lock(&self, name: &str) -> Result<Option<NameGuard>> {
        let lock = self.name_lock(name)?;
        Ok(lock.try_lock_owned().ok().map(|guard| NameGuard {
            name: name.to_string(),
            guard: Some(guard),
            table: self.locks.clone(),
        }))
    }

    /// Snapshot of one instance.
    pub fn get(&self, name: &str) -> Result<Instance> {
        let entries = self.entries.read().map_err(poisoned)?;
        entries
            .instances
            .get(name)
            .cloned()
            .ok_or_else(|| StateError::NotFound(name.to_string()).into())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.entries.read().map_err(poisoned)?.instances.contains_key(name))
    }

    /// Snapshots of all instances, ordered by name.
    pub fn list(&self) -> Result<Vec<Instance>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.instances.values().cloned().collect())
    }

    /// Registered names, ordered.
    pub fn names(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.instances.keys().cloned().collect())
    }

    /// Register a confirmed instance.
    pub fn insert(&self, guard: &NameGuard, instance: Instance) -> Result<()> {
        if instance.name != guard.name {
            return Err(ClientError::Internal(format!(
                "guard for {} used to insert {}",
                guard.name, instance.name
            )));
        }
        let mut entries = self.entries.write().map_err(poisoned)?;
        self.stamp(&mut entries, &guard.name);
        entries.instances.insert(instance.name.clone(), instance);
        Ok(())
    }

    /// Apply a fresh inspection of the guarded instance.
    ///
    /// Inspection is authoritative, so this is the one path that resolves
    /// `Unknown` to whatever the tool reports.
    pub fn record_inspection(&self, guard: &NameGuard, record: &Record) -> Result<Instance> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        self.stamp(&mut entries, &guard.name);
        let instance = entries
            .instances
            .entry(guard.name.clone())
            .or_insert_with(|| Instance::from_record(record));
        instance.observe(record);
        Ok(instance.clone())
    }

    /// Mark the guarded instance `Unknown`.
    pub fn mark_unknown(&self, guard: &NameGuard) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        self.stamp(&mut entries, &guard.name);
        if let Some(instance) = entries.instances.get_mut(&guard.name) {
            if instance.state != InstanceState::Unknown {
                warn!(name = %guard.name, from = %instance.state, "Instance state is now unknown");
            }
            instance.set_state(InstanceState::Unknown);
        }
        Ok(())
    }

    /// Remove the guarded instance entirely.
    pub fn evict(&self, guard: &NameGuard) -> Result<Option<Instance>> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        self.stamp(&mut entries, &guard.name);
        let evicted = entries.instances.remove(&guard.name);
        if evicted.is_some() {
            debug!(name = %guard.name, "Instance evicted from registry");
        }
        Ok(evicted)
    }

    /// Merge freshly parsed records into the registry.
    ///
    /// `since` is the [`generation`](Self::generation) read before the
    /// listing was requested. Names held by an in-flight operation, and
    /// names mutated or evicted after `since`, are skipped. A listing older
    /// than one already reconciled is skipped entirely. Observed states that
    /// the state machine cannot reach from the current state become
    /// `Unknown`, and registered names missing from `records` become
    /// `Unknown` too. Only an explicit `Destroyed` report evicts.
    pub fn reconcile(&self, records: Vec<Record>, since: u64) -> Result<ReconcileDiff> {
        let mut diff = ReconcileDiff::default();
        let mut seen = HashSet::new();
        let mut entries = self.entries.write().map_err(poisoned)?;

        if since < entries.reconciled {
            debug!(since, reconciled = entries.reconciled, "Discarding superseded listing");
            diff.skipped = records.into_iter().map(|record| record.name).collect();
            return Ok(diff);
        }
        entries.reconciled = since;

        for record in records {
            seen.insert(record.name.clone());

            if entries.changed_since(&record.name, since) {
                debug!(name = %record.name, "Changed after listing started, skipping");
                diff.skipped.push(record.name);
                continue;
            }
            let Some(_guard) = self.try_lock(&record.name)? else {
                diff.skipped.push(record.name);
                continue;
            };
            let instances = &mut entries.instances;

            if !instances.contains_key(&record.name) {
                if record.state != InstanceState::Destroyed {
                    instances.insert(record.name.clone(), Instance::from_record(&record));
                    diff.added.push(record.name);
                }
                continue;
            }

            if record.state == InstanceState::Destroyed {
                instances.remove(&record.name);
                diff.removed.push(record.name);
                continue;
            }

            let Some(instance) = instances.get_mut(&record.name) else {
                continue;
            };
            let from = instance.state;
            let legal = from == record.state
                || from == InstanceState::Unknown
                || from.can_transition_to(record.state);
            if legal {
                instance.observe(&record);
            } else {
                warn!(
                    name = %record.name,
                    from = %from,
                    observed = %record.state,
                    "Observed state is not reachable, marking unknown"
                );
                instance.set_state(InstanceState::Unknown);
            }
            if instance.state != from {
                diff.changed.push(StateChange {
                    name: record.name,
                    from,
                    to: instance.state,
                });
            }
        }

        let absent: Vec<String> = entries
            .instances
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        for name in absent {
            if entries.changed_since(&name, since) {
                diff.skipped.push(name);
                continue;
            }
            let Some(_guard) = self.try_lock(&name)? else {
                diff.skipped.push(name);
                continue;
            };
            if let Some(instance) = entries.instances.get_mut(&name) {
                if instance.state != InstanceState::Unknown {
                    instance.set_state(InstanceState::Unknown);
                    diff.missing.push(name);
                }
            }
        }

        // Later listings start after these stamps, so they are authoritative
        entries.stamps.retain(|_, stamp| *stamp > since);

        if !diff.is_empty() {
            info!(
                added = diff.added.len(),
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                missing = diff.missing.len(),
                skipped = diff.skipped.len(),
                "Registry reconciled"
            );
        }

        Ok(diff)
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(name: &str, state: InstanceState) -> Record {
        Record::new(name, state)
    }

    /// Reconcile a listing taken right now.
    fn reconcile(registry: &InstanceRegistry, records: Vec<Record>) -> ReconcileDiff {
        registry.reconcile(records, registry.generation()).unwrap()
    }

    #[test]
    fn test_reconcile_inserts_and_orders() {
        let registry = InstanceRegistry::new();
        let diff = reconcile(
            &registry,
            vec![
                record("vm-b", InstanceState::Running),
                record("vm-a", InstanceState::Stopped),
            ],
        );
        assert_eq!(diff.added, vec!["vm-b".to_string(), "vm-a".to_string()]);

        let names: Vec<String> = registry.list().unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["vm-a".to_string(), "vm-b".to_string()]);
    }

    #[test]
    fn test_absent_entries_become_unknown() {
        let registry = InstanceRegistry::new();
        reconcile(&registry, vec![record("vm1", InstanceState::Running)]);

        let diff = reconcile(&registry, vec![]);
        assert_eq!(diff.missing, vec!["vm1".to_string()]);
        assert_eq!(registry.get("vm1").unwrap().state, InstanceState::Unknown);
    }

    #[test]
    fn test_running_never_jumps_to_destroyed_implicitly() {
        let registry = InstanceRegistry::new();
        reconcile(&registry, vec![record("vm1", InstanceState::Running)]);

        // Creating is not reachable from Running
        reconcile(&registry, vec![record("vm1", InstanceState::Creating)]);
        assert_eq!(registry.get("vm1").unwrap().state, InstanceState::Unknown);

        // An explicit report evicts
        let diff = reconcile(&registry, vec![record("vm1", InstanceState::Destroyed)]);
        assert_eq!(diff.removed, vec!["vm1".to_string()]);
        assert!(registry.get("vm1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let registry = InstanceRegistry::new();
        let records = vec![record("vm1", InstanceState::Running), record("vm2", InstanceState::Paused)];
        reconcile(&registry, records.clone());
        let first = registry.list().unwrap();

        let diff = reconcile(&registry, records);
        assert!(diff.is_empty());
        assert_eq!(registry.list().unwrap(), first);
    }

    #[tokio::test]
    async fn test_reconcile_skips_locked_names() {
        let registry = InstanceRegistry::new();
        reconcile(&registry, vec![record("vm1", InstanceState::Running)]);

        let guard = registry.lock("vm1").await.unwrap();
        let diff = reconcile(
            &registry,
            vec![record("vm1", InstanceState::Stopped), record("vm2", InstanceState::Creating)],
        );
        assert_eq!(diff.skipped, vec!["vm1".to_string()]);
        assert_eq!(diff.added, vec!["vm2".to_string()]);
        assert_eq!(registry.get("vm1").unwrap().state, InstanceState::Running);
        drop(guard);

        reconcile(&registry, vec![record("vm1", InstanceState::Stopped)]);
        assert_eq!(registry.get("vm1").unwrap().state, InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_stale_listing_does_not_resurrect_evicted_name() {
        let registry = InstanceRegistry::new();
        reconcile(&registry, vec![record("vm1", InstanceState::Stopped)]);

        // Listing requested while vm1 still existed
        let since = registry.generation();
        {
            let guard = registry.lock("vm1").await.unwrap();
            registry.evict(&guard).unwrap();
        }

        let diff = registry
            .reconcile(vec![record("vm1", InstanceState::Stopped)], since)
            .unwrap();
        assert_eq!(diff.skipped, vec!["vm1".to_string()]);
        assert!(diff.added.is_empty());
        assert!(registry.get("vm1").unwrap_err().is_not_found());

        // A listing requested after the eviction is authoritative again
        let diff = reconcile(&registry, vec![record("vm1", InstanceState::Stopped)]);
        assert_eq!(diff.added, vec!["vm1".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_listing_does_not_revert_newer_state() {
        let registry = InstanceRegistry::new();
        reconcile(&registry, vec![record("vm1", InstanceState::Running)]);

        let since = registry.generation();
        {
            let guard = registry.lock("vm1").await.unwrap();
            registry
                .record_inspection(&guard, &record("vm1", InstanceState::Stopped))
                .unwrap();
        }

        // Running is reachable from Stopped, so only the stamp protects it
        registry
            .reconcile(vec![record("vm1", InstanceState::Running)], since)
            .unwrap();
        assert_eq!(registry.get("vm1").unwrap().state, InstanceState::Stopped);

        // Nor does the stale listing's absence of a fresh name count
        {
            let guard = registry.lock("vm2").await.unwrap();
            registry
                .insert(&guard, Instance::from_record(&record("vm2", InstanceState::Running)))
                .unwrap();
        }
        let diff = registry.reconcile(vec![], since).unwrap();
        assert!(diff.skipped.contains(&"vm2".to_string()));
        assert_eq!(registry.get("vm2").unwrap().state, InstanceState::Running);
    }

    #[tokio::test]
    async fn test_superseded_listing_is_discarded() {
        let registry = InstanceRegistry::new();
        let older = registry.generation();
        {
            let guard = registry.lock("vm1").await.unwrap();
            registry
                .insert(&guard, Instance::from_record(&record("vm1", InstanceState::Running)))
                .unwrap();
        }
        let newer = registry.generation();
        registry.reconcile(vec![record("vm1", InstanceState::Paused)], newer).unwrap();

        let diff = registry.reconcile(vec![record("vm1", InstanceState::Stopped)], older).unwrap();
        assert_eq!(diff.skipped, vec!["vm1".to_string()]);
        assert_eq!(registry.get("vm1").unwrap().state, InstanceState::Paused);
    }

    #[tokio::test]
    async fn test_per_name_locks_are_independent() {
        let registry = Arc::new(InstanceRegistry::new());
        let _vm1 = registry.lock("vm1").await.unwrap();

        // A different name is not blocked
        let vm2 = tokio::time::timeout(Duration::from_millis(100), registry.lock("vm2")).await;
        assert!(vm2.is_ok());

        // The same name is
        assert!(registry.try_lock("vm1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_table_pruned_after_release() {
        let registry = InstanceRegistry::new();
        {
            let _guard = registry.lock("vm1").await.unwrap();
            assert_eq!(registry.locks.lock().unwrap().len(), 1);
        }
        assert!(registry.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guarded_mutations() {
        let registry = InstanceRegistry::new();
        let guard = registry.lock("vm1").await.unwrap();

        let mut observed = record("vm1", InstanceState::Running);
        observed.pid = Some(99);
        let instance = registry.record_inspection(&guard, &observed).unwrap();
        assert_eq!(instance.pid, Some(99));

        registry.mark_unknown(&guard).unwrap();
        let instance = registry.get("vm1").unwrap();
        assert_eq!(instance.state, InstanceState::Unknown);
        assert_eq!(instance.pid, None);

        assert!(registry.evict(&guard).unwrap().is_some());
        assert!(!registry.contains("vm1").unwrap());

        let other = Instance::from_record(&record("vm2", InstanceState::Running));
        assert!(registry.insert(&guard, other).is_err());
    }

    #[tokio::test]
    async fn test_stamps_pruned_once_listing_catches_up() {
        let registry = InstanceRegistry::new();
        {
            let guard = registry.lock("vm1").await.unwrap();
            registry
                .insert(&guard, Instance::from_record(&record("vm1", InstanceState::Stopped)))
                .unwrap();
            registry.evict(&guard).unwrap();
        }
        assert_eq!(registry.entries.read().unwrap().stamps.len(), 1);

        reconcile(&registry, vec![]);
        assert!(registry.entries.read().unwrap().stamps.is_empty());
    }
}
