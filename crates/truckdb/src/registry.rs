//! Multi-truck front-end: opens trucks on demand, keeps at most
//! `max_active_trucks` workers alive at once (evicting the least recently
//! used), layers a global value cache and change-notification bus on top
//! of the per-truck workers.

use std::collections::{HashMap, VecDeque};

use tokio::fs;
use tokio::sync::{broadcast, Mutex};

use crate::change_bus::{ChangeBus, ChangeEvent};
use crate::config::RegistryConfig;
use crate::error::Result;
use crate::lru::Lru;
use crate::truck::Truck;
use crate::value::Value;
use crate::worker::TruckWorkerHandle;

type GlobalKey = (String, String, String);

struct RegistryState {
    active: HashMap<String, TruckWorkerHandle>,
    recency: VecDeque<String>,
}

impl RegistryState {
    fn touch(&mut self, truck_id: &str) {
        self.recency.retain(|id| id != truck_id);
        self.recency.push_back(truck_id.to_string());
    }

    /// Evicts the least recently used active truck, if any, returning its
    /// handle so the caller can shut it down outside the state lock.
    fn evict_oldest(&mut self) -> Option<TruckWorkerHandle> {
        while let Some(candidate) = self.recency.pop_front() {
            if let Some(handle) = self.active.remove(&candidate) {
                return Some(handle);
            }
        }
        None
    }
}

pub struct Registry {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    global_cache: Mutex<Lru<GlobalKey, Value>>,
    change_bus: ChangeBus,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        let global_cache = Mutex::new(Lru::new(config.global_lru_capacity));
        let change_bus = ChangeBus::new(config.change_bus_buffer);
        Self {
            state: Mutex::new(RegistryState {
                active: HashMap::new(),
                recency: VecDeque::new(),
            }),
            global_cache,
            change_bus,
            config,
        }
    }

    async fn get_or_open(&self, truck_id: &str) -> Result<TruckWorkerHandle> {
        {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.active.get(truck_id).cloned() {
                state.touch(truck_id);
                return Ok(handle);
            }
        }

        let truck = Truck::open(&self.config.root_path, truck_id, self.config.truck.clone()).await?;
        let handle = TruckWorkerHandle::spawn(truck, self.config.request_timeout);

        let evicted = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.active.get(truck_id).cloned() {
                state.touch(truck_id);
                drop(state);
                let _ = handle.shutdown().await;
                return Ok(existing);
            }
            state.active.insert(truck_id.to_string(), handle.clone());
            state.touch(truck_id);
            if state.active.len() > self.config.max_active_trucks {
                state.evict_oldest()
            } else {
                None
            }
        };

        if let Some(evicted_handle) = evicted {
            tracing::debug!(truck_id = evicted_handle.id(), "evicting least recently used truck");
            let _ = evicted_handle.shutdown().await;
        }

        Ok(handle)
    }

    pub async fn put(&self, truck_id: &str, box_id: &str, tag: &str, value: Value, sync: bool) -> Result<()> {
        let key: GlobalKey = (truck_id.to_string(), box_id.to_string(), tag.to_string());
        let existed = self.global_cache.lock().await.contains(&key);
        let handle = self.get_or_open(truck_id).await?;
        let existed = existed || handle.contains(box_id, tag).await?;

        handle.write(box_id, tag, value.clone(), sync).await?;
        self.global_cache.lock().await.put(key, value.clone());

        let event = if existed {
            ChangeEvent::Update {
                truck_id: truck_id.to_string(),
                box_id: box_id.to_string(),
                tag: tag.to_string(),
                value,
            }
        } else {
            ChangeEvent::Put {
                truck_id: truck_id.to_string(),
                box_id: box_id.to_string(),
                tag: tag.to_string(),
                value,
            }
        };
        self.change_bus.publish(event);
        Ok(())
    }

    pub async fn put_cas(
        &self,
        truck_id: &str,
        box_id: &str,
        tag: &str,
        value: Value,
        field: &str,
        expected: Value,
        sync: bool,
    ) -> Result<bool> {
        let handle = self.get_or_open(truck_id).await?;
        let ok = handle.put_cas(box_id, tag, value.clone(), field, expected, sync).await?;
        if ok {
            let key: GlobalKey = (truck_id.to_string(), box_id.to_string(), tag.to_string());
            self.global_cache.lock().await.put(key, value.clone());
            self.change_bus.publish(ChangeEvent::CasUpdate {
                truck_id: truck_id.to_string(),
                box_id: box_id.to_string(),
                tag: tag.to_string(),
                value,
            });
        }
        Ok(ok)
    }

    pub async fn batch(&self, truck_id: &str, box_id: &str, entries: Vec<(String, Value)>) -> Result<()> {
        let handle = self.get_or_open(truck_id).await?;
        let tags: Vec<String> = entries.iter().map(|(tag, _)| tag.clone()).collect();
        {
            let mut cache = self.global_cache.lock().await;
            for (tag, value) in &entries {
                cache.put((truck_id.to_string(), box_id.to_string(), tag.clone()), value.clone());
            }
        }
        handle.batch(box_id, entries).await?;
        self.change_bus.publish(ChangeEvent::Batch {
            truck_id: truck_id.to_string(),
            box_id: box_id.to_string(),
            entries: tags,
        });
        Ok(())
    }

    pub async fn read(&self, truck_id: &str, box_id: &str, tag: &str) -> Result<Option<Value>> {
        let key: GlobalKey = (truck_id.to_string(), box_id.to_string(), tag.to_string());
        if let Some(value) = self.global_cache.lock().await.get(&key) {
            return Ok(Some(value));
        }
        let handle = self.get_or_open(truck_id).await?;
        let value = handle.read(box_id, tag).await?;
        if let Some(value) = &value {
            self.global_cache.lock().await.put(key, value.clone());
        }
        Ok(value)
    }

    pub async fn read_box(&self, truck_id: &str, box_id: &str) -> Result<Vec<(String, Value)>> {
        let handle = self.get_or_open(truck_id).await?;
        handle.read_box(box_id).await
    }

    pub async fn query(&self, truck_id: &str, box_id: &str, field: &str, prefix: &str) -> Result<Vec<Value>> {
        let handle = self.get_or_open(truck_id).await?;
        handle.query(box_id, field, prefix).await
    }

    pub async fn remove_tag(&self, truck_id: &str, box_id: &str, tag: &str, sync: bool) -> Result<()> {
        let handle = self.get_or_open(truck_id).await?;
        handle.remove_tag(box_id, tag, sync).await?;
        let key: GlobalKey = (truck_id.to_string(), box_id.to_string(), tag.to_string());
        self.global_cache.lock().await.remove(&key);
        self.change_bus.publish(ChangeEvent::Delete {
            truck_id: truck_id.to_string(),
            box_id: box_id.to_string(),
            tag: tag.to_string(),
        });
        Ok(())
    }

    /// Removes every tag in `box_id`. The global cache has no cheap way to
    /// invalidate just the entries for one box, so a box deletion clears it
    /// entirely rather than risk serving a stale value.
    pub async fn remove_box(&self, truck_id: &str, box_id: &str, sync: bool) -> Result<()> {
        let handle = self.get_or_open(truck_id).await?;
        handle.remove_box(box_id, sync).await?;
        self.global_cache.lock().await.clear();
        self.change_bus.publish(ChangeEvent::DeleteBox {
            truck_id: truck_id.to_string(),
            box_id: box_id.to_string(),
        });
        Ok(())
    }

    pub async fn get_all_boxes(&self, truck_id: &str) -> Result<Vec<String>> {
        let handle = self.get_or_open(truck_id).await?;
        handle.get_all_boxes().await
    }

    pub async fn compact(&self, truck_id: &str) -> Result<()> {
        let handle = self.get_or_open(truck_id).await?;
        handle.compact().await
    }

    /// Closes every active truck worker. Does not delete their files.
    pub async fn close_all(&self) -> Result<()> {
        let handles: Vec<TruckWorkerHandle> = {
            let mut state = self.state.lock().await;
            let handles = state.active.values().cloned().collect();
            state.active.clear();
            state.recency.clear();
            handles
        };
        for handle in handles {
            handle.shutdown().await?;
        }
        Ok(())
    }

    /// Closes `truck_id`'s worker (if running) and removes its `.dat`/`.idx`
    /// files from disk. The global cache is cleared rather than selectively
    /// invalidated, for the same reason `remove_box` clears it.
    pub async fn delete_truck(&self, truck_id: &str) -> Result<()> {
        let handle = {
            let mut state = self.state.lock().await;
            state.recency.retain(|id| id != truck_id);
            state.active.remove(truck_id)
        };
        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        self.global_cache.lock().await.clear();
        remove_if_exists(&self.config.root_path.join(format!("{truck_id}.dat"))).await?;
        remove_if_exists(&self.config.root_path.join(format!("{truck_id}.idx"))).await?;
        Ok(())
    }

    /// Closes every active worker, clears every cache, and resets the root
    /// directory to empty.
    pub async fn delete_all(&self) -> Result<()> {
        self.close_all().await?;
        self.global_cache.lock().await.clear();
        if fs::metadata(&self.config.root_path).await.is_ok() {
            fs::remove_dir_all(&self.config.root_path).await?;
        }
        fs::create_dir_all(&self.config.root_path).await?;
        Ok(())
    }

    /// Subscribes to changes to one tag. The first call to [`TagWatcher::next`]
    /// yields the tag's current value; every later call blocks until a
    /// matching change event fires, then re-reads and yields the fresh value.
    pub fn watch(&self, truck_id: impl Into<String>, box_id: impl Into<String>, tag: impl Into<String>) -> TagWatcher<'_> {
        TagWatcher {
            registry: self,
            truck_id: truck_id.into(),
            box_id: box_id.into(),
            tag: tag.into(),
            rx: self.change_bus.subscribe(),
            started: false,
        }
    }

    /// Subscribes to changes to one box. The first call to [`BoxWatcher::next`]
    /// yields the box's current snapshot; every later call blocks until a
    /// matching change event fires, then re-reads and yields a fresh snapshot.
    pub fn watch_box(&self, truck_id: impl Into<String>, box_id: impl Into<String>) -> BoxWatcher<'_> {
        BoxWatcher {
            registry: self,
            truck_id: truck_id.into(),
            box_id: box_id.into(),
            rx: self.change_bus.subscribe(),
            started: false,
        }
    }
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// A live view over one tag's value, backed by the registry's change bus.
/// Lagged bus deliveries are skipped, since a watcher only cares about
/// eventually re-reading current state, not replaying a complete history.
pub struct TagWatcher<'a> {
    registry: &'a Registry,
    truck_id: String,
    box_id: String,
    tag: String,
    rx: broadcast::Receiver<ChangeEvent>,
    started: bool,
}

impl TagWatcher<'_> {
    /// Yields the current value on the first call, then the freshly
    /// re-read value on every call after a matching change event. Returns
    /// `None` once the change bus closes.
    pub async fn next(&mut self) -> Option<Result<Option<Value>>> {
        if !self.started {
            self.started = true;
            return Some(self.registry.read(&self.truck_id, &self.box_id, &self.tag).await);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.truck_id() != self.truck_id || event.box_id() != self.box_id {
                        continue;
                    }
                    if !event.affects_tag(&self.tag) {
                        continue;
                    }
                    return Some(self.registry.read(&self.truck_id, &self.box_id, &self.tag).await);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A live view over one box's full contents, backed by the registry's
/// change bus.
pub struct BoxWatcher<'a> {
    registry: &'a Registry,
    truck_id: String,
    box_id: String,
    rx: broadcast::Receiver<ChangeEvent>,
    started: bool,
}

impl BoxWatcher<'_> {
    /// Yields the current box snapshot on the first call, then a fresh
    /// snapshot on every call after a matching change event. Returns `None`
    /// once the change bus closes.
    pub async fn next(&mut self) -> Option<Result<Vec<(String, Value)>>> {
        if !self.started {
            self.started = true;
            return Some(self.registry.read_box(&self.truck_id, &self.box_id).await);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.truck_id() != self.truck_id || event.box_id() != self.box_id {
                        continue;
                    }
                    return Some(self.registry.read_box(&self.truck_id, &self.box_id).await);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> RegistryConfig {
        RegistryConfig::new(dir)
    }

    #[tokio::test]
    async fn put_then_read_across_registry() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(config(dir.path()));
        registry.put("t1", "users", "u1", Value::Int(1), true).await.unwrap();
        assert_eq!(registry.read("t1", "users", "u1").await.unwrap(), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn tag_watcher_yields_current_value_then_fresh_values_on_change() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(config(dir.path()));
        let mut watcher = registry.watch("t1", "users", "u1");

        // Nothing written yet: the initial yield is the current (absent) value.
        assert_eq!(watcher.next().await.unwrap().unwrap(), None);

        registry.put("t1", "users", "u1", Value::Int(1), true).await.unwrap();
        assert_eq!(watcher.next().await.unwrap().unwrap(), Some(Value::Int(1)));

        registry.put("t1", "users", "u1", Value::Int(2), true).await.unwrap();
        assert_eq!(watcher.next().await.unwrap().unwrap(), Some(Value::Int(2)));
    }

    #[tokio::test]
    async fn evicted_truck_reopens_transparently() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_active_trucks = 1;
        let registry = Registry::new(cfg);

        registry.put("t1", "b", "x", Value::Int(1), true).await.unwrap();
        registry.put("t2", "b", "x", Value::Int(2), true).await.unwrap();

        assert_eq!(registry.read("t1", "b", "x").await.unwrap(), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn watch_box_filters_other_boxes_and_trucks() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(config(dir.path()));
        let mut watcher = registry.watch_box("t1", "orders");

        // Initial snapshot: nothing in t1/orders yet.
        assert_eq!(watcher.next().await.unwrap().unwrap(), Vec::new());

        registry.put("t1", "users", "u1", Value::Int(1), true).await.unwrap();
        registry.put("t2", "orders", "o1", Value::Int(2), true).await.unwrap();
        registry.put("t1", "orders", "o1", Value::Int(3), true).await.unwrap();

        let snapshot = watcher.next().await.unwrap().unwrap();
        assert_eq!(snapshot, vec![("o1".to_string(), Value::Int(3))]);
    }

    #[tokio::test]
    async fn delete_truck_removes_worker_and_files() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(config(dir.path()));
        registry.put("t1", "b", "x", Value::Int(1), true).await.unwrap();

        registry.delete_truck("t1").await.unwrap();

        assert!(!dir.path().join("t1.dat").exists());
        assert!(!dir.path().join("t1.idx").exists());
        assert_eq!(registry.read("t1", "b", "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_all_resets_root_and_caches() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(config(dir.path()));
        registry.put("t1", "b", "x", Value::Int(1), true).await.unwrap();
        registry.put("t2", "b", "x", Value::Int(2), true).await.unwrap();

        registry.delete_all().await.unwrap();

        assert!(!dir.path().join("t1.dat").exists());
        assert!(!dir.path().join("t2.dat").exists());
        assert_eq!(registry.read("t1", "b", "x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_box_invalidates_global_cache() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(config(dir.path()));
        registry.put("t1", "b", "x", Value::Int(1), true).await.unwrap();
        registry.read("t1", "b", "x").await.unwrap();
        registry.remove_box("t1", "b", true).await.unwrap();
        assert_eq!(registry.read("t1", "b", "x").await.unwrap(), None);
    }
}
