use crate::proto::RpcClient;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct Registry {
    /// Device name -> client. The round-robin pool.
    devices: HashMap<String, Arc<RpcClient>>,
    /// Full type (`IOX`) and stripped name (`X`) -> device name. First
    /// registrant wins a contested alias.
    aliases: HashMap<String, String>,
}

/// I/O device registry and request router. Exact lookups first; unknown
/// device names fall back to a round-robin over every registered device in
/// alphabetical order.
pub struct IoRouter {
    inner: RwLock<Registry>,
    counter: spin::Mutex<u64>,
}

impl IoRouter {
    pub fn new() -> Self {
        IoRouter {
            inner: RwLock::new(Registry {
                devices: HashMap::new(),
                aliases: HashMap::new(),
            }),
            counter: spin::Mutex::new(0),
        }
    }

    /// Register a device under its name, its full type and the stripped
    /// type name.
    pub fn register(&self, name: &str, full_type: &str, client: RpcClient) {
        let mut inner = self.inner.write().unwrap();
        inner.devices.insert(name.to_string(), Arc::new(client));

        for alias in [full_type, full_type.trim_start_matches("IO")] {
            if alias.is_empty() || alias == name {
                continue;
            }
            inner
                .aliases
                .entry(alias.to_string())
                .or_insert_with(|| name.to_string());
        }
        log::info!("io device '{}' registered (type {})", name, full_type);
    }

    /// All registered devices, alphabetically. The fallback pool is the
    /// whole registry, not one type family.
    pub fn similar_devices(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner.devices.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Pick the device serving `requested`: exact name, then alias, then
    /// round-robin over the whole pool. `None` when nothing is registered.
    pub fn select(&self, requested: &str) -> Option<String> {
        let inner = self.inner.read().unwrap();
        if inner.devices.contains_key(requested) {
            return Some(requested.to_string());
        }
        if let Some(name) = inner.aliases.get(requested) {
            return Some(name.clone());
        }
        drop(inner);

        let pool = self.similar_devices();
        if pool.is_empty() {
            log::error!("no io devices registered for request '{}'", requested);
            return None;
        }
        let mut counter = self.counter.lock();
        let chosen = pool[(*counter as usize) % pool.len()].clone();
        *counter += 1;
        log::info!("io balancer: '{}' routed to '{}'", requested, chosen);
        Some(chosen)
    }

    pub fn client_of(&self, name: &str) -> Option<Arc<RpcClient>> {
        let inner = self.inner.read().unwrap();
        if let Some(client) = inner.devices.get(name) {
            return Some(Arc::clone(client));
        }
        let device = inner.aliases.get(name)?;
        inner.devices.get(device).map(Arc::clone)
    }
}

impl Default for IoRouter {
    fn default() -> Self {
        Self::new()
    }
}
