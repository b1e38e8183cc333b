use std::sync::{Arc, Mutex, OnceLock};

use ahash::AHashMap;

use crate::master::{MasterModel, MasterModelConfig};
use crate::{Error, Result};

// The only process-wide state: an explicit handle table for embedding
// hosts that cannot hold a MasterModel directly. Entries are refcounted,
// so a lookup never blocks another handle's disposal.
struct Registry {
    next_id: u64,
    masters: AHashMap<u64, Arc<MasterModel>>,
}

fn registry() -> &'static Mutex<Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            next_id: 1,
            masters: AHashMap::new(),
        })
    })
}

/// Creates a master and registers it under a fresh handle.
pub fn create(config: MasterModelConfig) -> Result<u64> {
    let master = Arc::new(MasterModel::new(config)?);
    let mut registry = registry().lock().unwrap();

    let id = registry.next_id;
    registry.next_id += 1;
    registry.masters.insert(id, master);

    Ok(id)
}

/// Registers an existing master (e.g. a duplicate) under a fresh handle.
pub fn register(master: Arc<MasterModel>) -> u64 {
    let mut registry = registry().lock().unwrap();

    let id = registry.next_id;
    registry.next_id += 1;
    registry.masters.insert(id, master);

    id
}

pub fn get(id: u64) -> Result<Arc<MasterModel>> {
    registry()
        .lock()
        .unwrap()
        .masters
        .get(&id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("master {}", id)))
}

pub fn dispose(id: u64) -> Result<()> {
    registry()
        .lock()
        .unwrap()
        .masters
        .remove(&id)
        .map(|_| ())
        .ok_or_else(|| Error::NotFound(format!("master {}", id)))
}

pub fn len() -> usize {
    registry().lock().unwrap().masters.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_round_trip() {
        let config = MasterModelConfig::with_topics(&["t1"]);
        let id = create(config).unwrap();

        let master = get(id).unwrap();
        assert_eq!(master.config().topic_names, vec!["t1"]);

        // A held reference survives disposal of the handle.
        dispose(id).unwrap();
        assert!(get(id).is_err());
        assert!(dispose(id).is_err());
        assert_eq!(master.config().topic_names, vec!["t1"]);
    }
}
