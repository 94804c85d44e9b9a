//! Scene membership
//!
//! Tracks which sessions are in which scene so scene changes can notify the
//! peers that need to create or destroy the moving player's entity.

use std::collections::HashMap;
use std::net::SocketAddr;

#[derive(Debug, Default)]
pub struct SceneDirectory {
    scenes: HashMap<String, Vec<SocketAddr>>,
}

impl SceneDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addr` to `scene`; a repeated join keeps a single entry
    pub fn join(&mut self, scene: &str, addr: SocketAddr) {
        let members = self.scenes.entry(scene.to_lowercase()).or_default();
        if !members.contains(&addr) {
            members.push(addr);
        }
    }

    /// Removes `addr` from `scene` and returns who is left there
    pub fn leave(&mut self, scene: &str, addr: SocketAddr) -> Vec<SocketAddr> {
        let key = scene.to_lowercase();
        let remaining = match self.scenes.get_mut(&key) {
            Some(members) => {
                members.retain(|m| *m != addr);
                members.clone()
            }
            None => Vec::new(),
        };

        if remaining.is_empty() {
            self.scenes.remove(&key);
        }
        remaining
    }

    pub fn members(&self, scene: &str) -> &[SocketAddr] {
        self.scenes
            .get(&scene.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    pub fn clear(&mut self) {
        self.scenes.clear();
    }
}
