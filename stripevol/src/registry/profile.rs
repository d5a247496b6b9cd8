use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, VolumeError};

/// What a client needs to find a volume by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub name: String,
    pub volume: String,
    pub metadata: Option<String>,
}

#[derive(Debug, Default)]
pub struct ProfileTable {
    profiles: RwLock<HashMap<String, Profile>>,
}

impl ProfileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, profile: Profile) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if profiles.contains_key(&profile.name) {
            return Err(VolumeError::invalid(format!(
                "profile {} already exists",
                profile.name
            )));
        }
        debug!(profile = %profile.name, volume = %profile.volume, "add profile");
        profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Profile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn del(&self, name: &str) -> Option<Profile> {
        self.profiles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lifecycle() {
        let table = ProfileTable::new();
        let p = Profile {
            name: "client".into(),
            volume: "vol0".into(),
            metadata: None,
        };
        table.add(p.clone()).unwrap();
        assert!(table.add(p.clone()).is_err());
        assert_eq!(table.get("client"), Some(p));
        assert_eq!(table.names(), vec!["client".to_string()]);
        assert!(table.del("client").is_some());
        assert!(table.get("client").is_none());
    }
}
