use crate::types::UserOperationControllerState;
use anyhow::{anyhow, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Where the controller persists its state after every mutation.
pub trait StateStore: Send + Sync {
    fn save(&self, state: &UserOperationControllerState) -> Result<()>;
}

/// Keeps nothing. Used when the host persists state some other way.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl StateStore for NoopStore {
    fn save(&self, _state: &UserOperationControllerState) -> Result<()> {
        Ok(())
    }
}

/// `{ "userOperations": { ... } }` as a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state file, or an empty state when it does not exist yet.
    pub fn load(&self) -> Result<UserOperationControllerState> {
        let path = self.path.as_path();
        if !path.exists() {
            return Ok(UserOperationControllerState::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read state file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse state file {}", path.display()))
    }
}

impl StateStore for JsonFileStore {
    fn save(&self, state: &UserOperationControllerState) -> Result<()> {
        let path = self.path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(state)
            .context("failed to serialize user operation state")?;

        // Write to a temp file then rename so an interrupted write never
        // leaves a truncated state file behind.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write temp state file {}", tmp_path.display()))?;

        // rename replaces the destination on Unix but not on Windows.
        if let Err(err) = fs::rename(&tmp_path, path) {
            if cfg!(windows) {
                let _ = fs::remove_file(path);
                fs::rename(&tmp_path, path)
                    .with_context(|| format!("failed to replace state file {}", path.display()))?;
            } else {
                return Err(anyhow!(
                    "failed to replace state file {}: {err}",
                    path.display()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UserOperation, UserOperationMetadata, UserOperationStatus};

    fn state_with(id: &str) -> UserOperationControllerState {
        let mut state = UserOperationControllerState::default();
        state.user_operations.insert(
            id.to_string(),
            UserOperationMetadata {
                id: id.to_string(),
                status: UserOperationStatus::Submitted,
                chain_id: 84_532,
                origin: "internal".into(),
                time: 1_700_000_000_000,
                transaction_params: None,
                transaction_type: None,
                user_operation: UserOperation::default(),
                hash: Some(ethers::types::H256::repeat_byte(0x42)),
                transaction_hash: None,
                error: None,
                bundler_url: Some("https://bundler.example.com".into()),
                swaps_metadata: None,
                user_fee_level: None,
                actual_gas_cost: None,
                actual_gas_used: None,
                base_fee_per_gas: None,
            },
        );
        state
    }

    #[test]
    fn missing_file_loads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().user_operations.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("state.json"));

        store.save(&state_with("op-1")).unwrap();
        store.save(&state_with("op-2")).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, state_with("op-2"));
        assert!(!store.path().with_extension("json.tmp").exists());

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["userOperations"]["op-2"]["chainId"], "0x14a34");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStore::new(path).load().is_err());
    }
}
