//! Read-only command/user catalog.
//!
//! The engines never hold on to catalog entries: every operation asks the
//! catalog for its current [`CatalogSnapshot`], so a reload is picked up by
//! the next request while requests already in flight keep the snapshot they
//! started with.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Result, WheelhouseError};
use crate::storage::{hash_command, Command, User};

/// Source of commands and users.
pub trait Catalog: Send + Sync + std::fmt::Debug {
    /// Current snapshot. Fails with [`WheelhouseError::ConfigUnavailable`]
    /// when nothing has been loaded.
    fn snapshot(&self) -> Result<Arc<CatalogSnapshot>>;

    /// Swap in a fresh snapshot. On failure the previous one stays in effect.
    fn reload(&self) -> Result<()>;

    fn list_commands(&self) -> Result<Vec<Command>> {
        Ok(self.snapshot()?.commands().to_vec())
    }

    fn get_command_by_id(&self, id: &str) -> Result<Option<Command>> {
        Ok(self.snapshot()?.command(id).cloned())
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self.snapshot()?.user(username).cloned())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CatalogSnapshot {
    commands: Vec<Command>,
    by_id: HashMap<String, usize>,
    users: HashMap<String, User>,
}

impl CatalogSnapshot {
    /// Build a snapshot, assigning content-derived ids. A command whose text
    /// duplicates an earlier one is dropped.
    pub fn new(commands: Vec<Command>, users: Vec<User>) -> Self {
        let mut kept = Vec::with_capacity(commands.len());
        let mut by_id = HashMap::with_capacity(commands.len());

        for mut command in commands {
            command.id = hash_command(&command.command);
            if by_id.contains_key(&command.id) {
                warn!(
                    command_id = %command.id,
                    command_name = %command.name,
                    "Duplicate command text in catalog, keeping the first entry"
                );
                continue;
            }
            by_id.insert(command.id.clone(), kept.len());
            kept.push(command);
        }

        let users = users
            .into_iter()
            .map(|user| (user.username.clone(), user))
            .collect();

        Self {
            commands: kept,
            by_id,
            users,
        }
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn command(&self, id: &str) -> Option<&Command> {
        self.by_id.get(id).map(|&idx| &self.commands[idx])
    }

    pub fn user(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    commands: Vec<Command>,
    #[serde(default)]
    users: Vec<User>,
}

/// Catalog backed by a JSON file, re-read on [`Catalog::reload`].
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl JsonCatalog {
    /// Load the catalog; startup fails if the file cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot = Self::load_file(&path)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(snapshot)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_file(path: &Path) -> Result<CatalogSnapshot> {
        let content = fs::read_to_string(path).map_err(|source| WheelhouseError::CatalogRead {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CatalogFile =
            serde_json::from_str(&content).map_err(|source| WheelhouseError::CatalogParse {
                path: path.to_path_buf(),
                source,
            })?;

        if file.commands.is_empty() {
            warn!(path = %path.display(), "No commands found in catalog");
        }

        let snapshot = CatalogSnapshot::new(file.commands, file.users);
        debug!(
            path = %path.display(),
            commands = snapshot.commands().len(),
            users = snapshot.user_count(),
            "Catalog parsed"
        );
        Ok(snapshot)
    }
}

impl Catalog for JsonCatalog {
    fn snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        Ok(self.current.read().clone())
    }

    fn reload(&self) -> Result<()> {
        let snapshot = match Self::load_file(&self.path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Catalog reload failed, keeping previous snapshot"
                );
                return Err(err);
            }
        };
        *self.current.write() = Arc::new(snapshot);
        info!(path = %self.path.display(), "Catalog reloaded");
        Ok(())
    }
}

/// In-memory catalog, replaced wholesale by its owner.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
}

impl MemoryCatalog {
    pub fn new(snapshot: CatalogSnapshot) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(snapshot))),
        }
    }

    /// A catalog with nothing loaded; every read fails.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn replace(&self, snapshot: CatalogSnapshot) {
        *self.current.write() = Some(Arc::new(snapshot));
    }
}

impl Catalog for MemoryCatalog {
    fn snapshot(&self) -> Result<Arc<CatalogSnapshot>> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| WheelhouseError::ConfigUnavailable("catalog not loaded".to_string()))
    }

    fn reload(&self) -> Result<()> {
        self.snapshot().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CATALOG: &str = r#"{
        "commands": [
            {"name": "List", "command": "ls -la"},
            {"name": "Secret", "command": "echo $SECRET", "role": "admin"},
            {"name": "List again", "command": "ls -la"}
        ],
        "users": [
            {"username": "alice", "password_hash": "x", "roles": ["admin"]},
            {"username": "bob", "password_hash": "y"}
        ]
    }"#;

    fn write_catalog(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn open_assigns_hash_ids_and_drops_duplicates() {
        let file = write_catalog(CATALOG);
        let catalog = JsonCatalog::open(file.path()).unwrap();

        let commands = catalog.list_commands().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].id, hash_command("ls -la"));
        assert_eq!(commands[1].role.as_deref(), Some("admin"));

        let found = catalog
            .get_command_by_id(&hash_command("echo $SECRET"))
            .unwrap();
        assert_eq!(found.map(|c| c.name), Some("Secret".to_string()));
        assert!(catalog.get_command_by_id("nope").unwrap().is_none());

        let bob = catalog.get_user_by_username("bob").unwrap().unwrap();
        assert!(bob.roles.is_empty());
        assert!(catalog.get_user_by_username("carol").unwrap().is_none());
    }

    #[test]
    fn missing_arrays_mean_empty_catalog() {
        let file = write_catalog("{}");
        let catalog = JsonCatalog::open(file.path()).unwrap();
        assert!(catalog.list_commands().unwrap().is_empty());
    }

    #[test]
    fn open_fails_on_unreadable_or_invalid_file() {
        let err = JsonCatalog::open("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, WheelhouseError::CatalogRead { .. }));

        let file = write_catalog("{ not json");
        let err = JsonCatalog::open(file.path()).unwrap_err();
        assert!(matches!(err, WheelhouseError::CatalogParse { .. }));
    }

    #[test]
    fn reload_swaps_snapshot_and_keeps_old_one_on_failure() {
        let file = write_catalog(CATALOG);
        let catalog = JsonCatalog::open(file.path()).unwrap();
        let before = catalog.snapshot().unwrap();

        let updated = r#"{"commands": [{"name": "Up", "command": "uptime"}]}"#;
        fs::write(file.path(), updated).unwrap();
        catalog.reload().unwrap();
        let names: Vec<_> = catalog
            .list_commands()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Up"]);
        // A reader holding the old snapshot still sees the old view.
        assert_eq!(before.commands().len(), 2);

        fs::write(file.path(), "garbage").unwrap();
        assert!(catalog.reload().is_err());
        assert_eq!(catalog.list_commands().unwrap().len(), 1);
    }

    #[test]
    fn unavailable_memory_catalog_reports_config_unavailable() {
        let catalog = MemoryCatalog::unavailable();
        assert!(matches!(
            catalog.list_commands(),
            Err(WheelhouseError::ConfigUnavailable(_))
        ));
        catalog.replace(CatalogSnapshot::new(vec![Command::new("Up", "uptime", None)], vec![]));
        assert_eq!(catalog.list_commands().unwrap().len(), 1);
    }
}
