//! Client-side remote address book: `<user_config_dir>/remotes.toml`.
//!
//! Edited in place with `toml_edit` so operator comments and formatting
//! survive `remote add` / `remote remove`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use toml_edit::{ArrayOfTables, DocumentMut, Item, Table, value};

/// One saved remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub url: String,
    pub token: String,
}

/// Handle on the remotes file.
#[derive(Debug, Clone)]
pub struct RemotesFile {
    path: PathBuf,
}

impl RemotesFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_config_dir(config_dir: &Path) -> Self {
        Self::new(config_dir.join("remotes.toml"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All saved remotes; a missing file reads as empty.
    pub fn list(&self) -> Result<Vec<RemoteEntry>> {
        let doc = self.load()?;
        let Some(tables) = doc.get("remote").and_then(Item::as_array_of_tables) else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for table in tables.iter() {
            let field = |key: &str| -> Result<String> {
                table
                    .get(key)
                    .and_then(Item::as_str)
                    .map(String::from)
                    .with_context(|| {
                        format!("remotes.toml: [[remote]] entry missing '{key}'")
                    })
            };
            entries.push(RemoteEntry {
                name: field("name")?,
                url: field("url")?,
                token: field("token")?,
            });
        }
        Ok(entries)
    }

    pub fn find(&self, name: &str) -> Result<Option<RemoteEntry>> {
        Ok(self.list()?.into_iter().find(|r| r.name == name))
    }

    /// Add a remote; names are unique.
    pub fn add(&self, entry: &RemoteEntry) -> Result<()> {
        if self.find(&entry.name)?.is_some() {
            bail!("remote '{}' already exists", entry.name);
        }

        let mut doc = self.load()?;
        if doc.get("remote").is_none() {
            doc.insert("remote", Item::ArrayOfTables(ArrayOfTables::new()));
        }

        let mut table = Table::new();
        table.insert("name", value(&entry.name));
        table.insert("url", value(&entry.url));
        table.insert("token", value(&entry.token));

        doc.get_mut("remote")
            .and_then(Item::as_array_of_tables_mut)
            .context("remotes.toml: 'remote' is not an array of tables")?
            .push(table);

        self.save(&doc)
    }

    /// Remove a remote by name; returns whether it existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut doc = self.load()?;
        let Some(tables) = doc.get_mut("remote").and_then(Item::as_array_of_tables_mut)
        else {
            return Ok(false);
        };

        let before = tables.len();
        tables.retain(|table| table.get("name").and_then(Item::as_str) != Some(name));
        let removed = tables.len() < before;

        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<DocumentMut> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents
                .parse::<DocumentMut>()
                .with_context(|| format!("failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DocumentMut::new()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }

    fn save(&self, doc: &DocumentMut) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, doc.to_string())
            .with_context(|| format!("failed to write {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
