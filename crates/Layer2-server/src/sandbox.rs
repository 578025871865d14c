//! Filesystem sandbox - the instance's home directory as seen by remote callers
//!
//! Every caller-supplied path goes through `extend_path`, which resolves it
//! lexically under the sandbox root and falls back to the root itself for
//! anything that would land outside. Operations then apply the file policy
//! (`check_blocked`, `check_edible`) and a canonical-path check so symlinks
//! inside the sandbox cannot point out of it.
//!
//! Errors carry the path the caller asked for, never the resolved host path.

use crate::account::Owner;
use crate::state::InstanceState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ssm_foundation::{ActionCode, Error, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Marker file written at the sandbox root on create/reinstall
pub const IDENTITY_FILE: &str = "identity.json";

/// Extensions that may be read and written through the file API
const EDIBLE_EXTENSIONS: &[&str] = &["txt", "properties", "nbt", "yaml", "json", "yml", "log"];

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub size: u64,
    pub symlink: bool,
    pub is_dir: bool,
    pub is_file: bool,
    /// Regular file, within the edit size cap, with an editable extension
    pub edible: bool,
}

pub struct Sandbox {
    root: PathBuf,
    state: Arc<InstanceState>,
    max_edit_bytes: u64,
    manage_ownership: bool,
}

impl Sandbox {
    pub fn new(
        root: impl Into<PathBuf>,
        state: Arc<InstanceState>,
        max_edit_bytes: u64,
        manage_ownership: bool,
    ) -> Self {
        Self {
            root: root.into(),
            state,
            max_edit_bytes,
            manage_ownership,
        }
    }

    /// `<home_root>/<id>/public`
    pub fn root_for(home_root: &Path, id: &str) -> PathBuf {
        home_root.join(id).join("public")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ========================================================================
    // Policy
    // ========================================================================

    /// Resolve a caller path under the root; anything else resolves to the root
    pub fn extend_path(&self, relative: &str) -> PathBuf {
        let decoded = match urlencoding::decode(relative) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => return self.root.clone(),
        };
        if decoded.contains('\0') {
            return self.root.clone();
        }

        let mut resolved = self.root.clone();
        for component in Path::new(&decoded).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }

        if resolved.starts_with(&self.root) {
            resolved
        } else {
            self.root.clone()
        }
    }

    /// Whether the file type may be read or written through the file API
    pub fn check_edible(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| EDIBLE_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
    }

    /// Whether the path is the identity marker or the live log file, by name
    /// or through a symlink
    pub fn check_blocked(&self, path: &Path) -> bool {
        let mut blocked = vec![self.root.join(IDENTITY_FILE)];
        if let Some(log_file) = self.state.game().log_file() {
            blocked.push(self.extend_path(log_file));
        }
        if blocked.iter().any(|b| b == path) {
            return true;
        }

        let Some(real) = real_path(path) else {
            return false;
        };
        blocked.iter().filter_map(|b| real_path(b)).any(|b| b == real)
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.state.is_blocked() {
            return Err(ActionCode::Locked.into());
        }
        Ok(())
    }

    /// Follow symlinks on the deepest existing ancestor and require it to stay under the root
    fn is_contained(&self, path: &Path) -> bool {
        let root = match std::fs::canonicalize(&self.root) {
            Ok(root) => root,
            Err(_) => return false,
        };
        real_path(path).is_some_and(|real| real.starts_with(&root))
    }

    /// Resolve a caller path and apply the policy shared by all operations
    fn resolve(&self, relative: &str, require_edible: bool) -> Result<PathBuf> {
        self.ensure_unlocked()?;
        let path = self.extend_path(relative);
        if self.check_blocked(&path) || (require_edible && !self.check_edible(&path)) {
            return Err(Error::file(relative));
        }
        if !self.is_contained(&path) {
            warn!(server_id = %self.state.id(), path = %relative, "Path escapes sandbox via symlink");
            return Err(Error::file(relative));
        }
        Ok(path)
    }

    fn chown(&self, path: &Path) -> Result<()> {
        if self.manage_ownership {
            Owner::lookup(self.state.id())?.apply(path)?;
        }
        Ok(())
    }

    // ========================================================================
    // File API
    // ========================================================================

    pub async fn get_dir(&self, relative: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(relative, false)?;
        let mut reader = tokio::fs::read_dir(&dir)
            .await
            .map_err(|_| Error::file(relative))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|_| Error::file(relative))? {
            let path = entry.path();
            if self.check_blocked(&path) {
                continue;
            }

            let link = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            // Broken symlinks are listed with their own metadata
            let meta = tokio::fs::metadata(&path).await.unwrap_or_else(|_| link.clone());
            let name = entry.file_name().to_string_lossy().to_string();

            entries.push(DirEntry {
                created: meta.created().ok().map(DateTime::<Utc>::from),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                size: meta.len(),
                symlink: link.file_type().is_symlink(),
                is_dir: meta.is_dir(),
                is_file: meta.is_file(),
                edible: meta.is_file()
                    && meta.len() <= self.max_edit_bytes
                    && self.check_edible(Path::new(&name)),
                name,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn get_file_contents(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative, true)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::file(relative))?;
        if !meta.is_file() || meta.len() > self.max_edit_bytes {
            return Err(Error::file(relative));
        }
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| Error::file(relative))
    }

    pub async fn write_file(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.resolve(relative, true)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| Error::file(relative))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|_| Error::file(relative))?;
        self.chown(&path)?;
        debug!(server_id = %self.state.id(), path = %relative, "File written");
        Ok(())
    }

    pub async fn remove_file(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative, true)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| Error::file(relative))?;
        debug!(server_id = %self.state.id(), path = %relative, "File removed");
        Ok(())
    }

    /// Remove an empty directory
    pub async fn remove_folder(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative, false)?;
        if path == self.root {
            return Err(Error::file(relative));
        }
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|_| Error::file(relative))?;
        debug!(server_id = %self.state.id(), path = %relative, "Folder removed");
        Ok(())
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Open a regular file for download; returns the handle and its size
    pub async fn open_download(&self, relative: &str) -> Result<(tokio::fs::File, u64)> {
        let path = self.resolve(relative, false)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::file(relative))?;
        if !meta.is_file() {
            return Err(Error::file(relative));
        }
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| Error::file(relative))?;
        Ok((file, meta.len()))
    }

    /// Store an upload as `dir/name`, failing if it exceeds `limit` bytes
    pub async fn write_upload<R>(&self, dir: &str, name: &str, reader: R, limit: u64) -> Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let relative = format!("{}/{}", dir.trim_end_matches('/'), name);
        let mut parts = Path::new(name).components();
        if !matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None)) {
            return Err(Error::file(relative));
        }

        let path = self.resolve(&relative, false)?;
        if path.is_dir() || path == self.root {
            return Err(Error::file(relative));
        }

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|_| Error::file(&relative))?;
        let mut limited = reader.take(limit + 1);
        let written = tokio::io::copy(&mut limited, &mut file)
            .await
            .map_err(|_| Error::file(&relative))?;
        drop(file);

        if written > limit {
            let _ = tokio::fs::remove_file(&path).await;
            warn!(server_id = %self.state.id(), path = %relative, limit, "Upload exceeded size limit");
            return Err(Error::file(relative));
        }

        self.chown(&path)?;
        Ok(written)
    }

    // ========================================================================
    // Internal bootstrap (trusted fixed paths, no policy checks)
    // ========================================================================

    pub async fn ensure_file(&self, relative: &str) -> Result<()> {
        let path = self.extend_path(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !path.exists() {
            tokio::fs::write(&path, b"").await?;
        }
        self.chown(&path)
    }

    pub async fn truncate_file(&self, relative: &str) -> Result<()> {
        let path = self.extend_path(relative);
        let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(0).await?;
        self.chown(&path)
    }

    /// Write `identity.json` with the instance id
    pub async fn create_identity(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(IDENTITY_FILE);
        let body = serde_json::to_vec_pretty(&serde_json::json!({ "id": self.state.id() }))?;
        tokio::fs::write(&path, body).await?;
        self.chown(&path)
    }
}

/// `path` with symlinks resolved on its deepest existing ancestor and the
/// missing tail appended unchanged
fn real_path(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        match std::fs::canonicalize(existing) {
            Ok(mut real) => {
                real.extend(tail.iter().rev());
                return Some(real);
            }
            Err(_) => {
                tail.push(existing.file_name()?);
                existing = existing.parent()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn sandbox_at(root: &Path, log_file: Option<&str>) -> Sandbox {
        let mut record = fixtures::record("alice", 25565);
        if let Some(log) = log_file {
            record.game.logging.log_file.use_log_file = true;
            record.game.logging.log_file.path = log.to_string();
        }
        let state = Arc::new(InstanceState::new(record));
        Sandbox::new(root, state, 1_000_000, false)
    }

    fn sandbox(log_file: Option<&str>) -> Sandbox {
        sandbox_at(Path::new("/home/alice/public"), log_file)
    }

    #[test]
    fn test_extend_path_resolves_inside_root() {
        let sb = sandbox(None);
        assert_eq!(
            sb.extend_path("server.properties"),
            PathBuf::from("/home/alice/public/server.properties")
        );
        assert_eq!(
            sb.extend_path("world/../plugins/./x.yml"),
            PathBuf::from("/home/alice/public/plugins/x.yml")
        );
        assert_eq!(
            sb.extend_path("/etc/passwd"),
            PathBuf::from("/home/alice/public/etc/passwd")
        );
        assert_eq!(sb.extend_path(""), PathBuf::from("/home/alice/public"));
    }

    #[test]
    fn test_extend_path_traversal_falls_back_to_root() {
        let sb = sandbox(None);
        let root = PathBuf::from("/home/alice/public");
        for input in [
            "../../etc/passwd",
            "..",
            "../publicity/x.txt",
            "%2e%2e/%2e%2e/etc/passwd",
            "..%2F..%2Fetc%2Fshadow",
            "a/../../../../root",
            "%00",
            "%ff%fe",
        ] {
            assert_eq!(sb.extend_path(input), root, "input {:?}", input);
        }
    }

    #[test]
    fn test_extend_path_randomized_never_escapes() {
        let sb = sandbox(None);
        let root = PathBuf::from("/home/alice/public");
        let pieces = [
            "..", ".", "a", "public", "%2e%2e", "%2F", "/", "%5C", "b.txt", "%00", "...", "alice",
        ];

        // xorshift so the sequence is reproducible
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..5000 {
            let mut input = String::new();
            for _ in 0..(seed % 8 + 1) {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                input.push_str(pieces[(seed % pieces.len() as u64) as usize]);
                if seed & 1 == 0 {
                    input.push('/');
                }
            }
            let resolved = sb.extend_path(&input);
            assert!(resolved.starts_with(&root), "{:?} -> {:?}", input, resolved);
        }
    }

    #[test]
    fn test_check_edible() {
        let sb = sandbox(None);
        for ok in ["a.txt", "server.properties", "level.nbt", "c.yaml", "d.json", "e.yml", "f.log"] {
            assert!(sb.check_edible(Path::new(ok)), "{}", ok);
        }
        for bad in ["server.jar", "run.sh", "noext", "x.txt.bak"] {
            assert!(!sb.check_edible(Path::new(bad)), "{}", bad);
        }
    }

    #[test]
    fn test_check_blocked() {
        let sb = sandbox(Some("logs/latest.log"));
        assert!(sb.check_blocked(&sb.extend_path("identity.json")));
        assert!(sb.check_blocked(&sb.extend_path("./logs/../logs/latest.log")));
        assert!(!sb.check_blocked(&sb.extend_path("logs/old.log")));
        assert!(!sb.check_blocked(&sb.extend_path("world/identity.json")));

        let no_log = sandbox(None);
        assert!(!no_log.check_blocked(&no_log.extend_path("logs/latest.log")));
    }

    #[tokio::test]
    async fn test_file_round_trip_and_policy() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_at(dir.path(), Some("logs/latest.log"));

        sb.write_file("config/server.properties", "motd=hi\n").await.unwrap();
        assert_eq!(
            sb.get_file_contents("config/server.properties").await.unwrap(),
            "motd=hi\n"
        );

        let err = sb.write_file("run.sh", "rm -rf /").await.unwrap_err();
        assert!(matches!(err, Error::File(p) if p == "run.sh"));

        sb.create_identity().await.unwrap();
        let err = sb.get_file_contents("identity.json").await.unwrap_err();
        assert!(matches!(err, Error::File(_)));
        let err = sb.write_file("logs/latest.log", "x").await.unwrap_err();
        assert!(matches!(err, Error::File(_)));

        sb.remove_file("config/server.properties").await.unwrap();
        sb.remove_folder("config").await.unwrap();
        assert!(!dir.path().join("config").exists());
    }

    #[tokio::test]
    async fn test_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(InstanceState::new(fixtures::record("alice", 25565)));
        let sb = Sandbox::new(dir.path(), state, 8, false);

        std::fs::write(dir.path().join("big.txt"), "0123456789").unwrap();
        assert!(sb.get_file_contents("big.txt").await.is_err());

        let listing = sb.get_dir("").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].is_file);
        assert!(!listing[0].edible);
    }

    #[tokio::test]
    async fn test_get_dir_hides_blocked_files() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_at(dir.path(), None);
        sb.create_identity().await.unwrap();
        sb.write_file("ops.json", "[]").await.unwrap();
        std::fs::create_dir(dir.path().join("world")).unwrap();

        let names: Vec<String> = sb.get_dir("").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["ops.json", "world"]);

        let world = sb.get_dir("").await.unwrap().into_iter().find(|e| e.name == "world").unwrap();
        assert!(world.is_dir);
        assert!(!world.edible);
    }

    #[tokio::test]
    async fn test_locked_sandbox_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(InstanceState::new(fixtures::record("alice", 25565)));
        let sb = Sandbox::new(dir.path(), state.clone(), 1_000_000, false);

        let guard = state.block().await.unwrap();
        let err = sb.get_dir("").await.unwrap_err();
        assert!(err.is_action(ActionCode::Locked));
        assert!(sb.write_file("a.txt", "x").await.unwrap_err().is_action(ActionCode::Locked));
        guard.release().await;

        sb.write_file("a.txt", "x").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_root_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s3cret").unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
        let sb = sandbox_at(dir.path(), None);

        let err = sb.get_file_contents("escape/secret.txt").await.unwrap_err();
        assert!(matches!(err, Error::File(p) if p == "escape/secret.txt"));
        assert!(sb.write_file("escape/new.txt", "x").await.is_err());
        assert!(!outside.path().join("new.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_to_blocked_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_at(dir.path(), Some("logs/latest.log"));
        sb.create_identity().await.unwrap();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/latest.log"), "line\n").unwrap();

        std::os::unix::fs::symlink(dir.path().join(IDENTITY_FILE), dir.path().join("x.json")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("logs"), dir.path().join("l")).unwrap();

        assert!(sb.check_blocked(&sb.extend_path("x.json")));
        assert!(sb.check_blocked(&sb.extend_path("l/latest.log")));
        assert!(!sb.check_blocked(&sb.extend_path("l/other.log")));

        let err = sb.get_file_contents("x.json").await.unwrap_err();
        assert!(matches!(err, Error::File(p) if p == "x.json"));
        assert!(sb.write_file("l/latest.log", "x").await.is_err());
        assert_eq!(std::fs::read_to_string(dir.path().join("logs/latest.log")).unwrap(), "line\n");
    }

    #[tokio::test]
    async fn test_upload_limits() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_at(dir.path(), None);

        let written = sb
            .write_upload("plugins", "a.jar", &b"12345"[..], 10)
            .await
            .unwrap_err();
        // plugins/ does not exist yet
        assert!(matches!(written, Error::File(_)));

        std::fs::create_dir(dir.path().join("plugins")).unwrap();
        assert_eq!(
            sb.write_upload("plugins", "a.jar", &b"12345"[..], 10).await.unwrap(),
            5
        );
        assert!(sb
            .write_upload("plugins", "b.jar", &b"0123456789abc"[..], 10)
            .await
            .is_err());
        assert!(!dir.path().join("plugins/b.jar").exists());
        assert!(sb
            .write_upload("plugins", "../identity.json", &b"{}"[..], 10)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ensure_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_at(dir.path(), Some("logs/latest.log"));

        sb.ensure_file("logs/latest.log").await.unwrap();
        std::fs::write(dir.path().join("logs/latest.log"), "old").unwrap();
        sb.ensure_file("logs/latest.log").await.unwrap();
        sb.truncate_file("logs/latest.log").await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("logs/latest.log")).unwrap(), "");
    }
}
