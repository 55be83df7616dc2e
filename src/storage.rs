use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tokio::io::ErrorKind;

/// Read-only view over the configured root directory. Every virtual path is
/// normalized and symlink-checked before it touches the filesystem.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Normalizes a virtual path to its canonical slash-joined form.
    /// Download tokens are bound to this exact string.
    pub fn normalize_virtual(&self, relative: &str) -> Result<String, StorageError> {
        let segments = virtual_segments(relative)?;
        Ok(segments.join("/"))
    }

    /// Resolves a virtual path to a real path under the root, rejecting
    /// escapes and symlink components.
    pub async fn resolve_path_checked(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let segments = virtual_segments(relative)?;
        let mut target = self.root.clone();
        for segment in &segments {
            target.push(segment);
        }
        self.ensure_no_symlink_components(&target).await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(&self, target: &Path) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::PathEscape)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::PathEscape);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::Io(ErrorKind::NotFound.into()));
                    }
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// Lists the immediate children of a virtual directory path. Dotfiles
    /// are skipped; `filter` keeps only names containing the substring.
    pub async fn list_dir(
        &self,
        relative: &str,
        filter: Option<&str>,
    ) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve_path_checked(relative).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(StorageError::Io(ErrorKind::NotFound.into()));
        }
        let filter_lower = filter.map(str::to_lowercase);

        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(needle) = filter_lower.as_deref()
                && !name.to_lowercase().contains(needle)
            {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(|duration| duration.as_secs() as i64)
                .unwrap_or(0);

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified,
            });
        }

        Ok(entries)
    }
}

/// Splits a virtual path into plain segments, rejecting anything that could
/// resolve outside the root.
fn virtual_segments(relative: &str) -> Result<Vec<String>, StorageError> {
    let mut segments = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(segment) => {
                segments.push(segment.to_string_lossy().to_string());
            }
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathEscape);
            }
        }
    }
    Ok(segments)
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Modified,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Sorts a listing in place: directories always first, then the requested
/// column with name as the tie-breaker. Name comparison is natural, so
/// "file2" sorts before "file10".
pub fn sort_entries(entries: &mut [FileEntry], key: SortKey, order: SortOrder) {
    entries.sort_by(|a, b| {
        match (a.is_dir, b.is_dir) {
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let by_column = match key {
            SortKey::Name => natural_cmp(&a.name, &b.name),
            SortKey::Size => a.size.cmp(&b.size),
            SortKey::Modified => a.modified.cmp(&b.modified),
        };
        let by_column = match order {
            SortOrder::Asc => by_column,
            SortOrder::Desc => by_column.reverse(),
        };
        by_column.then_with(|| natural_cmp(&a.name, &b.name))
    });
}

/// Case-insensitive comparison treating digit runs as numbers.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();

    loop {
        match (ai.peek().copied(), bi.peek().copied()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(ca), Some(cb)) if ca.is_ascii_digit() && cb.is_ascii_digit() => {
                let na = take_digit_run(&mut ai);
                let nb = take_digit_run(&mut bi);
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(ca), Some(cb)) => {
                let la = ca.to_ascii_lowercase();
                let lb = cb.to_ascii_lowercase();
                if la != lb {
                    return la.cmp(&lb);
                }
                ai.next();
                bi.next();
            }
        }
    }
}

fn take_digit_run(iter: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(ch) = iter.peek() {
        if !ch.is_ascii_digit() {
            break;
        }
        run.push(*ch);
        iter.next();
    }
    run
}

#[derive(Debug)]
pub enum StorageError {
    PathEscape,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: i64,
}
