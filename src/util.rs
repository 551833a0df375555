use memmap2::Mmap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::patch_format::ModeBits;

/// Slash-separated key for `full`, which must lie under `root`.
///
/// On Windows `\` is the separator and is translated. Elsewhere it is an
/// ordinary file name byte that the patch format cannot carry, so such paths
/// are refused.
pub fn relative_key(root: &Path, full: &Path) -> Result<String> {
    let relative = full.strip_prefix(root).map_err(|_| Error::UnsupportedPath {
        path: full.to_path_buf(),
        reason: "path is outside the snapshot root",
    })?;
    let s = relative.to_str().ok_or_else(|| Error::UnsupportedPath {
        path: full.to_path_buf(),
        reason: "path is not valid UTF-8",
    })?;
    #[cfg(windows)]
    {
        Ok(s.replace('\\', "/"))
    }
    #[cfg(not(windows))]
    {
        if s.contains('\\') {
            return Err(Error::UnsupportedPath {
                path: full.to_path_buf(),
                reason: "file name contains a backslash",
            });
        }
        Ok(s.to_string())
    }
}

/// A symlink's target as recorded in manifests and patches.
pub fn link_target_string(link: &Path, target: &Path) -> Result<String> {
    let s = target.to_str().ok_or_else(|| Error::UnsupportedPath {
        path: link.to_path_buf(),
        reason: "symlink target is not valid UTF-8",
    })?;
    #[cfg(windows)]
    {
        Ok(s.replace('\\', "/"))
    }
    #[cfg(not(windows))]
    {
        Ok(s.to_string())
    }
}

/// Current target of the symlink at `link`, `None` if it is not a symlink.
pub fn read_link_target(link: &Path) -> Option<String> {
    let target = fs::read_link(link).ok()?;
    link_target_string(link, &target).ok()
}

/// Refuse `path` when its nearest existing ancestor resolves outside `root`.
/// `root` must already be canonical.
pub fn ensure_within(root: &Path, path: &Path) -> Result<()> {
    let mut current = path.parent();
    while let Some(dir) = current {
        match fs::symlink_metadata(dir) {
            Ok(_) => {
                let resolved = dir.canonicalize().with_path(dir)?;
                if resolved.starts_with(root) {
                    return Ok(());
                }
                break;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
                ) =>
            {
                current = dir.parent();
            }
            Err(e) => return Err(e).with_path(dir),
        }
    }
    Err(Error::OutsideTarget {
        path: path.to_path_buf(),
    })
}

/// Reject patch paths that could escape the target root.
pub fn validate_patch_path(path: &str) -> Result<()> {
    if path.is_empty() || path.contains('\\') || path.contains('\0') {
        return Err(Error::Format(format!("invalid path in patch: {path:?}")));
    }
    for component in Path::new(path).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(Error::Format(format!("invalid path in patch: {path:?}")));
        }
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(Error::Format(format!("invalid path in patch: {path:?}")));
    }
    Ok(())
}

/// Number of separators; `a` is depth 0, `a/b` depth 1.
pub fn depth(path: &str) -> usize {
    path.bytes().filter(|&b| b == b'/').count()
}

/// Ancestor directories of a relative path, nearest first.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.rmatch_indices('/').map(move |(i, _)| &path[..i])
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = fs::File::open(path).with_path(path)?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe { Mmap::map(&file).with_path(path) }
}

/// Read a whole file, mapping it when non-empty.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    let len = fs::metadata(path).with_path(path)?.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    Ok(mmap_file(path)?.to_vec())
}

pub fn mode_bits_of(meta: &fs::Metadata) -> ModeBits {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
            return ModeBits::Executable;
        }
    }
    #[cfg(not(unix))]
    let _ = meta;
    ModeBits::Plain
}

/// Set or clear the executable bits, keeping the rest of the permissions.
/// Returns whether anything changed. Symlinks are left alone.
pub fn set_mode_bits(path: &Path, mode_bits: ModeBits) -> Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = fs::symlink_metadata(path).with_path(path)?;
        if meta.file_type().is_symlink() {
            return Ok(false);
        }
        let mode = meta.permissions().mode() & 0o7777;
        let wanted = match mode_bits {
            ModeBits::Executable => mode | 0o111,
            ModeBits::Plain => mode & !0o111,
        };
        if wanted == mode {
            return Ok(false);
        }
        fs::set_permissions(path, fs::Permissions::from_mode(wanted)).with_path(path)?;
        Ok(true)
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode_bits);
        Ok(false)
    }
}

/// Write `data` to a temporary sibling of `path`, then rename it into place.
/// A crash leaves either the previous file or the complete new one.
pub fn write_atomic(path: &Path, data: &[u8], mode_bits: ModeBits) -> Result<()> {
    let parent = parent_of(path);
    let existing_mode = existing_permissions(path);

    let mut tmp = tempfile::NamedTempFile::new_in(parent).with_path(parent)?;
    tmp.write_all(data).with_path(tmp.path())?;
    tmp.as_file().sync_all().with_path(tmp.path())?;
    if let Some(perms) = existing_mode {
        fs::set_permissions(tmp.path(), perms).with_path(tmp.path())?;
    } else {
        set_default_permissions(tmp.path())?;
    }
    set_mode_bits(tmp.path(), mode_bits)?;
    tmp.persist(path).map_err(|e| Error::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Create (or replace) a symlink by linking a temporary sibling and renaming it.
pub fn symlink_atomic(path: &Path, target: &str) -> Result<()> {
    let parent = parent_of(path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.dirpatch-link"));
    match fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e).with_path(&tmp),
        _ => {}
    }
    make_symlink(target, &tmp).with_path(&tmp)?;
    fs::rename(&tmp, path).with_path(path)
}

#[cfg(unix)]
fn make_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &str, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(not(any(unix, windows)))]
fn make_symlink(_target: &str, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn existing_permissions(path: &Path) -> Option<fs::Permissions> {
    fs::symlink_metadata(path)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.permissions())
}

fn set_default_permissions(path: &Path) -> Result<()> {
    // NamedTempFile is created 0600; new files get the usual 0644
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644)).with_path(path)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Join a validated relative patch path onto the target root.
pub fn target_path(root: &Path, relative: &str) -> PathBuf {
    relative.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}
