use std::io;
use std::path::{Path, PathBuf};

/// Home directory from `$HOME`, falling back to the password database.
#[cfg(unix)]
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            use nix::unistd::{Uid, User};
            User::from_uid(Uid::effective())
                .ok()
                .flatten()
                .map(|u| u.dir)
        })
}

#[cfg(not(unix))]
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Expand a leading `~` or `~/` to the user's home directory. Paths without
/// one, or with no resolvable home, are returned as given.
pub fn expand_home(path: &str) -> PathBuf {
    expand_against(path, home_dir().as_deref())
}

fn expand_against(path: &str, home: Option<&Path>) -> PathBuf {
    match (path, home) {
        ("~", Some(home)) => home.to_path_buf(),
        (_, Some(home)) if path.starts_with("~/") => home.join(&path[2..]),
        _ => PathBuf::from(path),
    }
}

/// Create `dir` and any missing parents readable by the owner only.
/// Buffered volumes and the keyring live under the working directory.
/// Existing directories keep their permissions.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_forms() {
        let home = Path::new("/home/ops");
        assert_eq!(expand_against("~", Some(home)), home);
        assert_eq!(
            expand_against("~/.snapvault", Some(home)),
            home.join(".snapvault")
        );
        assert_eq!(expand_against("/var/lib/x", Some(home)), Path::new("/var/lib/x"));
        assert_eq!(expand_against("~ops/x", Some(home)), Path::new("~ops/x"));
        assert_eq!(expand_against("~/x", None), Path::new("~/x"));
    }

    #[cfg(unix)]
    #[test]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("work").join("temp");
        create_private_dir(&dir).unwrap();
        for created in [dir.parent().unwrap(), dir.as_path()] {
            let mode = std::fs::metadata(created).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0, "{} has mode {mode:o}", created.display());
        }
        // Idempotent on an existing tree.
        create_private_dir(&dir).unwrap();
    }
}
