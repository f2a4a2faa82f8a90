//! Remote path helpers
//!
//! Remote paths always use `/`, whatever the local or remote OS.

/// Join remote path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Strip trailing slashes, keeping a lone `/`.
pub fn trim_remote_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/"
    } else {
        trimmed
    }
}

/// Parent directory of a remote path. `None` for `/` and single relative
/// components.
pub fn parent_remote_path(path: &str) -> Option<&str> {
    let path = trim_remote_path(path);
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn remote_file_name(path: &str) -> &str {
    let path = trim_remote_path(path);
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_parent_remote_path() {
        assert_eq!(parent_remote_path("/srv/data/a.txt"), Some("/srv/data"));
        assert_eq!(parent_remote_path("/srv/data/"), Some("/srv"));
        assert_eq!(parent_remote_path("/srv"), Some("/"));
        assert_eq!(parent_remote_path("/"), None);
        assert_eq!(parent_remote_path("uploads/a.txt"), Some("uploads"));
        assert_eq!(parent_remote_path("a.txt"), None);
    }

    #[test]
    fn test_remote_file_name() {
        assert_eq!(remote_file_name("/srv/data/a.txt"), "a.txt");
        assert_eq!(remote_file_name("/srv/data/"), "data");
        assert_eq!(remote_file_name("plain"), "plain");
    }
}
