//! Change-notification matching.
//!
//! After any mutation the host broadcasts "path P (± subtree) changed" to
//! every loaded module and marks every panel whose shown path overlaps. The
//! fan-out itself is driven by the router so it runs inside the same host
//! call; this module holds the notification type and the overlap test.
//! Delivery is at-least-once, so receivers must treat repeats as no-ops.

/// One pending notification. Delivered synchronously, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub path: String,
    pub include_subtree: bool,
}

impl ChangeNotification {
    pub fn new(path: impl Into<String>, include_subtree: bool) -> Self {
        Self {
            path: path.into(),
            include_subtree,
        }
    }

    /// Does this notification affect a panel showing `shown`?
    pub fn covers(&self, shown: &str) -> bool {
        path_covers(&self.path, self.include_subtree, shown)
    }
}

/// Case-insensitive overlap test between a notified path and a shown path.
///
/// Without the subtree flag only the path itself matches; with it, every
/// descendant matches too. Trailing separators are ignored on both sides.
pub fn path_covers(notified: &str, include_subtree: bool, shown: &str) -> bool {
    let notified = trim_separators(notified);
    let shown = trim_separators(shown);

    // A bare root keeps its separator after trimming and covers everything
    // below it; the general prefix test below would demand a second one.
    if notified.len() == 1 && notified.chars().next().is_some_and(is_separator) {
        return match shown.chars().next() {
            Some(c) if is_separator(c) => shown.len() == 1 || include_subtree,
            _ => false,
        };
    }

    if notified.len() > shown.len() {
        return false;
    }
    let (head, rest) = shown.split_at(notified.len());
    if !head.eq_ignore_ascii_case(notified) {
        return false;
    }
    match rest.chars().next() {
        None => true,
        Some(c) => include_subtree && is_separator(c),
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn trim_separators(path: &str) -> &str {
    let trimmed = path.trim_end_matches(is_separator);
    // Keep a bare root instead of an empty string.
    if trimmed.is_empty() && !path.is_empty() {
        &path[..1]
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtree_covers_descendant_but_not_sibling() {
        let n = ChangeNotification::new("/a", true);
        assert!(n.covers("/a/b"));
        assert!(n.covers("/a"));
        assert!(!n.covers("/c"));
        assert!(!n.covers("/ab"));
    }

    #[test]
    fn test_without_subtree_only_exact_path() {
        let n = ChangeNotification::new("/a", false);
        assert!(n.covers("/a"));
        assert!(n.covers("/a/"));
        assert!(!n.covers("/a/b"));
    }

    #[test]
    fn test_case_insensitive_match() {
        assert!(path_covers("remote:Server/Dir", true, "remote:server/dir/sub"));
    }

    #[test]
    fn test_trailing_separators_ignored() {
        assert!(path_covers("/a/", true, "/a/b"));
        assert!(path_covers("/a", false, "/a///"));
    }

    #[test]
    fn test_root_paths() {
        assert!(path_covers("/", true, "/anything"));
        assert!(path_covers("/", false, "/"));
        assert!(!path_covers("/", false, "/anything"));
    }
}
