//! Map a free-form path onto a configured directory entry.
//!
//! Worktrees and subdirectories belong to the most specific configured root
//! that contains them.

use crate::wire::DirectoryEntry;

/// Normalize a path for comparison.
///
/// Backslashes become forward slashes and trailing slashes are stripped (a
/// bare `/` stays). Only a Windows drive letter is lower-cased; the rest of
/// the path keeps its case.
pub fn normalize_path_for_match(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        normalized.replace_range(0..1, &drive.to_string());
    }
    normalized
}

fn is_ancestor(ancestor: &str, target: &str) -> bool {
    if ancestor.is_empty() {
        return false;
    }
    if ancestor == "/" {
        return target.starts_with('/');
    }
    target == ancestor
        || (target.starts_with(ancestor) && target.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Resolve `path` to an entry: exact match first, then the longest ancestor.
///
/// `None` means the path lives somewhere untracked; callers treat that as a
/// degraded case, not an error.
pub fn match_directory_entry_for_path<'a, I>(entries: I, path: &str) -> Option<&'a DirectoryEntry>
where
    I: IntoIterator<Item = &'a DirectoryEntry>,
{
    let target = normalize_path_for_match(path);
    if target.is_empty() {
        return None;
    }

    let mut best: Option<(&'a DirectoryEntry, usize)> = None;
    for entry in entries {
        let candidate = normalize_path_for_match(&entry.path);
        if candidate == target {
            return Some(entry);
        }
        if is_ancestor(&candidate, &target) && best.is_none_or(|(_, len)| candidate.len() > len) {
            best = Some((entry, candidate.len()));
        }
    }
    best.map(|(entry, _)| entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, path: &str) -> DirectoryEntry {
        DirectoryEntry::new(id, path)
    }

    #[test]
    fn test_longest_ancestor_wins() {
        let entries = vec![entry("a", "/repo"), entry("b", "/repo/sub")];
        let hit = match_directory_entry_for_path(&entries, "/repo/sub/file").unwrap();
        assert_eq!(hit.id, "b");
        let hit = match_directory_entry_for_path(&entries, "/repo/other").unwrap();
        assert_eq!(hit.id, "a");
    }

    #[test]
    fn test_exact_match_wins_outright() {
        let entries = vec![entry("a", "/repo"), entry("b", "/repo/sub/")];
        let hit = match_directory_entry_for_path(&entries, "/repo/sub").unwrap();
        assert_eq!(hit.id, "b");
    }

    #[test]
    fn test_sibling_prefix_is_not_ancestor() {
        let entries = vec![entry("a", "/repo")];
        assert!(match_directory_entry_for_path(&entries, "/repository/x").is_none());
    }

    #[test]
    fn test_windows_drive_letter_case_only() {
        let entries = vec![entry("w", "C:\\Work\\Proj\\")];
        let hit = match_directory_entry_for_path(&entries, "c:/Work/Proj/src").unwrap();
        assert_eq!(hit.id, "w");
        assert!(match_directory_entry_for_path(&entries, "c:/work/proj/src").is_none());
    }

    #[test]
    fn test_normalize_keeps_root() {
        assert_eq!(normalize_path_for_match("/"), "/");
        assert_eq!(normalize_path_for_match("///"), "/");
        assert_eq!(normalize_path_for_match("D:\\a\\b\\"), "d:/a/b");
    }

    #[test]
    fn test_unmatched_returns_none() {
        let entries = vec![entry("a", "/repo")];
        assert!(match_directory_entry_for_path(&entries, "/elsewhere").is_none());
        assert!(match_directory_entry_for_path(&entries, "").is_none());
    }
}
