//! Ticket & Queue State Machine (C2).
//!
//! Pure functions over a plan worktree path: parsing ticket/area bodies,
//! deriving the next monotonic ticket id, and normalizing slugs/paths. No I/O
//! happens here beyond what the caller (the tick loop, via the git plan
//! store) already did to materialize the worktree — grounded on the
//! teacher's split between `worktree::manager_validation`/`manager_utilities`
//! (pure helpers) and `worktree::manager` (the I/O-performing orchestrator).

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TicketState {
    Open,
    InProgress,
    Done,
}

impl TicketState {
    pub fn dir_name(self) -> &'static str {
        match self {
            TicketState::Open => "open",
            TicketState::InProgress => "in-progress",
            TicketState::Done => "done",
        }
    }

    pub const ALL: [TicketState; 3] = [
        TicketState::Open,
        TicketState::InProgress,
        TicketState::Done,
    ];
}

#[derive(Debug, Clone)]
pub struct Ticket {
    pub id: u32,
    pub slug: String,
    pub state: TicketState,
    pub body: String,
}

impl Ticket {
    pub fn file_name(&self) -> String {
        format!("{:04}-{}.md", self.id, self.slug)
    }

    pub fn relpath(&self) -> String {
        format!("tickets/{}/{}", self.state.dir_name(), self.file_name())
    }

    /// The suffix of the first `**Area:**` line, trimmed. Empty if absent.
    pub fn area_id(&self) -> String {
        parse_area_id(&self.body)
    }

    pub fn worktree_path(&self) -> Option<String> {
        parse_worktree_line(&self.body)
    }

    /// Appends/replaces the `**Worktree:**` line with `path`.
    pub fn set_worktree(&mut self, path: &str) {
        self.body = strip_worktree_line(&self.body);
        if !self.body.ends_with('\n') {
            self.body.push('\n');
        }
        self.body.push_str(&format!("**Worktree:** {path}\n"));
    }

    /// Removes the `**Worktree:**` line, if any.
    pub fn strip_worktree(&mut self) {
        self.body = strip_worktree_line(&self.body);
    }

    /// Appends a `## Merge Queue Failure` section recording `summary` and a
    /// diagnostic `tag` (`FAIL`, `CONFLICT`, or a timeout kind).
    pub fn append_failure(&mut self, tag: &str, summary: &str) {
        if !self.body.ends_with('\n') {
            self.body.push('\n');
        }
        self.body.push_str(&format!(
            "\n## Merge Queue Failure\n\n- Summary: {summary}\n- Diagnostic: {tag}\n"
        ));
    }
}

/// Parses the first `**Area:**` line's suffix after trim; empty if none.
pub fn parse_area_id(body: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("**Area:**") {
            return rest.trim().to_string();
        }
    }
    String::new()
}

fn parse_worktree_line(body: &str) -> Option<String> {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("**Worktree:**") {
            return Some(rest.trim().to_string());
        }
    }
    None
}

fn strip_worktree_line(body: &str) -> String {
    body.lines()
        .filter(|line| !line.trim().starts_with("**Worktree:**"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reads every ticket file under `tickets/<state>/` in a plan worktree.
pub fn load_all_tickets(worktree: &Path) -> Result<Vec<Ticket>> {
    let mut tickets = Vec::new();
    for state in TicketState::ALL {
        let dir = worktree.join("tickets").join(state.dir_name());
        if !dir.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let Some((id, slug)) = parse_ticket_file_name(file_name) else {
                continue;
            };
            let body = std::fs::read_to_string(&path)?;
            tickets.push(Ticket {
                id,
                slug,
                state,
                body,
            });
        }
    }
    tickets.sort_by_key(|t| (t.state as u8, t.id));
    Ok(tickets)
}

fn parse_ticket_file_name(file_name: &str) -> Option<(u32, String)> {
    let stem = file_name.strip_suffix(".md")?;
    let (prefix, slug) = stem.split_once('-')?;
    let id: u32 = prefix.parse().ok()?;
    Some((id, slug.to_string()))
}

/// Union of area ids referenced by every ticket in `open` and `in-progress`.
pub fn collect_active_areas(tickets: &[Ticket]) -> std::collections::HashSet<String> {
    tickets
        .iter()
        .filter(|t| matches!(t.state, TicketState::Open | TicketState::InProgress))
        .map(|t| t.area_id())
        .filter(|a| !a.is_empty())
        .collect()
}

/// Sorted list of area file paths (relative to the plan worktree root) whose
/// stem has no open/in-progress ticket referencing it.
pub fn areas_needing_tickets(areas: &[PathBuf], active: &std::collections::HashSet<String>) -> Vec<PathBuf> {
    let mut needing: Vec<PathBuf> = areas
        .iter()
        .filter(|path| {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            !active.contains(stem)
        })
        .cloned()
        .collect();
    needing.sort();
    needing
}

/// `max(observed_id) + 1`, or `1` when the union of ids across all three
/// states (and the pending queue, whose entries share the ticket numbering)
/// is empty.
pub fn next_ticket_id(worktree: &Path) -> Result<u32> {
    let mut max_id: Option<u32> = None;
    for state in TicketState::ALL {
        let dir = worktree.join("tickets").join(state.dir_name());
        if !dir.exists() {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(prefix) = name.split('-').next() {
                if let Ok(id) = prefix.parse::<u32>() {
                    max_id = Some(max_id.map_or(id, |m| m.max(id)));
                }
            }
        }
    }
    Ok(max_id.map_or(1, |m| m + 1))
}

/// Lowercase; keep `[a-z0-9]`; map separators to `-`; collapse consecutive
/// `-`; trim trailing `-`; empty result is `InvalidInput`.
pub fn normalize_slug(input: &str) -> Result<String> {
    let mut out = String::new();
    let mut last_was_sep = false;
    for ch in input.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if ch == ' ' || ch == '_' || ch == '-' {
            if !last_was_sep && !out.is_empty() {
                out.push('-');
            }
            last_was_sep = true;
        }
        // all other characters are dropped entirely
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        return Err(Error::InvalidInput(format!("slug normalizes to empty: {input:?}")));
    }
    Ok(out)
}

/// Must be relative, must not contain `..`, must end in `.md` (case
/// insensitive); else `InvalidInput`.
pub fn normalize_area_path(input: &str) -> Result<String> {
    let path = Path::new(input);
    if path.is_absolute() {
        return Err(Error::InvalidInput(format!("area path must be relative: {input}")));
    }
    if input.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(Error::InvalidInput(format!("area path escapes root: {input}")));
    }
    if !input.to_lowercase().ends_with(".md") {
        return Err(Error::InvalidInput(format!("area path must end in .md: {input}")));
    }
    Ok(input.to_string())
}

/// Parses `<NNNN>-<NNNN>.md` pending queue entry names into `(ticket_id, id_again)`.
pub fn parse_pending_entry_name(name: &str) -> Option<(u32, u32)> {
    let stem = name.strip_suffix(".md")?;
    let (a, b) = stem.split_once('-')?;
    if a.len() != 4 || b.len() != 4 {
        return None;
    }
    Some((a.parse().ok()?, b.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_id_parses_first_line_only() {
        let body = "Body text\n**Area:** core-storage\nmore\n**Area:** other\n";
        assert_eq!(parse_area_id(body), "core-storage");
    }

    #[test]
    fn area_id_empty_when_absent() {
        assert_eq!(parse_area_id("no area line here"), "");
    }

    #[test]
    fn worktree_round_trips() {
        let mut ticket = Ticket {
            id: 1,
            slug: "first".into(),
            state: TicketState::Open,
            body: "**Area:** core\n".into(),
        };
        ticket.set_worktree("/tmp/wt/0001");
        assert_eq!(ticket.worktree_path().as_deref(), Some("/tmp/wt/0001"));
        assert_eq!(ticket.area_id(), "core");

        ticket.strip_worktree();
        assert_eq!(ticket.worktree_path(), None);
        assert_eq!(ticket.area_id(), "core");
    }

    #[test]
    fn slug_normalization_is_idempotent() {
        for input in ["Hello World!", "  multi   space_test--", "already-ok", "全角"] {
            let once = normalize_slug(input);
            if let Ok(once) = once {
                let twice = normalize_slug(&once).unwrap();
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn slug_rejects_empty_result() {
        assert!(normalize_slug("!!!").is_err());
        assert!(normalize_slug("").is_err());
    }

    #[test]
    fn area_path_rejects_escape_and_absolute() {
        assert!(normalize_area_path("../areas/x.md").is_err());
        assert!(normalize_area_path("/areas/x.md").is_err());
        assert!(normalize_area_path("areas/x.txt").is_err());
        assert!(normalize_area_path("areas/x.md").is_ok());
        assert!(normalize_area_path("areas/X.MD").is_ok());
    }

    #[test]
    fn pending_entry_name_parses() {
        assert_eq!(parse_pending_entry_name("0001-0001.md"), Some((1, 1)));
        assert_eq!(parse_pending_entry_name("bad.md"), None);
        assert_eq!(parse_pending_entry_name("00001-0001.md"), None);
    }

    #[test]
    fn next_id_is_max_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tickets/open")).unwrap();
        std::fs::create_dir_all(dir.path().join("tickets/done")).unwrap();
        std::fs::write(dir.path().join("tickets/open/0002-a.md"), "").unwrap();
        std::fs::write(dir.path().join("tickets/done/0005-b.md"), "").unwrap();
        assert_eq!(next_ticket_id(dir.path()).unwrap(), 6);
    }

    #[test]
    fn next_id_is_one_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_ticket_id(dir.path()).unwrap(), 1);
    }
}
