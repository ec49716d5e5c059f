//! Merge queue file format: `queue/merge/pending/<NNNN>-<NNNN>.md` and
//! `queue/merge/active.md` (§3). Pure parsing/formatting; I/O is the caller's
//! job via the plan worktree path, matching [`crate::ticket`]'s split.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub ticket_id: u32,
    pub branch: String,
    pub worktree: String,
    pub summary: String,
}

impl PendingEntry {
    pub fn file_name(&self) -> String {
        format!("{:04}-{:04}.md", self.ticket_id, self.ticket_id)
    }

    pub fn relpath(&self) -> String {
        format!("queue/merge/pending/{}", self.file_name())
    }

    pub fn to_body(&self) -> String {
        format!(
            "**Ticket:** {:04}\n**Branch:** {}\n**Worktree:** {}\n**Summary:** {}\n",
            self.ticket_id, self.branch, self.worktree, self.summary
        )
    }

    pub fn from_body(ticket_id: u32, body: &str) -> Result<Self> {
        let branch = field(body, "**Branch:**").ok_or_else(|| {
            Error::InvalidInput(format!("pending entry {ticket_id} missing **Branch:**"))
        })?;
        let worktree = field(body, "**Worktree:**").ok_or_else(|| {
            Error::InvalidInput(format!("pending entry {ticket_id} missing **Worktree:**"))
        })?;
        let summary = field(body, "**Summary:**").unwrap_or_default();
        Ok(Self {
            ticket_id,
            branch,
            worktree,
            summary,
        })
    }
}

fn field(body: &str, prefix: &str) -> Option<String> {
    body.lines().find_map(|line| {
        line.trim()
            .strip_prefix(prefix)
            .map(|rest| rest.trim().to_string())
    })
}

/// Lists pending entries, FIFO-ordered by filename ascending (Q: filename
/// order is the queue order).
pub fn list_pending(worktree: &Path) -> Result<Vec<(PathBuf, PendingEntry)>> {
    let dir = worktree.join("queue/merge/pending");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let Some((ticket_id, _)) = crate::ticket::parse_pending_entry_name(&name) else {
            continue;
        };
        let body = std::fs::read_to_string(&path)?;
        let parsed = PendingEntry::from_body(ticket_id, &body)?;
        entries.push((path, parsed));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Reads `queue/merge/active.md`: the relative path of the pending entry
/// currently being processed, or `None` when idle/missing/empty.
pub fn read_active(worktree: &Path) -> Result<Option<String>> {
    let path = worktree.join("queue/merge/active.md");
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

pub fn write_active(worktree: &Path, relpath: &str) -> Result<()> {
    let path = worktree.join("queue/merge/active.md");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{relpath}\n"))?;
    Ok(())
}

pub fn clear_active(worktree: &Path) -> Result<()> {
    let path = worktree.join("queue/merge/active.md");
    std::fs::write(path, "")?;
    Ok(())
}
