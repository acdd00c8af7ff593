//! Terminal stand-in for the profile page: an achievements box, a diff view,
//! toasts, and a visibility flag the user toggles.

use cfa_notify::{Achievement, AchievementDiff, AchievementSnapshot, PageHandle, Toaster};
use std::fmt::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Awarded to at most this fraction of users
const RARE_FRACTION: f64 = 0.001;

pub struct TerminalToaster;

impl Toaster for TerminalToaster {
    fn show_toast(&self, message: &str) {
        println!("\n  >> {}\n", message);
    }
}

/// Owns the visibility flag; coordinators get read-only handles.
pub struct TerminalPage {
    visible: watch::Sender<bool>,
}

impl TerminalPage {
    pub fn new(visible: bool) -> Self {
        let (visible, _) = watch::channel(visible);
        Self { visible }
    }

    pub fn handle(&self) -> PageHandle {
        PageHandle {
            visible: self.visible.subscribe(),
            toaster: Arc::new(TerminalToaster),
        }
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.send_replace(visible);
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }
}

/// A line typed into a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCommand {
    Show,
    Hide,
    Diff,
    Help,
    Quit,
}

impl FromStr for PageCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "show" => Ok(Self::Show),
            "hide" => Ok(Self::Hide),
            "diff" => Ok(Self::Diff),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" | "q" => Ok(Self::Quit),
            other => Err(format!("unknown command: {:?} (try `help`)", other)),
        }
    }
}

pub const HELP: &str = "\
commands:
  show   mark the page visible
  hide   mark the page hidden
  diff   show achievement changes since last viewed
  quit   stop this instance";

/// Rarer achievements first, like the profile box on the site.
pub fn render_box(snapshot: &AchievementSnapshot) -> String {
    let mut achievements: Vec<&Achievement> = snapshot.achievements.iter().collect();
    achievements.sort_by_key(|a| a.users_awarded);

    let mut out = format!("Achievements of {}\n", snapshot.handle);
    if achievements.is_empty() {
        out.push_str("  (none yet)\n");
    }
    for ach in achievements {
        let _ = writeln!(out, "  {}", brief_line(ach));
    }
    out
}

pub fn render_diff(diff: &AchievementDiff) -> String {
    let mut out = String::new();
    if !diff.added.is_empty() {
        out.push_str("New achievements:\n");
        for ach in &diff.added {
            let _ = writeln!(out, "  + {}", brief_line(ach));
        }
    }
    if !diff.removed.is_empty() {
        out.push_str("Lost achievements:\n");
        for ach in &diff.removed {
            let _ = writeln!(out, "  - {}", brief_line(ach));
        }
    }
    if out.is_empty() {
        out.push_str("No changes since last viewed\n");
    }
    out
}

fn brief_line(ach: &Achievement) -> String {
    let mut line = String::new();
    if ach.users_awarded_fraction <= RARE_FRACTION {
        line.push('*');
    } else {
        line.push(' ');
    }
    let _ = write!(line, " {}", ach.title);
    // Single grants carry no multiplier
    if ach.grant_infos.len() > 1 {
        let _ = write!(line, " x{}", ach.grant_infos.len());
    }
    let _ = write!(line, " ({:.2}%)", ach.users_awarded_fraction * 100.0);
    if !ach.brief.is_empty() {
        let _ = write!(line, " - {}", ach.brief);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ach(title: &str, users_awarded: u64, fraction: f64, grants: usize) -> Achievement {
        Achievement {
            title: title.to_string(),
            brief: format!("{} brief", title),
            users_awarded,
            users_awarded_fraction: fraction,
            grant_infos: (0..grants).map(|i| format!("grant {}", i)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_box_lists_rarer_first() {
        let snapshot = AchievementSnapshot {
            handle: "tourist".to_string(),
            achievements: vec![ach("Common", 5000, 0.5, 1), ach("Rare", 3, 0.0003, 2)],
        };
        let rendered = render_box(&snapshot);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Achievements of tourist");
        assert_eq!(lines[1], "  * Rare x2 (0.03%) - Rare brief");
        assert_eq!(lines[2], "    Common (50.00%) - Common brief");
    }

    #[test]
    fn test_empty_box() {
        let snapshot = AchievementSnapshot {
            handle: "newbie".to_string(),
            achievements: vec![],
        };
        assert!(render_box(&snapshot).contains("(none yet)"));
    }

    #[test]
    fn test_diff_sections() {
        let diff = AchievementDiff {
            added: vec![ach("Expert", 10, 0.01, 1)],
            removed: vec![],
            changed: true,
        };
        let rendered = render_diff(&diff);
        assert!(rendered.starts_with("New achievements:\n"));
        assert!(rendered.contains("+   Expert"));
        assert!(!rendered.contains("Lost achievements"));

        assert_eq!(
            render_diff(&AchievementDiff::default()),
            "No changes since last viewed\n"
        );
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("show".parse::<PageCommand>(), Ok(PageCommand::Show));
        assert_eq!(" HIDE \n".parse::<PageCommand>(), Ok(PageCommand::Hide));
        assert_eq!("q".parse::<PageCommand>(), Ok(PageCommand::Quit));
        assert!("dance".parse::<PageCommand>().is_err());
    }

    #[test]
    fn test_visibility_reaches_handles() {
        let page = TerminalPage::new(false);
        let handle = page.handle();
        assert!(!*handle.visible.borrow());

        page.set_visible(true);
        assert!(page.is_visible());
        assert!(*handle.visible.borrow());
    }
}
