use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single achievement as returned by the achievements API.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Achievement {
    /// Unique within a snapshot; the only field diffs look at
    pub title: String,
    #[serde(default)]
    pub brief: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_url: String,
    #[serde(default)]
    pub users_awarded: u64,
    #[serde(default)]
    pub users_awarded_fraction: f64,
    #[serde(default)]
    pub grant_infos: Vec<String>,
}

/// All achievements of one user as of one fetch.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AchievementSnapshot {
    pub handle: String,
    pub achievements: Vec<Achievement>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AchievementDiff {
    pub added: Vec<Achievement>,
    pub removed: Vec<Achievement>,
    pub changed: bool,
}

/// Returns what is in `new` but not in `old` and vice versa, keyed by title.
pub fn calculate_diffs(old: &[Achievement], new: &[Achievement]) -> AchievementDiff {
    let added = not_in_a_but_in_b(old, new);
    let removed = not_in_a_but_in_b(new, old);
    let changed = !added.is_empty() || !removed.is_empty();
    AchievementDiff {
        added,
        removed,
        changed,
    }
}

fn not_in_a_but_in_b(a: &[Achievement], b: &[Achievement]) -> Vec<Achievement> {
    let titles: HashSet<&str> = a.iter().map(|ach| ach.title.as_str()).collect();
    b.iter()
        .filter(|ach| !titles.contains(ach.title.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ach(title: &str) -> Achievement {
        Achievement {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn titles(achs: &[Achievement]) -> Vec<&str> {
        achs.iter().map(|a| a.title.as_str()).collect()
    }

    #[test]
    fn test_identical_lists_are_unchanged() {
        let a = vec![ach("Rated"), ach("Expert")];
        let diff = calculate_diffs(&a, &a);
        assert!(!diff.changed);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_added_and_removed() {
        let old = vec![ach("Rated"), ach("Pupil")];
        let new = vec![ach("Rated"), ach("Specialist"), ach("Hacker")];
        let diff = calculate_diffs(&old, &new);
        assert!(diff.changed);
        assert_eq!(titles(&diff.added), vec!["Specialist", "Hacker"]);
        assert_eq!(titles(&diff.removed), vec!["Pupil"]);
    }

    #[test]
    fn test_diff_is_symmetric() {
        let a = vec![ach("x"), ach("y"), ach("z")];
        let b = vec![ach("y"), ach("w")];
        let ab = calculate_diffs(&a, &b);
        let ba = calculate_diffs(&b, &a);
        assert_eq!(ab.added, ba.removed);
        assert_eq!(ab.removed, ba.added);
        assert_eq!(ab.changed, ba.changed);
    }

    #[test]
    fn test_only_title_matters() {
        let old = vec![Achievement {
            title: "Rated".to_string(),
            users_awarded: 10,
            brief: "old".to_string(),
            ..Default::default()
        }];
        let new = vec![Achievement {
            title: "Rated".to_string(),
            users_awarded: 11,
            brief: "new".to_string(),
            ..Default::default()
        }];
        assert!(!calculate_diffs(&old, &new).changed);
    }

    #[test]
    fn test_snapshot_from_api_json() {
        let json = r#"{
            "handle": "tourist",
            "achievements": [{
                "title": "Legendary",
                "brief": "Reach 3000",
                "description": "Reach a rating of 3000",
                "icon_url": "https://example.com/i.png",
                "users_awarded": 12,
                "users_awarded_fraction": 0.0001,
                "grant_infos": ["Round 1"]
            }]
        }"#;
        let snapshot: AchievementSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.handle, "tourist");
        assert_eq!(snapshot.achievements[0].icon_url, "https://example.com/i.png");
        assert_eq!(snapshot.achievements[0].grant_infos, vec!["Round 1"]);
    }
}
