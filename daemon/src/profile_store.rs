//! Persisted profiles and snapshot matching.
//!
//! Each profile lives in its own JSON document under the profiles directory.
//! The daemon only ever rewrites the `last_applied` timestamp; everything
//! else is authored by the layout editor.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::{MoniqueError, MonitorDescriptor, MonitorSnapshot, Profile};
use serde::{Deserialize, Serialize};

use crate::error::MatchNotFound;

/// How to choose among several fully matching profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Most recently applied first, never-applied last, then by name
    #[default]
    MostRecent,
    /// Lexical name order
    Lexical,
    /// Most monitors first, then as `MostRecent`
    MostSpecific,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
    tie_break: TieBreak,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>, tie_break: TieBreak) -> Self {
        Self {
            dir: dir.into(),
            tie_break,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<name>.json`, with path separators in the name replaced.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file = name.replace(['/', '\\'], "_");
        self.dir.join(format!("{}.json", file))
    }

    /// Every readable profile, sorted by name. Unreadable files are skipped.
    pub fn list(&self) -> Vec<Profile> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                log::warn!("Cannot read profiles from {}: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut profiles: Vec<Profile> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| match read_profile(&path) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    log::warn!("Skipping profile {}: {}", path.display(), e);
                    None
                }
            })
            .collect();

        profiles.sort_by(|a, b| a.name.cmp(&b.name));
        profiles
    }

    pub fn load(&self, name: &str) -> Result<Profile, MoniqueError> {
        let path = self.path_for(name);
        match read_profile(&path) {
            Err(MoniqueError::Io(_)) if !path.exists() => {
                Err(MoniqueError::NotFound(format!("profile '{}'", name)))
            }
            other => other,
        }
    }

    /// Validate and write atomically.
    pub fn save(&self, profile: &Profile) -> Result<(), MoniqueError> {
        profile.validate()?;
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&profile.name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(profile)?)?;
        fs::rename(&tmp, &path)?;

        log::debug!("Saved profile '{}' to {}", profile.name, path.display());
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), MoniqueError> {
        match fs::remove_file(self.path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(MoniqueError::NotFound(format!("profile '{}'", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn mark_applied(&self, name: &str, when: DateTime<Utc>) -> Result<(), MoniqueError> {
        let mut profile = self.load(name)?;
        profile.last_applied = Some(when);
        self.save(&profile)
    }

    /// The best stored profile fully satisfied by `snapshot`.
    pub fn find_match(&self, snapshot: &MonitorSnapshot) -> Result<Profile, MatchNotFound> {
        let profiles = self.list();

        for profile in &profiles {
            let (matched, required) = score(profile, snapshot);
            log::debug!("Profile '{}' matches {}/{}", profile.name, matched, required);
        }

        select(&profiles, snapshot, self.tie_break)
            .cloned()
            .ok_or(MatchNotFound)
    }
}

fn read_profile(path: &Path) -> Result<Profile, MoniqueError> {
    let contents = fs::read_to_string(path)?;
    let profile: Profile = serde_json::from_str(&contents)?;
    profile.validate()?;
    Ok(profile)
}

/// Pair each profile descriptor with a distinct snapshot monitor of the same
/// identity, preferring one on the same connector. Returns profile connector
/// to snapshot connector, or `None` if any descriptor is left unmatched.
pub fn assign(profile: &Profile, snapshot: &MonitorSnapshot) -> Option<BTreeMap<String, String>> {
    let (assigned, _) = assign_partial(profile, snapshot);
    (assigned.len() == profile.monitors.len()).then_some(assigned)
}

fn assign_partial(
    profile: &Profile,
    snapshot: &MonitorSnapshot,
) -> (BTreeMap<String, String>, usize) {
    let mut assigned = BTreeMap::new();
    let mut used = vec![false; snapshot.len()];

    // Same connector first so a second identical monitor cannot steal it
    for wanted in &profile.monitors {
        if let Some(i) = snapshot.monitors().iter().position(|m| {
            m.name == wanted.name && m.identity_key() == wanted.identity_key()
        }) {
            used[i] = true;
            assigned.insert(wanted.name.clone(), snapshot.monitors()[i].name.clone());
        }
    }

    for wanted in &profile.monitors {
        if assigned.contains_key(&wanted.name) {
            continue;
        }
        let monitors = snapshot.monitors();
        if let Some(i) = (0..monitors.len())
            .find(|&i| !used[i] && monitors[i].identity_key() == wanted.identity_key())
        {
            used[i] = true;
            assigned.insert(wanted.name.clone(), snapshot.monitors()[i].name.clone());
        }
    }

    let matched = assigned.len();
    (assigned, matched)
}

/// `(matched, required)` descriptor counts for a profile.
pub fn score(profile: &Profile, snapshot: &MonitorSnapshot) -> (usize, usize) {
    let (_, matched) = assign_partial(profile, snapshot);
    (matched, profile.monitors.len())
}

/// Pick among fully satisfied profiles. Deterministic for a given input.
pub fn select<'a>(
    profiles: &'a [Profile],
    snapshot: &MonitorSnapshot,
    tie_break: TieBreak,
) -> Option<&'a Profile> {
    profiles
        .iter()
        .filter(|p| assign(p, snapshot).is_some())
        .min_by(|a, b| rank(a, b, tie_break))
}

/// `Less` means `a` is preferred.
fn rank(a: &Profile, b: &Profile, tie_break: TieBreak) -> Ordering {
    let recent = |a: &Profile, b: &Profile| b.last_applied.cmp(&a.last_applied);
    let by_name = |a: &Profile, b: &Profile| a.name.cmp(&b.name);

    match tie_break {
        TieBreak::MostRecent => recent(a, b).then_with(|| by_name(a, b)),
        TieBreak::Lexical => by_name(a, b),
        TieBreak::MostSpecific => b
            .monitors
            .len()
            .cmp(&a.monitors.len())
            .then_with(|| recent(a, b))
            .then_with(|| by_name(a, b)),
    }
}

/// Rewrite a matched profile onto the snapshot's actual connector names.
/// Descriptors without a counterpart are dropped.
pub fn resolve_target(profile: &Profile, snapshot: &MonitorSnapshot) -> Vec<MonitorDescriptor> {
    let (assigned, _) = assign_partial(profile, snapshot);

    profile
        .monitors
        .iter()
        .filter_map(|wanted| {
            assigned.get(&wanted.name).map(|connector| MonitorDescriptor {
                name: connector.clone(),
                ..wanted.clone()
            })
        })
        .collect()
}
