//! Typed BIDS entities and derivative path construction.
//!
//! An [`Entity`] describes the BIDS identity of one file: subject, session,
//! task, run and so on. Entities are read from existing inputs, then a small
//! set of fields is overridden to describe an output artifact, and the result
//! is rendered through a [`PathPattern`] into a relative derivative path.
//!
//! ```rust,ignore
//! use fmripreproc::entity::{Entity, EntityOverrides, PathPattern, DERIVATIVE_PATTERN};
//!
//! let source = Entity::new().with_subject("01").with_task("rest").with_run(1);
//! let output = source.derive(
//!     &EntityOverrides::new().datatype("func").space("native").desc("preproc").suffix("bold"),
//! );
//! let pattern = PathPattern::parse(DERIVATIVE_PATTERN)?;
//! let path = pattern.build(&output)?;
//! ```

pub mod pattern;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use pattern::{PathPattern, DERIVATIVE_DIR_PATTERN, DERIVATIVE_PATTERN};

/// Keys that may appear in a path pattern or a BIDS file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Subject,
    Session,
    Datatype,
    Task,
    Acquisition,
    Reconstruction,
    Run,
    Echo,
    Direction,
    Space,
    Desc,
    Suffix,
    Extension,
}

impl EntityKey {
    /// Resolves a placeholder name used in path patterns (`{subject}`, `{type}`, ...).
    pub fn from_pattern_name(name: &str) -> Option<Self> {
        let key = match name {
            "subject" => EntityKey::Subject,
            "session" => EntityKey::Session,
            "type" | "datatype" => EntityKey::Datatype,
            "task" => EntityKey::Task,
            "acquisition" => EntityKey::Acquisition,
            "reconstruction" => EntityKey::Reconstruction,
            "run" => EntityKey::Run,
            "echo" => EntityKey::Echo,
            "direction" => EntityKey::Direction,
            "space" => EntityKey::Space,
            "desc" => EntityKey::Desc,
            "suffix" => EntityKey::Suffix,
            "ext" | "extension" => EntityKey::Extension,
            _ => return None,
        };
        Some(key)
    }

    /// Resolves the short label used in BIDS file names (`sub`, `ses`, `acq`, ...).
    pub fn from_bids_label(label: &str) -> Option<Self> {
        let key = match label {
            "sub" => EntityKey::Subject,
            "ses" => EntityKey::Session,
            "task" => EntityKey::Task,
            "acq" => EntityKey::Acquisition,
            "rec" => EntityKey::Reconstruction,
            "run" => EntityKey::Run,
            "echo" => EntityKey::Echo,
            "dir" => EntityKey::Direction,
            "space" => EntityKey::Space,
            "desc" => EntityKey::Desc,
            _ => return None,
        };
        Some(key)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKey::Subject => "subject",
            EntityKey::Session => "session",
            EntityKey::Datatype => "type",
            EntityKey::Task => "task",
            EntityKey::Acquisition => "acquisition",
            EntityKey::Reconstruction => "reconstruction",
            EntityKey::Run => "run",
            EntityKey::Echo => "echo",
            EntityKey::Direction => "direction",
            EntityKey::Space => "space",
            EntityKey::Desc => "desc",
            EntityKey::Suffix => "suffix",
            EntityKey::Extension => "extension",
        };
        f.write_str(name)
    }
}

/// BIDS identity of a single file.
///
/// Every field is optional; which ones are present depends on the file.
/// Empty strings are treated as absent everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub subject: Option<String>,
    pub session: Option<String>,
    /// BIDS datatype directory (`anat`, `func`, `fmap`), `{type}` in patterns.
    pub datatype: Option<String>,
    pub task: Option<String>,
    pub acquisition: Option<String>,
    pub reconstruction: Option<String>,
    pub run: Option<u32>,
    pub echo: Option<u32>,
    pub direction: Option<String>,
    pub space: Option<String>,
    pub desc: Option<String>,
    pub suffix: Option<String>,
    /// Extension without the leading dot (`nii.gz`, `tsv`).
    pub extension: Option<String>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Some(datatype.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_acquisition(mut self, acquisition: impl Into<String>) -> Self {
        self.acquisition = Some(acquisition.into());
        self
    }

    pub fn with_run(mut self, run: u32) -> Self {
        self.run = Some(run);
        self
    }

    pub fn with_echo(mut self, echo: u32) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Returns the rendered value for `key`, or `None` when absent or empty.
    ///
    /// `run` and `echo` are always rendered zero-padded to two digits.
    pub fn value(&self, key: EntityKey) -> Option<String> {
        let text = match key {
            EntityKey::Run => return self.run.map(|run| format!("{run:02}")),
            EntityKey::Echo => return self.echo.map(|echo| format!("{echo:02}")),
            EntityKey::Subject => self.subject.as_deref(),
            EntityKey::Session => self.session.as_deref(),
            EntityKey::Datatype => self.datatype.as_deref(),
            EntityKey::Task => self.task.as_deref(),
            EntityKey::Acquisition => self.acquisition.as_deref(),
            EntityKey::Reconstruction => self.reconstruction.as_deref(),
            EntityKey::Direction => self.direction.as_deref(),
            EntityKey::Space => self.space.as_deref(),
            EntityKey::Desc => self.desc.as_deref(),
            EntityKey::Suffix => self.suffix.as_deref(),
            EntityKey::Extension => self.extension.as_deref(),
        };
        text.filter(|value| !value.is_empty()).map(str::to_string)
    }

    /// Sets a field from its textual form, as found in a file name.
    ///
    /// Returns `false` when the value cannot be represented (a non-numeric run).
    pub fn set_text(&mut self, key: EntityKey, value: &str) -> bool {
        let value = value.trim();
        let text = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
        match key {
            EntityKey::Run | EntityKey::Echo => {
                let parsed = match text {
                    Some(ref raw) => match raw.parse::<u32>() {
                        Ok(number) => Some(number),
                        Err(_) => return false,
                    },
                    None => None,
                };
                if key == EntityKey::Run {
                    self.run = parsed;
                } else {
                    self.echo = parsed;
                }
            }
            EntityKey::Subject => self.subject = text,
            EntityKey::Session => self.session = text,
            EntityKey::Datatype => self.datatype = text,
            EntityKey::Task => self.task = text,
            EntityKey::Acquisition => self.acquisition = text,
            EntityKey::Reconstruction => self.reconstruction = text,
            EntityKey::Direction => self.direction = text,
            EntityKey::Space => self.space = text,
            EntityKey::Desc => self.desc = text,
            EntityKey::Suffix => self.suffix = text,
            EntityKey::Extension => self.extension = text,
        }
        true
    }

    /// Produces a new entity describing an output artifact.
    ///
    /// The source entity is left untouched.
    pub fn derive(&self, overrides: &EntityOverrides) -> Entity {
        let mut derived = self.clone();
        overrides.datatype.apply(&mut derived.datatype);
        overrides.space.apply(&mut derived.space);
        overrides.desc.apply(&mut derived.desc);
        overrides.suffix.apply(&mut derived.suffix);
        overrides.extension.apply(&mut derived.extension);
        derived
    }

    /// Canonical per-run key, `<task><run:02>` (e.g. `rest01`).
    ///
    /// Used for working-directory names and job names. Returns `None` for
    /// entities without a task.
    pub fn run_key(&self) -> Option<String> {
        let task = self.value(EntityKey::Task)?;
        Some(match self.value(EntityKey::Run) {
            Some(run) => format!("{task}{run}"),
            None => task,
        })
    }

    /// Whether `other` carries the same session, task, acquisition and run.
    pub fn same_acquisition(&self, other: &Entity) -> bool {
        self.session == other.session
            && self.task == other.task
            && self.acquisition == other.acquisition
            && self.run == other.run
    }
}

/// Override applied to a single entity field when deriving an output entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Override {
    #[default]
    Keep,
    Set(String),
    Clear,
}

impl Override {
    fn apply(&self, field: &mut Option<String>) {
        match self {
            Override::Keep => {}
            Override::Set(value) => *field = Some(value.clone()),
            Override::Clear => *field = None,
        }
    }
}

/// Field overrides used to describe an output artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityOverrides {
    pub datatype: Override,
    pub space: Override,
    pub desc: Override,
    pub suffix: Override,
    pub extension: Override,
}

impl EntityOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn datatype(mut self, datatype: impl Into<String>) -> Self {
        self.datatype = Override::Set(datatype.into());
        self
    }

    pub fn space(mut self, space: impl Into<String>) -> Self {
        self.space = Override::Set(space.into());
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Override::Set(desc.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Override::Set(suffix.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Override::Set(extension.into());
        self
    }

    pub fn clear_space(mut self) -> Self {
        self.space = Override::Clear;
        self
    }

    pub fn clear_desc(mut self) -> Self {
        self.desc = Override::Clear;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bold_entity() -> Entity {
        Entity::new()
            .with_subject("01")
            .with_datatype("func")
            .with_task("rest")
            .with_run(1)
            .with_suffix("bold")
            .with_extension("nii.gz")
    }

    #[test]
    fn test_run_is_zero_padded() {
        assert_eq!(
            Entity::new().with_run(1).value(EntityKey::Run),
            Some("01".to_string())
        );
        assert_eq!(
            Entity::new().with_run(12).value(EntityKey::Run),
            Some("12".to_string())
        );
        assert_eq!(
            Entity::new().with_echo(2).value(EntityKey::Echo),
            Some("02".to_string())
        );
    }

    #[test]
    fn test_empty_string_is_absent() {
        let entity = Entity::new().with_desc("");
        assert_eq!(entity.value(EntityKey::Desc), None);
    }

    #[test]
    fn test_derive_does_not_mutate_source() {
        let source = bold_entity();
        let derived = source.derive(
            &EntityOverrides::new()
                .space("native")
                .desc("preproc")
                .suffix("sbref"),
        );

        assert_eq!(source.space, None);
        assert_eq!(source.suffix.as_deref(), Some("bold"));
        assert_eq!(derived.space.as_deref(), Some("native"));
        assert_eq!(derived.desc.as_deref(), Some("preproc"));
        assert_eq!(derived.suffix.as_deref(), Some("sbref"));
        assert_eq!(derived.task, source.task);
    }

    #[test]
    fn test_derive_clear() {
        let source = bold_entity().with_desc("preproc").with_space("native");
        let derived = source.derive(&EntityOverrides::new().clear_desc().clear_space());
        assert_eq!(derived.desc, None);
        assert_eq!(derived.space, None);
    }

    #[test]
    fn test_run_key() {
        assert_eq!(bold_entity().run_key(), Some("rest01".to_string()));
        assert_eq!(
            Entity::new().with_task("motor").run_key(),
            Some("motor".to_string())
        );
        assert_eq!(Entity::new().with_run(3).run_key(), None);
    }

    #[test]
    fn test_set_text_rejects_non_numeric_run() {
        let mut entity = Entity::new();
        assert!(!entity.set_text(EntityKey::Run, "first"));
        assert!(entity.set_text(EntityKey::Run, "02"));
        assert_eq!(entity.run, Some(2));
    }

    #[test]
    fn test_key_lookup() {
        assert_eq!(EntityKey::from_pattern_name("type"), Some(EntityKey::Datatype));
        assert_eq!(EntityKey::from_pattern_name("ext"), Some(EntityKey::Extension));
        assert_eq!(EntityKey::from_pattern_name("bogus"), None);
        assert_eq!(EntityKey::from_bids_label("dir"), Some(EntityKey::Direction));
        assert_eq!(EntityKey::from_bids_label("sub"), Some(EntityKey::Subject));
    }

    #[test]
    fn test_same_acquisition() {
        let raw = bold_entity();
        let preproc = raw.derive(&EntityOverrides::new().space("native").desc("preproc"));
        assert!(raw.same_acquisition(&preproc));
        assert!(!raw.same_acquisition(&raw.clone().with_run(2)));
    }
}
