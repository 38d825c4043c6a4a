//! Path pattern grammar for derivative file names.
//!
//! A pattern is made of literal text, required placeholders `{key}` and
//! optional groups `[...]`. An optional group is rendered only when every
//! placeholder it references has a value; otherwise the whole group,
//! including its literal text, is dropped.

use std::path::PathBuf;

use super::{Entity, EntityKey};
use crate::error::PatternError;

/// Naming grammar for derivative files.
pub const DERIVATIVE_PATTERN: &str = "fmripreproc/sub-{subject}/[ses-{session}/][{type}/]sub-{subject}[_ses-{session}][_task-{task}][_acq-{acquisition}][_rec-{reconstruction}][_run-{run}][_echo-{echo}][_dir-{direction}][_space-{space}][_desc-{desc}]_{suffix}.{ext}";

/// Naming grammar for derivative directories (registration transforms).
pub const DERIVATIVE_DIR_PATTERN: &str = "fmripreproc/sub-{subject}/[ses-{session}/][{type}/]sub-{subject}[_ses-{session}][_task-{task}][_acq-{acquisition}][_rec-{reconstruction}][_run-{run}][_desc-{desc}]_{suffix}/";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Key(EntityKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Required(EntityKey),
    Optional(Vec<Token>),
}

/// A parsed path template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Parses a pattern string.
    ///
    /// # Errors
    ///
    /// Returns `PatternError` for unbalanced or nested brackets, empty
    /// placeholders and placeholder names that are not entity keys.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        // (byte offset of '[', tokens collected so far)
        let mut optional: Option<(usize, Vec<Token>)> = None;
        let mut chars = pattern.char_indices();

        while let Some((position, ch)) = chars.next() {
            match ch {
                '[' => {
                    if optional.is_some() {
                        return Err(PatternError::NestedOptional {
                            pattern: pattern.to_string(),
                            position,
                        });
                    }
                    flush_literal(&mut literal, &mut segments, None);
                    optional = Some((position, Vec::new()));
                }
                ']' => {
                    let Some((_, mut tokens)) = optional.take() else {
                        return Err(PatternError::UnbalancedBracket {
                            pattern: pattern.to_string(),
                            bracket: ']',
                            position,
                        });
                    };
                    flush_literal(&mut literal, &mut segments, Some(&mut tokens));
                    segments.push(Segment::Optional(tokens));
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        name.push(inner);
                    }
                    if !closed {
                        return Err(PatternError::UnbalancedBracket {
                            pattern: pattern.to_string(),
                            bracket: '{',
                            position,
                        });
                    }
                    if name.trim().is_empty() {
                        return Err(PatternError::EmptyPlaceholder {
                            pattern: pattern.to_string(),
                            position,
                        });
                    }
                    let key = EntityKey::from_pattern_name(name.trim())
                        .ok_or_else(|| PatternError::UnknownKey(name.clone()))?;

                    match optional.as_mut() {
                        Some((_, tokens)) => {
                            flush_literal(&mut literal, &mut segments, Some(&mut *tokens));
                            tokens.push(Token::Key(key));
                        }
                        None => {
                            flush_literal(&mut literal, &mut segments, None);
                            segments.push(Segment::Required(key));
                        }
                    }
                }
                '}' => {
                    return Err(PatternError::UnbalancedBracket {
                        pattern: pattern.to_string(),
                        bracket: '}',
                        position,
                    });
                }
                other => literal.push(other),
            }
        }

        if let Some((position, _)) = optional {
            return Err(PatternError::UnbalancedBracket {
                pattern: pattern.to_string(),
                bracket: '[',
                position,
            });
        }
        flush_literal(&mut literal, &mut segments, None);

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    /// Returns the pattern text this was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Renders the relative path for `entity`.
    ///
    /// # Errors
    ///
    /// Returns `PatternError::MissingRequired` when a placeholder outside any
    /// optional group has no value.
    pub fn build(&self, entity: &Entity) -> Result<PathBuf, PatternError> {
        let mut rendered = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Required(key) => {
                    let value = entity
                        .value(*key)
                        .ok_or_else(|| PatternError::MissingRequired {
                            key: key.to_string(),
                        })?;
                    rendered.push_str(&value);
                }
                Segment::Optional(tokens) => {
                    if let Some(group) = render_group(tokens, entity) {
                        rendered.push_str(&group);
                    }
                }
            }
        }

        Ok(PathBuf::from(rendered))
    }
}

fn flush_literal(literal: &mut String, segments: &mut Vec<Segment>, tokens: Option<&mut Vec<Token>>) {
    if literal.is_empty() {
        return;
    }
    let text = std::mem::take(literal);
    match tokens {
        Some(tokens) => tokens.push(Token::Literal(text)),
        None => segments.push(Segment::Literal(text)),
    }
}

fn render_group(tokens: &[Token], entity: &Entity) -> Option<String> {
    let mut group = String::new();
    for token in tokens {
        match token {
            Token::Literal(text) => group.push_str(text),
            Token::Key(key) => group.push_str(&entity.value(*key)?),
        }
    }
    Some(group)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anat_entity() -> Entity {
        Entity::new()
            .with_subject("01")
            .with_datatype("anat")
            .with_space("T1w")
            .with_desc("brain")
            .with_suffix("T1w")
            .with_extension("nii.gz")
    }

    #[test]
    fn test_build_anatomical_path() {
        let pattern = PathPattern::parse(DERIVATIVE_PATTERN).unwrap();
        let path = pattern.build(&anat_entity()).unwrap();
        assert_eq!(
            path,
            PathBuf::from("fmripreproc/sub-01/anat/sub-01_space-T1w_desc-brain_T1w.nii.gz")
        );
    }

    #[test]
    fn test_build_functional_path_with_session() {
        let pattern = PathPattern::parse(DERIVATIVE_PATTERN).unwrap();
        let entity = Entity::new()
            .with_subject("01")
            .with_session("pre")
            .with_datatype("func")
            .with_task("rest")
            .with_acquisition("mb4")
            .with_run(2)
            .with_space("native")
            .with_desc("preproc")
            .with_suffix("bold")
            .with_extension("nii.gz");

        let path = pattern.build(&entity).unwrap();
        assert_eq!(
            path,
            PathBuf::from(
                "fmripreproc/sub-01/ses-pre/func/sub-01_ses-pre_task-rest_acq-mb4_run-02_space-native_desc-preproc_bold.nii.gz"
            )
        );
    }

    #[test]
    fn test_optional_segment_dropped_exactly() {
        let pattern = PathPattern::parse(DERIVATIVE_PATTERN).unwrap();
        let with_desc = pattern.build(&anat_entity()).unwrap();
        let mut without = anat_entity();
        without.desc = None;
        let without_desc = pattern.build(&without).unwrap();

        let with_desc = with_desc.to_string_lossy().to_string();
        let without_desc = without_desc.to_string_lossy().to_string();
        assert_eq!(with_desc.replace("_desc-brain", ""), without_desc);
    }

    #[test]
    fn test_empty_value_drops_segment() {
        let pattern = PathPattern::parse("sub-{subject}[_desc-{desc}]_{suffix}").unwrap();
        let entity = Entity::new()
            .with_subject("01")
            .with_desc("")
            .with_suffix("bold");
        assert_eq!(pattern.build(&entity).unwrap(), PathBuf::from("sub-01_bold"));
    }

    #[test]
    fn test_missing_required_key_fails() {
        let pattern = PathPattern::parse(DERIVATIVE_PATTERN).unwrap();
        let mut entity = anat_entity();
        entity.suffix = None;
        assert_eq!(
            pattern.build(&entity),
            Err(PatternError::MissingRequired {
                key: "suffix".to_string()
            })
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let pattern = PathPattern::parse(DERIVATIVE_PATTERN).unwrap();
        let first = pattern.build(&anat_entity()).unwrap();
        let second = pattern.build(&anat_entity()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_directory_pattern_keeps_trailing_slash() {
        let pattern = PathPattern::parse(DERIVATIVE_DIR_PATTERN).unwrap();
        let entity = Entity::new()
            .with_subject("01")
            .with_datatype("func")
            .with_task("rest")
            .with_run(1)
            .with_space("MNI152Nonlin2006")
            .with_suffix("reg");
        let path = pattern.build(&entity).unwrap();
        assert_eq!(
            path.to_string_lossy(),
            "fmripreproc/sub-01/func/sub-01_task-rest_run-01_reg/"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            PathPattern::parse("sub-{subject}[_run-{run}"),
            Err(PatternError::UnbalancedBracket { bracket: '[', .. })
        ));
        assert!(matches!(
            PathPattern::parse("sub-{subject}]"),
            Err(PatternError::UnbalancedBracket { bracket: ']', .. })
        ));
        assert!(matches!(
            PathPattern::parse("[a[b]]"),
            Err(PatternError::NestedOptional { .. })
        ));
        assert!(matches!(
            PathPattern::parse("sub-{}"),
            Err(PatternError::EmptyPlaceholder { .. })
        ));
        assert!(matches!(
            PathPattern::parse("sub-{subject"),
            Err(PatternError::UnbalancedBracket { bracket: '{', .. })
        ));
        assert_eq!(
            PathPattern::parse("{colour}"),
            Err(PatternError::UnknownKey("colour".to_string()))
        );
    }

    #[test]
    fn test_literal_only_group_always_rendered() {
        let pattern = PathPattern::parse("a[-b]_{suffix}").unwrap();
        let entity = Entity::new().with_suffix("x");
        assert_eq!(pattern.build(&entity).unwrap(), PathBuf::from("a-b_x"));
    }
}
