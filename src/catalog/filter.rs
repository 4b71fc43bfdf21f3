//! Subject filters

use super::{CatalogError, Subject};
use regex::Regex;

/// Narrows a subject list.
///
/// A subject is kept when it matches any include pattern (or there are
/// none), matches no exclude pattern, and matches `grep` when set. Globs
/// support `*` and are tested against the key, the title and the name.
#[derive(Debug, Clone, Default)]
pub struct SubjectFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    grep: Option<Regex>,
}

fn glob_to_regex(pattern: &str) -> Result<Regex, CatalogError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    Regex::new(&format!("^{}$", body)).map_err(|e| CatalogError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

impl SubjectFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S], grep: Option<&str>) -> Result<Self, CatalogError> {
        let include = include
            .iter()
            .map(|p| glob_to_regex(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let exclude = exclude
            .iter()
            .map(|p| glob_to_regex(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let grep = grep
            .map(|g| {
                Regex::new(g).map_err(|e| CatalogError::InvalidPattern {
                    pattern: g.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self { include, exclude, grep })
    }

    /// Filter that keeps everything
    pub fn all() -> Self {
        Self::default()
    }

    fn any_field(patterns: &[Regex], subject: &Subject) -> bool {
        patterns.iter().any(|p| {
            p.is_match(&subject.key) || p.is_match(&subject.title) || p.is_match(&subject.name)
        })
    }

    pub fn matches(&self, subject: &Subject) -> bool {
        if Self::any_field(&self.exclude, subject) {
            return false;
        }
        if !self.include.is_empty() && !Self::any_field(&self.include, subject) {
            return false;
        }
        match &self.grep {
            Some(grep) => {
                grep.is_match(&subject.key) || grep.is_match(&subject.display_name())
            }
            None => true,
        }
    }

    pub fn apply(&self, subjects: Vec<Subject>) -> Vec<Subject> {
        subjects.into_iter().filter(|s| self.matches(s)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects() -> Vec<Subject> {
        vec![
            Subject::new("forms-button--primary", "Forms/Button", "Primary"),
            Subject::new("forms-button--secondary", "Forms/Button", "Secondary"),
            Subject::new("layout-card--default", "Layout/Card", "Default"),
        ]
    }

    fn keys(subjects: &[Subject]) -> Vec<&str> {
        subjects.iter().map(|s| s.key.as_str()).collect()
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        assert_eq!(SubjectFilter::all().apply(subjects()).len(), 3);
    }

    #[test]
    fn test_include_glob() {
        let filter = SubjectFilter::new(&["forms-*"], &[], None).unwrap();
        assert_eq!(
            keys(&filter.apply(subjects())),
            vec!["forms-button--primary", "forms-button--secondary"]
        );
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = SubjectFilter::new(&["forms-*"], &["*--secondary"], None).unwrap();
        assert_eq!(keys(&filter.apply(subjects())), vec!["forms-button--primary"]);
    }

    #[test]
    fn test_glob_matches_title() {
        let filter = SubjectFilter::new(&["Layout/*"], &[], None).unwrap();
        assert_eq!(keys(&filter.apply(subjects())), vec!["layout-card--default"]);
    }

    #[test]
    fn test_glob_escapes_regex_characters() {
        let filter = SubjectFilter::new(&["forms.button*"], &[], None).unwrap();
        assert!(filter.apply(subjects()).is_empty());
    }

    #[test]
    fn test_grep() {
        let filter = SubjectFilter::new::<&str>(&[], &[], Some("(?i)secondary|card")).unwrap();
        assert_eq!(
            keys(&filter.apply(subjects())),
            vec!["forms-button--secondary", "layout-card--default"]
        );
    }

    #[test]
    fn test_invalid_grep_is_rejected() {
        let err = SubjectFilter::new::<&str>(&[], &[], Some("(unclosed")).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidPattern { .. }));
    }
}
