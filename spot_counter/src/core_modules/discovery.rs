// THEORY:
// Discovery turns a folder tree into addressable work. The root holds one folder
// per sample; each folder holds one photograph per depth, and the depth is only
// recoverable from the file name. The operator describes the naming scheme with
// a small template such as `scan_$value\.jpg`, where `$value` stands for the
// depth string.
//
// Key architectural principles:
// 1.  **Template, Then Regex**: The depth is escaped before substitution, so a
//     depth like `1.5` only ever matches a literal `1.5`. The substituted pattern
//     must match the whole file name.
// 2.  **Deterministic Listing**: Sample folders and file names are sorted, so the
//     table rows and the choice among ambiguous matches are stable across runs.
// 3.  **Issues, Not Guesses**: A depth with no matching file is reported as
//     missing and skipped. It is never treated as an empty photograph.

use crate::error::DiscoveryError;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

/// File extensions counted by the image survey.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Value,
}

/// A filename template with `$value` (or `${value}`) standing for the depth.
/// `$$` is a literal `$`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenamePattern {
    template: String,
    pieces: Vec<Piece>,
}

impl FilenamePattern {
    pub fn new(template: impl Into<String>) -> Result<Self, DiscoveryError> {
        let template = template.into();
        let invalid = |reason: &str| DiscoveryError::InvalidTemplate {
            template: template.clone(),
            reason: reason.to_string(),
        };

        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut rest = template.as_str();
        while let Some(position) = rest.find('$') {
            literal.push_str(&rest[..position]);
            let after = &rest[position + 1..];
            if let Some(tail) = after.strip_prefix('$') {
                literal.push('$');
                rest = tail;
                continue;
            }
            rest = after
                .strip_prefix("{value}")
                .or_else(|| after.strip_prefix("value"))
                .ok_or_else(|| invalid("`$` must be followed by `value`, `{value}` or `$`"))?;
            if !literal.is_empty() {
                pieces.push(Piece::Literal(std::mem::take(&mut literal)));
            }
            pieces.push(Piece::Value);
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            pieces.push(Piece::Literal(literal));
        }

        if !pieces.contains(&Piece::Value) {
            return Err(invalid("the template never mentions `$value`"));
        }
        Ok(Self { template, pieces })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// The template with `depth` substituted, before anchoring.
    pub fn substitute(&self, depth: &str) -> String {
        let escaped = regex::escape(depth);
        self.pieces
            .iter()
            .map(|piece| match piece {
                Piece::Literal(text) => text.as_str(),
                Piece::Value => escaped.as_str(),
            })
            .collect()
    }

    /// Full-match regex for one depth.
    pub fn regex_for(&self, depth: &str) -> Result<Regex, DiscoveryError> {
        Regex::new(&format!("^(?:{})$", self.substitute(depth))).map_err(|source| {
            DiscoveryError::Regex {
                depth: depth.to_string(),
                source,
            }
        })
    }
}

/// Outcome of looking up one depth in a sample folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Unique(PathBuf),
    /// Several names matched; `chosen` is the first in sorted order.
    Ambiguous {
        chosen: PathBuf,
        candidates: Vec<String>,
    },
    Missing,
}

/// A sample folder and its sorted file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFolder {
    pub name: String,
    pub path: PathBuf,
    files: Vec<String>,
}

impl SampleFolder {
    pub fn scan(path: impl Into<PathBuf>) -> Result<Self, DiscoveryError> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut files = Vec::new();
        for entry in read_dir(&path)? {
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                files.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        files.sort();
        Ok(Self { name, path, files })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn resolve(&self, pattern: &Regex) -> Resolution {
        let matches: Vec<&String> = self.files.iter().filter(|f| pattern.is_match(f)).collect();
        match matches.as_slice() {
            [] => Resolution::Missing,
            [only] => Resolution::Unique(self.path.join(only)),
            [first, ..] => Resolution::Ambiguous {
                chosen: self.path.join(first),
                candidates: matches.iter().map(|m| m.to_string()).collect(),
            },
        }
    }

    pub fn image_count(&self) -> usize {
        self.files.iter().filter(|f| is_image_file(f)).count()
    }
}

fn read_dir(path: &Path) -> Result<Vec<std::fs::DirEntry>, DiscoveryError> {
    let io_error = |source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::read_dir(path)
        .map_err(io_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)
}

/// Every non-hidden sub-folder of `root`, sorted by name.
pub fn sample_directories(root: &Path) -> Result<Vec<SampleFolder>, DiscoveryError> {
    let mut paths: Vec<PathBuf> = read_dir(root)?
        .into_iter()
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths.into_iter().map(SampleFolder::scan).collect()
}

pub fn is_image_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Folders whose image count differs from `expected`, with their actual count.
pub fn survey_image_counts(folders: &[SampleFolder], expected: usize) -> Vec<(String, usize)> {
    folders
        .iter()
        .map(|folder| (folder.name.clone(), folder.image_count()))
        .filter(|(_, count)| *count != expected)
        .collect()
}

/// A `(sample, depth)` cell that could not be mapped to exactly one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveIssue {
    Missing {
        sample: String,
        depth: String,
    },
    Ambiguous {
        sample: String,
        depth: String,
        candidates: Vec<String>,
    },
}

impl fmt::Display for ResolveIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { sample, depth } => {
                write!(f, "{sample}: no file for depth {depth}")
            }
            Self::Ambiguous {
                sample,
                depth,
                candidates,
            } => write!(
                f,
                "{sample}: depth {depth} matches {} files ({}), using the first",
                candidates.len(),
                candidates.join(", ")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn depth_is_escaped_before_substitution() {
        let pattern = FilenamePattern::new(r"img_$value\.png").unwrap();
        assert_eq!(pattern.substitute("1.5"), r"img_1\.5\.png");

        let regex = pattern.regex_for("1.5").unwrap();
        assert!(regex.is_match("img_1.5.png"));
        assert!(!regex.is_match("img_1x5.png"));
        assert!(!regex.is_match("old_img_1.5.png"));
        assert!(!regex.is_match("img_1.5.png.bak"));
    }

    #[test]
    fn braced_token_and_literal_dollar() {
        let pattern = FilenamePattern::new(r"${value}mm_$$\.jpg").unwrap();
        assert_eq!(pattern.substitute("30"), r"30mm_$\.jpg");

        let pattern = FilenamePattern::new(r"d$value|depth$value").unwrap();
        let regex = pattern.regex_for("7").unwrap();
        assert!(regex.is_match("d7"));
        assert!(regex.is_match("depth7"));
        assert!(!regex.is_match("d7x"));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(matches!(
            FilenamePattern::new("img_$depth.png"),
            Err(DiscoveryError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            FilenamePattern::new("img.png"),
            Err(DiscoveryError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            FilenamePattern::new("img_$value(").unwrap().regex_for("1"),
            Err(DiscoveryError::Regex { .. })
        ));
    }

    #[test]
    fn sample_folders_are_sorted_and_hidden_ones_skipped() {
        let root = tempfile::tempdir().unwrap();
        for name in ["beta", "alpha", ".cache"] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        fs::write(root.path().join("results.csv"), "").unwrap();
        fs::write(root.path().join("alpha").join("b.png"), "").unwrap();
        fs::write(root.path().join("alpha").join("a.JPG"), "").unwrap();
        fs::write(root.path().join("alpha").join("notes.txt"), "").unwrap();

        let folders = sample_directories(root.path()).unwrap();
        let names: Vec<&str> = folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(folders[0].files(), &["a.JPG", "b.png", "notes.txt"]);
        assert_eq!(folders[0].image_count(), 2);

        let survey = survey_image_counts(&folders, 2);
        assert_eq!(survey, vec![("beta".to_string(), 0)]);
    }

    #[test]
    fn resolution_reports_missing_and_ambiguous_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["s_10_b.png", "s_10_a.png", "s_20.png"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let folder = SampleFolder::scan(dir.path()).unwrap();
        let pattern = FilenamePattern::new(r"s_$value(_.)?\.png").unwrap();

        assert_eq!(
            folder.resolve(&pattern.regex_for("20").unwrap()),
            Resolution::Unique(dir.path().join("s_20.png"))
        );
        assert_eq!(
            folder.resolve(&pattern.regex_for("10").unwrap()),
            Resolution::Ambiguous {
                chosen: dir.path().join("s_10_a.png"),
                candidates: vec!["s_10_a.png".into(), "s_10_b.png".into()],
            }
        );
        assert_eq!(folder.resolve(&pattern.regex_for("30").unwrap()), Resolution::Missing);
    }

    #[test]
    fn image_extensions_ignore_case() {
        assert!(is_image_file("a.JPEG"));
        assert!(is_image_file("b.Png"));
        assert!(!is_image_file("c.tif"));
        assert!(!is_image_file("png"));
    }
}
