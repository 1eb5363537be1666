//! Mapping document loader (TOML ingestion, aggregation).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use trackpads_errors::{usage, ErrorCode, TrackResult};

use crate::mapping::model::{
    Algorithm, DefaultHooks, Hook, MappingDocument, MappingMeta, MappingSource,
};
use crate::mapping::selector::HookSelector;

/// Helper aggregating inline and file sources into loaded documents.
#[derive(Default)]
pub struct MappingAggregator {
    documents: Vec<MappingDocument>,
}

impl MappingAggregator {
    /// Ingest a mapping document from the filesystem.
    pub fn ingest_file(&mut self, path: &Path) -> TrackResult<()> {
        let contents = fs::read_to_string(path).map_err(|err| {
            usage!(
                ErrorCode::InvalidMapping,
                "failed to read mapping document '{}': {}",
                path.display(),
                err
            )
        })?;
        self.ingest_source(path, &contents)
    }

    /// Ingest an inline mapping document (used for builtin defaults).
    pub fn ingest_inline(&mut self, label: &str, contents: &str) -> TrackResult<()> {
        let pseudo_path = PathBuf::from(format!("<inline:{label}>"));
        self.ingest_source(&pseudo_path, contents)
    }

    /// Finalize the aggregation.
    pub fn finish(self) -> Vec<MappingDocument> {
        self.documents
    }

    fn ingest_source(&mut self, path: &Path, contents: &str) -> TrackResult<()> {
        let checksum = calculate_sha256(contents);
        let raw: RawMappingFile = toml::from_str(contents).map_err(|err| {
            usage!(
                ErrorCode::InvalidMapping,
                "failed to parse mapping document '{}': {}",
                path.display(),
                err
            )
        })?;

        let meta = parse_meta(&raw.metadata, path)?;
        let default_hooks = Arc::new(parse_default_hooks(raw.default_hooks.as_ref(), path)?);
        let algorithms = parse_algorithms(&raw.algorithms, path)?;

        self.documents.push(MappingDocument {
            meta,
            default_hooks,
            algorithms,
            source: MappingSource {
                path: path.to_path_buf(),
                sha256: checksum,
            },
        });
        Ok(())
    }
}

pub(crate) fn calculate_sha256(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)
}

fn parse_meta(raw: &RawMeta, path: &Path) -> TrackResult<MappingMeta> {
    if raw.library.trim().is_empty() {
        return Err(usage!(
            ErrorCode::InvalidMapping,
            "'metadata.library' must not be empty in '{}'",
            path.display()
        ));
    }
    Ok(MappingMeta {
        author: raw.author.clone().unwrap_or_default(),
        library: raw.library.clone(),
        library_version: raw.library_version.clone(),
        mapping_version: raw.mapping_version.clone(),
    })
}

fn parse_default_hooks(raw: Option<&RawDefaultHooks>, path: &Path) -> TrackResult<DefaultHooks> {
    let Some(raw) = raw else {
        return Ok(DefaultHooks::default());
    };
    Ok(DefaultHooks {
        modules: parse_hook_table(raw.modules.as_ref().and_then(|g| g.fns.as_ref()), path)?,
        classes: parse_hook_table(raw.classes.as_ref().and_then(|g| g.fns.as_ref()), path)?,
        fns: parse_hook_table(raw.fns.as_ref().and_then(|g| g.fns.as_ref()), path)?,
    })
}

fn parse_hook_table(
    raw: Option<&BTreeMap<String, RawSelector>>,
    path: &Path,
) -> TrackResult<Vec<Hook>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut hooks = Vec::with_capacity(raw.len());
    for (event, selector) in raw {
        hooks.push(Hook::new(event.clone(), parse_selector(selector, event, path)?));
    }
    Ok(hooks)
}

fn parse_selector(raw: &RawSelector, event: &str, path: &Path) -> TrackResult<HookSelector> {
    let parsed = match raw {
        RawSelector::Token(token) => HookSelector::parse_token(token),
        RawSelector::List(tokens) => HookSelector::parse_list(tokens),
    };
    parsed.map_err(|err| {
        usage!(
            ErrorCode::InvalidMapping,
            "invalid selector for hook '{}' in '{}': {}",
            event,
            path.display(),
            err
        )
    })
}

fn parse_algorithms(raw_algorithms: &[RawAlgorithm], path: &Path) -> TrackResult<Vec<Algorithm>> {
    let mut algorithms = Vec::with_capacity(raw_algorithms.len());
    for (idx, raw) in raw_algorithms.iter().enumerate() {
        let location = format!("{} algorithms[{}]", path.display(), idx);
        if raw.name.trim().is_empty() {
            return Err(usage!(
                ErrorCode::InvalidMapping,
                "'name' must not be empty in {}",
                location
            ));
        }
        if raw.implementation.is_empty() {
            return Err(usage!(
                ErrorCode::InvalidMapping,
                "algorithm '{}' declares no implementation references in {}",
                raw.name,
                location
            ));
        }
        let hooks = parse_hook_table(raw.hooks.as_ref(), path)?;
        algorithms.push(Algorithm {
            name: raw.name.clone(),
            other_names: raw.other_names.clone(),
            implementation: raw.implementation.clone(),
            hooks,
        });
    }
    Ok(algorithms)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMappingFile {
    metadata: RawMeta,
    #[serde(default)]
    default_hooks: Option<RawDefaultHooks>,
    #[serde(default)]
    algorithms: Vec<RawAlgorithm>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMeta {
    #[serde(default)]
    author: Option<String>,
    library: String,
    library_version: String,
    mapping_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefaultHooks {
    #[serde(default)]
    modules: Option<RawGranularity>,
    #[serde(default)]
    classes: Option<RawGranularity>,
    #[serde(default)]
    fns: Option<RawGranularity>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGranularity {
    #[serde(default)]
    fns: Option<BTreeMap<String, RawSelector>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAlgorithm {
    name: String,
    #[serde(default)]
    other_names: Vec<String>,
    implementation: BTreeMap<String, String>,
    #[serde(default)]
    hooks: Option<BTreeMap<String, RawSelector>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSelector {
    Token(String),
    List(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::model::Granularity;

    const SAMPLE: &str = r#"
[metadata]
author = "trackpads"
library = "sklearn"
library_version = "0.21"
mapping_version = "1"

[default_hooks.classes.fns]
pads_init = ["init"]

[default_hooks.fns.fns]
pads_log = "always"

[[algorithms]]
name = "decision tree"
other_names = ["dtree"]

[algorithms.implementation]
sklearn = "sklearn.tree.DecisionTreeClassifier"

[algorithms.hooks]
pads_fit = ["fit"]
pads_predict = ["predict", "predict_proba"]
"#;

    #[test]
    fn parses_sample_document() {
        let mut aggregator = MappingAggregator::default();
        aggregator
            .ingest_inline("sample", SAMPLE)
            .expect("ingest sample");
        let documents = aggregator.finish();
        assert_eq!(documents.len(), 1);

        let document = &documents[0];
        assert_eq!(document.meta.library, "sklearn");
        assert_eq!(document.source.path, PathBuf::from("<inline:sample>"));
        assert_eq!(document.source.sha256.len(), 64);
        assert_eq!(
            document.default_hooks.for_granularity(Granularity::Class).len(),
            1
        );

        let mappings = document.target_mappings().expect("resolve mappings");
        assert_eq!(mappings.len(), 1);
        let mapping = &mappings[0];
        assert_eq!(mapping.reference, "sklearn.tree.DecisionTreeClassifier");
        assert_eq!(mapping.hooks.len(), 2);
        assert!(mapping
            .hooks
            .iter()
            .any(|h| h.event == "pads_predict" && h.is_applicable("predict_proba")));
    }

    #[test]
    fn rejects_algorithm_without_implementation() {
        let broken = r#"
[metadata]
library = "lib"
library_version = "1"
mapping_version = "1"

[[algorithms]]
name = "empty"
[algorithms.implementation]
"#;
        let mut aggregator = MappingAggregator::default();
        let err = aggregator
            .ingest_inline("broken", broken)
            .expect_err("should reject");
        assert_eq!(err.code, ErrorCode::InvalidMapping);
    }

    #[test]
    fn rejects_unknown_fields() {
        let broken = r#"
[metadata]
library = "lib"
library_version = "1"
mapping_version = "1"
surprise = true
"#;
        let mut aggregator = MappingAggregator::default();
        let err = aggregator
            .ingest_inline("broken", broken)
            .expect_err("should reject unknown field");
        assert_eq!(err.code, ErrorCode::InvalidMapping);
    }

    #[test]
    fn missing_file_reports_path() {
        let mut aggregator = MappingAggregator::default();
        let err = aggregator
            .ingest_file(Path::new("/nonexistent/mapping.toml"))
            .expect_err("missing file");
        assert!(err.message().contains("/nonexistent/mapping.toml"));
    }
}
