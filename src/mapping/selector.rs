//! Member selectors used by hook declarations.

use globset::{Glob, GlobMatcher};
use regex::Regex;
use trackpads_errors::{usage, ErrorCode, TrackResult};

/// Decides which members of a container a hook applies to.
///
/// The textual forms mirror the mapping document grammar: the literal
/// `"always"`, a plain member name, or a `glob:`/`regex:` prefixed pattern.
#[derive(Debug, Clone)]
pub enum HookSelector {
    /// Applies to every member.
    Always,
    /// Applies to members named exactly.
    Names(Vec<String>),
    /// Applies to members matching a glob pattern.
    Glob(GlobMatcher),
    /// Applies to members matching a regular expression.
    Regex(Regex),
}

impl HookSelector {
    /// Parse a single selector token.
    pub fn parse_token(token: &str) -> TrackResult<Self> {
        if token == "always" {
            return Ok(HookSelector::Always);
        }
        if let Some(pattern) = token.strip_prefix("glob:") {
            let matcher = Glob::new(pattern)
                .map_err(|err| {
                    usage!(
                        ErrorCode::InvalidMapping,
                        "invalid glob selector '{}': {}",
                        pattern,
                        err
                    )
                })?
                .compile_matcher();
            return Ok(HookSelector::Glob(matcher));
        }
        if let Some(pattern) = token.strip_prefix("regex:") {
            let regex = Regex::new(pattern).map_err(|err| {
                usage!(
                    ErrorCode::InvalidMapping,
                    "invalid regex selector '{}': {}",
                    pattern,
                    err
                )
            })?;
            return Ok(HookSelector::Regex(regex));
        }
        Ok(HookSelector::Names(vec![token.to_string()]))
    }

    /// Parse a selector from a list of tokens. Name tokens collapse into a
    /// single `Names` set; pattern tokens must stand alone.
    pub fn parse_list(tokens: &[String]) -> TrackResult<Self> {
        if tokens.is_empty() {
            return Err(usage!(
                ErrorCode::InvalidMapping,
                "hook selector list must not be empty"
            ));
        }
        if tokens.len() == 1 {
            return Self::parse_token(&tokens[0]);
        }
        let mut names = Vec::with_capacity(tokens.len());
        for token in tokens {
            match Self::parse_token(token)? {
                HookSelector::Names(mut parsed) => names.append(&mut parsed),
                other => {
                    return Err(usage!(
                        ErrorCode::InvalidMapping,
                        "selector '{}' ({:?}) cannot be combined with plain names",
                        token,
                        other_kind(&other)
                    ));
                }
            }
        }
        Ok(HookSelector::Names(names))
    }

    /// True when the selector covers `member`.
    pub fn matches(&self, member: &str) -> bool {
        match self {
            HookSelector::Always => true,
            HookSelector::Names(names) => names.iter().any(|n| n == member),
            HookSelector::Glob(glob) => glob.is_match(member),
            HookSelector::Regex(regex) => regex.is_match(member),
        }
    }
}

fn other_kind(selector: &HookSelector) -> &'static str {
    match selector {
        HookSelector::Always => "always",
        HookSelector::Names(_) => "names",
        HookSelector::Glob(_) => "glob",
        HookSelector::Regex(_) => "regex",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_matches_everything() {
        let selector = HookSelector::parse_token("always").expect("parse");
        assert!(selector.matches("fit"));
        assert!(selector.matches("anything_else"));
    }

    #[test]
    fn name_lists_collapse() {
        let tokens = vec!["fit".to_string(), "predict".to_string()];
        let selector = HookSelector::parse_list(&tokens).expect("parse");
        assert!(selector.matches("fit"));
        assert!(selector.matches("predict"));
        assert!(!selector.matches("transform"));
    }

    #[test]
    fn glob_selector_matches_prefix() {
        let selector = HookSelector::parse_token("glob:fit*").expect("parse");
        assert!(selector.matches("fit"));
        assert!(selector.matches("fit_transform"));
        assert!(!selector.matches("predict"));
    }

    #[test]
    fn regex_selector_is_anchorable() {
        let selector = HookSelector::parse_token("regex:^(fit|predict)$").expect("parse");
        assert!(selector.matches("predict"));
        assert!(!selector.matches("predict_proba"));
    }

    #[test]
    fn mixed_pattern_and_names_rejected() {
        let tokens = vec!["fit".to_string(), "glob:pre*".to_string()];
        let err = HookSelector::parse_list(&tokens).expect_err("should reject mix");
        assert_eq!(err.code, ErrorCode::InvalidMapping);
    }
}
