//! Route templates with `{name}` placeholders.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ApiError, Result};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^}]+)\}").expect("placeholder pattern is valid"));

/// A route such as `/auteurs/{id_author}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
    raw: String,
    placeholders: Vec<String>,
}

impl RouteTemplate {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut placeholders: Vec<String> = Vec::new();
        for capture in PLACEHOLDER.captures_iter(&raw) {
            let name = capture[1].to_string();
            if !placeholders.contains(&name) {
                placeholders.push(name);
            }
        }
        Self { raw, placeholders }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Placeholder names in declaration order, without duplicates.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Binds `args` to placeholders by position.
    ///
    /// Surplus arguments are ignored. Missing ones are an error unless
    /// `allow_unresolved` is set, in which case the placeholder stays literal.
    pub fn format(&self, args: &[String], allow_unresolved: bool) -> Result<String> {
        if args.len() < self.placeholders.len() && !allow_unresolved {
            let missing = self.placeholders[args.len()..].join(", ");
            return Err(ApiError::configuration(format!(
                "route {} is missing values for: {}",
                self.raw, missing
            )));
        }

        let mut route = self.raw.clone();
        for (name, value) in self.placeholders.iter().zip(args) {
            route = route.replace(&format!("{{{name}}}"), value);
        }
        Ok(route)
    }
}
