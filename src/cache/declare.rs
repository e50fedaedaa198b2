//! Read and evict declarations.
//!
//! Declarations are built once (typically stored next to the method they
//! advise) and rendered against every call. Templates are parsed and checked
//! at construction so a malformed declaration fails before any call runs.

use std::collections::BTreeSet;
use std::time::Duration;

use super::error::TemplateError;
use super::invocation::Invocation;
use super::template::KeyTemplate;

fn require_bound(template: KeyTemplate) -> Result<KeyTemplate, TemplateError> {
    if template.uses_item() {
        return Err(TemplateError::UnboundIteration {
            template: template.source().to_string(),
        });
    }
    Ok(template)
}

/// Declares a read-through cached method.
#[derive(Debug, Clone)]
pub struct Cacheable {
    key: KeyTemplate,
    depends_on: Vec<KeyTemplate>,
    ttl: Option<Duration>,
}

impl Cacheable {
    pub fn new(key: &str) -> Result<Self, TemplateError> {
        Ok(Self {
            key: require_bound(KeyTemplate::parse(key)?)?,
            depends_on: Vec::new(),
            ttl: None,
        })
    }

    /// Declare a dependency tag. Evicting the rendered tag evicts this key.
    pub fn depends_on(mut self, tag: &str) -> Result<Self, TemplateError> {
        self.depends_on
            .push(require_bound(KeyTemplate::parse(tag)?)?);
        Ok(self)
    }

    /// Override the configured TTL for entries written by this declaration.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn key(&self) -> &KeyTemplate {
        &self.key
    }

    pub fn dependencies(&self) -> &[KeyTemplate] {
        &self.depends_on
    }

    pub fn ttl_override(&self) -> Option<Duration> {
        self.ttl
    }

    pub(crate) fn render_key(&self, invocation: &Invocation) -> Result<String, TemplateError> {
        self.key.render(invocation)
    }

    /// Rendered dependency tags, deduplicated.
    pub(crate) fn render_tags(&self, invocation: &Invocation) -> Result<Vec<String>, TemplateError> {
        let mut tags = BTreeSet::new();
        for template in &self.depends_on {
            tags.insert(template.render(invocation)?);
        }
        Ok(tags.into_iter().collect())
    }
}

/// One thing an eviction removes.
#[derive(Debug, Clone)]
pub enum EvictTarget {
    /// A single rendered name.
    Key(KeyTemplate),
    /// One name per element of the collection argument at `source`.
    Each { template: KeyTemplate, source: usize },
    /// Every stored key starting with the rendered prefix.
    Prefix(KeyTemplate),
}

/// Declares a method whose successful completion evicts cached entries.
///
/// Every evicted name is also evicted as a dependency tag, cascading to keys
/// that declared it.
#[derive(Debug, Clone, Default)]
pub struct CacheEvict {
    targets: Vec<EvictTarget>,
    before_invocation: bool,
}

impl CacheEvict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, template: &str) -> Result<Self, TemplateError> {
        self.targets
            .push(EvictTarget::Key(require_bound(KeyTemplate::parse(template)?)?));
        Ok(self)
    }

    /// Evict one name per element of argument `source`, with `${it}` bound to
    /// the element.
    pub fn each(mut self, template: &str, source: usize) -> Result<Self, TemplateError> {
        self.targets.push(EvictTarget::Each {
            template: KeyTemplate::parse(template)?,
            source,
        });
        Ok(self)
    }

    pub fn prefix(mut self, template: &str) -> Result<Self, TemplateError> {
        self.targets
            .push(EvictTarget::Prefix(require_bound(KeyTemplate::parse(template)?)?));
        Ok(self)
    }

    /// Evict before calling through instead of after a successful call.
    pub fn before_invocation(mut self, before: bool) -> Self {
        self.before_invocation = before;
        self
    }

    pub fn targets(&self) -> &[EvictTarget] {
        &self.targets
    }

    pub fn runs_before_invocation(&self) -> bool {
        self.before_invocation
    }

    pub(crate) fn resolve(&self, invocation: &Invocation) -> Result<ResolvedEviction, TemplateError> {
        let mut names = BTreeSet::new();
        let mut prefixes = BTreeSet::new();
        for target in &self.targets {
            match target {
                EvictTarget::Key(template) => {
                    names.insert(template.render(invocation)?);
                }
                EvictTarget::Each { template, source } => {
                    names.extend(template.render_each(invocation, *source)?);
                }
                EvictTarget::Prefix(template) => {
                    prefixes.insert(template.render(invocation)?);
                }
            }
        }
        Ok(ResolvedEviction {
            names: names.into_iter().collect(),
            prefixes: prefixes.into_iter().collect(),
        })
    }
}

/// Names and prefixes rendered from a [`CacheEvict`] for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ResolvedEviction {
    pub(crate) names: Vec<String>,
    pub(crate) prefixes: Vec<String>,
}
