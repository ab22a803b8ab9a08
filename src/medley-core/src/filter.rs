use crate::models::TypeFilter;
use crate::registry::SourceRegistry;
use crate::source::{Operation, Source};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Selects the registered sources able to serve an operation.
#[derive(Debug, Clone)]
pub struct CapabilityFilter {
    operation: Operation,
    type_filter: TypeFilter,
    only: Option<BTreeSet<String>>,
}

impl CapabilityFilter {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            type_filter: TypeFilter::ALL,
            only: None,
        }
    }

    /// Limit selection to the given source ids. An empty list means no restriction.
    pub fn restrict_to<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = ids.into_iter().map(Into::into).collect();
        self.only = (!ids.is_empty()).then_some(ids);
        self
    }

    pub fn with_type_filter(mut self, type_filter: TypeFilter) -> Self {
        self.type_filter = type_filter;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn matches(&self, source: &dyn Source) -> bool {
        if !source.capabilities().supports(self.operation) || !source.is_available() {
            return false;
        }
        if let Some(only) = &self.only {
            if !only.contains(source.id()) {
                return false;
            }
        }
        if self.type_filter.is_all() {
            return true;
        }
        // A source that can't honour any requested type would only return noise.
        let honoured = source
            .caps(self.operation)
            .type_filter
            .intersect(&self.type_filter);
        !honoured.is_empty()
    }

    pub fn select(&self, registry: &SourceRegistry) -> Vec<Arc<dyn Source>> {
        registry
            .sources()
            .into_iter()
            .filter(|source| self.matches(source.as_ref()))
            .collect()
    }
}
