use crate::models::{MediaId, OperationOptions};
use crate::source::{Operation, Source, SourceError};
use thiserror::Error;

/// Expectations supplied by a source implementation to run the shared contract suite.
#[derive(Debug, Clone)]
pub struct SourceContractExpectations {
    /// The source id every returned item must carry.
    pub source_id: String,
    /// Query text that must produce at least `min_results` items.
    pub query: String,
    /// The first item expected for `query` (deterministic ordering).
    pub expected_first_id: MediaId,
    /// How many items the fixture is known to hold for `query`.
    pub min_results: usize,
    /// A container to browse when the source advertises browse.
    pub browse_container: Option<MediaId>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceContractError {
    #[error("search returned no items for query: {query}")]
    EmptySearch { query: String },
    #[error("search returned {actual} items, expected at least {expected}")]
    TooFewResults { expected: usize, actual: usize },
    #[error("search returned wrong first item: expected {expected}, got {actual}")]
    WrongFirstItem { expected: MediaId, actual: MediaId },
    #[error("item {id} carries source id {actual}")]
    SourceMismatch { id: MediaId, actual: String },
    #[error("search returned {returned} items for count {count}")]
    CountExceeded { returned: usize, count: u32 },
    #[error("skip {skip} returned {actual} first, expected {expected}")]
    SkipMismatch {
        skip: u32,
        expected: MediaId,
        actual: MediaId,
    },
    #[error("resolve returned mismatched id: expected {expected}, got {actual}")]
    ResolveMismatch { expected: MediaId, actual: MediaId },
    #[error("browse advertised but no container expectation supplied")]
    MissingBrowseContainer,
    #[error("browse of {container} returned no children")]
    EmptyBrowse { container: MediaId },
    #[error("{operation} not advertised but did not return NotSupported")]
    NotSupportedExpected { operation: Operation },
    #[error("source error while running contract: {0}")]
    SourceFailure(String),
}

fn failure(err: SourceError) -> SourceContractError {
    SourceContractError::SourceFailure(err.to_string())
}

/// Run the shared source contract suite.
///
/// Sources call this from their crate-level tests with fixtures that exist in
/// their test setup.
pub async fn run_source_contract(
    source: &dyn Source,
    expectations: &SourceContractExpectations,
) -> Result<(), SourceContractError> {
    verify_search(source, expectations).await?;
    verify_paging(source, expectations).await?;
    verify_resolve(source, expectations).await?;
    verify_browse(source, expectations).await?;
    Ok(())
}

async fn verify_search(
    source: &dyn Source,
    expectations: &SourceContractExpectations,
) -> Result<(), SourceContractError> {
    let page = source
        .search(&expectations.query, &OperationOptions::unlimited())
        .await
        .map_err(failure)?;

    let Some(first) = page.items.first() else {
        return Err(SourceContractError::EmptySearch {
            query: expectations.query.clone(),
        });
    };
    if first.id != expectations.expected_first_id {
        return Err(SourceContractError::WrongFirstItem {
            expected: expectations.expected_first_id.clone(),
            actual: first.id.clone(),
        });
    }
    if page.items.len() < expectations.min_results {
        return Err(SourceContractError::TooFewResults {
            expected: expectations.min_results,
            actual: page.items.len(),
        });
    }
    if let Some(stray) = page
        .items
        .iter()
        .find(|item| item.source_id != expectations.source_id)
    {
        return Err(SourceContractError::SourceMismatch {
            id: stray.id.clone(),
            actual: stray.source_id.clone(),
        });
    }
    Ok(())
}

async fn verify_paging(
    source: &dyn Source,
    expectations: &SourceContractExpectations,
) -> Result<(), SourceContractError> {
    let all = source
        .search(&expectations.query, &OperationOptions::unlimited())
        .await
        .map_err(failure)?;

    let options = OperationOptions::first(1);
    let one = source
        .search(&expectations.query, &options)
        .await
        .map_err(failure)?;
    if one.items.len() > 1 {
        return Err(SourceContractError::CountExceeded {
            returned: one.items.len(),
            count: 1,
        });
    }

    if all.items.len() >= 2 {
        let skipped = source
            .search(&expectations.query, &options.with_skip(1))
            .await
            .map_err(failure)?;
        if let (Some(expected), Some(actual)) = (all.items.get(1), skipped.items.first()) {
            if expected.id != actual.id {
                return Err(SourceContractError::SkipMismatch {
                    skip: 1,
                    expected: expected.id.clone(),
                    actual: actual.id.clone(),
                });
            }
        }
    }
    Ok(())
}

async fn verify_resolve(
    source: &dyn Source,
    expectations: &SourceContractExpectations,
) -> Result<(), SourceContractError> {
    let id = &expectations.expected_first_id;
    let result = source.resolve(id).await;
    if !source.capabilities().resolve {
        return expect_not_supported(Operation::Resolve, result.map(|_| ()));
    }
    let media = result.map_err(failure)?;
    if &media.id != id {
        return Err(SourceContractError::ResolveMismatch {
            expected: id.clone(),
            actual: media.id,
        });
    }
    if media.source_id != expectations.source_id {
        return Err(SourceContractError::SourceMismatch {
            id: media.id,
            actual: media.source_id,
        });
    }
    Ok(())
}

async fn verify_browse(
    source: &dyn Source,
    expectations: &SourceContractExpectations,
) -> Result<(), SourceContractError> {
    let options = OperationOptions::unlimited();
    if !source.capabilities().browse {
        let result = source.browse(None, &options).await;
        return expect_not_supported(Operation::Browse, result.map(|_| ()));
    }

    let container = expectations
        .browse_container
        .as_ref()
        .ok_or(SourceContractError::MissingBrowseContainer)?;
    let page = source
        .browse(Some(container), &options)
        .await
        .map_err(failure)?;
    if page.items.is_empty() {
        return Err(SourceContractError::EmptyBrowse {
            container: container.clone(),
        });
    }
    if let Some(stray) = page
        .items
        .iter()
        .find(|item| item.source_id != expectations.source_id)
    {
        return Err(SourceContractError::SourceMismatch {
            id: stray.id.clone(),
            actual: stray.source_id.clone(),
        });
    }
    Ok(())
}

fn expect_not_supported(
    operation: Operation,
    result: Result<(), SourceError>,
) -> Result<(), SourceContractError> {
    match result {
        Err(SourceError::NotSupported { .. }) => Ok(()),
        _ => Err(SourceContractError::NotSupportedExpected { operation }),
    }
}
