//! Estimate persistence.
//!
//! Relational storage is out of scope; the in-memory repository backs the
//! service and the tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use estimator_core::{Estimate, EstimateId, EstimatePatch};
use serde::Serialize;

/// Repository error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("estimate not found: {0}")]
    NotFound(EstimateId),
    #[error("estimate already exists: {0}")]
    AlreadyExists(EstimateId),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// One page of a newest-first listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    /// 1-based.
    pub page: usize,
    pub per_page: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    /// Cut page `page` (1-based) of `per_page` items out of `all`.
    pub fn slice(all: Vec<T>, page: usize, per_page: usize) -> Self {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .collect();
        Self {
            items,
            total,
            page,
            per_page,
            pages: total.div_ceil(per_page),
        }
    }
}

/// Estimate storage.
pub trait EstimateRepository: Send + Sync {
    fn insert(&self, estimate: Estimate) -> Result<Estimate, RepositoryError>;

    fn fetch(&self, id: EstimateId) -> Result<Estimate, RepositoryError>;

    /// Apply `patch` and return the updated record.
    fn update(&self, id: EstimateId, patch: &EstimatePatch) -> Result<Estimate, RepositoryError>;

    /// Newest first, `page` is 1-based.
    fn page(&self, page: usize, per_page: usize) -> Result<Page<Estimate>, RepositoryError>;
}

impl<R> EstimateRepository for Arc<R>
where
    R: EstimateRepository + ?Sized,
{
    fn insert(&self, estimate: Estimate) -> Result<Estimate, RepositoryError> {
        (**self).insert(estimate)
    }

    fn fetch(&self, id: EstimateId) -> Result<Estimate, RepositoryError> {
        (**self).fetch(id)
    }

    fn update(&self, id: EstimateId, patch: &EstimatePatch) -> Result<Estimate, RepositoryError> {
        (**self).update(id, patch)
    }

    fn page(&self, page: usize, per_page: usize) -> Result<Page<Estimate>, RepositoryError> {
        (**self).page(page, per_page)
    }
}

/// In-memory repository.
#[derive(Debug, Default)]
pub struct InMemoryEstimateRepository {
    inner: RwLock<HashMap<EstimateId, Estimate>>,
}

impl InMemoryEstimateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> RepositoryError {
    RepositoryError::Unavailable("lock poisoned".to_string())
}

impl EstimateRepository for InMemoryEstimateRepository {
    fn insert(&self, estimate: Estimate) -> Result<Estimate, RepositoryError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        if map.contains_key(&estimate.id) {
            return Err(RepositoryError::AlreadyExists(estimate.id));
        }
        map.insert(estimate.id, estimate.clone());
        Ok(estimate)
    }

    fn fetch(&self, id: EstimateId) -> Result<Estimate, RepositoryError> {
        let map = self.inner.read().map_err(poisoned)?;
        map.get(&id).cloned().ok_or(RepositoryError::NotFound(id))
    }

    fn update(&self, id: EstimateId, patch: &EstimatePatch) -> Result<Estimate, RepositoryError> {
        let mut map = self.inner.write().map_err(poisoned)?;
        let estimate = map.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        estimate.apply(patch);
        Ok(estimate.clone())
    }

    fn page(&self, page: usize, per_page: usize) -> Result<Page<Estimate>, RepositoryError> {
        let map = self.inner.read().map_err(poisoned)?;
        let mut estimates: Vec<Estimate> = map.values().cloned().collect();
        estimates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Page::slice(estimates, page, per_page))
    }
}
