//! Authorization gate
//!
//! The pipeline asks a `PermissionChecker` before writing: new objects are
//! checked against their scheme, existing objects against themselves.
//! `CachedPermissions` keeps answers for a short TTL.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use serde::Serialize;
use crate::Result;

/// What a permission applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionTarget {
    Scheme(i64),
    Object(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Update => write!(f, "update"),
        }
    }
}

pub trait PermissionChecker {
    fn check(&self, target: PermissionTarget, user: Option<i64>, action: Action) -> Result<bool>;
}

/// Grants everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn check(&self, _target: PermissionTarget, _user: Option<i64>, _action: Action) -> Result<bool> {
        Ok(true)
    }
}

type PermissionKey = (PermissionTarget, Option<i64>, Action);

/// TTL-bounded cache in front of another checker.
pub struct CachedPermissions<P> {
    inner: P,
    ttl: Duration,
    entries: Mutex<HashMap<PermissionKey, (bool, Instant)>>,
}

impl<P: PermissionChecker> CachedPermissions<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Forget every cached answer
    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl<P: PermissionChecker> PermissionChecker for CachedPermissions<P> {
    fn check(&self, target: PermissionTarget, user: Option<i64>, action: Action) -> Result<bool> {
        let key = (target, user, action);
        let now = Instant::now();
        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((allowed, at)) = entries.get(&key) {
                if now.duration_since(*at) < self.ttl {
                    return Ok(*allowed);
                }
            }
        }

        let allowed = self.inner.check(target, user, action)?;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, (allowed, now));
        Ok(allowed)
    }
}
