// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::abi::MAX_RELEASE_ATTEMPTS;
use crate::layout::PageLayout;
use serde::{Deserialize, Serialize};

/// Chunks per page used when a writer gives no size hint: 1, 2, 4, 7 or 14.
pub const DD_TRACE_SHM_PAGE_LAYOUT: &str = "DD_TRACE_SHM_PAGE_LAYOUT";
/// CAS attempts per chunk release before the release is deferred.
pub const DD_TRACE_SHM_RELEASE_ATTEMPTS: &str = "DD_TRACE_SHM_RELEASE_ATTEMPTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Partitioning of new pages when the writer gives no size hint.
    pub default_page_layout: PageLayout,
    /// Retry budget of each chunk release. A release that runs out of attempts
    /// is deferred and retried on later arbiter calls.
    pub release_attempts: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            default_page_layout: PageLayout::Div14,
            release_attempts: MAX_RELEASE_ATTEMPTS,
        }
    }
}

impl ArbiterConfig {
    pub fn new(default_page_layout: PageLayout, release_attempts: u32) -> anyhow::Result<Self> {
        let config = Self {
            default_page_layout,
            release_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.default_page_layout.num_chunks() > 0,
            "{:?} cannot be used to partition pages",
            self.default_page_layout
        );
        anyhow::ensure!(
            self.release_attempts > 0,
            "at least one release attempt is required"
        );
        Ok(())
    }

    /// Defaults, overridden by `DD_TRACE_SHM_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_env_vars(|name| std::env::var(name).ok())
    }

    fn from_env_vars(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(value) = get(DD_TRACE_SHM_PAGE_LAYOUT) {
            let chunks: usize = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("{DD_TRACE_SHM_PAGE_LAYOUT}={value:?} is not a number: {e}")
            })?;
            config.default_page_layout = PageLayout::from_chunks_per_page(chunks).ok_or_else(|| {
                anyhow::anyhow!(
                    "{DD_TRACE_SHM_PAGE_LAYOUT}={chunks} must be one of 1, 2, 4, 7 or 14"
                )
            })?;
        }
        if let Some(value) = get(DD_TRACE_SHM_RELEASE_ATTEMPTS) {
            config.release_attempts = value.trim().parse().map_err(|e| {
                anyhow::anyhow!("{DD_TRACE_SHM_RELEASE_ATTEMPTS}={value:?} is not a number: {e}")
            })?;
        }
        config.validate()?;
        Ok(config)
    }
}
