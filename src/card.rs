//! Card models and the image store the renderer reads from.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// A card placed on a sheet, with its layout already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub image_id: String,
    pub width_mm: f64,
    pub height_mm: f64,
    pub bleed_mm: f64,
}

impl Card {
    /// Standard 63x88mm trading card without bleed.
    pub fn standard(id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image_id: image_id.into(),
            width_mm: 63.0,
            height_mm: 88.0,
            bleed_mm: 0.0,
        }
    }

    /// Outer size including bleed on every side.
    pub fn outer_size_mm(&self) -> (f64, f64) {
        (
            self.width_mm + 2.0 * self.bleed_mm,
            self.height_mm + 2.0 * self.bleed_mm,
        )
    }
}

/// Read-only map from image id to stored image bytes.
#[derive(Debug, Clone, Default)]
pub struct ImageStore {
    images: HashMap<String, Arc<[u8]>>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_id: impl Into<String>, bytes: Vec<u8>) {
        self.images.insert(image_id.into(), Arc::from(bytes));
    }

    pub fn get(&self, image_id: &str) -> Option<&[u8]> {
        self.images.get(image_id).map(|bytes| bytes.as_ref())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Loads every image listed in `paths` from disk.
    pub async fn load_files(paths: &HashMap<String, PathBuf>) -> Result<Self> {
        let mut store = Self::new();
        for (image_id, path) in paths {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read image {} from {}", image_id, path.display()))?;
            debug!(image_id = %image_id, bytes = bytes.len(), "Loaded card image");
            store.insert(image_id.clone(), bytes);
        }
        Ok(store)
    }
}
